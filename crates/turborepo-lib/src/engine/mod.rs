mod builder;
mod dot;
mod execute;

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

pub use builder::{EngineBuilder, Error as BuilderError};
pub use execute::{ExecuteError, ExecutionOptions, Message, StopExecution};
use miette::{Diagnostic, NamedSource, SourceSpan};
use petgraph::Graph;
use thiserror::Error;
use turborepo_errors::Spanned;

use crate::{task_graph::TaskDefinition, task_id::TaskId};

/// A node in the task graph: a concrete task, or the synthetic root that
/// every entry task connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskNode {
    Root,
    Task(TaskId<'static>),
}

impl From<TaskId<'static>> for TaskNode {
    fn from(value: TaskId<'static>) -> Self {
        Self::Task(value)
    }
}

impl fmt::Display for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskNode::Root => f.write_str("___ROOT___"),
            TaskNode::Task(task) => task.fmt(f),
        }
    }
}

#[derive(Debug, Default)]
pub struct Building;
#[derive(Debug, Default)]
pub struct Built;

/// Validation failures on a structurally complete task graph.
#[derive(Debug, Error, Diagnostic)]
pub enum ValidateError {
    #[error("Cannot find task definition for {task_id}")]
    MissingTask { task_id: String },
    #[error(
        "\"{persistent_task_id}\" is a persistent task, \"{dependant_task_id}\" cannot depend on \
         it"
    )]
    DependencyOnPersistentTask {
        #[source_code]
        text: NamedSource,
        #[label("persistent task")]
        span: Option<SourceSpan>,
        persistent_task_id: String,
        dependant_task_id: String,
    },
    #[error(
        "tasks \"{first_task_id}\" and \"{second_task_id}\" in package \"{package}\" declare \
         overlapping outputs ({glob})"
    )]
    OverlappingOutputs {
        package: String,
        first_task_id: String,
        second_task_id: String,
        glob: String,
    },
    #[error(
        "You have {persistent_count} persistent tasks but a concurrency of {concurrency}. Set \
         --concurrency to at least {}",
        persistent_count + 1
    )]
    PersistentTasksExceedConcurrency {
        persistent_count: u32,
        concurrency: u32,
    },
}

/// The task graph and its metadata. Edges point from a task to the tasks it
/// depends on; the `Built` state is immutable and shared by the executor.
pub struct Engine<S = Built> {
    marker: std::marker::PhantomData<S>,
    task_graph: Graph<TaskNode, ()>,
    root_index: petgraph::graph::NodeIndex,
    task_lookup: HashMap<TaskId<'static>, petgraph::graph::NodeIndex>,
    task_definitions: HashMap<TaskId<'static>, TaskDefinition>,
    task_locations: HashMap<TaskId<'static>, Spanned<()>>,
}

impl Engine<Building> {
    pub fn new() -> Self {
        let mut task_graph = Graph::default();
        let root_index = task_graph.add_node(TaskNode::Root);
        Self {
            marker: std::marker::PhantomData,
            task_graph,
            root_index,
            task_lookup: HashMap::default(),
            task_definitions: HashMap::default(),
            task_locations: HashMap::default(),
        }
    }

    pub fn get_index(&mut self, task_id: &TaskId<'static>) -> petgraph::graph::NodeIndex {
        self.task_lookup.get(task_id).copied().unwrap_or_else(|| {
            let index = self.task_graph.add_node(TaskNode::Task(task_id.clone()));
            self.task_lookup.insert(task_id.clone(), index);
            index
        })
    }

    pub fn connect_to_root(&mut self, task_id: &TaskId<'static>) {
        let source = self.get_index(task_id);
        self.task_graph.add_edge(source, self.root_index, ());
    }

    pub fn add_edge(
        &mut self,
        source: petgraph::graph::NodeIndex,
        target: petgraph::graph::NodeIndex,
    ) {
        self.task_graph.add_edge(source, target, ());
    }

    pub fn add_definition(
        &mut self,
        task_id: TaskId<'static>,
        definition: TaskDefinition,
    ) -> Option<TaskDefinition> {
        self.task_definitions.insert(task_id, definition)
    }

    pub fn add_task_location(&mut self, task_id: TaskId<'static>, location: Spanned<()>) {
        // keep the first location that actually has a range
        let has_location = self
            .task_locations
            .get(&task_id)
            .is_some_and(|existing| existing.range.is_some());
        if !has_location {
            self.task_locations.insert(task_id, location);
        }
    }

    /// Seals the graph against further mutation.
    pub fn seal(self) -> Engine<Built> {
        let Engine {
            task_graph,
            root_index,
            task_lookup,
            task_definitions,
            task_locations,
            ..
        } = self;
        Engine {
            marker: std::marker::PhantomData,
            task_graph,
            root_index,
            task_lookup,
            task_definitions,
            task_locations,
        }
    }
}

impl Default for Engine<Building> {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine<Built> {
    pub fn dependencies(&self, task_id: &TaskId) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, petgraph::Direction::Outgoing)
    }

    pub fn dependents(&self, task_id: &TaskId) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, petgraph::Direction::Incoming)
    }

    fn neighbors(
        &self,
        task_id: &TaskId,
        direction: petgraph::Direction,
    ) -> Option<HashSet<&TaskNode>> {
        let index = self.task_lookup.get(task_id)?;
        Some(
            self.task_graph
                .neighbors_directed(*index, direction)
                .map(|index| {
                    self.task_graph
                        .node_weight(index)
                        .expect("node index must be present")
                })
                .collect(),
        )
    }

    pub fn task_definition(&self, task_id: &TaskId<'static>) -> Option<&TaskDefinition> {
        self.task_definitions.get(task_id)
    }

    pub fn task_definitions(&self) -> &HashMap<TaskId<'static>, TaskDefinition> {
        &self.task_definitions
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.task_graph.node_weights()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId<'static>> {
        self.tasks().filter_map(|task| match task {
            TaskNode::Task(task_id) => Some(task_id),
            TaskNode::Root => None,
        })
    }

    pub fn len(&self) -> usize {
        self.task_lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_lookup.is_empty()
    }

    pub fn task_graph(&self) -> &Graph<TaskNode, ()> {
        &self.task_graph
    }

    /// Rules that only make sense on the finished graph: no task may depend
    /// on a persistent task, sibling tasks in a package may not declare the
    /// same output path, and persistent tasks must fit in the concurrency
    /// budget.
    pub fn validate(&self, concurrency: u32) -> Result<(), Vec<ValidateError>> {
        let mut errors = Vec::new();
        let mut persistent_count = 0;

        for node_index in self.task_graph.node_indices() {
            let TaskNode::Task(dependency) = &self.task_graph[node_index] else {
                continue;
            };
            let Some(dependency_definition) = self.task_definitions.get(dependency) else {
                errors.push(ValidateError::MissingTask {
                    task_id: dependency.to_string(),
                });
                continue;
            };
            if dependency_definition.persistent {
                persistent_count += 1;
                // incoming neighbors are the tasks that wait on this one
                for dependant_index in self
                    .task_graph
                    .neighbors_directed(node_index, petgraph::Direction::Incoming)
                {
                    let TaskNode::Task(dependant) = &self.task_graph[dependant_index] else {
                        continue;
                    };
                    let (span, text) = self
                        .task_locations
                        .get(dependant)
                        .map(|location| location.span_and_text("turbo.json"))
                        .unwrap_or_else(|| (None, NamedSource::new("turbo.json", String::new())));
                    errors.push(ValidateError::DependencyOnPersistentTask {
                        span,
                        text,
                        persistent_task_id: dependency.to_string(),
                        dependant_task_id: dependant.to_string(),
                    });
                }
            }
        }

        errors.extend(self.validate_overlapping_outputs());

        if persistent_count >= concurrency {
            errors.push(ValidateError::PersistentTasksExceedConcurrency {
                persistent_count,
                concurrency,
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Two tasks in the same package declaring an identical output glob will
    /// race on the filesystem.
    fn validate_overlapping_outputs(&self) -> Vec<ValidateError> {
        let mut errors = Vec::new();
        let mut globs_by_package: HashMap<(&str, &String), &TaskId<'static>> = HashMap::new();
        let mut task_ids: Vec<_> = self.task_definitions.keys().collect();
        task_ids.sort();
        for task_id in task_ids {
            let definition = &self.task_definitions[task_id];
            for glob in &definition.outputs.inclusions {
                match globs_by_package.insert((task_id.package(), glob), task_id) {
                    Some(previous) if previous != task_id => {
                        errors.push(ValidateError::OverlappingOutputs {
                            package: task_id.package().to_string(),
                            first_task_id: previous.to_string(),
                            second_task_id: task_id.to_string(),
                            glob: glob.clone(),
                        });
                    }
                    _ => {}
                }
            }
        }
        errors
    }

    pub fn write_dot(&self, output: &mut impl std::io::Write) -> std::io::Result<()> {
        dot::write_graph(output, &self.task_graph)
    }
}

impl<S> fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("tasks", &self.task_lookup.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task_graph::TaskOutputs;

    fn engine_with(tasks: Vec<(TaskId<'static>, TaskDefinition)>, edges: Vec<(usize, usize)>) -> Engine {
        let mut engine = Engine::new();
        let indices: Vec<_> = tasks
            .iter()
            .map(|(task_id, _)| engine.get_index(task_id))
            .collect();
        for (task_id, definition) in tasks {
            engine.add_definition(task_id, definition);
        }
        for (from, to) in edges {
            engine.add_edge(indices[from], indices[to]);
        }
        engine.seal()
    }

    #[test]
    fn test_persistent_dependency_rejected() {
        let persistent = TaskDefinition {
            persistent: true,
            cache: false,
            ..Default::default()
        };
        let engine = engine_with(
            vec![
                (TaskId::new("pkg-b", "build").into_owned(), TaskDefinition::default()),
                (TaskId::new("pkg-z", "dev").into_owned(), persistent),
            ],
            vec![(0, 1)],
        );

        let errors = engine.validate(10).unwrap_err();
        assert_eq!(errors.len(), 1);
        let message = errors[0].to_string();
        assert!(message.contains("pkg-z#dev"), "{message}");
        assert!(message.contains("pkg-b#build"), "{message}");
    }

    #[test]
    fn test_overlapping_outputs_rejected() {
        let with_outputs = |glob: &str| TaskDefinition {
            outputs: TaskOutputs {
                inclusions: vec![glob.to_string()],
                exclusions: vec![],
            },
            ..Default::default()
        };
        let engine = engine_with(
            vec![
                (TaskId::new("web", "build").into_owned(), with_outputs("dist/**")),
                (TaskId::new("web", "bundle").into_owned(), with_outputs("dist/**")),
            ],
            vec![],
        );

        let errors = engine.validate(10).unwrap_err();
        assert!(errors
            .iter()
            .any(|err| matches!(err, ValidateError::OverlappingOutputs { .. })));
    }

    #[test]
    fn test_persistent_tasks_exceeding_concurrency() {
        let persistent = || TaskDefinition {
            persistent: true,
            cache: false,
            ..Default::default()
        };
        let engine = engine_with(
            vec![
                (TaskId::new("a", "dev").into_owned(), persistent()),
                (TaskId::new("b", "dev").into_owned(), persistent()),
            ],
            vec![],
        );
        assert!(engine.validate(2).is_err());
        assert!(engine.validate(3).is_ok());
    }
}
