use std::collections::{HashMap, HashSet, VecDeque};

use itertools::Itertools;
use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;
use turborepo_errors::Spanned;
use turborepo_graph_utils as graph;
use turborepo_repository::package_graph::{PackageGraph, PackageName, PackageNode};

use super::{Building, Built, Engine};
use crate::{
    task_graph::TaskDefinition,
    task_id::{TaskId, TaskName},
    turbo_json::{TurboJson, TurboJsonLoader},
};

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("Could not find the following tasks in project: {names}")]
    MissingTasks { names: String },
    #[error("Could not find package \"{package}\" referenced by task \"{task_id}\"")]
    MissingPackage {
        package: String,
        task_id: String,
        #[source_code]
        text: NamedSource,
        #[label("package does not exist")]
        span: Option<SourceSpan>,
    },
    #[error("Could not find task definition for \"{task_id}\"")]
    MissingTaskDefinition {
        task_id: String,
        #[source_code]
        text: NamedSource,
        #[label("no definition for this dependency")]
        span: Option<SourceSpan>,
    },
    #[error(
        "Root tasks must be explicitly declared in turbo.json, add \"//#{task_name}\" to run it"
    )]
    MissingRootTask {
        task_name: String,
        #[source_code]
        text: NamedSource,
        #[label("root task is not enabled")]
        span: Option<SourceSpan>,
    },
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] crate::turbo_json::Error),
    #[error("Invalid task configuration: {0}")]
    CycleInTaskGraph(#[source] graph::Error),
}

/// Expands the pipeline against the package graph into the task graph,
/// starting from the filter-selected entry set and following `dependsOn`
/// edges to closure.
pub struct EngineBuilder<'a> {
    package_graph: &'a PackageGraph,
    turbo_json_loader: &'a TurboJsonLoader,
    is_single: bool,
    workspaces: Vec<PackageName>,
    tasks: Vec<Spanned<TaskName<'static>>>,
    tasks_only: bool,
}

impl<'a> EngineBuilder<'a> {
    pub fn new(
        package_graph: &'a PackageGraph,
        turbo_json_loader: &'a TurboJsonLoader,
        is_single: bool,
    ) -> Self {
        Self {
            package_graph,
            turbo_json_loader,
            is_single,
            workspaces: Vec::new(),
            tasks: Vec::new(),
            tasks_only: false,
        }
    }

    pub fn with_workspaces(mut self, workspaces: Vec<PackageName>) -> Self {
        self.workspaces = workspaces;
        self
    }

    pub fn with_tasks<I: IntoIterator<Item = Spanned<TaskName<'static>>>>(
        mut self,
        tasks: I,
    ) -> Self {
        self.tasks = tasks.into_iter().collect();
        self
    }

    /// With `--only`, dependencies are not followed; exactly the requested
    /// package-task pairs run.
    pub fn with_tasks_only(mut self, tasks_only: bool) -> Self {
        self.tasks_only = tasks_only;
        self
    }

    fn root_turbo_json(&self) -> &TurboJson {
        self.turbo_json_loader.root()
    }

    /// Root tasks must be opted in via a `//#task` pipeline entry.
    fn root_enabled_tasks(&self) -> HashSet<TaskName<'static>> {
        self.root_turbo_json()
            .tasks
            .keys()
            .filter(|task_name| {
                task_name.package() == Some(turborepo_repository::package_graph::ROOT_PKG_NAME)
            })
            .map(|task_name| task_name.clone().into_non_workspace_task())
            .collect()
    }

    /// Whether the pipeline has a definition that applies to this
    /// package-task pair.
    fn has_task_definition(&self, workspace: &PackageName, task_name: &TaskName) -> bool {
        let task_id = TaskId::from_static(
            workspace.as_str().to_string(),
            task_name.task().to_string(),
        );
        !self.task_definition_chain(&task_id).is_empty()
    }

    /// A task materializes in a package only if the package actually has the
    /// script (or the pipeline names the pair explicitly).
    fn task_exists_in_package(&self, workspace: &PackageName, task: &str) -> bool {
        if self
            .package_graph
            .package_json(workspace)
            .is_some_and(|package_json| package_json.command(task).is_some())
        {
            return true;
        }
        let qualified =
            TaskName::from(format!("{workspace}{}{task}", crate::task_id::TASK_DELIMITER));
        self.root_turbo_json().tasks.contains_key(&qualified)
    }

    /// The raw definitions that merge into this task's resolved definition:
    /// root bare entry, then the root `pkg#task` override, then the
    /// package-level turbo.json entry. Later entries win per field.
    fn task_definition_chain(
        &self,
        task_id: &TaskId,
    ) -> Vec<crate::turbo_json::RawTaskDefinition> {
        let mut chain = Vec::new();
        let root = self.root_turbo_json();
        let workspace = PackageName::from(task_id.package());
        let bare_name = task_id.as_non_workspace_task_name().into_owned();

        // Single-package repos have no workspace dimension: bare keys are
        // the definitions and everything runs in the root package.
        if self.is_single {
            if let Some(def) = root.tasks.get(&bare_name) {
                chain.push(def.as_inner().clone());
            }
            return chain;
        }

        if workspace == PackageName::Root {
            // Root tasks are only ever defined by their qualified key.
            if let Some(def) = root.tasks.get(&task_id.as_task_name().into_owned()) {
                chain.push(def.as_inner().clone());
            }
            return chain;
        }

        if let Some(def) = root.tasks.get(&bare_name) {
            chain.push(def.as_inner().clone());
        }
        if let Some(def) = root.tasks.get(&task_id.as_task_name().into_owned()) {
            chain.push(def.as_inner().clone());
        }
        if !self.is_single {
            if let Some(workspace_json) = self.turbo_json_loader.load(&workspace) {
                if let Some(def) = workspace_json.tasks.get(&bare_name) {
                    chain.push(def.as_inner().clone());
                }
            }
        }
        chain
    }

    fn task_definition(&self, task_id: &Spanned<TaskId>) -> Result<TaskDefinition, Error> {
        let chain = self.task_definition_chain(task_id);
        if chain.is_empty() {
            let (span, text) = task_id.span_and_text("turbo.json");
            return Err(Error::MissingTaskDefinition {
                task_id: task_id.to_string(),
                span,
                text,
            });
        }
        Ok(TaskDefinition::from_raw_chain(chain)?)
    }

    pub fn build(self) -> Result<Engine<Built>, Error> {
        // No matching packages is not an error; the run simply does nothing.
        if self.workspaces.is_empty() {
            return Ok(Engine::default().seal());
        }

        let root_enabled_tasks = self.root_enabled_tasks();
        let mut missing_tasks: HashMap<&TaskName<'static>, Spanned<()>> =
            HashMap::from_iter(self.tasks.iter().map(|spanned| spanned.as_ref().split()));
        let mut traversal_queue = VecDeque::new();

        for (workspace, task) in self.workspaces.iter().cartesian_product(self.tasks.iter()) {
            // Qualified names only apply to their own package.
            if !task.in_workspace(workspace.as_str()) {
                continue;
            }
            let task_id = task
                .task_id()
                .map(|id| id.into_owned())
                .unwrap_or_else(|| {
                    TaskId::from_static(workspace.as_str().to_string(), task.task().to_string())
                });

            if self.has_task_definition(workspace, task.as_inner()) {
                missing_tasks.remove(task.as_inner());

                let is_root = *workspace == PackageName::Root;
                let instantiable = self.task_exists_in_package(workspace, task_id.task())
                    && (!is_root
                        || self.is_single
                        || root_enabled_tasks.contains(&task_id.as_non_workspace_task_name()));
                if instantiable {
                    traversal_queue.push_back(task.to(task_id));
                }
            }
        }

        // A requested task that no package defines is fatal.
        if !missing_tasks.is_empty() {
            let mut names: Vec<_> = missing_tasks.keys().map(|name| name.to_string()).collect();
            names.sort();
            return Err(Error::MissingTasks {
                names: names.join(", "),
            });
        }

        let mut visited = HashSet::new();
        let mut engine: Engine<Building> = Engine::default();

        while let Some(task_id) = traversal_queue.pop_front() {
            {
                let (task_id, span) = task_id.clone().split();
                engine.add_task_location(task_id.into_owned(), span);
            }

            if visited.contains(task_id.as_inner()) {
                continue;
            }
            visited.insert(task_id.as_inner().clone());

            let workspace = PackageName::from(task_id.package());
            if self.package_graph.package_info(&workspace).is_none() {
                let (span, text) = task_id.span_and_text("turbo.json");
                return Err(Error::MissingPackage {
                    package: task_id.package().to_string(),
                    task_id: task_id.to_string(),
                    span,
                    text,
                });
            }

            let task_definition = self.task_definition(&task_id)?;
            let this_task_id = task_id.as_inner().clone().into_owned();
            let this_index = engine.get_index(&this_task_id);
            let mut has_deps = false;

            if !self.tasks_only {
                // `^task` fans out across the package's direct dependencies.
                let dep_packages = self
                    .package_graph
                    .immediate_dependencies(&PackageNode::Workspace(workspace.clone()));
                for topo_dep in &task_definition.topological_dependencies {
                    for dep_package in dep_packages.iter().flatten() {
                        let PackageNode::Workspace(dep_package) = dep_package else {
                            continue;
                        };
                        if *dep_package == PackageName::Root {
                            continue;
                        }
                        // A dependency package without the task is fine;
                        // not every package needs every task.
                        if !self.task_exists_in_package(dep_package, topo_dep.task())
                            || !self.has_task_definition(
                                dep_package,
                                &topo_dep.as_inner().clone().into_non_workspace_task(),
                            )
                        {
                            continue;
                        }
                        let dep_task_id = TaskId::from_static(
                            dep_package.as_str().to_string(),
                            topo_dep.task().to_string(),
                        );
                        let dep_index = engine.get_index(&dep_task_id);
                        engine.add_edge(this_index, dep_index);
                        has_deps = true;
                        traversal_queue.push_back(topo_dep.to(dep_task_id));
                    }
                }

                for dep in &task_definition.task_dependencies {
                    let dep_task_id = dep
                        .task_id()
                        .map(|id| id.into_owned())
                        .unwrap_or_else(|| {
                            TaskId::from_static(
                                this_task_id.package().to_string(),
                                dep.task().to_string(),
                            )
                        });
                    let dep_workspace = PackageName::from(dep_task_id.package());

                    if dep.is_package_task() {
                        // Fully qualified dependencies must exist.
                        if self.package_graph.package_info(&dep_workspace).is_none() {
                            let (span, text) = dep.span_and_text("turbo.json");
                            return Err(Error::MissingPackage {
                                package: dep_task_id.package().to_string(),
                                task_id: dep_task_id.to_string(),
                                span,
                                text,
                            });
                        }
                        let is_root_task = dep_workspace == PackageName::Root;
                        if is_root_task
                            && !self.is_single
                            && !root_enabled_tasks
                                .contains(&dep_task_id.as_non_workspace_task_name())
                        {
                            let (span, text) = dep.span_and_text("turbo.json");
                            return Err(Error::MissingRootTask {
                                task_name: dep_task_id.task().to_string(),
                                span,
                                text,
                            });
                        }
                        if !self.has_task_definition(
                            &dep_workspace,
                            &dep_task_id.as_non_workspace_task_name(),
                        ) {
                            let (span, text) = dep.span_and_text("turbo.json");
                            return Err(Error::MissingTaskDefinition {
                                task_id: dep_task_id.to_string(),
                                span,
                                text,
                            });
                        }
                    } else if !self.task_exists_in_package(&dep_workspace, dep_task_id.task())
                        || !self.has_task_definition(
                            &dep_workspace,
                            &dep_task_id.as_non_workspace_task_name(),
                        )
                    {
                        // A same-package dependency the package doesn't have
                        // is silently skipped.
                        continue;
                    }

                    let dep_index = engine.get_index(&dep_task_id);
                    engine.add_edge(this_index, dep_index);
                    has_deps = true;
                    traversal_queue.push_back(dep.to(dep_task_id));
                }
            }

            engine.add_definition(this_task_id.clone(), task_definition);
            if !has_deps {
                engine.connect_to_root(&this_task_id);
            }
        }

        graph::validate_graph(engine.task_graph_for_validation())
            .map_err(Error::CycleInTaskGraph)?;

        Ok(engine.seal())
    }
}

impl Engine<Building> {
    fn task_graph_for_validation(&self) -> &petgraph::Graph<super::TaskNode, ()> {
        &self.task_graph
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use turborepo_repository::{
        package_graph::PackageGraph, package_json::PackageJson, package_manager::PackageManager,
    };

    use super::*;
    use crate::turbo_json::parse_raw_turbo_json;

    fn mock_package_graph(
        repo_root: &turbopath::AbsoluteSystemPath,
        packages: &[(&str, &[&str], &[&str])],
    ) -> PackageGraph {
        let mut manifests = std::collections::HashMap::new();
        for (name, deps, scripts) in packages {
            let path = repo_root.join_components(&["packages", name, "package.json"]);
            manifests.insert(
                path,
                PackageJson {
                    name: Some(name.to_string()),
                    dependencies: Some(
                        deps.iter()
                            .map(|dep| (dep.to_string(), "workspace:*".to_string()))
                            .collect(),
                    ),
                    scripts: scripts
                        .iter()
                        .map(|script| (script.to_string(), format!("echo {script}")))
                        .collect(),
                    ..Default::default()
                },
            );
        }
        PackageGraph::builder(repo_root, PackageJson::default())
            .with_package_manager(PackageManager::Npm)
            .with_package_jsons(manifests)
            .build()
            .unwrap()
    }

    fn loader(json: &str) -> TurboJsonLoader {
        let raw = parse_raw_turbo_json(json).unwrap();
        let turbo_json = TurboJson::try_from(raw).unwrap();
        TurboJsonLoader::noop(
            [(PackageName::Root, turbo_json)].into_iter().collect(),
        )
    }

    fn all_dependencies(engine: &Engine) -> HashMap<String, HashSet<String>> {
        engine
            .task_ids()
            .map(|task_id| {
                let deps = engine
                    .dependencies(task_id)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|node| node.to_string())
                    .collect();
                (task_id.to_string(), deps)
            })
            .collect()
    }

    fn deps(entries: &[(&str, &[&str])]) -> HashMap<String, HashSet<String>> {
        entries
            .iter()
            .map(|(task, deps)| {
                (
                    task.to_string(),
                    deps.iter().map(|dep| dep.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_topological_expansion() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = turbopath::AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let package_graph = mock_package_graph(
            &repo_root,
            &[
                ("a", &[], &["build", "prepare"]),
                ("b", &[], &["build", "prepare"]),
                ("c", &["a", "b"], &["build", "prepare", "test"]),
            ],
        );
        let loader = loader(
            r#"{
                "tasks": {
                    "test": { "dependsOn": ["^build", "prepare"] },
                    "build": { "dependsOn": ["^build", "prepare"] },
                    "prepare": {}
                }
            }"#,
        );

        let engine = EngineBuilder::new(&package_graph, &loader, false)
            .with_tasks(Some(Spanned::new(TaskName::from("test"))))
            .with_workspaces(vec![
                PackageName::from("a"),
                PackageName::from("b"),
                PackageName::from("c"),
            ])
            .build()
            .unwrap();

        let expected = deps(&[
            ("a#test", &["a#prepare"]),
            ("a#build", &["a#prepare"]),
            ("a#prepare", &["___ROOT___"]),
            ("b#test", &["b#prepare"]),
            ("b#build", &["b#prepare"]),
            ("b#prepare", &["___ROOT___"]),
            ("c#prepare", &["___ROOT___"]),
            ("c#test", &["a#build", "b#build", "c#prepare"]),
        ]);
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_missing_script_skips_task() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = turbopath::AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        // b has no build script
        let package_graph = mock_package_graph(
            &repo_root,
            &[("a", &["b"], &["build"]), ("b", &[], &["lint"])],
        );
        let loader = loader(r#"{"tasks": {"build": {"dependsOn": ["^build"]}}}"#);

        let engine = EngineBuilder::new(&package_graph, &loader, false)
            .with_tasks(Some(Spanned::new(TaskName::from("build"))))
            .with_workspaces(vec![PackageName::from("a"), PackageName::from("b")])
            .build()
            .unwrap();

        let expected = deps(&[("a#build", &["___ROOT___"])]);
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_missing_requested_task_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = turbopath::AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let package_graph = mock_package_graph(&repo_root, &[("a", &[], &["build"])]);
        let loader = loader(r#"{"tasks": {"build": {}}}"#);

        let result = EngineBuilder::new(&package_graph, &loader, false)
            .with_tasks(Some(Spanned::new(TaskName::from("deploy"))))
            .with_workspaces(vec![PackageName::from("a")])
            .build();

        assert!(matches!(result, Err(Error::MissingTasks { .. })));
    }

    #[test]
    fn test_qualified_dep_on_missing_package_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = turbopath::AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let package_graph = mock_package_graph(&repo_root, &[("a", &[], &["build"])]);
        let loader = loader(
            r#"{"tasks": {"build": {"dependsOn": ["ghost#build"]}}}"#,
        );

        let result = EngineBuilder::new(&package_graph, &loader, false)
            .with_tasks(Some(Spanned::new(TaskName::from("build"))))
            .with_workspaces(vec![PackageName::from("a")])
            .build();

        assert!(matches!(result, Err(Error::MissingPackage { .. })));
    }

    #[test]
    fn test_bare_missing_dep_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = turbopath::AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let package_graph = mock_package_graph(&repo_root, &[("a", &[], &["build"])]);
        let loader = loader(r#"{"tasks": {"build": {"dependsOn": ["codegen"]}, "codegen": {}}}"#);

        let engine = EngineBuilder::new(&package_graph, &loader, false)
            .with_tasks(Some(Spanned::new(TaskName::from("build"))))
            .with_workspaces(vec![PackageName::from("a")])
            .build()
            .unwrap();

        let expected = deps(&[("a#build", &["___ROOT___"])]);
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_root_task_requires_declaration() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = turbopath::AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let package_graph = mock_package_graph(&repo_root, &[("a", &[], &["build"])]);
        let loader = loader(
            r#"{"tasks": {"build": {"dependsOn": ["//#codegen"]}, "codegen": {}}}"#,
        );

        let result = EngineBuilder::new(&package_graph, &loader, false)
            .with_tasks(Some(Spanned::new(TaskName::from("build"))))
            .with_workspaces(vec![PackageName::from("a")])
            .build();

        assert!(matches!(result, Err(Error::MissingRootTask { .. })));
    }

    #[test]
    fn test_task_cycle_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = turbopath::AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let package_graph =
            mock_package_graph(&repo_root, &[("a", &[], &["build", "prepare"])]);
        let loader = loader(
            r#"{"tasks": {
                "build": {"dependsOn": ["prepare"]},
                "prepare": {"dependsOn": ["build"]}
            }}"#,
        );

        let result = EngineBuilder::new(&package_graph, &loader, false)
            .with_tasks(Some(Spanned::new(TaskName::from("build"))))
            .with_workspaces(vec![PackageName::from("a")])
            .build();

        assert!(matches!(result, Err(Error::CycleInTaskGraph(_))));
    }

    #[test]
    fn test_single_package_uses_bare_definitions() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = turbopath::AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let root_package_json = PackageJson {
            scripts: [
                ("build".to_string(), "echo build".to_string()),
                ("test".to_string(), "echo test".to_string()),
            ]
            .into_iter()
            .collect(),
            ..Default::default()
        };
        let package_graph = PackageGraph::builder(&repo_root, root_package_json)
            .with_package_manager(PackageManager::Npm)
            .with_single_package_mode(true)
            .build()
            .unwrap();
        let loader = loader(
            r#"{"tasks": {"test": {"dependsOn": ["build"]}, "build": {"outputs": ["foo"]}}}"#,
        );

        let engine = EngineBuilder::new(&package_graph, &loader, true)
            .with_tasks(Some(Spanned::new(TaskName::from("test"))))
            .with_workspaces(vec![PackageName::Root])
            .build()
            .unwrap();

        let expected = deps(&[("//#test", &["//#build"]), ("//#build", &["___ROOT___"])]);
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_tasks_only_skips_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = turbopath::AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let package_graph = mock_package_graph(
            &repo_root,
            &[("a", &[], &["build"]), ("b", &["a"], &["build", "test"])],
        );
        let loader = loader(
            r#"{"tasks": {"build": {"dependsOn": ["^build"]}, "test": {"dependsOn": ["build"]}}}"#,
        );

        let engine = EngineBuilder::new(&package_graph, &loader, false)
            .with_tasks_only(true)
            .with_tasks(Some(Spanned::new(TaskName::from("test"))))
            .with_workspaces(vec![PackageName::from("b")])
            .build()
            .unwrap();

        let expected = deps(&[("b#test", &["___ROOT___"])]);
        assert_eq!(all_dependencies(&engine), expected);
    }
}
