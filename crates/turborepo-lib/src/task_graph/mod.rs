mod visitor;

use serde::Serialize;
use turborepo_errors::Spanned;

pub use visitor::{Error as VisitorError, Visitor};

use crate::{
    task_id::TaskName,
    turbo_json::{Error as ConfigError, OutputLogsMode, RawTaskDefinition, CONFIG_FILE},
};

/// Output globs split into inclusions and `!`-prefixed exclusions.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutputs {
    pub inclusions: Vec<String>,
    pub exclusions: Vec<String>,
}

impl TaskOutputs {
    pub fn is_empty(&self) -> bool {
        self.inclusions.is_empty() && self.exclusions.is_empty()
    }

    /// Globs for the cache layer, including the task's log file which is
    /// always captured.
    pub fn validated_inclusions(&self) -> Vec<String> {
        self.inclusions.clone()
    }
}

/// The fully merged and validated definition of one task, the unit the
/// hasher and the executor work against.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub outputs: TaskOutputs,
    pub cache: bool,
    /// Environment variable names that feed the task hash.
    pub env: Vec<String>,
    /// Environment variables forwarded to the task but not hashed in loose
    /// mode. `None` means nothing was declared.
    pub pass_through_env: Option<Vec<String>>,
    /// `^task` entries: the named task in every direct dependency package.
    pub topological_dependencies: Vec<Spanned<TaskName<'static>>>,
    /// Plain and package-qualified `dependsOn` entries.
    pub task_dependencies: Vec<Spanned<TaskName<'static>>>,
    /// Input globs; empty means every file in the package.
    pub inputs: Vec<String>,
    pub output_logs: OutputLogsMode,
    pub persistent: bool,
    pub interactive: bool,
}

impl Default for TaskDefinition {
    fn default() -> Self {
        Self {
            outputs: TaskOutputs::default(),
            cache: true,
            env: Vec::new(),
            pass_through_env: None,
            topological_dependencies: Vec::new(),
            task_dependencies: Vec::new(),
            inputs: Vec::new(),
            output_logs: OutputLogsMode::default(),
            persistent: false,
            interactive: false,
        }
    }
}

const TOPOLOGICAL_PIPELINE_DELIMITER: &str = "^";
const ENV_PIPELINE_DELIMITER: &str = "$";

impl TaskDefinition {
    /// Merges a chain of raw definitions (root bare, root qualified, package
    /// override, in that order) and validates the result.
    pub fn from_raw_chain(
        chain: impl IntoIterator<Item = RawTaskDefinition>,
    ) -> Result<Self, ConfigError> {
        let mut merged = RawTaskDefinition::default();
        for raw in chain {
            merged.merge(raw);
        }
        Self::from_raw(merged)
    }

    pub fn from_raw(raw: RawTaskDefinition) -> Result<Self, ConfigError> {
        let mut outputs = TaskOutputs::default();
        for glob in raw.outputs.into_iter().flatten() {
            let glob = glob.into_inner();
            match glob.strip_prefix('!') {
                Some(exclusion) => outputs.exclusions.push(exclusion.to_string()),
                None => outputs.inclusions.push(glob),
            }
        }
        outputs.inclusions.sort();
        outputs.exclusions.sort();

        let mut topological_dependencies = Vec::new();
        let mut task_dependencies = Vec::new();
        for dep in raw.depends_on.map(Spanned::into_inner).into_iter().flatten() {
            let (dep_name, span) = dep.split();
            if let Some(topo_dep) = dep_name.strip_prefix(TOPOLOGICAL_PIPELINE_DELIMITER) {
                topological_dependencies
                    .push(span.to(TaskName::from(topo_dep.to_string())));
            } else if let Some(stripped) = dep_name.strip_prefix(ENV_PIPELINE_DELIMITER) {
                // The legacy "$VAR" syntax for implicit env dependencies is
                // a hard error; env vars belong in "env".
                let stripped = stripped.to_string();
                let (span, text) = span.span_and_text(CONFIG_FILE);
                return Err(ConfigError::InvalidDependsOnValue {
                    value: dep_name,
                    stripped,
                    span,
                    text,
                });
            } else {
                task_dependencies.push(span.to(TaskName::from(dep_name)));
            }
        }
        topological_dependencies.sort_by(|a, b| a.value.cmp(&b.value));
        task_dependencies.sort_by(|a, b| a.value.cmp(&b.value));

        let mut env = Vec::new();
        for var in raw.env.into_iter().flatten() {
            if let Some(stripped) = var.strip_prefix(ENV_PIPELINE_DELIMITER) {
                let stripped = stripped.to_string();
                let (span, text) = var.span_and_text(CONFIG_FILE);
                return Err(ConfigError::InvalidEnvPrefix { stripped, span, text });
            }
            env.push(var.into_inner());
        }
        env.sort();
        env.dedup();

        let pass_through_env = raw.pass_through_env.map(|vars| {
            let mut vars: Vec<String> = vars.into_iter().map(Spanned::into_inner).collect();
            vars.sort();
            vars.dedup();
            vars
        });

        let inputs: Vec<String> = raw
            .inputs
            .into_iter()
            .flatten()
            .map(Spanned::into_inner)
            .collect();

        let persistent = raw.persistent.as_deref().copied().unwrap_or(false);
        let interactive = raw.interactive.as_deref().copied().unwrap_or(false);

        let cache = match &raw.cache {
            Some(cache) => {
                if **cache && interactive {
                    let (span, text) = raw
                        .interactive
                        .as_ref()
                        .expect("interactive is set when true")
                        .span_and_text(CONFIG_FILE);
                    return Err(ConfigError::InteractiveNoCacheable { span, text });
                }
                **cache
            }
            None => true,
        };
        // Persistent and interactive tasks never finish normally, so there
        // is nothing coherent to cache.
        let cache = cache && !persistent && !interactive;

        Ok(TaskDefinition {
            outputs,
            cache,
            env,
            pass_through_env,
            topological_dependencies,
            task_dependencies,
            inputs,
            output_logs: raw
                .output_logs
                .map(Spanned::into_inner)
                .unwrap_or_default(),
            persistent,
            interactive,
        })
    }

    /// Repo-anchored globs for collecting this task's outputs after a run,
    /// rooted at the package directory.
    pub fn repo_relative_hashable_outputs(
        &self,
        task_name: &crate::task_id::TaskId,
        package_dir: &turbopath::AnchoredSystemPath,
    ) -> TaskOutputs {
        let make_glob_repo_relative = |glob: &str| -> String {
            let mut prefix = package_dir.to_unix().into_string();
            if !prefix.is_empty() {
                prefix.push('/');
            }
            format!("{prefix}{glob}")
        };

        // The log file is always an output.
        let log_file = crate::run::cache::log_file_path(task_name.task());
        let mut inclusions: Vec<String> = self
            .outputs
            .inclusions
            .iter()
            .map(|glob| make_glob_repo_relative(glob))
            .collect();
        inclusions.push(make_glob_repo_relative(log_file.to_unix().as_str()));
        inclusions.sort();

        let mut exclusions: Vec<String> = self
            .outputs
            .exclusions
            .iter()
            .map(|glob| make_glob_repo_relative(glob))
            .collect();
        exclusions.sort();

        TaskOutputs {
            inclusions,
            exclusions,
        }
    }
}
