//! Per-task hashing: file inputs first (in parallel, before anything
//! executes), then each task's full hash in dependency order so that
//! topological dependency hashes are available when a task needs them.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::debug;
use turbopath::{AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use turborepo_env::{DetailedMap, EnvironmentVariableMap};
use turborepo_repository::package_graph::PackageGraph;
use turborepo_scm::{GitHashes, SCM};

use crate::{
    cli::EnvMode,
    engine::{Engine, TaskNode},
    hash::{FileHashes, LockFilePackages, TaskHashable, TurboHash},
    task_graph::TaskDefinition,
    task_id::TaskId,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot find package {package} for task {task_id}")]
    MissingPackage { package: String, task_id: String },
    #[error("missing task definition for {0}")]
    MissingTaskDefinition(String),
    #[error(transparent)]
    Scm(#[from] turborepo_scm::Error),
    #[error(transparent)]
    Env(#[from] turborepo_env::Error),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
    #[error("failed to serialize task definition: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("hashing task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// File-content hashes for every task's inputs, computed up front. A
/// failure here is fatal before any task runs.
#[derive(Debug, Default)]
pub struct PackageInputsHashes {
    /// task id -> hash over its sorted input (path, hash) pairs
    pub hashes: HashMap<TaskId<'static>, String>,
    /// task id -> the individual file hashes feeding the above
    pub expanded_hashes: HashMap<TaskId<'static>, GitHashes>,
}

impl PackageInputsHashes {
    pub async fn calculate_file_hashes(
        scm: &SCM,
        engine: &Engine,
        package_graph: &PackageGraph,
        repo_root: &AbsoluteSystemPathBuf,
    ) -> Result<PackageInputsHashes, Error> {
        let mut jobs = Vec::new();

        for task_node in engine.tasks() {
            let TaskNode::Task(task_id) = task_node else {
                continue;
            };
            let task_definition = engine
                .task_definition(task_id)
                .ok_or_else(|| Error::MissingTaskDefinition(task_id.to_string()))?;

            let package_name = task_id.to_workspace_name();
            let package_info = package_graph.package_info(&package_name).ok_or_else(|| {
                Error::MissingPackage {
                    package: package_name.to_string(),
                    task_id: task_id.to_string(),
                }
            })?;

            let package_path = package_info.package_path().to_owned();
            let inputs = task_definition.inputs.clone();
            let default_exclusions = task_definition.outputs.inclusions.clone();
            let task_id = task_id.clone();
            let repo_root = repo_root.clone();
            // SCM hashing shells out to git and reads files; keep it off
            // the async workers.
            let scm = scm_for_blocking(scm, &repo_root);
            jobs.push(tokio::task::spawn_blocking(move || {
                let hashes = scm.get_package_file_hashes(
                    &repo_root,
                    &package_path,
                    &inputs,
                    &default_exclusions,
                )?;
                Ok::<_, Error>((task_id, hashes))
            }));
        }

        let mut hashes = HashMap::new();
        let mut expanded_hashes = HashMap::new();
        for job in jobs {
            let (task_id, file_hashes) = job.await??;
            hashes.insert(task_id.clone(), FileHashes(file_hashes.clone()).hash());
            expanded_hashes.insert(task_id, file_hashes);
        }

        Ok(PackageInputsHashes {
            hashes,
            expanded_hashes,
        })
    }
}

// SCM is re-detected per blocking job rather than shared across threads;
// detection is two path probes.
fn scm_for_blocking(scm: &SCM, repo_root: &AbsoluteSystemPathBuf) -> SCM {
    if scm.is_manual() {
        SCM::Manual
    } else {
        SCM::new(repo_root)
    }
}

#[derive(Debug, Default)]
pub struct TaskHashTrackerState {
    package_task_hashes: HashMap<TaskId<'static>, String>,
    package_task_env_vars: HashMap<TaskId<'static>, DetailedMap>,
    expanded_outputs: HashMap<TaskId<'static>, Vec<AnchoredSystemPathBuf>>,
}

/// Shared record of everything hashed during the run; the visitor writes
/// expanded outputs into it and the run summary reads it at the end.
#[derive(Debug, Default, Clone)]
pub struct TaskHashTracker {
    state: Arc<Mutex<TaskHashTrackerState>>,
}

impl TaskHashTracker {
    pub fn hash(&self, task_id: &TaskId) -> Option<String> {
        let state = self.state.lock().expect("hash tracker lock poisoned");
        state.package_task_hashes.get(task_id).cloned()
    }

    pub fn env_vars(&self, task_id: &TaskId) -> Option<EnvironmentVariableMap> {
        let state = self.state.lock().expect("hash tracker lock poisoned");
        state
            .package_task_env_vars
            .get(task_id)
            .map(|detailed| detailed.all.clone())
    }

    pub fn expanded_outputs(&self, task_id: &TaskId) -> Option<Vec<AnchoredSystemPathBuf>> {
        let state = self.state.lock().expect("hash tracker lock poisoned");
        state.expanded_outputs.get(task_id).cloned()
    }

    pub fn track_expanded_outputs(
        &self,
        task_id: TaskId<'static>,
        outputs: Vec<AnchoredSystemPathBuf>,
    ) {
        let mut state = self.state.lock().expect("hash tracker lock poisoned");
        state.expanded_outputs.insert(task_id, outputs);
    }
}

/// Computes full task hashes and remembers them for dependents.
pub struct TaskHasher<'a> {
    package_inputs_hashes: PackageInputsHashes,
    env_at_execution_start: &'a EnvironmentVariableMap,
    global_hash: &'a str,
    task_hash_tracker: TaskHashTracker,
}

impl<'a> TaskHasher<'a> {
    pub fn new(
        package_inputs_hashes: PackageInputsHashes,
        env_at_execution_start: &'a EnvironmentVariableMap,
        global_hash: &'a str,
    ) -> Self {
        Self {
            package_inputs_hashes,
            env_at_execution_start,
            global_hash,
            task_hash_tracker: TaskHashTracker::default(),
        }
    }

    pub fn task_hash_tracker(&self) -> TaskHashTracker {
        self.task_hash_tracker.clone()
    }

    pub fn expanded_inputs(&self, task_id: &TaskId) -> Option<&GitHashes> {
        self.package_inputs_hashes.expanded_hashes.get(task_id)
    }

    pub fn calculate_task_hash(
        &self,
        task_id: &TaskId<'static>,
        task_definition: &TaskDefinition,
        env_mode: EnvMode,
        package_graph: &PackageGraph,
        dependency_hashes: Vec<String>,
    ) -> Result<String, Error> {
        let hash_of_files = self
            .package_inputs_hashes
            .hashes
            .get(task_id)
            .cloned()
            .unwrap_or_default();

        let package_name = task_id.to_workspace_name();
        let package_info =
            package_graph
                .package_info(&package_name)
                .ok_or_else(|| Error::MissingPackage {
                    package: package_name.to_string(),
                    task_id: task_id.to_string(),
                })?;

        let external_deps_hash = package_info
            .transitive_dependencies
            .as_ref()
            .map(|deps| LockFilePackages(deps.iter().cloned().collect()).hash())
            .unwrap_or_default();

        let env_vars = self
            .env_at_execution_start
            .from_wildcards(&task_definition.env)?;
        let detailed_env = DetailedMap {
            all: env_vars.clone(),
            by_source: turborepo_env::BySource {
                explicit: env_vars.clone(),
                matching: EnvironmentVariableMap::default(),
            },
        };

        let mut task_dependency_hashes = dependency_hashes;
        task_dependency_hashes.sort();

        let task_hashable = TaskHashable {
            global_hash: self.global_hash,
            task_dependency_hashes,
            package_dir: package_info.package_path().to_unix(),
            task: task_id.to_string(),
            external_deps_hash,
            hash_of_files: &hash_of_files,
            outputs: task_definition.outputs.clone(),
            task_definition: serde_json::to_string(task_definition)?,
            env: task_definition.env.clone(),
            resolved_env_vars: env_vars.to_secret_hashable(),
            pass_through_env: task_definition
                .pass_through_env
                .clone()
                .unwrap_or_default(),
            env_mode,
        };
        let hash = task_hashable.hash();
        debug!("task hash for {task_id} is {hash}");

        let mut state = self
            .task_hash_tracker
            .state
            .lock()
            .expect("hash tracker lock poisoned");
        state.package_task_hashes.insert(task_id.clone(), hash.clone());
        state.package_task_env_vars.insert(task_id.clone(), detailed_env);

        Ok(hash)
    }

    /// Hashes of this task's direct dependencies, which must have been
    /// hashed already (the engine hands out tasks in dependency order).
    pub fn dependency_hashes(&self, engine: &Engine, task_id: &TaskId) -> Vec<String> {
        let mut hashes = Vec::new();
        for node in engine.dependencies(task_id).unwrap_or_default() {
            let TaskNode::Task(dependency_id) = node else {
                continue;
            };
            if let Some(hash) = self.task_hash_tracker.hash(dependency_id) {
                hashes.push(hash);
            }
        }
        hashes.sort();
        hashes
    }

    /// The environment handed to the child process. Strict mode forwards
    /// only declared variables plus a small hygiene set; loose mode
    /// forwards everything.
    pub fn execution_env(
        &self,
        env_mode: EnvMode,
        task_definition: &TaskDefinition,
        global_env: &[String],
        global_pass_through_env: Option<&[String]>,
        task_hash: &str,
    ) -> Result<EnvironmentVariableMap, Error> {
        let mut execution_env = match env_mode {
            EnvMode::Loose => self.env_at_execution_start.clone(),
            EnvMode::Strict => {
                let mut declared: Vec<String> = DEFAULT_PASS_THROUGH_VARS
                    .iter()
                    .map(|var| var.to_string())
                    .collect();
                declared.extend(task_definition.env.iter().cloned());
                declared.extend(
                    task_definition.pass_through_env.iter().flatten().cloned(),
                );
                declared.extend(global_env.iter().cloned());
                declared.extend(global_pass_through_env.into_iter().flatten().cloned());
                self.env_at_execution_start.from_wildcards(&declared)?
            }
        };

        execution_env.insert("TURBO_HASH".to_string(), task_hash.to_string());
        Ok(execution_env)
    }

    pub fn env_vars_for_task(&self, task_id: &TaskId) -> Option<EnvironmentVariableMap> {
        self.task_hash_tracker.env_vars(task_id)
    }
}

/// Always forwarded in strict mode so shells and tools behave.
const DEFAULT_PASS_THROUGH_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "SHELL",
    "USER",
    "TZ",
    "LANG",
    "TMPDIR",
    "TEMP",
    "TMP",
    "SYSTEMROOT",
    "WINDIR",
    "PATHEXT",
    "COMSPEC",
];

#[cfg(test)]
mod test {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> EnvironmentVariableMap {
        EnvironmentVariableMap::from(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        )
    }

    fn test_graph(dir: &tempfile::TempDir) -> PackageGraph {
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let manifests = HashMap::from([(
            repo_root.join_components(&["packages", "web", "package.json"]),
            turborepo_repository::package_json::PackageJson {
                name: Some("web".to_string()),
                ..Default::default()
            },
        )]);
        PackageGraph::builder(&repo_root, Default::default())
            .with_package_manager(turborepo_repository::package_manager::PackageManager::Npm)
            .with_package_jsons(manifests)
            .build()
            .unwrap()
    }

    #[test]
    fn test_env_var_sensitivity() {
        let dir = tempfile::tempdir().unwrap();
        let graph = test_graph(&dir);
        let task_id = TaskId::new("web", "build").into_owned();

        let declared = TaskDefinition {
            env: vec!["SOME_ENV_VAR".to_string()],
            ..Default::default()
        };
        let undeclared = TaskDefinition::default();

        let env_unset = env(&[]);
        let env_set = env(&[("SOME_ENV_VAR", "hi")]);

        let hash_with = |env_map: &EnvironmentVariableMap, def: &TaskDefinition| {
            let hasher = TaskHasher::new(PackageInputsHashes::default(), env_map, "global");
            hasher
                .calculate_task_hash(&task_id, def, EnvMode::Strict, &graph, Vec::new())
                .unwrap()
        };

        // declared env var flips the hash
        assert_ne!(hash_with(&env_unset, &declared), hash_with(&env_set, &declared));
        // undeclared env var does not
        assert_eq!(
            hash_with(&env_unset, &undeclared),
            hash_with(&env_set, &undeclared)
        );
    }

    #[test]
    fn test_task_definition_sensitivity() {
        let dir = tempfile::tempdir().unwrap();
        let graph = test_graph(&dir);
        let task_id = TaskId::new("web", "build").into_owned();
        let env_map = env(&[]);

        let hasher = TaskHasher::new(PackageInputsHashes::default(), &env_map, "global");
        let base = hasher
            .calculate_task_hash(
                &task_id,
                &TaskDefinition::default(),
                EnvMode::Strict,
                &graph,
                Vec::new(),
            )
            .unwrap();
        let changed = hasher
            .calculate_task_hash(
                &task_id,
                &TaskDefinition {
                    outputs: crate::task_graph::TaskOutputs {
                        inclusions: vec!["dist/**".to_string()],
                        exclusions: vec![],
                    },
                    ..Default::default()
                },
                EnvMode::Strict,
                &graph,
                Vec::new(),
            )
            .unwrap();
        assert_ne!(base, changed);
    }

    #[test]
    fn test_strict_env_filters_undeclared() {
        let env_map = env(&[("PATH", "/bin"), ("SECRET", "shh"), ("DECLARED", "yes")]);
        let hasher = TaskHasher::new(PackageInputsHashes::default(), &env_map, "global");

        let definition = TaskDefinition {
            env: vec!["DECLARED".to_string()],
            ..Default::default()
        };
        let strict_env = hasher
            .execution_env(EnvMode::Strict, &definition, &[], None, "hash")
            .unwrap();
        assert_eq!(strict_env.get("DECLARED").map(String::as_str), Some("yes"));
        assert_eq!(strict_env.get("PATH").map(String::as_str), Some("/bin"));
        assert!(!strict_env.contains_key("SECRET"));
        assert_eq!(strict_env.get("TURBO_HASH").map(String::as_str), Some("hash"));

        let loose_env = hasher
            .execution_env(EnvMode::Loose, &definition, &[], None, "hash")
            .unwrap();
        assert!(loose_env.contains_key("SECRET"));
    }
}
