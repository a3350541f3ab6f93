use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;
use turbopath::{AbsoluteSystemPath, RelativeUnixPathBuf};
use turborepo_env::{get_global_hashable_env_vars, DetailedMap, EnvironmentVariableMap};
use turborepo_repository::package_graph::PackageGraph;
use turborepo_scm::SCM;

use crate::{
    cli::EnvMode,
    hash::{GlobalHashable, LockFilePackages, TurboHash},
    turbo_json::TurboJson,
};

/// Bumped when the layout of cached artifacts changes, so stale entries
/// from incompatible versions never replay.
const GLOBAL_CACHE_KEY: &str = "snozzberries taste like snozzberries";

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Env(#[from] turborepo_env::Error),
    #[error(transparent)]
    Scm(#[from] turborepo_scm::Error),
    #[error(transparent)]
    Glob(#[from] globwalk::WalkError),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
    #[error("failed to serialize pipeline: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Everything that feeds the run-wide hash. Kept around after hashing
/// because the run summary reports these inputs.
#[derive(Debug)]
pub struct GlobalHashableInputs {
    pub global_cache_key: String,
    pub global_file_hash_map: HashMap<RelativeUnixPathBuf, String>,
    pub root_external_deps_hash: String,
    pub pipeline: String,
    pub env: Vec<String>,
    pub resolved_env_vars: DetailedMap,
    pub pass_through_env: Vec<String>,
    pub env_mode: EnvMode,
    pub engines: Vec<(String, String)>,
}

pub fn get_global_hash_inputs(
    repo_root: &AbsoluteSystemPath,
    package_graph: &PackageGraph,
    root_turbo_json: &TurboJson,
    env_at_execution_start: &EnvironmentVariableMap,
    env_mode: EnvMode,
    scm: &SCM,
) -> Result<GlobalHashableInputs, Error> {
    // Global file dependencies, hashed by content.
    let global_file_hash_map = if root_turbo_json.global_deps.is_empty() {
        HashMap::new()
    } else {
        let files = globwalk::globwalk(
            repo_root,
            &root_turbo_json.global_deps,
            &[],
            globwalk::WalkType::Files,
        )?;
        let mut anchored = Vec::with_capacity(files.len());
        for file in files {
            anchored.push(repo_root.anchor(&file)?);
        }
        scm.get_hashes_for_files(repo_root, &anchored, false)?
    };

    let root_external_deps_hash = package_graph
        .package_info(&turborepo_repository::package_graph::PackageName::Root)
        .and_then(|info| info.transitive_dependencies.as_ref())
        .map(|deps| LockFilePackages(deps.iter().cloned().collect()).hash())
        .unwrap_or_default();

    let resolved_env_vars =
        get_global_hashable_env_vars(env_at_execution_start, &root_turbo_json.global_env)?;

    // The pipeline itself is a hash input: a changed task definition
    // anywhere invalidates the run. Keys are sorted by the underlying map.
    let pipeline = serde_json::to_string(&root_turbo_json.tasks)?;

    let engines = package_graph
        .root_package_json()
        .engines
        .as_ref()
        .map(|engines| {
            engines
                .iter()
                .map(|(engine, version)| (engine.clone(), version.clone()))
                .collect()
        })
        .unwrap_or_default();

    let global_cache_key = match &root_turbo_json.global_cache_key {
        Some(user_key) => format!("{GLOBAL_CACHE_KEY}|{user_key}"),
        None => GLOBAL_CACHE_KEY.to_string(),
    };

    Ok(GlobalHashableInputs {
        global_cache_key,
        global_file_hash_map,
        root_external_deps_hash,
        pipeline,
        env: root_turbo_json.global_env.clone(),
        resolved_env_vars,
        pass_through_env: root_turbo_json
            .global_pass_through_env
            .clone()
            .unwrap_or_default(),
        env_mode,
        engines,
    })
}

impl GlobalHashableInputs {
    pub fn calculate_global_hash(&self) -> String {
        let mut global_file_hash_map: Vec<_> = self
            .global_file_hash_map
            .iter()
            .map(|(path, hash)| (path.clone(), hash.clone()))
            .collect();
        global_file_hash_map.sort();

        let hashable = GlobalHashable {
            global_cache_key: self.global_cache_key.clone(),
            global_file_hash_map,
            root_external_deps_hash: self.root_external_deps_hash.clone(),
            pipeline: self.pipeline.clone(),
            env: self.env.clone(),
            resolved_env_vars: self.resolved_env_vars.all.to_secret_hashable(),
            pass_through_env: self.pass_through_env.clone(),
            env_mode: self.env_mode,
            engines: self.engines.clone(),
        };
        let hash = hashable.hash();
        debug!("global hash is {hash}");
        hash
    }
}
