//! The run driver: builds the package graph, loads configuration, resolves
//! the filter scope, constructs and validates the task graph, hashes
//! everything, and then either renders a dry run or drives the cache-aware
//! executor.

pub mod cache;
pub mod global_hash;
pub mod scope;
pub mod summary;

use std::{sync::Arc, time::Duration};

use chrono::Local;
use itertools::Itertools;
use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use turbopath::AbsoluteSystemPathBuf;
use turborepo_api_client::{APIAuth, APIClient};
use turborepo_cache::{AsyncCache, RemoteCacheOpts};
use turborepo_env::EnvironmentVariableMap;
use turborepo_errors::Spanned;
use turborepo_repository::{
    package_graph::{PackageGraph, PackageName},
    package_json::PackageJson,
};
use turborepo_scm::SCM;

use crate::{
    cli::{DryRunMode, EnvMode},
    engine::{Engine, EngineBuilder, ExecutionOptions, TaskNode},
    opts::{GraphOpts, Opts},
    process::ProcessManager,
    run::{
        cache::RunCache,
        global_hash::get_global_hash_inputs,
        summary::{RunTracker, TaskCacheSummary, TaskSummary},
    },
    signal::SignalHandler,
    task_graph::Visitor,
    task_hash::{PackageInputsHashes, TaskHasher},
    task_id::{TaskId, TaskName},
    turbo_json::TurboJsonLoader,
};

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error(transparent)]
    PackageJson(#[from] turborepo_repository::package_json::Error),
    #[error(transparent)]
    PackageGraph(#[from] turborepo_repository::package_graph::Error),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] crate::turbo_json::Error),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Scope(#[from] scope::Error),
    #[error(transparent)]
    #[diagnostic(transparent)]
    EngineBuilder(#[from] crate::engine::BuilderError),
    #[error("Invalid task configuration:\n{0}")]
    EngineValidation(String),
    #[error(transparent)]
    GlobalHash(#[from] global_hash::Error),
    #[error(transparent)]
    TaskHash(#[from] crate::task_hash::Error),
    #[error(transparent)]
    Cache(#[from] turborepo_cache::CacheError),
    #[error(transparent)]
    Visitor(#[from] crate::task_graph::VisitorError),
    #[error(transparent)]
    Execute(#[from] crate::engine::ExecuteError),
    #[error(transparent)]
    Summary(#[from] summary::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

const API_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Run {
    repo_root: AbsoluteSystemPathBuf,
    opts: Opts,
}

impl Run {
    pub fn new(repo_root: AbsoluteSystemPathBuf, opts: Opts) -> Self {
        Self { repo_root, opts }
    }

    pub async fn run(self) -> Result<i32, Error> {
        let Run { repo_root, opts } = self;
        let started_at = Local::now();
        let signal_handler = SignalHandler::install();
        // One snapshot, taken before anything else reads or mutates env.
        let env_at_execution_start = EnvironmentVariableMap::infer();

        let root_package_json =
            PackageJson::load(&repo_root.join_component("package.json"))?;
        let is_single_package = opts.run_opts.single_package;

        let package_graph = PackageGraph::builder(&repo_root, root_package_json)
            .with_single_package_mode(is_single_package)
            .build()?;

        let turbo_json_loader = if is_single_package {
            TurboJsonLoader::single_package(&repo_root)?
        } else {
            TurboJsonLoader::workspace(&repo_root, &package_graph)?
        };
        let root_turbo_json = turbo_json_loader.root().clone();

        let scm = SCM::new(&repo_root);

        let env_mode = opts
            .run_opts
            .env_mode
            .or(root_turbo_json.env_mode)
            .unwrap_or_default();

        // Scope: which packages are in this run.
        let filtered_packages = if is_single_package {
            [PackageName::Root].into_iter().collect()
        } else {
            let (packages, _explicit_filter) = scope::resolve_packages(
                &opts.scope_opts,
                &repo_root,
                &package_graph,
                &scm,
                root_turbo_json.global_deps.clone(),
            )?;
            packages
        };

        let tasks: Vec<Spanned<TaskName<'static>>> = opts
            .run_opts
            .tasks
            .iter()
            .map(|task| Spanned::new(TaskName::from(task.clone()).into_owned()))
            .collect();
        let mut workspaces: Vec<PackageName> = filtered_packages.into_iter().collect();
        workspaces.sort();

        let engine = EngineBuilder::new(&package_graph, &turbo_json_loader, is_single_package)
            .with_workspaces(workspaces.clone())
            .with_tasks(tasks)
            .build()?;

        engine
            .validate(opts.run_opts.concurrency)
            .map_err(|errors| {
                Error::EngineValidation(
                    errors.into_iter().map(|e| e.to_string()).sorted().join("\n"),
                )
            })?;

        if let Some(graph_opts) = &opts.run_opts.graph {
            match graph_opts {
                GraphOpts::Stdout => {
                    let mut stdout = std::io::stdout();
                    engine.write_dot(&mut stdout)?;
                }
                GraphOpts::File(file) => {
                    let path = AbsoluteSystemPathBuf::from_unknown(&repo_root, file.as_str());
                    path.ensure_dir()?;
                    let mut file = std::fs::File::create(path.as_std_path())?;
                    engine.write_dot(&mut file)?;
                }
            }
            return Ok(0);
        }

        // Hashing happens before anything executes; failures here abort the
        // run before any child process is spawned.
        let global_hash_inputs = get_global_hash_inputs(
            &repo_root,
            &package_graph,
            &root_turbo_json,
            &env_at_execution_start,
            env_mode,
            &scm,
        )?;
        let global_hash = global_hash_inputs.calculate_global_hash();

        let package_inputs_hashes =
            PackageInputsHashes::calculate_file_hashes(&scm, &engine, &package_graph, &repo_root)
                .await?;
        let task_hasher =
            TaskHasher::new(package_inputs_hashes, &env_at_execution_start, &global_hash);

        for task_id in topological_task_order(&engine) {
            let task_definition = engine
                .task_definition(&task_id)
                .expect("every task in the graph has a definition");
            let dependency_hashes = task_hasher.dependency_hashes(&engine, &task_id);
            task_hasher.calculate_task_hash(
                &task_id,
                task_definition,
                env_mode,
                &package_graph,
                dependency_hashes,
            )?;
        }

        // Remote cache wiring.
        let (api_client, api_auth) = match &opts.api_client_opts.token {
            Some(token) => {
                let use_preflight = root_turbo_json
                    .remote_cache
                    .as_ref()
                    .and_then(|rc| rc.preflight.as_ref())
                    .map(|preflight| *preflight.as_inner())
                    .unwrap_or(false);
                let client = APIClient::new(
                    &opts.api_client_opts.api_url,
                    Some(API_TIMEOUT),
                    crate::get_version(),
                    use_preflight,
                )
                .ok();
                let auth = APIAuth {
                    team_id: opts.api_client_opts.team_id.clone(),
                    token: token.clone(),
                    team_slug: opts.api_client_opts.team_slug.clone(),
                };
                (client, Some(auth))
            }
            None => (None, None),
        };

        let mut cache_opts = opts.cache_opts.clone();
        cache_opts.remote_cache_opts = root_turbo_json.remote_cache.as_ref().map(|rc| {
            RemoteCacheOpts {
                team_id: rc.team_id.as_ref().map(|id| id.as_inner().clone()),
                signature: rc
                    .signature
                    .as_ref()
                    .map(|sig| *sig.as_inner())
                    .unwrap_or(false),
            }
        });
        let async_cache = AsyncCache::new(&cache_opts, &repo_root, api_client, api_auth)?;

        let package_names: Vec<String> = workspaces
            .iter()
            .filter(|name| **name != PackageName::Root || is_single_package)
            .map(|name| name.to_string())
            .sorted()
            .collect();

        // Dry run: everything above ran, nothing below will.
        if let Some(dry_run_mode) = opts.run_opts.dry_run {
            return dry_run(
                dry_run_mode,
                &engine,
                &package_graph,
                &task_hasher,
                &async_cache,
                package_names,
                global_hash,
                &global_hash_inputs,
                env_mode,
                started_at,
                &opts,
            )
            .await;
        }

        let run_cache = Arc::new(RunCache::new(
            async_cache,
            repo_root.clone(),
            &opts.run_opts,
        ));
        let run_tracker = RunTracker::new(
            started_at,
            format!("turbo run {}", opts.run_opts.tasks.join(" ")),
        );

        let manager = ProcessManager::new();
        {
            // Signals translate into the child shutdown sequence; the walk
            // unwinds when its tasks report canceled.
            let mut subscriber = signal_handler.subscribe();
            let manager = manager.clone();
            tokio::spawn(async move {
                subscriber.listen().await;
                debug!("shutdown signal received, stopping children");
                manager.stop().await;
            });
        }

        let engine = Arc::new(engine);
        let visitor = Visitor::new(
            &repo_root,
            &package_graph,
            engine.clone(),
            run_cache.clone(),
            &run_tracker,
            &task_hasher,
            &opts.run_opts,
            env_mode,
            root_turbo_json.global_env.clone(),
            root_turbo_json.global_pass_through_env.clone(),
            manager.clone(),
        );

        let (visitor_tx, visitor_rx) = mpsc::channel(opts.run_opts.concurrency.max(1) as usize);
        let execution_options = ExecutionOptions::new(
            opts.run_opts.parallel,
            opts.run_opts.concurrency as usize,
        );

        let (execute_result, visit_result) = tokio::join!(
            engine.clone().execute(execution_options, visitor_tx),
            visitor.visit(visitor_rx),
        );
        visit_result?;
        execute_result?;

        // Drain queued cache writes before reporting.
        run_cache.shutdown_cache().await;

        let errors = visitor.errors();
        let mut stdout = std::io::stdout();
        run_tracker
            .finish(
                &repo_root,
                &opts.run_opts,
                package_names,
                global_hash,
                &global_hash_inputs,
                env_mode,
                &mut stdout,
            )
            .await?;

        for error in &errors {
            eprintln!("{error}");
        }

        if signal_handler.subscribe().is_triggered() {
            // canceled by signal: report as 128 + SIGINT
            return Ok(130);
        }
        Ok(if errors.is_empty() { 0 } else { 1 })
    }
}

/// Tasks in dependency-first order; used to hash tasks so dependency hashes
/// are always present.
fn topological_task_order(engine: &Engine) -> Vec<TaskId<'static>> {
    let graph = engine.task_graph();
    let mut order = petgraph::algo::toposort(graph, None)
        .expect("task graph was validated acyclic")
        .into_iter()
        .filter_map(|index| match &graph[index] {
            TaskNode::Task(task_id) => Some(task_id.clone()),
            TaskNode::Root => None,
        })
        .collect::<Vec<_>>();
    // edges point task -> dependency, so toposort yields dependents first
    order.reverse();
    order
}

/// The skeleton of a task's summary entry; callers fill in execution and
/// cache state.
pub(crate) fn task_summary(
    task_id: &TaskId<'static>,
    hash: &str,
    engine: &Engine,
    package_graph: &PackageGraph,
    task_hasher: &TaskHasher,
) -> TaskSummary {
    let task_definition = engine.task_definition(task_id).cloned().unwrap_or_default();
    let package_info = package_graph.package_info(&task_id.to_workspace_name());

    let command = package_info
        .and_then(|info| info.package_json.command(task_id.task()))
        .unwrap_or("<NONEXISTENT>")
        .to_string();
    let directory = package_info
        .map(|info| info.package_path().to_string())
        .unwrap_or_default();
    let log_file = package_info
        .map(|info| {
            info.package_path()
                .to_owned()
                .to_unix()
                .join(&cache::log_file_path(task_id.task()).to_unix())
                .into_string()
        })
        .unwrap_or_default();

    let hash_of_external_dependencies = package_info
        .and_then(|info| info.transitive_dependencies.as_ref())
        .map(|deps| {
            use crate::hash::TurboHash;
            crate::hash::LockFilePackages(deps.iter().cloned().collect()).hash()
        })
        .unwrap_or_default();

    let mut inputs: Vec<_> = task_hasher
        .expanded_inputs(task_id)
        .map(|hashes| {
            hashes
                .iter()
                .map(|(path, hash)| (path.clone(), hash.clone()))
                .collect()
        })
        .unwrap_or_default();
    inputs.sort();

    let task_ids_from = |nodes: Option<std::collections::HashSet<&TaskNode>>| {
        let mut ids: Vec<TaskId<'static>> = nodes
            .unwrap_or_default()
            .into_iter()
            .filter_map(|node| match node {
                TaskNode::Task(task_id) => Some(task_id.clone()),
                TaskNode::Root => None,
            })
            .collect();
        ids.sort();
        ids
    };

    TaskSummary {
        task_id: task_id.clone(),
        task: task_id.task().to_string(),
        package: task_id.package().to_string(),
        hash: hash.to_string(),
        inputs,
        hash_of_external_dependencies,
        cache_state: TaskCacheSummary::default(),
        command,
        outputs: task_definition.outputs.inclusions.clone(),
        excluded_outputs: task_definition.outputs.exclusions.clone(),
        log_file,
        directory,
        dependencies: task_ids_from(engine.dependencies(task_id)),
        dependents: task_ids_from(engine.dependents(task_id)),
        resolved_task_definition: task_definition,
        expanded_outputs: Vec::new(),
        execution: None,
    }
}

/// Steps 1-3 of the runner plus a summary rendering in place of execution.
#[allow(clippy::too_many_arguments)]
async fn dry_run(
    mode: DryRunMode,
    engine: &Engine,
    package_graph: &PackageGraph,
    task_hasher: &TaskHasher<'_>,
    cache: &AsyncCache,
    package_names: Vec<String>,
    global_hash: String,
    global_hash_inputs: &global_hash::GlobalHashableInputs,
    env_mode: EnvMode,
    started_at: chrono::DateTime<Local>,
    opts: &Opts,
) -> Result<i32, Error> {
    let tracker = task_hasher.task_hash_tracker();
    let mut tasks = Vec::new();
    for task_id in topological_task_order(engine) {
        let hash = tracker
            .hash(&task_id)
            .expect("every task is hashed before the dry run renders");
        let mut summary = task_summary(&task_id, &hash, engine, package_graph, task_hasher);
        // probe both tiers without restoring anything
        let hit_metadata = cache.exists(&hash).await.unwrap_or_default();
        summary.cache_state = TaskCacheSummary::from_hit(hit_metadata);
        tasks.push(summary);
    }

    let summary = summary::RunSummary {
        id: String::new(),
        version: "1".to_string(),
        turbo_version: crate::get_version().to_string(),
        monorepo: !opts.run_opts.single_package,
        global_hash,
        global_hash_summary: summary::GlobalHashSummary::from(global_hash_inputs),
        env_mode,
        packages: package_names,
        execution: summary::SummaryState::default(),
        tasks,
        start_time: started_at,
        end_time: Local::now(),
    };

    let mut stdout = std::io::stdout();
    summary.print_dry_run(mode, &mut stdout)?;
    Ok(0)
}
