use std::{io::Write, sync::Arc};

use tracing::warn;
use turbopath::{AbsoluteSystemPathBuf, AnchoredSystemPath, AnchoredSystemPathBuf};
use turborepo_cache::{AsyncCache, CacheError, CacheHitMetadata};

use crate::{
    opts::RunOpts,
    task_graph::{TaskDefinition, TaskOutputs},
    task_id::TaskId,
    turbo_json::OutputLogsMode,
};

pub const LOG_DIR: &str = ".turbo";

/// Where a task's captured log lives, relative to its package directory.
pub fn log_file_path(task_name: &str) -> AnchoredSystemPathBuf {
    AnchoredSystemPathBuf::from_raw(format!("{LOG_DIR}/turbo-{task_name}.log"))
        .expect("log file path is relative")
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("cannot find task log: {0}")]
    LogFileMissing(#[source] std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Glob(#[from] globwalk::WalkError),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
}

/// Run-wide cache state shared by all task caches.
pub struct RunCache {
    cache: AsyncCache,
    reads_disabled: bool,
    writes_disabled: bool,
    output_logs_override: Option<OutputLogsMode>,
    repo_root: AbsoluteSystemPathBuf,
}

impl RunCache {
    pub fn new(cache: AsyncCache, repo_root: AbsoluteSystemPathBuf, run_opts: &RunOpts) -> Self {
        Self {
            cache,
            reads_disabled: run_opts.force,
            writes_disabled: run_opts.no_cache,
            output_logs_override: run_opts.output_logs_override,
            repo_root,
        }
    }

    pub fn task_cache(
        self: &Arc<Self>,
        task_definition: &TaskDefinition,
        package_dir: &AnchoredSystemPath,
        task_id: &TaskId<'static>,
        hash: &str,
    ) -> TaskCache {
        let log_file_path = self
            .repo_root
            .resolve(package_dir)
            .resolve(&log_file_path(task_id.task()));
        let repo_relative_globs =
            task_definition.repo_relative_hashable_outputs(task_id, package_dir);

        TaskCache {
            expanded_outputs: Vec::new(),
            run_cache: self.clone(),
            repo_relative_globs,
            hash: hash.to_string(),
            task_id: task_id.clone(),
            task_output_logs: self
                .output_logs_override
                .unwrap_or(task_definition.output_logs),
            caching_disabled: !task_definition.cache,
            log_file_path,
        }
    }

    /// Drains pending cache writes.
    pub async fn shutdown_cache(&self) {
        self.cache.shutdown().await;
    }
}

/// The cache interface for one task: fetch-and-restore before running,
/// store after a successful run, and log replay for hits.
pub struct TaskCache {
    expanded_outputs: Vec<AnchoredSystemPathBuf>,
    run_cache: Arc<RunCache>,
    repo_relative_globs: TaskOutputs,
    hash: String,
    task_id: TaskId<'static>,
    task_output_logs: OutputLogsMode,
    caching_disabled: bool,
    log_file_path: AbsoluteSystemPathBuf,
}

impl TaskCache {
    pub fn is_caching_disabled(&self) -> bool {
        self.caching_disabled
    }

    pub fn output_logs(&self) -> OutputLogsMode {
        self.task_output_logs
    }

    pub fn log_file_path(&self) -> &AbsoluteSystemPathBuf {
        &self.log_file_path
    }

    pub fn expanded_outputs(&self) -> &[AnchoredSystemPathBuf] {
        &self.expanded_outputs
    }

    /// Writes the captured log back to the user's terminal, honoring the
    /// task's output mode.
    pub fn replay_log_file(&self, output: &mut impl Write) -> Result<(), Error> {
        let contents = self
            .log_file_path
            .read_to_string()
            .map_err(Error::LogFileMissing)?;
        output.write_all(contents.as_bytes())?;
        Ok(())
    }

    /// Replays logs after a failure for tasks configured to stay quiet on
    /// success.
    pub fn on_error(&self, output: &mut impl Write) -> Result<(), Error> {
        if self.task_output_logs == OutputLogsMode::ErrorsOnly {
            writeln!(output, "cache miss, executing {}", self.hash)?;
            self.replay_log_file(output)?;
        }
        Ok(())
    }

    /// Probes the cache and restores outputs on a hit. A read failure is
    /// logged and treated as a miss.
    pub async fn restore_outputs(
        &mut self,
        output: &mut impl Write,
    ) -> Result<Option<CacheHitMetadata>, Error> {
        if self.caching_disabled || self.run_cache.reads_disabled {
            if !matches!(
                self.task_output_logs,
                OutputLogsMode::None | OutputLogsMode::ErrorsOnly
            ) {
                writeln!(output, "cache bypass, force executing {}", self.hash)?;
            }
            return Ok(None);
        }

        let cache_status = match self
            .run_cache
            .cache
            .fetch(&self.run_cache.repo_root, &self.hash)
            .await
        {
            Ok(cache_status) => cache_status,
            Err(err) => {
                warn!("failed to fetch {} from cache: {err}", self.task_id);
                None
            }
        };

        let Some((cache_hit_metadata, restored_files)) = cache_status else {
            if !matches!(
                self.task_output_logs,
                OutputLogsMode::None | OutputLogsMode::ErrorsOnly
            ) {
                writeln!(output, "cache miss, executing {}", self.hash)?;
            }
            return Ok(None);
        };

        self.expanded_outputs = restored_files;

        match self.task_output_logs {
            OutputLogsMode::Full => {
                writeln!(output, "cache hit, replaying logs {}", self.hash)?;
                self.replay_log_file(output)?;
            }
            // new-only shows logs for fresh executions, never replays
            OutputLogsMode::HashOnly | OutputLogsMode::NewOnly => {
                writeln!(output, "cache hit, suppressing logs {}", self.hash)?;
            }
            OutputLogsMode::None | OutputLogsMode::ErrorsOnly => {}
        }

        Ok(Some(cache_hit_metadata))
    }

    /// Collects the declared outputs (and the log file) and queues the
    /// cache write.
    pub async fn save_outputs(&mut self, duration_ms: u64) -> Result<(), Error> {
        if self.caching_disabled || self.run_cache.writes_disabled {
            return Ok(());
        }

        let files = globwalk::globwalk(
            &self.run_cache.repo_root,
            &self.repo_relative_globs.inclusions,
            &self.repo_relative_globs.exclusions,
            globwalk::WalkType::All,
        )?;

        let mut relative_paths = Vec::with_capacity(files.len());
        for file in files {
            relative_paths.push(self.run_cache.repo_root.anchor(&file)?);
        }
        relative_paths.sort();
        self.expanded_outputs = relative_paths.clone();

        self.run_cache
            .cache
            .put(
                self.run_cache.repo_root.clone(),
                self.hash.clone(),
                relative_paths,
                duration_ms,
            )
            .await;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use turborepo_cache::CacheOpts;

    use super::*;
    use crate::{cli::EnvMode, opts::ResolvedLogOrder};

    fn run_opts(force: bool, no_cache: bool) -> RunOpts {
        RunOpts {
            tasks: vec!["build".to_string()],
            concurrency: 10,
            parallel: false,
            env_mode: Some(EnvMode::Strict),
            force,
            continue_on_error: false,
            dry_run: None,
            graph: None,
            single_package: false,
            log_order: ResolvedLogOrder::Stream,
            log_prefix: crate::cli::LogPrefix::Auto,
            output_logs_override: None,
            no_cache,
            summarize: false,
        }
    }

    fn setup(
        force: bool,
    ) -> (tempfile::TempDir, Arc<RunCache>, TaskCache) {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let package_dir = repo_root.join_components(&["packages", "web"]);
        package_dir.create_dir_all().unwrap();

        let cache = AsyncCache::new(
            &CacheOpts {
                cache_dir: "cache".into(),
                workers: 1,
                ..Default::default()
            },
            &repo_root,
            None,
            None,
        )
        .unwrap();
        let run_cache = Arc::new(RunCache::new(cache, repo_root, &run_opts(force, false)));

        let task_id = TaskId::new("web", "build").into_owned();
        let definition = TaskDefinition {
            outputs: TaskOutputs {
                inclusions: vec!["dist/**".to_string()],
                exclusions: vec![],
            },
            ..Default::default()
        };
        let task_cache = run_cache.task_cache(
            &definition,
            AnchoredSystemPath::new("packages/web").unwrap(),
            &task_id,
            "task-hash",
        );
        (dir, run_cache, task_cache)
    }

    #[tokio::test]
    async fn test_save_and_restore_round_trip() {
        let (dir, run_cache, mut task_cache) = setup(false);
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();

        // produce outputs and a log
        let dist = repo_root.join_components(&["packages", "web", "dist"]);
        dist.create_dir_all().unwrap();
        dist.join_component("main.js")
            .create_with_contents("bundle")
            .unwrap();
        task_cache.log_file_path().ensure_dir().unwrap();
        task_cache
            .log_file_path()
            .create_with_contents("building...\n")
            .unwrap();

        task_cache.save_outputs(1500).await.unwrap();
        run_cache.shutdown_cache().await;

        // wipe the outputs, then restore from cache
        dist.remove_dir_all().unwrap();
        let mut replay = Vec::new();
        let hit = task_cache.restore_outputs(&mut replay).await.unwrap();
        assert!(hit.is_some());
        assert_eq!(
            dist.join_component("main.js").read_to_string().unwrap(),
            "bundle"
        );
        let replayed = String::from_utf8(replay).unwrap();
        assert!(replayed.contains("cache hit, replaying logs task-hash"));
        assert!(replayed.contains("building..."));
    }

    #[tokio::test]
    async fn test_force_bypasses_reads_but_not_writes() {
        let (dir, run_cache, mut task_cache) = setup(true);
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let dist = repo_root.join_components(&["packages", "web", "dist"]);
        dist.create_dir_all().unwrap();
        dist.join_component("main.js")
            .create_with_contents("bundle")
            .unwrap();
        task_cache.log_file_path().ensure_dir().unwrap();
        task_cache
            .log_file_path()
            .create_with_contents("log")
            .unwrap();

        task_cache.save_outputs(10).await.unwrap();
        run_cache.shutdown_cache().await;

        let mut out = Vec::new();
        let hit = task_cache.restore_outputs(&mut out).await.unwrap();
        assert!(hit.is_none());
        assert!(String::from_utf8(out)
            .unwrap()
            .contains("cache bypass, force executing task-hash"));
    }

    #[tokio::test]
    async fn test_disabled_caching_never_stores() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let cache = AsyncCache::new(
            &CacheOpts {
                cache_dir: "cache".into(),
                workers: 1,
                ..Default::default()
            },
            &repo_root,
            None,
            None,
        )
        .unwrap();
        let run_cache = Arc::new(RunCache::new(
            cache,
            repo_root.clone(),
            &run_opts(false, false),
        ));
        let task_id = TaskId::new("web", "dev").into_owned();
        let definition = TaskDefinition {
            cache: false,
            ..Default::default()
        };
        repo_root
            .join_components(&["packages", "web"])
            .create_dir_all()
            .unwrap();
        let mut task_cache = run_cache.task_cache(
            &definition,
            AnchoredSystemPath::new("packages/web").unwrap(),
            &task_id,
            "dev-hash",
        );

        assert!(task_cache.is_caching_disabled());
        task_cache.save_outputs(10).await.unwrap();
        run_cache.shutdown_cache().await;

        let mut out = Vec::new();
        let hit = task_cache.restore_outputs(&mut out).await.unwrap();
        assert!(hit.is_none());
    }
}
