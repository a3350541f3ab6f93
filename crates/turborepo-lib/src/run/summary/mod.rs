mod execution;
mod task;

use std::{io::Write, sync::Mutex};

use chrono::{DateTime, Local};
pub use execution::{ExecutionTracker, SummaryState, TaskExecutionSummary, Tracker};
use owo_colors::OwoColorize;
use serde::Serialize;
pub use task::{CacheStatus, TaskCacheSummary, TaskSummary};
use thiserror::Error;
use turbopath::AbsoluteSystemPath;

use crate::{
    cli::{DryRunMode, EnvMode},
    opts::RunOpts,
    run::global_hash::GlobalHashableInputs,
};

const RUN_SUMMARY_SCHEMA_VERSION: &str = "1";
const RUNS_DIR: &str = ".turbo/runs";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to write run summary: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize run summary: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("summary state thread panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// The inputs to the global hash, as reported to users.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalHashSummary {
    pub global_cache_key: String,
    pub global_file_hash_map: std::collections::BTreeMap<String, String>,
    pub root_external_deps_hash: String,
    pub global_env_vars: Vec<String>,
    pub pass_through_env_vars: Vec<String>,
}

impl From<&GlobalHashableInputs> for GlobalHashSummary {
    fn from(inputs: &GlobalHashableInputs) -> Self {
        Self {
            global_cache_key: inputs.global_cache_key.clone(),
            global_file_hash_map: inputs
                .global_file_hash_map
                .iter()
                .map(|(path, hash)| (path.to_string(), hash.clone()))
                .collect(),
            root_external_deps_hash: inputs.root_external_deps_hash.clone(),
            global_env_vars: inputs.env.clone(),
            pass_through_env_vars: inputs.pass_through_env.clone(),
        }
    }
}

/// The complete record of a run, rendered to the terminal and optionally
/// persisted under `.turbo/runs/`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: String,
    pub version: String,
    pub turbo_version: String,
    pub monorepo: bool,
    pub global_hash: String,
    pub global_hash_summary: GlobalHashSummary,
    pub env_mode: EnvMode,
    pub packages: Vec<String>,
    pub execution: SummaryState,
    pub tasks: Vec<TaskSummary>,
    #[serde(skip)]
    pub start_time: DateTime<Local>,
    #[serde(skip)]
    pub end_time: DateTime<Local>,
}

/// Collects per-task summaries while the run progresses.
pub struct RunTracker {
    execution_tracker: ExecutionTracker,
    task_summaries: Mutex<Vec<TaskSummary>>,
    started_at: DateTime<Local>,
}

impl RunTracker {
    pub fn new(started_at: DateTime<Local>, command: String) -> Self {
        Self {
            execution_tracker: ExecutionTracker::new(command, started_at),
            task_summaries: Mutex::new(Vec::new()),
            started_at,
        }
    }

    pub fn task_tracker(&self, task_id: crate::task_id::TaskId<'static>) -> Tracker<()> {
        self.execution_tracker.tracker(task_id)
    }

    pub fn add_task_summary(&self, summary: TaskSummary) {
        self.task_summaries
            .lock()
            .expect("task summary lock poisoned")
            .push(summary);
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn finish(
        self,
        repo_root: &AbsoluteSystemPath,
        run_opts: &RunOpts,
        packages: Vec<String>,
        global_hash: String,
        global_hash_inputs: &GlobalHashableInputs,
        env_mode: EnvMode,
        output: &mut impl Write,
    ) -> Result<RunSummary, Error> {
        let Self {
            execution_tracker,
            task_summaries,
            started_at,
        } = self;
        let execution = execution_tracker.finish().await?;

        let mut tasks = task_summaries
            .into_inner()
            .expect("task summary lock poisoned");
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let summary = RunSummary {
            id: generate_run_id(started_at),
            version: RUN_SUMMARY_SCHEMA_VERSION.to_string(),
            turbo_version: crate::get_version().to_string(),
            monorepo: !run_opts.single_package,
            global_hash,
            global_hash_summary: GlobalHashSummary::from(global_hash_inputs),
            env_mode,
            packages,
            execution,
            tasks,
            start_time: started_at,
            end_time: Local::now(),
        };

        if run_opts.summarize {
            summary.save(repo_root)?;
        }
        summary.print_execution(output)?;

        Ok(summary)
    }
}

impl RunSummary {
    fn summary_path(&self, repo_root: &AbsoluteSystemPath) -> turbopath::AbsoluteSystemPathBuf {
        repo_root
            .join_unix_path(turbopath::RelativeUnixPath::new(RUNS_DIR).expect("runs dir is relative"))
            .join_component(&format!("{}.json", self.id))
    }

    pub fn save(&self, repo_root: &AbsoluteSystemPath) -> Result<(), Error> {
        let path = self.summary_path(repo_root);
        path.ensure_dir()?;
        path.create_with_contents(serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// The trailing per-run report: task counts, timing, and the coveted
    /// FULL TURBO marker when everything came from cache.
    pub fn print_execution(&self, output: &mut impl Write) -> Result<(), Error> {
        let duration = self
            .end_time
            .signed_duration_since(self.start_time)
            .num_milliseconds()
            .max(0);
        let duration_display = if duration >= 60_000 {
            format!("{}m{}s", duration / 60_000, (duration % 60_000) / 1000)
        } else if duration >= 1000 {
            format!("{:.2}s", duration as f64 / 1000.0)
        } else {
            format!("{duration}ms")
        };

        let full_turbo = if self.execution.cached == self.execution.attempted
            && self.execution.attempted > 0
        {
            format!("  {}", ">>> FULL TURBO".magenta().bold())
        } else {
            String::new()
        };

        writeln!(output)?;
        writeln!(
            output,
            " Tasks:    {}, {} total",
            format!("{} successful", self.execution.success + self.execution.cached).bold().green(),
            self.execution.attempted
        )?;
        writeln!(
            output,
            "Cached:    {}, {} total",
            format!("{} cached", self.execution.cached).bold(),
            self.execution.attempted
        )?;
        writeln!(output, "  Time:    {}{}", duration_display.bold(), full_turbo)?;

        let failed: Vec<_> = self
            .tasks
            .iter()
            .filter(|task| {
                matches!(
                    task.execution,
                    Some(TaskExecutionSummary {
                        state: execution::ExecutionState::BuildFailed { .. },
                        ..
                    })
                )
            })
            .map(|task| task.task_id.to_string())
            .collect();
        if !failed.is_empty() {
            writeln!(output, "Failed:    {}", failed.join(", ").bold().red())?;
        }
        writeln!(output)?;
        Ok(())
    }

    /// Renders the dry run: the full JSON document, or a human-readable
    /// digest of every task that would have run.
    pub fn print_dry_run(
        &self,
        mode: DryRunMode,
        output: &mut impl Write,
    ) -> Result<(), Error> {
        match mode {
            DryRunMode::Json => {
                writeln!(output, "{}", serde_json::to_string_pretty(self)?)?;
            }
            DryRunMode::Text => {
                writeln!(output, "\nGlobal Hash Inputs")?;
                writeln!(output, "  Global Hash\t=\t{}", self.global_hash)?;
                writeln!(
                    output,
                    "  Global Files\t=\t{}",
                    self.global_hash_summary.global_file_hash_map.len()
                )?;
                writeln!(output, "\nPackages in Scope")?;
                for package in &self.packages {
                    writeln!(output, "  {package}")?;
                }
                writeln!(output, "\nTasks to Run")?;
                for task in &self.tasks {
                    writeln!(output, "{}", task.task_id.to_string().bold())?;
                    writeln!(output, "  Task\t\t\t=\t{}", task.task)?;
                    writeln!(output, "  Package\t\t=\t{}", task.package)?;
                    writeln!(output, "  Hash\t\t\t=\t{}", task.hash)?;
                    writeln!(
                        output,
                        "  Cached (Local)\t=\t{}",
                        task.cache_state.local
                    )?;
                    writeln!(
                        output,
                        "  Cached (Remote)\t=\t{}",
                        task.cache_state.remote
                    )?;
                    writeln!(output, "  Directory\t\t=\t{}", task.directory)?;
                    writeln!(output, "  Command\t\t=\t{}", task.command)?;
                    writeln!(output, "  Outputs\t\t=\t{}", task.outputs.join(", "))?;
                    writeln!(output, "  Log File\t\t=\t{}", task.log_file)?;
                    writeln!(
                        output,
                        "  Dependencies\t\t=\t{}",
                        task.dependencies
                            .iter()
                            .map(|dep| dep.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )?;
                    writeln!(
                        output,
                        "  Dependents\t\t=\t{}",
                        task.dependents
                            .iter()
                            .map(|dep| dep.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// Time-prefixed random id so summaries sort by run order on disk.
fn generate_run_id(started_at: DateTime<Local>) -> String {
    use rand::Rng;
    let suffix: u64 = rand::thread_rng().gen();
    format!("{}-{suffix:016x}", started_at.format("%Y-%m-%dT%H%M%S%.3f"))
}

#[cfg(test)]
mod test {
    use super::*;

    fn summary(attempted: usize, cached: usize) -> RunSummary {
        RunSummary {
            id: "test-run".to_string(),
            version: RUN_SUMMARY_SCHEMA_VERSION.to_string(),
            turbo_version: crate::get_version().to_string(),
            monorepo: true,
            global_hash: "global".to_string(),
            global_hash_summary: GlobalHashSummary {
                global_cache_key: "key".to_string(),
                global_file_hash_map: Default::default(),
                root_external_deps_hash: String::new(),
                global_env_vars: Vec::new(),
                pass_through_env_vars: Vec::new(),
            },
            env_mode: EnvMode::Strict,
            packages: vec!["my-app".to_string(), "util".to_string()],
            execution: SummaryState {
                attempted,
                cached,
                success: attempted - cached,
                failed: 0,
            },
            tasks: Vec::new(),
            start_time: Local::now(),
            end_time: Local::now(),
        }
    }

    #[test]
    fn test_full_turbo_marker() {
        let mut output = Vec::new();
        summary(2, 2).print_execution(&mut output).unwrap();
        let rendered = String::from_utf8(output).unwrap();
        assert!(rendered.contains("FULL TURBO"), "{rendered}");
        assert!(rendered.contains("2 cached"), "{rendered}");
        assert!(rendered.contains("2 total"), "{rendered}");

        let mut output = Vec::new();
        summary(2, 1).print_execution(&mut output).unwrap();
        let rendered = String::from_utf8(output).unwrap();
        assert!(!rendered.contains("FULL TURBO"), "{rendered}");
    }

    #[test]
    fn test_save_writes_to_runs_dir() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = turbopath::AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let summary = summary(1, 0);
        summary.save(&repo_root).unwrap();
        let path = repo_root
            .join_unix_path(turbopath::RelativeUnixPath::new(".turbo/runs/test-run.json").unwrap());
        assert!(path.exists());
        let contents = path.read_to_string().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["id"], "test-run");
        assert_eq!(parsed["execution"]["attempted"], 1);
    }
}
