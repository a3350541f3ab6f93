//! The command-line surface. Every user-tunable knob is parsed here and
//! funneled into a single [`crate::opts::Opts`] value at the boundary;
//! nothing downstream reads arguments or the environment directly.

use camino::Utf8PathBuf;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;
use turbopath::AbsoluteSystemPathBuf;

use crate::{opts::Opts, run};

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Opts(#[from] crate::opts::Error),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Run(#[from] run::Error),
}

/// Whether undeclared environment variables reach the child process. Both
/// modes hash only declared variables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
#[clap(rename_all = "lowercase")]
pub enum EnvMode {
    #[default]
    Strict,
    Loose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum LogOrder {
    #[default]
    Auto,
    Stream,
    Grouped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum LogPrefix {
    #[default]
    Auto,
    None,
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DryRunMode {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "turbo",
    author,
    version = crate::get_version(),
    about = "The build system that makes ship happen",
    args_conflicts_with_subcommands = true
)]
pub struct Args {
    /// The directory in which to run turbo
    #[arg(long, global = true, value_parser)]
    pub cwd: Option<Utf8PathBuf>,
    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    #[command(subcommand)]
    pub command: Option<Command>,
    // `turbo build` is shorthand for `turbo run build`
    #[clap(flatten)]
    pub run_args: RunArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run tasks across projects in your monorepo
    Run(Box<RunArgs>),
}

#[derive(Parser, Debug, Default, Clone)]
pub struct RunArgs {
    /// Tasks to run
    pub tasks: Vec<String>,
    /// Filter packages to run the tasks in
    #[arg(short = 'F', long, action = ArgAction::Append)]
    pub filter: Vec<String>,
    /// Run tasks in packages changed since the merge base with the default
    /// branch, plus their dependents
    #[arg(long)]
    pub affected: bool,
    /// Limit the concurrency of task execution: a count or a percentage of
    /// logical cores
    #[arg(long)]
    pub concurrency: Option<String>,
    /// Run all tasks with no concurrency limit and ignoring dependency order
    #[arg(long)]
    pub parallel: bool,
    /// Ignore the cache and force tasks to run
    #[arg(long, env = "TURBO_FORCE", num_args = 0..=1, default_missing_value = "true")]
    pub force: Option<Option<bool>>,
    /// Continue running tasks after a task fails
    #[arg(long = "continue")]
    pub continue_on_error: bool,
    /// Print the tasks that would run, without running them
    #[arg(long, num_args = 0..=1, default_missing_value = "text", value_parser = ["text", "json"])]
    pub dry: Option<String>,
    /// Emit the task graph in DOT, to stdout or a file
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    pub graph: Option<String>,
    /// Run in a repository with a single package
    #[arg(long)]
    pub single_package: bool,
    /// Override the local cache directory
    #[arg(long, env = "TURBO_CACHE_DIR")]
    pub cache_dir: Option<Utf8PathBuf>,
    /// Environment variable handling mode
    #[arg(long, value_enum)]
    pub env_mode: Option<EnvMode>,
    /// Override every task's outputLogs setting
    #[arg(long, value_enum)]
    pub output_logs: Option<crate::turbo_json::OutputLogsMode>,
    /// When to interleave task output
    #[arg(long, env = "TURBO_LOG_ORDER", value_enum)]
    pub log_order: Option<LogOrder>,
    /// Prefix task output with the task id
    #[arg(long, value_enum)]
    pub log_prefix: Option<LogPrefix>,
    /// Do not write task outputs to the cache
    #[arg(long)]
    pub no_cache: bool,
    /// Skip the local filesystem cache
    #[arg(long, env = "TURBO_REMOTE_ONLY")]
    pub remote_only: bool,
    /// Treat the remote cache as read-only
    #[arg(long, env = "TURBO_REMOTE_CACHE_READ_ONLY")]
    pub remote_cache_read_only: bool,
    /// Write a run summary under .turbo/runs
    #[arg(long, env = "TURBO_RUN_SUMMARY", num_args = 0..=1, default_missing_value = "true")]
    pub summarize: Option<Option<bool>>,
    /// Remote cache bearer token
    #[arg(long, env = "TURBO_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
    /// Remote cache team identifier
    #[arg(long, env = "TURBO_TEAM")]
    pub team: Option<String>,
    /// Remote cache API url
    #[arg(long = "api", env = "TURBO_API")]
    pub api_url: Option<String>,
}

/// Parses arguments and executes the requested command. The returned value
/// is the process exit code: 0 for success, 1 for task or run failures.
/// clap itself exits with 2 on usage errors.
pub async fn run() -> Result<i32, Error> {
    let args = Args::parse();

    let repo_root = match &args.cwd {
        Some(cwd) if cwd.is_absolute() => AbsoluteSystemPathBuf::new(cwd.clone())?,
        Some(cwd) => {
            let base = AbsoluteSystemPathBuf::cwd()?;
            AbsoluteSystemPathBuf::from_unknown(&base, cwd.clone())
        }
        None => AbsoluteSystemPathBuf::cwd()?,
    };

    let run_args = match args.command {
        Some(Command::Run(run_args)) => *run_args,
        None => args.run_args,
    };

    if run_args.tasks.is_empty() {
        // Usage error: mirror clap's exit code for missing arguments.
        eprintln!("error: at least one task must be specified");
        return Ok(2);
    }

    let opts = Opts::from_args(run_args)?;
    let exit_code = run::Run::new(repo_root, opts).run().await?;
    Ok(exit_code)
}

#[cfg(test)]
mod test {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_args_are_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_run_subcommand_parses_flags() {
        let args = Args::parse_from([
            "turbo",
            "run",
            "build",
            "--filter",
            "web...",
            "--concurrency",
            "50%",
            "--force",
            "--continue",
        ]);
        let Some(Command::Run(run_args)) = args.command else {
            panic!("expected run command");
        };
        assert_eq!(run_args.tasks, vec!["build"]);
        assert_eq!(run_args.filter, vec!["web..."]);
        assert_eq!(run_args.concurrency.as_deref(), Some("50%"));
        assert_eq!(run_args.force, Some(Some(true)));
        assert!(run_args.continue_on_error);
    }

    #[test]
    fn test_implicit_run_command() {
        let args = Args::parse_from(["turbo", "build", "lint"]);
        assert!(args.command.is_none());
        assert_eq!(args.run_args.tasks, vec!["build", "lint"]);
    }

    #[test]
    fn test_dry_flag_forms() {
        let args = Args::parse_from(["turbo", "run", "build", "--dry"]);
        let Some(Command::Run(run_args)) = args.command else {
            panic!("expected run command");
        };
        assert_eq!(run_args.dry.as_deref(), Some("text"));

        let args = Args::parse_from(["turbo", "run", "build", "--dry=json"]);
        let Some(Command::Run(run_args)) = args.command else {
            panic!("expected run command");
        };
        assert_eq!(run_args.dry.as_deref(), Some("json"));
    }
}
