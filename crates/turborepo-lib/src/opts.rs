//! The single configuration value the rest of the run reads. Assembled once
//! from CLI arguments (which already absorbed the `TURBO_*` environment
//! variables via clap) and turbo.json defaults.

use miette::Diagnostic;
use thiserror::Error;
use turborepo_cache::CacheOpts;

use crate::{
    cli::{DryRunMode, EnvMode, LogOrder, LogPrefix, RunArgs},
    turbo_json::OutputLogsMode,
};

const DEFAULT_CONCURRENCY: u32 = 10;
const DEFAULT_CACHE_WORKERS: u32 = 10;

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error(
        "invalid concurrency \"{0}\", expected a positive integer or a percentage of logical \
         cores (e.g. 50%)"
    )]
    InvalidConcurrency(String),
}

#[derive(Debug)]
pub struct Opts {
    pub run_opts: RunOpts,
    pub cache_opts: CacheOpts,
    pub scope_opts: ScopeOpts,
    pub api_client_opts: APIClientOpts,
}

#[derive(Debug, Clone)]
pub struct RunOpts {
    pub tasks: Vec<String>,
    pub concurrency: u32,
    pub parallel: bool,
    pub env_mode: Option<EnvMode>,
    pub force: bool,
    pub continue_on_error: bool,
    pub dry_run: Option<DryRunMode>,
    pub graph: Option<GraphOpts>,
    pub single_package: bool,
    pub log_order: ResolvedLogOrder,
    pub log_prefix: LogPrefix,
    pub output_logs_override: Option<OutputLogsMode>,
    pub no_cache: bool,
    pub summarize: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphOpts {
    Stdout,
    File(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedLogOrder {
    Stream,
    Grouped,
}

#[derive(Debug, Clone)]
pub struct ScopeOpts {
    pub filter_patterns: Vec<String>,
    pub affected: bool,
}

#[derive(Debug, Clone)]
pub struct APIClientOpts {
    pub api_url: String,
    pub token: Option<String>,
    pub team_id: Option<String>,
    pub team_slug: Option<String>,
}

pub const DEFAULT_API_URL: &str = "https://vercel.com/api";

impl Opts {
    pub fn from_args(args: RunArgs) -> Result<Self, Error> {
        let concurrency = args
            .concurrency
            .as_deref()
            .map(parse_concurrency)
            .transpose()?
            .unwrap_or(DEFAULT_CONCURRENCY);

        let log_order = match args.log_order.unwrap_or_default() {
            // without a TUI the automatic choice is streaming
            LogOrder::Auto | LogOrder::Stream => ResolvedLogOrder::Stream,
            LogOrder::Grouped => ResolvedLogOrder::Grouped,
        };

        let dry_run = match args.dry.as_deref() {
            Some("json") => Some(DryRunMode::Json),
            Some(_) => Some(DryRunMode::Text),
            None => None,
        };

        let graph = match args.graph.as_deref() {
            Some("") => Some(GraphOpts::Stdout),
            Some(file) => Some(GraphOpts::File(file.to_string())),
            None => None,
        };

        let cache_opts = CacheOpts {
            cache_dir: args
                .cache_dir
                .clone()
                .unwrap_or_else(CacheOpts::default_cache_dir),
            remote_cache_read_only: args.remote_cache_read_only,
            skip_remote: args.token.is_none(),
            skip_filesystem: args.remote_only,
            workers: DEFAULT_CACHE_WORKERS,
            remote_cache_opts: None,
        };

        let run_opts = RunOpts {
            tasks: args.tasks,
            concurrency,
            parallel: args.parallel,
            env_mode: args.env_mode,
            force: matches!(args.force, Some(Some(true)) | Some(None)),
            continue_on_error: args.continue_on_error,
            dry_run,
            graph,
            single_package: args.single_package,
            log_order,
            log_prefix: args.log_prefix.unwrap_or_default(),
            output_logs_override: args.output_logs,
            no_cache: args.no_cache,
            summarize: matches!(args.summarize, Some(Some(true)) | Some(None)),
        };

        let scope_opts = ScopeOpts {
            filter_patterns: args.filter,
            affected: args.affected,
        };

        let api_client_opts = APIClientOpts {
            api_url: args.api_url.unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            token: args.token,
            team_id: args.team.clone(),
            team_slug: args.team,
        };

        Ok(Opts {
            run_opts,
            cache_opts,
            scope_opts,
            api_client_opts,
        })
    }
}

/// `N` or `N%` of logical cores, minimum 1.
fn parse_concurrency(value: &str) -> Result<u32, Error> {
    if let Some(percent) = value.strip_suffix('%') {
        let percent: f64 = percent
            .trim()
            .parse()
            .map_err(|_| Error::InvalidConcurrency(value.to_string()))?;
        if !percent.is_finite() || percent <= 0.0 {
            return Err(Error::InvalidConcurrency(value.to_string()));
        }
        let cores = num_cpus::get() as f64;
        return Ok(((percent / 100.0 * cores).round() as u32).max(1));
    }
    match value.trim().parse::<u32>() {
        Ok(concurrency) if concurrency > 0 => Ok(concurrency),
        _ => Err(Error::InvalidConcurrency(value.to_string())),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_concurrency_number() {
        assert_eq!(parse_concurrency("4").unwrap(), 4);
        assert!(parse_concurrency("0").is_err());
        assert!(parse_concurrency("four").is_err());
        assert!(parse_concurrency("-1").is_err());
    }

    #[test]
    fn test_parse_concurrency_percent() {
        let cores = num_cpus::get() as u32;
        assert_eq!(parse_concurrency("100%").unwrap(), cores.max(1));
        // tiny percentages still get one slot
        assert_eq!(parse_concurrency("0.0001%").unwrap(), 1);
        assert!(parse_concurrency("-50%").is_err());
    }

    #[test]
    fn test_force_flag_forms() {
        let mut args = RunArgs {
            tasks: vec!["build".to_string()],
            ..Default::default()
        };
        args.force = Some(None);
        let opts = Opts::from_args(args.clone()).unwrap();
        assert!(opts.run_opts.force);

        args.force = Some(Some(false));
        let opts = Opts::from_args(args).unwrap();
        assert!(!opts.run_opts.force);
    }
}
