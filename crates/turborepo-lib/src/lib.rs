//! The core of the task runner: configuration loading, task graph
//! construction, hashing, the cache-aware concurrent executor, and the run
//! summary. The `turbo` binary is a thin shim over [`cli::run`].

#![deny(clippy::all)]

pub mod cli;
pub mod engine;
pub mod hash;
pub mod opts;
pub mod process;
pub mod run;
pub mod signal;
pub mod task_graph;
pub mod task_hash;
pub mod task_id;
pub mod turbo_json;

pub use cli::run;

pub fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
