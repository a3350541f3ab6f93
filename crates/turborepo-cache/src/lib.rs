//! The two-tier artifact cache.
//!
//! Entries are tarballs of a task's declared outputs plus a metadata
//! sidecar, keyed by the task hash. The filesystem tier writes atomically
//! (temp file + rename); the HTTP tier speaks the `/v8/artifacts` protocol
//! with optional HMAC signatures; the multiplexer composes the two. A small
//! worker pool decouples cache writes from task execution.

#![feature(error_generic_member_access)]
#![deny(clippy::all)]

mod async_cache;
pub mod cache_archive;
pub mod fs;
pub mod http;
mod multiplexer;
pub mod signature_authentication;

use std::{backtrace, backtrace::Backtrace};

pub use async_cache::AsyncCache;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signature_authentication::SignatureError;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error, #[backtrace] backtrace::Backtrace),
    #[error(
        "artifact verification failed: downloaded artifact is missing required x-artifact-tag \
         header"
    )]
    ArtifactTagMissing(#[backtrace] Backtrace),
    #[error("invalid artifact verification tag")]
    InvalidTag(#[backtrace] Backtrace),
    #[error("failed to contact remote cache: {0}")]
    ApiClientError(Box<turborepo_api_client::Error>, #[backtrace] Backtrace),
    #[error("signing artifact failed: {0}")]
    SignatureError(#[from] SignatureError, #[backtrace] Backtrace),
    #[error("invalid duration")]
    InvalidDuration(#[backtrace] Backtrace),
    #[error("Invalid file path: {0}")]
    PathError(#[from] turbopath::PathError, #[backtrace] Backtrace),
    #[error("links in the cache are cyclic")]
    CycleDetected(#[backtrace] Backtrace),
    #[error("Invalid file path, link target does not exist: {0}")]
    LinkTargetDoesNotExist(String, #[backtrace] Backtrace),
    #[error("Invalid tar, link target missing from header")]
    LinkTargetNotOnHeader(#[backtrace] Backtrace),
    #[error("attempted to restore unsupported file type: {0:?}")]
    RestoreUnsupportedFileType(tar::EntryType, #[backtrace] Backtrace),
    #[error("attempted to store unsupported file type")]
    CreateUnsupportedFileType(#[backtrace] Backtrace),
    #[error("tar file is malformed")]
    MalformedTar(#[backtrace] Backtrace),
    #[error("tar attempts to write outside of directory: {0}")]
    LinkOutsideOfDirectory(String, #[backtrace] Backtrace),
    #[error("Invalid cache metadata file")]
    InvalidMetadata(serde_json::Error, #[backtrace] Backtrace),
    #[error("no caches are enabled")]
    NoCachesEnabled,
    #[error("cache is shutting down")]
    CacheShuttingDown,
}

impl From<turborepo_api_client::Error> for CacheError {
    fn from(value: turborepo_api_client::Error) -> Self {
        CacheError::ApiClientError(Box::new(value), Backtrace::capture())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheSource {
    Local,
    Remote,
}

/// What a successful cache probe tells us: which tier answered and how long
/// the cached task originally took (the time a hit saves).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheHitMetadata {
    pub source: CacheSource,
    pub time_saved: u64,
}

#[derive(Clone, Debug, Default)]
pub struct CacheOpts {
    pub cache_dir: Utf8PathBuf,
    pub remote_cache_read_only: bool,
    pub skip_remote: bool,
    pub skip_filesystem: bool,
    pub workers: u32,
    pub remote_cache_opts: Option<RemoteCacheOpts>,
}

impl CacheOpts {
    /// `node_modules/.cache/turbo` under the repo root, unless overridden.
    pub fn default_cache_dir() -> Utf8PathBuf {
        Utf8PathBuf::from_iter(["node_modules", ".cache", "turbo"])
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteCacheOpts {
    pub team_id: Option<String>,
    pub signature: bool,
}
