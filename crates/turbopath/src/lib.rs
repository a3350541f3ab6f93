//! Path types used throughout the repository.
//!
//! Paths are tagged along two axes: absolute vs anchored (relative to the
//! repo root) and system separators vs unix separators. Filesystem APIs only
//! accept the absolute system variants; anything that gets serialized (cache
//! keys, config globs, hash inputs) is a `RelativeUnixPath`. Conversions
//! between the axes are explicit.

#![deny(clippy::all)]

mod absolute_system_path;
mod absolute_system_path_buf;
mod anchored_system_path;
mod anchored_system_path_buf;
mod relative_unix_path;
mod relative_unix_path_buf;

use std::io;

pub use absolute_system_path::AbsoluteSystemPath;
pub use absolute_system_path_buf::AbsoluteSystemPathBuf;
pub use anchored_system_path::AnchoredSystemPath;
pub use anchored_system_path_buf::AnchoredSystemPathBuf;
pub use relative_unix_path::RelativeUnixPath;
pub use relative_unix_path_buf::RelativeUnixPathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("Path is non-UTF-8: {0}")]
    InvalidUnicode(String),
    #[error("Path is not absolute: {0}")]
    NotAbsolute(String),
    #[error("Path is not relative: {0}")]
    NotRelative(String),
    #[error("Path {0} is not parent of {1}")]
    NotParent(String, String),
    #[error("Unix path contains a Windows separator: {0}")]
    WindowsSeparator(String),
    #[error("IO Error {0}")]
    IO(#[from] io::Error),
}

impl PathError {
    pub fn invalid_utf8_error(path: impl AsRef<std::ffi::OsStr>) -> Self {
        Self::InvalidUnicode(path.as_ref().to_string_lossy().into_owned())
    }

    pub fn is_io_error(&self, kind: io::ErrorKind) -> bool {
        matches!(self, PathError::IO(err) if err.kind() == kind)
    }
}

/// Converts a system-separated path string to unix separators.
pub(crate) fn to_unix_separators(path: &str) -> String {
    #[cfg(windows)]
    {
        path.replace('\\', "/")
    }
    #[cfg(not(windows))]
    {
        path.to_string()
    }
}

/// Converts a unix-separated path string to system separators.
pub(crate) fn to_system_separators(path: &str) -> String {
    #[cfg(windows)]
    {
        path.replace('/', "\\")
    }
    #[cfg(not(windows))]
    {
        path.to_string()
    }
}
