use std::fmt;

use crate::{PathError, RelativeUnixPathBuf};

/// A borrowed relative path that always uses unix separators. This is the
/// canonical serialized path form: config globs, cache archive entries, and
/// hash inputs are all unix-relative.
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RelativeUnixPath(str);

impl RelativeUnixPath {
    pub fn new<P: AsRef<str> + ?Sized>(value: &P) -> Result<&Self, PathError> {
        let path = value.as_ref();
        if path.starts_with('/') {
            return Err(PathError::NotRelative(path.to_string()));
        }
        #[cfg(not(windows))]
        if path.contains('\\') {
            return Err(PathError::WindowsSeparator(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub(crate) fn new_unchecked(value: &str) -> &Self {
        // SAFETY: repr(transparent) over str
        unsafe { &*(value as *const str as *const Self) }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_owned(&self) -> RelativeUnixPathBuf {
        RelativeUnixPathBuf::new_unchecked(self.0.to_string())
    }

    pub fn strip_prefix(&self, prefix: &RelativeUnixPath) -> Option<&RelativeUnixPath> {
        let stripped = self.0.strip_prefix(&prefix.0)?;
        Some(Self::new_unchecked(
            stripped.strip_prefix('/').unwrap_or(stripped),
        ))
    }
}

impl fmt::Display for RelativeUnixPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
