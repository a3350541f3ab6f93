use std::fmt;

use camino::{Utf8Components, Utf8Path};

use crate::{AnchoredSystemPathBuf, RelativeUnixPathBuf};

/// A borrowed path relative to a repository root, using the host separator
/// convention.
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct AnchoredSystemPath(Utf8Path);

impl AnchoredSystemPath {
    pub(crate) fn new_unchecked(path: &Utf8Path) -> &Self {
        // SAFETY: repr(transparent) over Utf8Path
        unsafe { &*(path as *const Utf8Path as *const Self) }
    }

    pub fn new<P: AsRef<str> + ?Sized>(path: &P) -> Result<&Self, crate::PathError> {
        let path: &Utf8Path = path.as_ref().into();
        if path.is_absolute() {
            return Err(crate::PathError::NotRelative(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_path(&self) -> &Utf8Path {
        &self.0
    }

    pub fn components(&self) -> Utf8Components<'_> {
        self.0.components()
    }

    pub fn parent(&self) -> Option<&AnchoredSystemPath> {
        self.0.parent().map(Self::new_unchecked)
    }

    pub fn starts_with(&self, other: &AnchoredSystemPath) -> bool {
        // Everything starts with the anchor itself.
        other.0.as_str() == "." || self.0.starts_with(other.as_path())
    }

    pub fn to_owned(&self) -> AnchoredSystemPathBuf {
        AnchoredSystemPathBuf::new_unchecked(self.0.to_owned())
    }

    pub fn to_unix(&self) -> RelativeUnixPathBuf {
        RelativeUnixPathBuf::new_unchecked(crate::to_unix_separators(self.0.as_str()))
    }
}

impl fmt::Display for AnchoredSystemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
