use std::{borrow::Borrow, fmt, ops::Deref, path::Path};

use camino::{Utf8Component, Utf8PathBuf};
use serde::Serialize;

use crate::{AbsoluteSystemPath, AnchoredSystemPath, PathError};

/// An owned path relative to a repository root, using the host separator
/// convention.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AnchoredSystemPathBuf(Utf8PathBuf);

impl AnchoredSystemPathBuf {
    pub(crate) fn new_unchecked(path: impl Into<Utf8PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn from_raw(raw: impl AsRef<str>) -> Result<Self, PathError> {
        let path = Utf8PathBuf::from(crate::to_system_separators(raw.as_ref()));
        if path.is_absolute() {
            return Err(PathError::NotRelative(path.into_string()));
        }
        Ok(Self(path))
    }

    pub fn from_system_path(path: &Path) -> Result<Self, PathError> {
        let path: Utf8PathBuf = path
            .to_path_buf()
            .try_into()
            .map_err(|_| PathError::invalid_utf8_error(path.as_os_str()))?;
        if path.is_absolute() {
            return Err(PathError::NotRelative(path.into_string()));
        }
        Ok(Self(path))
    }

    pub(crate) fn strip_root(
        root: &AbsoluteSystemPath,
        path: &AbsoluteSystemPath,
    ) -> Result<Self, PathError> {
        let stripped = path
            .as_path()
            .strip_prefix(root.as_path())
            .map_err(|_| PathError::NotParent(root.to_string(), path.to_string()))?;
        Ok(Self(stripped.to_owned()))
    }

    /// The path you would traverse to get from `from` to `to`. Both inputs
    /// must be absolute; the output is a relative system path of `..` and
    /// name components.
    pub fn relative_path_between(from: &AbsoluteSystemPath, to: &AbsoluteSystemPath) -> Self {
        let from_components: Vec<_> = from.as_path().components().collect();
        let to_components: Vec<_> = to.as_path().components().collect();
        let common = from_components
            .iter()
            .zip(to_components.iter())
            .take_while(|(a, b)| a == b)
            .count();

        let mut path = Utf8PathBuf::new();
        for _ in common..from_components.len() {
            path.push("..");
        }
        for component in &to_components[common..] {
            if let Utf8Component::Normal(part) = component {
                path.push(part);
            }
        }
        Self(path)
    }

    pub fn into_string(self) -> String {
        self.0.into_string()
    }
}

impl Deref for AnchoredSystemPathBuf {
    type Target = AnchoredSystemPath;

    fn deref(&self) -> &Self::Target {
        AnchoredSystemPath::new_unchecked(self.0.as_path())
    }
}

impl Borrow<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn borrow(&self) -> &AnchoredSystemPath {
        self
    }
}

impl AsRef<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn as_ref(&self) -> &AnchoredSystemPath {
        self
    }
}

impl fmt::Display for AnchoredSystemPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<&str> for AnchoredSystemPathBuf {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::from_raw(value)
    }
}
