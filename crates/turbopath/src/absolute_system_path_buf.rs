use std::{borrow::Borrow, fmt, ops::Deref, path::PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::{AbsoluteSystemPath, PathError};

/// An owned absolute path using the host separator convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AbsoluteSystemPathBuf(Utf8PathBuf);

impl AbsoluteSystemPathBuf {
    pub fn new(unchecked_path: impl Into<Utf8PathBuf>) -> Result<Self, PathError> {
        let path = unchecked_path.into();
        if path.is_relative() {
            return Err(PathError::NotAbsolute(path.into_string()));
        }
        Ok(Self(path))
    }

    pub(crate) fn new_unchecked(path: impl Into<Utf8PathBuf>) -> Self {
        Self(path.into())
    }

    /// Anchors `path` at `base` if it is relative, otherwise takes it as-is.
    /// Used for user-supplied paths such as `--cache-dir` values.
    pub fn from_unknown(base: &AbsoluteSystemPath, path: impl Into<Utf8PathBuf>) -> Self {
        let path = path.into();
        if path.is_absolute() {
            Self(path)
        } else {
            Self(
                path_clean::clean(base.as_path().join(path).as_std_path())
                    .try_into()
                    .expect("clean of utf8 path is utf8"),
            )
        }
    }

    pub fn cwd() -> Result<Self, PathError> {
        let cwd = std::env::current_dir()?;
        Self::new(
            Utf8PathBuf::from_path_buf(cwd).map_err(|p| PathError::invalid_utf8_error(p.as_os_str()))?,
        )
    }

    pub fn as_absolute_path(&self) -> &AbsoluteSystemPath {
        self
    }

    pub fn into_string(self) -> String {
        self.0.into_string()
    }
}

impl Deref for AbsoluteSystemPathBuf {
    type Target = AbsoluteSystemPath;

    fn deref(&self) -> &Self::Target {
        AbsoluteSystemPath::new_unchecked(self.0.as_path())
    }
}

impl Borrow<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn borrow(&self) -> &AbsoluteSystemPath {
        self
    }
}

impl AsRef<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn as_ref(&self) -> &AbsoluteSystemPath {
        self
    }
}

impl fmt::Display for AbsoluteSystemPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<&str> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&std::path::Path> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(value: &std::path::Path) -> Result<Self, Self::Error> {
        let value: &Utf8Path = value
            .try_into()
            .map_err(|_| PathError::invalid_utf8_error(value.as_os_str()))?;
        Self::new(value)
    }
}

impl TryFrom<PathBuf> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(value: PathBuf) -> Result<Self, Self::Error> {
        let value =
            Utf8PathBuf::from_path_buf(value).map_err(|p| PathError::invalid_utf8_error(p.as_os_str()))?;
        Self::new(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn test_from_unknown() {
        let base = AbsoluteSystemPath::new("/repo").unwrap();
        assert_eq!(
            AbsoluteSystemPathBuf::from_unknown(base, "node_modules/.cache/turbo").as_str(),
            "/repo/node_modules/.cache/turbo"
        );
        assert_eq!(
            AbsoluteSystemPathBuf::from_unknown(base, "/tmp/cache").as_str(),
            "/tmp/cache"
        );
    }
}
