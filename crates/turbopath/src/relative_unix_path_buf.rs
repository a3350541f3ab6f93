use std::{borrow::Borrow, fmt, ops::Deref};

use serde::{Deserialize, Serialize};

use crate::{AnchoredSystemPathBuf, PathError, RelativeUnixPath};

/// An owned relative path that always uses unix separators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelativeUnixPathBuf(String);

impl RelativeUnixPathBuf {
    pub fn new(path: impl Into<String>) -> Result<Self, PathError> {
        let path = path.into();
        RelativeUnixPath::new(&path)?;
        Ok(Self(path))
    }

    pub(crate) fn new_unchecked(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn to_anchored_system_path_buf(&self) -> AnchoredSystemPathBuf {
        AnchoredSystemPathBuf::new_unchecked(crate::to_system_separators(&self.0))
    }

    pub fn join(&self, tail: &RelativeUnixPath) -> Self {
        if self.0.is_empty() {
            return tail.to_owned();
        }
        Self(format!("{}/{}", self.0, tail.as_str()))
    }

    /// Tar archive entries carry a trailing slash for directories.
    pub fn make_canonical_for_tar(&mut self, is_dir: bool) {
        if is_dir && !self.0.ends_with('/') {
            self.0.push('/');
        }
    }
}

impl Deref for RelativeUnixPathBuf {
    type Target = RelativeUnixPath;

    fn deref(&self) -> &Self::Target {
        RelativeUnixPath::new_unchecked(&self.0)
    }
}

impl Borrow<RelativeUnixPath> for RelativeUnixPathBuf {
    fn borrow(&self) -> &RelativeUnixPath {
        self
    }
}

impl fmt::Display for RelativeUnixPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&RelativeUnixPath> for RelativeUnixPathBuf {
    fn from(path: &RelativeUnixPath) -> Self {
        path.to_owned()
    }
}
