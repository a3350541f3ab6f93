//! SCM integration. When the repo lives in git we use git itself for change
//! detection and reuse the index's blob hashes for clean tracked files;
//! dirty and untracked files are re-hashed from disk with the same blob
//! algorithm. Outside of git everything falls back to walking and hashing
//! the filesystem, producing identical hashes for identical content.

#![feature(error_generic_member_access)]
#![deny(clippy::all)]

mod git;
mod hash_object;
mod manual;

use std::{backtrace::Backtrace, collections::HashMap, path::PathBuf, process::Command};

use thiserror::Error;
use turbopath::{
    AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPath, AnchoredSystemPathBuf,
    PathError, RelativeUnixPathBuf,
};

pub type GitHashes = HashMap<RelativeUnixPathBuf, String>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("git error: {0}")]
    Git(String, #[backtrace] Backtrace),
    #[error("repository not found at {0}")]
    GitRequired(AbsoluteSystemPathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error, #[backtrace] Backtrace),
    #[error("path error: {0}")]
    Path(#[from] PathError, #[backtrace] Backtrace),
    #[error("could not find git binary")]
    GitBinaryNotFound(#[from] which::Error),
    #[error("git produced non-utf8 output")]
    NonUtf8GitOutput,
    #[error(transparent)]
    Glob(#[from] globwalk::WalkError),
}

impl Error {
    pub(crate) fn git_error(s: impl Into<String>) -> Self {
        Error::Git(s.into(), Backtrace::capture())
    }
}

/// The SCM backing for a repository. `Manual` hashes everything from disk and
/// cannot answer change queries.
#[derive(Debug)]
pub enum SCM {
    Git(Git),
    Manual,
}

#[derive(Debug)]
pub struct Git {
    root: AbsoluteSystemPathBuf,
    bin: PathBuf,
}

impl SCM {
    /// Detects the SCM for a path. Failure to find git (either the binary or
    /// a repository) is recoverable and drops us into manual hashing.
    pub fn new(path_in_repo: &AbsoluteSystemPath) -> SCM {
        match Git::find(path_in_repo) {
            Ok(git) => SCM::Git(git),
            Err(e) => {
                tracing::debug!("{}, continuing with manual hashing", e);
                SCM::Manual
            }
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, SCM::Manual)
    }

    /// Files changed between `from_ref` and the working tree (or `to_ref`
    /// when given), as paths anchored at `turbo_root`. Files outside
    /// `turbo_root` are dropped. Requires git.
    pub fn changed_files(
        &self,
        turbo_root: &AbsoluteSystemPath,
        from_ref: &str,
        to_ref: Option<&str>,
        include_uncommitted: bool,
    ) -> Result<std::collections::HashSet<AnchoredSystemPathBuf>, Error> {
        match self {
            SCM::Git(git) => git.changed_files(turbo_root, from_ref, to_ref, include_uncommitted),
            SCM::Manual => Err(Error::GitRequired(turbo_root.to_owned())),
        }
    }

    pub fn merge_base(&self, a: &str, b: &str) -> Result<String, Error> {
        match self {
            SCM::Git(git) => git.merge_base(a, b),
            SCM::Manual => Err(Error::git_error("merge-base requires a git repository")),
        }
    }

    /// Hashes of every file a task's `inputs` select within a package. With
    /// empty `inputs` this is every non-ignored file in the package except
    /// those matched by `default_exclusions` (the task's declared outputs).
    pub fn get_package_file_hashes(
        &self,
        turbo_root: &AbsoluteSystemPath,
        package_path: &AnchoredSystemPath,
        inputs: &[String],
        default_exclusions: &[String],
    ) -> Result<GitHashes, Error> {
        match self {
            SCM::Git(git) if inputs.is_empty() => {
                match git.get_package_file_hashes(turbo_root, package_path, default_exclusions) {
                    Ok(hashes) => Ok(hashes),
                    Err(e) => {
                        tracing::debug!("git hashing failed: {}, falling back to manual", e);
                        manual::get_package_file_hashes(
                            turbo_root,
                            package_path,
                            inputs,
                            default_exclusions,
                        )
                    }
                }
            }
            // Custom inputs bypass the index entirely so that non-tracked
            // matches are picked up.
            _ => manual::get_package_file_hashes(turbo_root, package_path, inputs, default_exclusions),
        }
    }

    /// Hashes an explicit list of repo-anchored files, e.g. global
    /// dependencies.
    pub fn get_hashes_for_files(
        &self,
        turbo_root: &AbsoluteSystemPath,
        files: &[AnchoredSystemPathBuf],
        allow_missing: bool,
    ) -> Result<GitHashes, Error> {
        manual::hash_files(turbo_root, files, allow_missing)
    }
}

impl Git {
    fn find(path_in_repo: &AbsoluteSystemPath) -> Result<Self, Error> {
        let bin = which::which("git")?;
        let root = path_in_repo
            .ancestors()
            .find(|ancestor| ancestor.join_component(".git").exists())
            .ok_or_else(|| Error::GitRequired(path_in_repo.to_owned()))?;
        Ok(Self {
            root: root.to_owned(),
            bin,
        })
    }

    pub(crate) fn spawn_git_command(
        &self,
        args: &[impl AsRef<std::ffi::OsStr>],
    ) -> Result<Vec<u8>, Error> {
        let output = Command::new(&self.bin)
            .args(args)
            .current_dir(self.root.as_std_path())
            .output()?;
        if !output.status.success() {
            return Err(Error::git_error(format!(
                "git exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_manual_fallback_outside_repo() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let scm = SCM::new(&root);
        assert!(scm.is_manual());
        assert!(matches!(
            scm.changed_files(&root, "HEAD", None, true),
            Err(Error::GitRequired(_))
        ));
    }
}
