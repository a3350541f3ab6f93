//! Lockfile parsing for every package manager the repository supports.
//!
//! Each variant parses its lockfile into a uniform view: given a workspace
//! and the dependencies its manifest declares, produce the transitive set of
//! external packages with pinned versions. That set feeds the per-package
//! dependency hash.

#![deny(clippy::all)]

mod berry;
mod bun;
mod error;
mod npm;
mod pnpm;
mod yarn1;

use std::collections::{HashMap, HashSet};

pub use berry::BerryLockfile;
pub use bun::BunLockfile;
pub use error::Error;
pub use npm::NpmLockfile;
pub use pnpm::PnpmLockfile;
use serde::Serialize;
use turbopath::RelativeUnixPathBuf;
pub use yarn1::Yarn1Lockfile;

/// An external package pinned by a lockfile: the lockfile-specific key it is
/// stored under and the resolved version.
#[derive(Debug, PartialEq, Eq, Clone, PartialOrd, Ord, Hash, Serialize)]
pub struct Package {
    pub key: String,
    pub version: String,
}

impl Package {
    pub fn new(key: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version: version.into(),
        }
    }
}

/// The capability set every lockfile variant implements.
pub trait Lockfile: Send + Sync {
    /// Given a workspace, a package it imports, and the version specifier
    /// from its manifest, returns the resolved lockfile entry if present.
    fn resolve_package(
        &self,
        workspace_path: &str,
        name: &str,
        version: &str,
    ) -> Result<Option<Package>, Error>;

    /// All (prod/dev/optional/peer) dependencies of a resolved lockfile key,
    /// as name -> specifier pairs suitable for `resolve_package`.
    fn all_dependencies(&self, key: &str) -> Result<Option<HashMap<String, String>>, Error>;

    /// Produces a pruned lockfile containing only the given workspaces and
    /// external package keys.
    fn subgraph(
        &self,
        workspace_packages: &[String],
        packages: &[String],
    ) -> Result<Box<dyn Lockfile>, Error>;

    fn encode(&self) -> Result<Vec<u8>, Error>;

    /// Patch files referenced by the lockfile, repo-relative.
    fn patches(&self) -> Result<Vec<RelativeUnixPathBuf>, Error> {
        Ok(Vec::new())
    }

    /// An opaque key summarizing lockfile-wide state. If this key differs
    /// between two versions of the lockfile, every package is considered
    /// changed. Keys are ephemeral and need not be stable across releases;
    /// implementations prefix a magic identifier to avoid cross-variant
    /// collisions.
    fn global_change_key(&self) -> Vec<u8>;
}

/// Whether a lockfile edit invalidates everything, e.g. a lockfile format
/// version bump.
pub fn global_change(prev: &dyn Lockfile, curr: &dyn Lockfile) -> bool {
    prev.global_change_key() != curr.global_change_key()
}

/// Calculates the transitive closure of external packages for every
/// workspace. Input maps workspace directory -> (name -> version specifier)
/// for the dependencies its manifest declares.
pub fn all_transitive_closures<L: Lockfile + ?Sized>(
    lockfile: &L,
    workspaces: HashMap<String, HashMap<String, String>>,
) -> Result<HashMap<String, HashSet<Package>>, Error> {
    workspaces
        .into_iter()
        .map(|(workspace, unresolved_deps)| {
            let closure = transitive_closure(lockfile, &workspace, unresolved_deps)?;
            Ok((workspace, closure))
        })
        .collect()
}

impl Lockfile for Box<dyn Lockfile> {
    fn resolve_package(
        &self,
        workspace_path: &str,
        name: &str,
        version: &str,
    ) -> Result<Option<Package>, Error> {
        self.as_ref().resolve_package(workspace_path, name, version)
    }

    fn all_dependencies(&self, key: &str) -> Result<Option<HashMap<String, String>>, Error> {
        self.as_ref().all_dependencies(key)
    }

    fn subgraph(
        &self,
        workspace_packages: &[String],
        packages: &[String],
    ) -> Result<Box<dyn Lockfile>, Error> {
        self.as_ref().subgraph(workspace_packages, packages)
    }

    fn encode(&self) -> Result<Vec<u8>, Error> {
        self.as_ref().encode()
    }

    fn patches(&self) -> Result<Vec<RelativeUnixPathBuf>, Error> {
        self.as_ref().patches()
    }

    fn global_change_key(&self) -> Vec<u8> {
        self.as_ref().global_change_key()
    }
}

pub fn transitive_closure<L: Lockfile + ?Sized>(
    lockfile: &L,
    workspace_path: &str,
    unresolved_deps: HashMap<String, String>,
) -> Result<HashSet<Package>, Error> {
    let mut transitive_deps = HashSet::new();
    transitive_closure_helper(lockfile, workspace_path, unresolved_deps, &mut transitive_deps)?;
    Ok(transitive_deps)
}

fn transitive_closure_helper<L: Lockfile + ?Sized>(
    lockfile: &L,
    workspace_path: &str,
    unresolved_deps: HashMap<String, impl AsRef<str>>,
    resolved_deps: &mut HashSet<Package>,
) -> Result<(), Error> {
    for (name, specifier) in unresolved_deps {
        let pkg = lockfile.resolve_package(workspace_path, &name, specifier.as_ref())?;

        match pkg {
            None => continue,
            Some(pkg) if resolved_deps.contains(&pkg) => continue,
            Some(pkg) => {
                let all_deps = lockfile.all_dependencies(&pkg.key)?;
                resolved_deps.insert(pkg);
                if let Some(deps) = all_deps {
                    transitive_closure_helper(lockfile, workspace_path, deps, resolved_deps)?;
                }
            }
        }
    }

    Ok(())
}
