use std::collections::HashSet;

use turbopath::AbsoluteSystemPath;
use turborepo_repository::{
    change_mapper::{ChangeMapper, PackageChanges},
    package_graph::{PackageGraph, PackageName},
};
use turborepo_scm::SCM;

use super::target_selector::GitRange;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Scm(#[from] turborepo_scm::Error),
    #[error(transparent)]
    ChangeMapper(#[from] turborepo_repository::change_mapper::Error),
}

/// Resolves a `[git range]` selector into the set of packages the range
/// touches. Lockfile or global-dependency changes mean every package.
pub trait GitChangeDetector {
    fn changed_packages(&self, range: &GitRange) -> Result<HashSet<PackageName>, Error>;
}

pub struct ScopeChangeDetector<'a> {
    turbo_root: &'a AbsoluteSystemPath,
    scm: &'a SCM,
    package_graph: &'a PackageGraph,
    global_deps: Vec<String>,
}

impl<'a> ScopeChangeDetector<'a> {
    pub fn new(
        turbo_root: &'a AbsoluteSystemPath,
        scm: &'a SCM,
        package_graph: &'a PackageGraph,
        global_deps: Vec<String>,
    ) -> Self {
        Self {
            turbo_root,
            scm,
            package_graph,
            global_deps,
        }
    }
}

impl GitChangeDetector for ScopeChangeDetector<'_> {
    fn changed_packages(&self, range: &GitRange) -> Result<HashSet<PackageName>, Error> {
        let changed_files = self.scm.changed_files(
            self.turbo_root,
            &range.from_ref,
            range.to_ref.as_deref(),
            range.include_uncommitted,
        )?;

        let lockfile_changed = changed_files.iter().any(|file| {
            file.to_unix().as_str() == self.package_graph.package_manager().lockfile_name()
        });

        let mapper = ChangeMapper::new(self.package_graph, &self.global_deps)?;
        match mapper.changed_packages(changed_files, lockfile_changed)? {
            PackageChanges::All => Ok(self
                .package_graph
                .packages()
                .map(|(name, _)| name.clone())
                .collect()),
            PackageChanges::Some(packages) => Ok(packages),
        }
    }
}
