mod change_detector;
mod filter;
mod simple_glob;
mod target_selector;

use std::collections::HashSet;

pub use filter::ResolutionError;
use turbopath::AbsoluteSystemPath;
use turborepo_repository::package_graph::{PackageGraph, PackageName};
use turborepo_scm::SCM;

use self::{change_detector::ScopeChangeDetector, filter::FilterResolver};
use crate::opts::ScopeOpts;

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum Error {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Resolution(#[from] ResolutionError),
    #[error("--affected requires a git repository: {0}")]
    AffectedRequiresGit(#[source] turborepo_scm::Error),
}

const DEFAULT_BASE_REF: &str = "main";

/// Computes the package entry set for a run: `--filter` expressions plus the
/// `--affected` shortcut, which behaves as `...[merge-base(HEAD, main)]`.
pub fn resolve_packages(
    opts: &ScopeOpts,
    turbo_root: &AbsoluteSystemPath,
    package_graph: &PackageGraph,
    scm: &SCM,
    global_deps: Vec<String>,
) -> Result<(HashSet<PackageName>, bool), Error> {
    let mut patterns = opts.filter_patterns.clone();
    if opts.affected {
        let base = scm
            .merge_base("HEAD", DEFAULT_BASE_REF)
            .map_err(Error::AffectedRequiresGit)?;
        patterns.push(format!("...[{base}]"));
    }

    let change_detector =
        ScopeChangeDetector::new(turbo_root, scm, package_graph, global_deps);
    let resolver = FilterResolver::new(package_graph, change_detector);
    Ok(resolver.resolve(&patterns)?)
}
