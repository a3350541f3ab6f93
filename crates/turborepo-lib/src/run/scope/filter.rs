use std::{collections::HashSet, str::FromStr};

use miette::Diagnostic;
use thiserror::Error;
use tracing::warn;
use turbopath::AnchoredSystemPathBuf;
use turborepo_repository::package_graph::{PackageGraph, PackageName, PackageNode};

use super::{
    change_detector::{self, GitChangeDetector},
    simple_glob::SimpleGlob,
    target_selector::{InvalidSelectorError, TargetSelector},
};

#[derive(Debug, Error, Diagnostic)]
pub enum ResolutionError {
    #[error("invalid filter pattern: {0}")]
    InvalidSelector(#[from] InvalidSelectorError),
    #[error("invalid package name pattern {pattern}: {source}")]
    InvalidNamePattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error(transparent)]
    ChangeDetection(#[from] change_detector::Error),
}

/// Applies `--filter` expressions against the package graph. Each positive
/// selector contributes a set of packages; the result is their union minus
/// the union of the negated selectors.
pub struct FilterResolver<'a, T: GitChangeDetector> {
    package_graph: &'a PackageGraph,
    change_detector: T,
}

impl<'a, T: GitChangeDetector> FilterResolver<'a, T> {
    pub fn new(package_graph: &'a PackageGraph, change_detector: T) -> Self {
        Self {
            package_graph,
            change_detector,
        }
    }

    /// Resolves the filter patterns into the selected package set, plus
    /// whether any filter was supplied at all (an empty filter list selects
    /// everything).
    pub fn resolve(
        &self,
        patterns: &[String],
    ) -> Result<(HashSet<PackageName>, bool), ResolutionError> {
        if patterns.is_empty() {
            let all = self
                .package_graph
                .packages()
                .map(|(name, _)| name.clone())
                .filter(|name| *name != PackageName::Root)
                .collect();
            return Ok((all, false));
        }

        let selectors = patterns
            .iter()
            .map(|pattern| TargetSelector::from_str(pattern))
            .collect::<Result<Vec<_>, _>>()?;

        let (include, exclude): (Vec<_>, Vec<_>) =
            selectors.into_iter().partition(|selector| !selector.exclude);

        // Exclusion-only filters subtract from the full package set.
        let mut selected = if include.is_empty() {
            self.package_graph
                .packages()
                .map(|(name, _)| name.clone())
                .filter(|name| *name != PackageName::Root)
                .collect()
        } else {
            HashSet::new()
        };
        for selector in include {
            selected.extend(self.resolve_selector(&selector)?);
        }
        for selector in exclude {
            let excluded = self.resolve_selector(&selector)?;
            selected.retain(|package| !excluded.contains(package));
        }

        if selected.is_empty() {
            // Not a failure: a filter that matches nothing produces an
            // empty run.
            warn!("no packages matched the provided filter");
        }

        Ok((selected, true))
    }

    fn resolve_selector(
        &self,
        selector: &TargetSelector,
    ) -> Result<HashSet<PackageName>, ResolutionError> {
        let mut entry_packages: HashSet<PackageName> = HashSet::new();

        if let Some(git_range) = &selector.git_range {
            entry_packages = self.change_detector.changed_packages(git_range)?;
            // a name or directory narrows the changed set
            if !selector.name_pattern.is_empty() {
                let matcher = self.name_matcher(&selector.name_pattern)?;
                entry_packages.retain(|name| matcher.is_match(name.as_str()));
            }
            if let Some(parent_dir) = &selector.parent_dir {
                entry_packages
                    .retain(|name| self.package_in_dir(name, parent_dir));
            }
        } else if let Some(parent_dir) = &selector.parent_dir {
            entry_packages = self
                .package_graph
                .packages()
                .filter(|(name, _)| **name != PackageName::Root)
                .filter(|(name, _)| self.package_in_dir(name, parent_dir))
                .map(|(name, _)| name.clone())
                .collect();
            if !selector.name_pattern.is_empty() {
                let matcher = self.name_matcher(&selector.name_pattern)?;
                entry_packages.retain(|name| matcher.is_match(name.as_str()));
            }
        } else {
            let matcher = self.name_matcher(&selector.name_pattern)?;
            entry_packages = self
                .package_graph
                .packages()
                .filter(|(name, _)| **name != PackageName::Root)
                .filter(|(name, _)| matcher.is_match(name.as_str()))
                .map(|(name, _)| name.clone())
                .collect();
        }

        let mut result = HashSet::new();
        for package in &entry_packages {
            let node = PackageNode::Workspace(package.clone());
            if selector.include_dependencies {
                result.extend(self.workspace_names(
                    self.package_graph.transitive_dependencies(&node),
                ));
            }
            if selector.include_dependents {
                result.extend(self.workspace_names(
                    self.package_graph.transitive_dependents(&node),
                ));
            }
        }
        if selector.exclude_self {
            for package in &entry_packages {
                result.remove(package);
            }
        } else {
            result.extend(entry_packages);
        }

        Ok(result)
    }

    fn name_matcher(&self, pattern: &str) -> Result<SimpleGlob, ResolutionError> {
        SimpleGlob::new(pattern).map_err(|source| ResolutionError::InvalidNamePattern {
            pattern: pattern.to_string(),
            source,
        })
    }

    fn package_in_dir(&self, name: &PackageName, parent_dir: &AnchoredSystemPathBuf) -> bool {
        self.package_graph
            .package_dir(name)
            .is_some_and(|dir| dir.starts_with(parent_dir))
    }

    fn workspace_names<'b>(
        &self,
        nodes: HashSet<&'b PackageNode>,
    ) -> impl Iterator<Item = PackageName> + 'b {
        nodes.into_iter().filter_map(|node| match node {
            PackageNode::Workspace(name) if *name != PackageName::Root => Some(name.clone()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use turborepo_repository::{package_json::PackageJson, package_manager::PackageManager};

    use super::*;
    use crate::run::scope::target_selector::GitRange;

    struct MockChangeDetector(HashSet<PackageName>);

    impl GitChangeDetector for MockChangeDetector {
        fn changed_packages(
            &self,
            _range: &GitRange,
        ) -> Result<HashSet<PackageName>, change_detector::Error> {
            Ok(self.0.clone())
        }
    }

    fn test_graph() -> (tempfile::TempDir, PackageGraph) {
        // app-a -> lib-b -> lib-d
        // app-c -> lib-b
        let dir = tempfile::tempdir().unwrap();
        let repo_root = turbopath::AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let mut manifests = HashMap::new();
        for (name, location, deps) in [
            ("app-a", "apps/app-a", vec!["lib-b"]),
            ("app-c", "apps/app-c", vec!["lib-b"]),
            ("lib-b", "libs/lib-b", vec!["lib-d"]),
            ("lib-d", "libs/lib-d", vec![]),
        ] {
            manifests.insert(
                repo_root.join_unix_path(
                    turbopath::RelativeUnixPath::new(&format!("{location}/package.json")).unwrap(),
                ),
                PackageJson {
                    name: Some(name.to_string()),
                    dependencies: Some(
                        deps.into_iter()
                            .map(|dep| (dep.to_string(), "workspace:*".to_string()))
                            .collect(),
                    ),
                    ..Default::default()
                },
            );
        }
        let graph = PackageGraph::builder(&repo_root, PackageJson::default())
            .with_package_manager(PackageManager::Npm)
            .with_package_jsons(manifests)
            .build()
            .unwrap();
        (dir, graph)
    }

    fn resolve(graph: &PackageGraph, changed: &[&str], patterns: &[&str]) -> Vec<String> {
        let resolver = FilterResolver::new(
            graph,
            MockChangeDetector(changed.iter().map(|name| PackageName::from(*name)).collect()),
        );
        let (packages, _) = resolver
            .resolve(&patterns.iter().map(|p| p.to_string()).collect::<Vec<_>>())
            .unwrap();
        let mut names: Vec<_> = packages.iter().map(|name| name.to_string()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_no_filter_selects_everything() {
        let (_dir, graph) = test_graph();
        assert_eq!(
            resolve(&graph, &[], &[]),
            vec!["app-a", "app-c", "lib-b", "lib-d"]
        );
    }

    #[test]
    fn test_exact_name() {
        let (_dir, graph) = test_graph();
        assert_eq!(resolve(&graph, &[], &["app-a"]), vec!["app-a"]);
    }

    #[test]
    fn test_name_with_dependencies() {
        let (_dir, graph) = test_graph();
        assert_eq!(
            resolve(&graph, &[], &["app-a..."]),
            vec!["app-a", "lib-b", "lib-d"]
        );
    }

    #[test]
    fn test_name_with_dependents() {
        let (_dir, graph) = test_graph();
        assert_eq!(
            resolve(&graph, &[], &["...lib-b"]),
            vec!["app-a", "app-c", "lib-b"]
        );
    }

    #[test]
    fn test_dependents_excluding_self() {
        let (_dir, graph) = test_graph();
        assert_eq!(resolve(&graph, &[], &["...^lib-b"]), vec!["app-a", "app-c"]);
    }

    #[test]
    fn test_directory_selector() {
        let (_dir, graph) = test_graph();
        assert_eq!(resolve(&graph, &[], &["./libs/lib-b"]), vec!["lib-b"]);
    }

    #[test]
    fn test_negation() {
        let (_dir, graph) = test_graph();
        assert_eq!(
            resolve(&graph, &[], &["*", "!lib-*"]),
            vec!["app-a", "app-c"]
        );
    }

    #[test]
    fn test_git_range_with_dependents() {
        let (_dir, graph) = test_graph();
        assert_eq!(
            resolve(&graph, &["lib-d"], &["...[main]"]),
            vec!["app-a", "app-c", "lib-b", "lib-d"]
        );
    }

    #[test]
    fn test_no_match_is_empty_not_error() {
        let (_dir, graph) = test_graph();
        assert_eq!(resolve(&graph, &[], &["ghost"]), Vec::<String>::new());
    }

    #[test]
    fn test_exclusion_only_subtracts_from_everything() {
        let (_dir, graph) = test_graph();
        assert_eq!(
            resolve(&graph, &[], &["!app-c"]),
            vec!["app-a", "lib-b", "lib-d"]
        );
    }

    #[test]
    fn test_filter_is_idempotent() {
        let (_dir, graph) = test_graph();
        let first = resolve(&graph, &[], &["...lib-b", "!app-c"]);
        let second = resolve(&graph, &[], &["...lib-b", "!app-c"]);
        assert_eq!(first, second);
    }
}
