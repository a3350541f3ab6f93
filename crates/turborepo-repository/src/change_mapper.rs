use std::collections::HashSet;

use turbopath::{AnchoredSystemPath, AnchoredSystemPathBuf};
use wax::Pattern;

use crate::package_graph::{PackageGraph, PackageName};

pub const DEFAULT_GLOBAL_INVALIDATORS: &[&str] = &["turbo.json", "package.json"];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid global dependency glob {0}: {1}")]
    BadGlob(String, String),
}

/// The result of mapping changed files to packages. `All` means a
/// repo-global input changed and every package must be considered dirty.
#[derive(Debug, PartialEq, Eq)]
pub enum PackageChanges {
    All,
    Some(HashSet<PackageName>),
}

/// Maps changed files back to the packages that own them. A file under a
/// package directory marks that package; the lockfile, root configuration,
/// or a `globalDependencies` match marks everything.
pub struct ChangeMapper<'a> {
    package_graph: &'a PackageGraph,
    global_deps_matcher: Option<wax::Any<'static>>,
}

impl<'a> ChangeMapper<'a> {
    pub fn new(package_graph: &'a PackageGraph, global_deps: &[String]) -> Result<Self, Error> {
        let global_deps_matcher = if global_deps.is_empty() {
            None
        } else {
            let globs = global_deps
                .iter()
                .map(|raw| {
                    wax::Glob::new(raw)
                        .map(wax::Glob::into_owned)
                        .map_err(|e| Error::BadGlob(raw.clone(), e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Some(
                wax::any::<wax::Glob<'_>, _>(globs)
                    .map_err(|e| Error::BadGlob(global_deps.join(","), e.to_string()))?,
            )
        };
        Ok(Self {
            package_graph,
            global_deps_matcher,
        })
    }

    pub fn changed_packages(
        &self,
        changed_files: HashSet<AnchoredSystemPathBuf>,
        lockfile_changed: bool,
    ) -> Result<PackageChanges, Error> {
        if lockfile_changed {
            return Ok(PackageChanges::All);
        }

        let mut changed = HashSet::new();
        for file in changed_files {
            let unix = file.to_unix();
            if self.is_global_invalidator(unix.as_str()) {
                return Ok(PackageChanges::All);
            }
            match self.package_for_file(&file) {
                Some(name) => {
                    changed.insert(name.clone());
                }
                // Files outside any package belong to the root package.
                None => {
                    changed.insert(PackageName::Root);
                }
            }
        }
        Ok(PackageChanges::Some(changed))
    }

    fn is_global_invalidator(&self, unix: &str) -> bool {
        if DEFAULT_GLOBAL_INVALIDATORS.contains(&unix)
            || unix == self.package_graph.package_manager().lockfile_name()
        {
            return true;
        }
        self.global_deps_matcher
            .as_ref()
            .is_some_and(|matcher| matcher.is_match(unix))
    }

    /// The deepest package whose directory contains `file`.
    fn package_for_file(&self, file: &AnchoredSystemPath) -> Option<&PackageName> {
        self.package_graph
            .packages()
            .filter(|(name, _)| **name != PackageName::Root)
            .filter(|(_, info)| file.starts_with(info.package_path()))
            .max_by_key(|(_, info)| info.package_path().as_str().len())
            .map(|(name, _)| name)
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use turbopath::AbsoluteSystemPathBuf;

    use super::*;
    use crate::{package_graph::PackageGraph, package_json::PackageJson, package_manager::PackageManager};

    fn test_graph() -> (tempfile::TempDir, PackageGraph) {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let mut manifests = HashMap::new();
        for name in ["web", "ui"] {
            manifests.insert(
                repo_root.join_components(&["packages", name, "package.json"]),
                PackageJson {
                    name: Some(name.to_string()),
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

    fn files(paths: &[&str]) -> HashSet<AnchoredSystemPathBuf> {
        paths
            .iter()
            .map(|p| AnchoredSystemPathBuf::from_raw(p).unwrap())
            .collect()
    }

    #[test]
    fn test_file_in_package_marks_package() {
        let (_dir, graph) = test_graph();
        let mapper = ChangeMapper::new(&graph, &[]).unwrap();
        let changes = mapper
            .changed_packages(files(&["packages/web/src/index.ts"]), false)
            .unwrap();
        assert_eq!(
            changes,
            PackageChanges::Some([PackageName::from("web")].into_iter().collect())
        );
    }

    #[test]
    fn test_lockfile_change_marks_all() {
        let (_dir, graph) = test_graph();
        let mapper = ChangeMapper::new(&graph, &[]).unwrap();
        assert_eq!(
            mapper.changed_packages(files(&[]), true).unwrap(),
            PackageChanges::All
        );
        assert_eq!(
            mapper
                .changed_packages(files(&["package-lock.json"]), false)
                .unwrap(),
            PackageChanges::All
        );
    }

    #[test]
    fn test_global_dependency_marks_all() {
        let (_dir, graph) = test_graph();
        let mapper = ChangeMapper::new(&graph, &["configs/*.json".to_string()]).unwrap();
        assert_eq!(
            mapper
                .changed_packages(files(&["configs/eslint.json"]), false)
                .unwrap(),
            PackageChanges::All
        );
    }

    #[test]
    fn test_unowned_file_marks_root() {
        let (_dir, graph) = test_graph();
        let mapper = ChangeMapper::new(&graph, &[]).unwrap();
        assert_eq!(
            mapper.changed_packages(files(&["README.md"]), false).unwrap(),
            PackageChanges::Some([PackageName::Root].into_iter().collect())
        );
    }
}
