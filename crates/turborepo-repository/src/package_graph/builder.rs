use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::prelude::*;
use thiserror::Error;
use tracing::warn;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf};
use turborepo_lockfiles::Lockfile;

use super::{PackageGraph, PackageInfo, PackageName, PackageNode};
use crate::{
    package_json::{self, PackageJson},
    package_manager::{self, PackageManager},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    PackageJson(#[from] package_json::Error),
    #[error(transparent)]
    PackageManager(#[from] package_manager::Error),
    #[error(transparent)]
    Glob(#[from] globwalk::WalkError),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
    #[error(transparent)]
    Lockfile(#[from] turborepo_lockfiles::Error),
    #[error(
        "Failed to add workspace \"{name}\" from \"{second}\", it already exists at \"{first}\""
    )]
    DuplicatePackageName {
        name: String,
        first: String,
        second: String,
    },
    #[error("package.json at {0} is missing a \"name\" field")]
    MissingPackageJsonName(String),
    #[error("Invalid package dependency graph: {0}")]
    InvalidPackageGraph(#[source] turborepo_graph_utils::Error),
}

/// Assembles a `PackageGraph`: discovers workspaces, reads manifests, builds
/// the internal edge set, and resolves external dependency closures through
/// the lockfile.
pub struct PackageGraphBuilder<'a> {
    repo_root: &'a AbsoluteSystemPath,
    root_package_json: PackageJson,
    is_single_package: bool,
    package_manager: Option<PackageManager>,
    package_jsons: Option<HashMap<AbsoluteSystemPathBuf, PackageJson>>,
    lockfile: Option<Box<dyn Lockfile>>,
}

impl<'a> PackageGraphBuilder<'a> {
    pub fn new(repo_root: &'a AbsoluteSystemPath, root_package_json: PackageJson) -> Self {
        Self {
            repo_root,
            root_package_json,
            is_single_package: false,
            package_manager: None,
            package_jsons: None,
            lockfile: None,
        }
    }

    pub fn with_single_package_mode(mut self, is_single: bool) -> Self {
        self.is_single_package = is_single;
        self
    }

    pub fn with_package_manager(mut self, package_manager: PackageManager) -> Self {
        self.package_manager = Some(package_manager);
        self
    }

    /// Skips filesystem discovery and uses the provided manifests. Mostly
    /// for tests.
    pub fn with_package_jsons(
        mut self,
        package_jsons: HashMap<AbsoluteSystemPathBuf, PackageJson>,
    ) -> Self {
        self.package_jsons = Some(package_jsons);
        self
    }

    pub fn with_lockfile(mut self, lockfile: Option<Box<dyn Lockfile>>) -> Self {
        self.lockfile = lockfile;
        self
    }

    pub fn build(self) -> Result<PackageGraph, Error> {
        let Self {
            repo_root,
            root_package_json,
            is_single_package,
            package_manager,
            package_jsons,
            lockfile,
        } = self;

        let package_manager = match package_manager {
            Some(pm) => pm,
            None => PackageManager::get_package_manager(repo_root, &root_package_json)?,
        };

        let mut graph = Graph::new();
        let mut node_lookup = HashMap::new();
        let mut packages = HashMap::new();

        let root_index = graph.add_node(PackageNode::Root);
        node_lookup.insert(PackageNode::Root, root_index);
        let root_workspace = PackageNode::Workspace(PackageName::Root);
        let root_workspace_index = graph.add_node(root_workspace.clone());
        node_lookup.insert(root_workspace, root_workspace_index);
        graph.add_edge(root_workspace_index, root_index, ());

        packages.insert(
            PackageName::Root,
            PackageInfo {
                package_json: root_package_json.clone(),
                package_json_path: turbopath::AnchoredSystemPathBuf::from_raw("package.json")?,
                unresolved_external_dependencies: None,
                transitive_dependencies: None,
            },
        );

        // Discover and parse workspace manifests.
        if !is_single_package {
            let manifests = match package_jsons {
                Some(manifests) => manifests,
                None => {
                    let globs =
                        package_manager.get_workspace_globs(repo_root, &root_package_json)?;
                    let inclusions: Vec<String> = globs
                        .inclusions
                        .iter()
                        .map(|glob| format!("{}/package.json", glob.trim_end_matches('/')))
                        .collect();
                    let paths = globwalk::globwalk(
                        repo_root,
                        &inclusions,
                        &globs.exclusions,
                        globwalk::WalkType::Files,
                    )?;
                    let mut manifests = HashMap::new();
                    for path in paths {
                        let manifest = PackageJson::load(&path)?;
                        manifests.insert(path, manifest);
                    }
                    manifests
                }
            };

            for (path, manifest) in manifests {
                let anchored = repo_root.anchor(&path)?;
                let name = manifest
                    .name
                    .clone()
                    .ok_or_else(|| Error::MissingPackageJsonName(path.to_string()))?;
                let name = PackageName::from(name);
                if let Some(existing) = packages.get(&name) {
                    return Err(Error::DuplicatePackageName {
                        name: name.to_string(),
                        first: existing.package_path().to_string(),
                        second: anchored
                            .parent()
                            .map(|p| p.to_string())
                            .unwrap_or_default(),
                    });
                }

                let node = PackageNode::Workspace(name.clone());
                let index = graph.add_node(node.clone());
                node_lookup.insert(node, index);
                packages.insert(
                    name,
                    PackageInfo {
                        package_json: manifest,
                        package_json_path: anchored,
                        unresolved_external_dependencies: None,
                        transitive_dependencies: None,
                    },
                );
            }
        }

        // Internal edges are created by name match; everything else the
        // manifest declares is an external dependency.
        let names: HashSet<PackageName> = packages.keys().cloned().collect();
        for (name, info) in packages.iter_mut() {
            let mut externals = BTreeMap::new();
            let own_index = node_lookup[&PackageNode::Workspace(name.clone())];
            let mut has_internal_deps = false;
            for (dep_name, specifier) in info.package_json.all_dependencies() {
                let dep = PackageName::from(dep_name.as_str());
                if dep != *name && names.contains(&dep) {
                    let dep_index = node_lookup[&PackageNode::Workspace(dep)];
                    graph.add_edge(own_index, dep_index, ());
                    has_internal_deps = true;
                } else {
                    externals.insert(dep_name.clone(), specifier.clone());
                }
            }
            info.unresolved_external_dependencies = Some(externals);
            if !has_internal_deps && *name != PackageName::Root {
                graph.add_edge(own_index, root_index, ());
            }
        }

        // Resolve external closures through the lockfile. A missing lockfile
        // downgrades to a warning; dependency hashes then cover nothing.
        let lockfile = match lockfile {
            Some(lockfile) => Some(lockfile),
            None if !is_single_package => match package_manager.read_lockfile(repo_root) {
                Ok(lockfile) => Some(lockfile),
                Err(package_manager::Error::Io { path, err })
                    if err.kind() == std::io::ErrorKind::NotFound =>
                {
                    warn!("no lockfile found at {path}, external dependencies will not be hashed");
                    None
                }
                Err(e) => return Err(e.into()),
            },
            None => None,
        };

        if let Some(lockfile) = &lockfile {
            let workspaces: HashMap<String, HashMap<String, String>> = packages
                .values()
                .map(|info| {
                    let path = package_manager
                        .workspace_lockfile_key(info.package_path().to_unix().as_str());
                    let deps = info
                        .unresolved_external_dependencies
                        .clone()
                        .unwrap_or_default()
                        .into_iter()
                        .collect();
                    (path, deps)
                })
                .collect();
            match turborepo_lockfiles::all_transitive_closures(lockfile, workspaces) {
                Ok(mut closures) => {
                    for info in packages.values_mut() {
                        let path = package_manager
                            .workspace_lockfile_key(info.package_path().to_unix().as_str());
                        info.transitive_dependencies = closures.remove(&path);
                    }
                }
                Err(err) => {
                    // A workspace the lockfile doesn't know about means the
                    // lockfile is out of date; surface that.
                    return Err(err.into());
                }
            }
        }

        let package_graph = PackageGraph {
            graph,
            node_lookup,
            packages,
            package_manager,
            lockfile,
            repo_root: repo_root.to_owned(),
        };

        package_graph
            .validate()
            .map_err(Error::InvalidPackageGraph)?;

        Ok(package_graph)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_duplicate_package_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let mut manifests = HashMap::new();
        for dir_name in ["first", "second"] {
            manifests.insert(
                repo_root.join_components(&["packages", dir_name, "package.json"]),
                PackageJson {
                    name: Some("dupe".to_string()),
                    ..Default::default()
                },
            );
        }
        let result = PackageGraph::builder(&repo_root, PackageJson::default())
            .with_package_manager(PackageManager::Npm)
            .with_package_jsons(manifests)
            .build();
        assert!(matches!(result, Err(Error::DuplicatePackageName { .. })));
    }

    #[test]
    fn test_missing_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let manifests = HashMap::from([(
            repo_root.join_components(&["packages", "anon", "package.json"]),
            PackageJson::default(),
        )]);
        let result = PackageGraph::builder(&repo_root, PackageJson::default())
            .with_package_manager(PackageManager::Npm)
            .with_package_jsons(manifests)
            .build();
        assert!(matches!(result, Err(Error::MissingPackageJsonName(_))));
    }

    #[test]
    fn test_workspace_cycle_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let mut manifests = HashMap::new();
        for (name, dep) in [("a", "b"), ("b", "a")] {
            manifests.insert(
                repo_root.join_components(&["packages", name, "package.json"]),
                PackageJson {
                    name: Some(name.to_string()),
                    dependencies: Some(
                        [(dep.to_string(), "workspace:*".to_string())]
                            .into_iter()
                            .collect(),
                    ),
                    ..Default::default()
                },
            );
        }
        let result = PackageGraph::builder(&repo_root, PackageJson::default())
            .with_package_manager(PackageManager::Npm)
            .with_package_jsons(manifests)
            .build();
        assert!(matches!(result, Err(Error::InvalidPackageGraph(_))));
    }

    #[test]
    fn test_single_package_mode_has_only_root() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let graph = PackageGraph::builder(&repo_root, PackageJson::default())
            .with_package_manager(PackageManager::Npm)
            .with_single_package_mode(true)
            .build()
            .unwrap();
        assert_eq!(graph.len(), 1);
        assert!(graph.package_info(&PackageName::Root).is_some());
    }
}
