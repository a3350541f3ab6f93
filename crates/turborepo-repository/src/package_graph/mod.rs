mod builder;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
};

use petgraph::prelude::*;
use serde::Serialize;
use turbopath::{AbsoluteSystemPathBuf, AnchoredSystemPath, AnchoredSystemPathBuf};
use turborepo_lockfiles::Lockfile;

pub use builder::{Error, PackageGraphBuilder};
use crate::{package_json::PackageJson, package_manager::PackageManager};

pub const ROOT_PKG_NAME: &str = "//";

/// A package's name. The synthetic root package is always present and named
/// "//" so that root tasks can be addressed as `//#task`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PackageName {
    Root,
    Other(String),
}

impl Serialize for PackageName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl PackageName {
    pub fn as_str(&self) -> &str {
        match self {
            PackageName::Root => ROOT_PKG_NAME,
            PackageName::Other(name) => name,
        }
    }
}

impl From<&str> for PackageName {
    fn from(value: &str) -> Self {
        if value == ROOT_PKG_NAME {
            PackageName::Root
        } else {
            PackageName::Other(value.to_string())
        }
    }
}

impl From<String> for PackageName {
    fn from(value: String) -> Self {
        if value == ROOT_PKG_NAME {
            PackageName::Root
        } else {
            PackageName::Other(value)
        }
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in the package graph: a workspace package, or the synthetic sink
/// every package ultimately depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PackageNode {
    Root,
    Workspace(PackageName),
}

impl PackageNode {
    pub fn as_package_name(&self) -> &PackageName {
        match self {
            PackageNode::Root => &PackageName::Root,
            PackageNode::Workspace(name) => name,
        }
    }
}

impl fmt::Display for PackageNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageNode::Root => f.write_str("___ROOT___"),
            PackageNode::Workspace(name) => name.fmt(f),
        }
    }
}

/// Everything we know about one discovered package.
#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub package_json: PackageJson,
    pub package_json_path: AnchoredSystemPathBuf,
    /// External (non-workspace) deps declared by the manifest: name ->
    /// specifier. `None` until dependency resolution has run.
    pub unresolved_external_dependencies: Option<BTreeMap<String, String>>,
    /// Closure of external deps resolved through the lockfile.
    pub transitive_dependencies: Option<HashSet<turborepo_lockfiles::Package>>,
}

impl PackageInfo {
    pub fn package_path(&self) -> &AnchoredSystemPath {
        self.package_json_path
            .parent()
            .unwrap_or_else(|| AnchoredSystemPath::new("").unwrap())
    }

    pub fn package_name(&self) -> Option<&str> {
        self.package_json.name.as_deref()
    }
}

/// The workspace package graph. Edges point from a package to the packages
/// it depends on; the synthetic root node is the sink for packages with no
/// internal dependencies. Immutable once built.
pub struct PackageGraph {
    graph: Graph<PackageNode, ()>,
    node_lookup: HashMap<PackageNode, NodeIndex>,
    packages: HashMap<PackageName, PackageInfo>,
    package_manager: PackageManager,
    lockfile: Option<Box<dyn Lockfile>>,
    repo_root: AbsoluteSystemPathBuf,
}

// The lockfile trait object has no Debug; render the parts that do.
impl fmt::Debug for PackageGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageGraph")
            .field("packages", &self.packages.keys().collect::<Vec<_>>())
            .field("package_manager", &self.package_manager)
            .finish_non_exhaustive()
    }
}

impl PackageGraph {
    pub fn builder(
        repo_root: &turbopath::AbsoluteSystemPath,
        root_package_json: PackageJson,
    ) -> PackageGraphBuilder<'_> {
        PackageGraphBuilder::new(repo_root, root_package_json)
    }

    pub fn repo_root(&self) -> &turbopath::AbsoluteSystemPath {
        &self.repo_root
    }

    pub fn package_manager(&self) -> &PackageManager {
        &self.package_manager
    }

    pub fn lockfile(&self) -> Option<&dyn Lockfile> {
        self.lockfile.as_deref()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn packages(&self) -> impl Iterator<Item = (&PackageName, &PackageInfo)> {
        self.packages.iter()
    }

    pub fn package_info(&self, name: &PackageName) -> Option<&PackageInfo> {
        self.packages.get(name)
    }

    pub fn package_json(&self, name: &PackageName) -> Option<&PackageJson> {
        self.packages.get(name).map(|info| &info.package_json)
    }

    pub fn package_dir(&self, name: &PackageName) -> Option<&AnchoredSystemPath> {
        self.packages.get(name).map(|info| info.package_path())
    }

    pub fn root_package_json(&self) -> &PackageJson {
        &self
            .packages
            .get(&PackageName::Root)
            .expect("the root package is always present")
            .package_json
    }

    /// Direct dependencies of `node`, including the synthetic root node.
    pub fn immediate_dependencies(&self, node: &PackageNode) -> Option<HashSet<&PackageNode>> {
        self.neighbors(node, petgraph::Direction::Outgoing)
    }

    pub fn immediate_dependents(&self, node: &PackageNode) -> Option<HashSet<&PackageNode>> {
        self.neighbors(node, petgraph::Direction::Incoming)
    }

    fn neighbors(
        &self,
        node: &PackageNode,
        direction: petgraph::Direction,
    ) -> Option<HashSet<&PackageNode>> {
        let index = self.node_lookup.get(node)?;
        Some(
            self.graph
                .neighbors_directed(*index, direction)
                .map(|index| {
                    self.graph
                        .node_weight(index)
                        .expect("node index must be present")
                })
                .collect(),
        )
    }

    /// All packages `node` transitively depends on, including itself.
    pub fn transitive_dependencies(&self, node: &PackageNode) -> HashSet<&PackageNode> {
        self.transitive_closure(Some(node), petgraph::Direction::Outgoing)
    }

    /// All packages that transitively depend on `node`, including itself.
    pub fn transitive_dependents(&self, node: &PackageNode) -> HashSet<&PackageNode> {
        self.transitive_closure(Some(node), petgraph::Direction::Incoming)
    }

    fn transitive_closure<'a, I: IntoIterator<Item = &'a PackageNode>>(
        &self,
        nodes: I,
        direction: petgraph::Direction,
    ) -> HashSet<&PackageNode> {
        let indices = nodes
            .into_iter()
            .filter_map(|node| self.node_lookup.get(node))
            .copied()
            .collect::<Vec<_>>();
        turborepo_graph_utils::transitive_closure(&self.graph, indices, direction)
    }

    /// Acyclicity check, run once after building.
    pub fn validate(&self) -> Result<(), turborepo_graph_utils::Error> {
        turborepo_graph_utils::validate_graph(&self.graph)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn graph_from_jsons(jsons: &[(&str, &[&str])]) -> PackageGraph {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let mut package_jsons = HashMap::new();
        for (name, deps) in jsons {
            let path = repo_root.join_components(&["packages", name, "package.json"]);
            let package_json = PackageJson {
                name: Some(name.to_string()),
                dependencies: Some(
                    deps.iter()
                        .map(|dep| (dep.to_string(), "workspace:*".to_string()))
                        .collect(),
                ),
                ..Default::default()
            };
            package_jsons.insert(path, package_json);
        }
        PackageGraph::builder(&repo_root, PackageJson::default())
            .with_package_manager(PackageManager::Npm)
            .with_package_jsons(package_jsons)
            .build()
            .unwrap()
    }

    #[test]
    fn test_internal_edges() {
        let graph = graph_from_jsons(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"])]);
        assert_eq!(graph.len(), 4); // root + 3

        let c = PackageNode::Workspace(PackageName::from("c"));
        let deps = graph.immediate_dependencies(&c).unwrap();
        assert_eq!(deps.len(), 2);
        assert!(deps.contains(&PackageNode::Workspace(PackageName::from("a"))));
        assert!(deps.contains(&PackageNode::Workspace(PackageName::from("b"))));
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = graph_from_jsons(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let a = PackageNode::Workspace(PackageName::from("a"));
        let dependents = graph.transitive_dependents(&a);
        let names: HashSet<_> = dependents
            .iter()
            .filter_map(|node| match node {
                PackageNode::Workspace(PackageName::Other(name)) => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, ["a", "b", "c"].into_iter().collect());
    }

    #[test]
    fn test_external_deps_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let path = repo_root.join_components(&["packages", "a", "package.json"]);
        let package_json = PackageJson {
            name: Some("a".to_string()),
            dependencies: Some(
                [("lodash".to_string(), "^4.17.21".to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };
        let graph = PackageGraph::builder(&repo_root, PackageJson::default())
            .with_package_manager(PackageManager::Npm)
            .with_package_jsons([(path, package_json)].into_iter().collect())
            .build()
            .unwrap();

        let info = graph.package_info(&PackageName::from("a")).unwrap();
        let externals = info.unresolved_external_dependencies.as_ref().unwrap();
        assert_eq!(externals.get("lodash").map(String::as_str), Some("^4.17.21"));
    }
}
