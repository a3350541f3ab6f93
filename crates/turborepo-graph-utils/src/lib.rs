//! Utilities layered over `petgraph`: cycle validation with candidate edges
//! to break the cycle, transitive closures, and a dependency-ordered
//! concurrent walker.

#![deny(clippy::all)]

mod walker;

use std::{collections::HashSet, fmt::Display, hash::Hash};

use itertools::Itertools;
use petgraph::{
    prelude::*,
    visit::{depth_first_search, DfsEvent, Reversed},
};
use thiserror::Error;

pub use walker::{WalkMessage, Walker};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cyclic dependency detected:\n{cycle_lines}")]
    CyclicDependencies { cycle_lines: String },
    #[error("{0} depends on itself")]
    SelfDependency(String),
}

/// Nodes reachable from `indices` in the given direction, including the
/// starting nodes themselves.
pub fn transitive_closure<N: Hash + Eq, I: IntoIterator<Item = NodeIndex>>(
    graph: &Graph<N, ()>,
    indices: I,
    direction: petgraph::Direction,
) -> HashSet<&N> {
    let mut visited = HashSet::new();

    let visitor = |event| {
        if let DfsEvent::Discover(n, _) = event {
            visited.insert(
                graph
                    .node_weight(n)
                    .expect("node index found during dfs must exist"),
            );
        }
    };

    match direction {
        petgraph::Direction::Outgoing => depth_first_search(&graph, indices, visitor),
        petgraph::Direction::Incoming => depth_first_search(Reversed(&graph), indices, visitor),
    };

    visited
}

/// Returns an error if the graph contains a cycle or a self-edge. Cycle
/// members are listed along with the single edges whose removal would break
/// the cycle, when any exist.
pub fn validate_graph<N: Display + Clone + Hash + Eq>(graph: &Graph<N, ()>) -> Result<(), Error> {
    for edge in graph.edge_references() {
        if edge.source() == edge.target() {
            let node = graph
                .node_weight(edge.source())
                .expect("edge must point at an existing node");
            return Err(Error::SelfDependency(node.to_string()));
        }
    }

    let cycle_lines = petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1)
        .map(|scc| {
            let members = scc
                .iter()
                .map(|index| graph.node_weight(*index).unwrap().to_string())
                .sorted()
                .join(", ");
            let cuts = single_edge_cuts(graph, &scc);
            if cuts.is_empty() {
                format!("\t{members}")
            } else {
                format!(
                    "\t{members}\n\nThe cycle can be broken by removing any of these \
                     dependencies:\n\t{}",
                    cuts.join(", ")
                )
            }
        })
        .join("\n");

    if !cycle_lines.is_empty() {
        return Err(Error::CyclicDependencies { cycle_lines });
    }

    Ok(())
}

/// Edges within the strongly-connected component whose individual removal
/// leaves the component acyclic.
fn single_edge_cuts<N: Display + Clone + Hash + Eq>(
    graph: &Graph<N, ()>,
    scc: &[NodeIndex],
) -> Vec<String> {
    let mut subgraph = graph.clone();
    subgraph.retain_nodes(|_, node| scc.contains(&node));

    let mut cuts = Vec::new();
    for edge in subgraph.edge_indices().collect::<Vec<_>>() {
        let Some((src, dst)) = subgraph.edge_endpoints(edge) else {
            continue;
        };
        let mut trimmed = subgraph.clone();
        trimmed.remove_edge(
            trimmed
                .find_edge(src, dst)
                .expect("edge exists in the clone"),
        );
        if !petgraph::algo::is_cyclic_directed(&trimmed) {
            cuts.push(format!(
                "{} -> {}",
                subgraph.node_weight(src).unwrap(),
                subgraph.node_weight(dst).unwrap()
            ));
        }
    }
    cuts.sort();
    cuts
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_acyclic_graph_passes() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        g.add_edge(a, b, ());
        assert!(validate_graph(&g).is_ok());
    }

    #[test]
    fn test_self_dependency() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        g.add_edge(a, a, ());
        let err = validate_graph(&g).unwrap_err();
        assert_eq!(err.to_string(), "a depends on itself");
    }

    #[test]
    fn test_cycle_lists_members_and_cuts() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(c, a, ());

        let err = validate_graph(&g).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("a, b, c"), "{message}");
        assert!(message.contains("a -> b"), "{message}");
        assert!(message.contains("b -> c"), "{message}");
        assert!(message.contains("c -> a"), "{message}");
    }

    #[test]
    fn test_transitive_closure() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(d, c, ());

        let deps = transitive_closure(&g, Some(a), petgraph::Direction::Outgoing);
        assert_eq!(deps, ["a", "b", "c"].iter().collect());

        let dependents = transitive_closure(&g, Some(c), petgraph::Direction::Incoming);
        assert_eq!(dependents, ["a", "b", "c", "d"].iter().collect());
    }
}
