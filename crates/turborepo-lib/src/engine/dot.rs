use std::io::Write;

use itertools::Itertools;
use petgraph::{visit::EdgeRef, Graph};

use super::TaskNode;

/// Renders the task graph in DOT for `--graph`. Edges read "depends on".
pub fn write_graph(output: &mut impl Write, graph: &Graph<TaskNode, ()>) -> std::io::Result<()> {
    writeln!(output, "digraph {{")?;
    writeln!(output, "\trankdir = \"BT\"")?;
    let lines = graph
        .edge_references()
        .map(|edge| {
            format!(
                "\t\"[root] {}\" -> \"[root] {}\"",
                graph[edge.source()], graph[edge.target()]
            )
        })
        .sorted();
    for line in lines {
        writeln!(output, "{line}")?;
    }
    writeln!(output, "}}")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task_id::TaskId;

    #[test]
    fn test_dot_output() {
        let mut graph = Graph::new();
        let root = graph.add_node(TaskNode::Root);
        let build = graph.add_node(TaskNode::Task(TaskId::new("web", "build").into_owned()));
        let lint = graph.add_node(TaskNode::Task(TaskId::new("web", "lint").into_owned()));
        graph.add_edge(build, root, ());
        graph.add_edge(lint, build, ());

        let mut out = Vec::new();
        write_graph(&mut out, &graph).unwrap();
        let rendered = String::from_utf8(out).unwrap();
        assert_eq!(
            rendered,
            "digraph {\n\trankdir = \"BT\"\n\t\"[root] web#build\" -> \"[root] ___ROOT___\"\n\t\"[root] web#lint\" -> \"[root] web#build\"\n}\n"
        );
    }
}
