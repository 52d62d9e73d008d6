//! Deterministic topological ordering of provider names.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::fmt;

/// One provider name and the provider names it depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    name: String,
    dependencies: Vec<String>,
}

impl GraphNode {
    /// Builds a node.
    #[must_use]
    pub fn new(name: impl Into<String>, dependencies: Vec<String>) -> Self {
        Self {
            name: name.into(),
            dependencies,
        }
    }

    /// Provider name.
    #[must_use]
    pub const fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Distinct dependency provider names in first-seen order.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

/// Directed dependency graph in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
}

/// Nodes left unordered because they sit on or behind a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    unresolved: Vec<String>,
}

impl CycleError {
    /// Unresolved provider names in insertion order.
    #[must_use]
    pub fn unresolved(&self) -> &[String] {
        &self.unresolved
    }

    pub(crate) fn into_unresolved(self) -> Vec<String> {
        self.unresolved
    }
}

impl DependencyGraph {
    /// Builds an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node.
    pub fn push(&mut self, node: GraphNode) {
        self.nodes.push(node);
    }

    /// Nodes in insertion order.
    #[must_use]
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// Orders names so every node follows its dependencies.
    ///
    /// Among ready nodes the earliest inserted wins. Dependencies that are
    /// not nodes of this graph are treated as already satisfied.
    ///
    /// # Errors
    ///
    /// Returns [`CycleError`] with every node that could not be ordered.
    pub fn resolve(&self) -> Result<Vec<String>, CycleError> {
        let index: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(position, node)| (node.name(), position))
            .collect();

        let mut pending = vec![0_usize; self.nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (position, node) in self.nodes.iter().enumerate() {
            for dependency in node.dependencies() {
                let Some(&target) = index.get(dependency.as_str()) else {
                    continue;
                };
                if let Some(count) = pending.get_mut(position) {
                    *count += 1;
                }
                if let Some(waiting) = dependents.get_mut(target) {
                    waiting.push(position);
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = pending
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(position, _)| Reverse(position))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(position)) = ready.pop() {
            if let Some(node) = self.nodes.get(position) {
                order.push(node.name.clone());
            }
            let Some(waiting) = dependents.get(position) else {
                continue;
            };
            for &dependent in waiting {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Reverse(dependent));
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            return Ok(order);
        }

        let unresolved = self
            .nodes
            .iter()
            .zip(&pending)
            .filter(|(_, count)| **count > 0)
            .map(|(node, _)| node.name.clone())
            .collect();
        Err(CycleError { unresolved })
    }
}

impl fmt::Display for DependencyGraph {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            if node.dependencies.is_empty() {
                writeln!(formatter, "{}", node.name)?;
            } else {
                writeln!(
                    formatter,
                    "{} -> {}",
                    node.name,
                    node.dependencies.join(", ")
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    type Nodes = Vec<(&'static str, Vec<&'static str>)>;

    fn graph(nodes: &[(&str, Vec<&str>)]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for (name, dependencies) in nodes {
            graph.push(GraphNode::new(
                *name,
                dependencies.iter().map(|dep| (*dep).to_owned()).collect(),
            ));
        }
        graph
    }

    fn assert_topological(graph: &DependencyGraph, order: &[String]) {
        for node in graph.nodes() {
            let own = order.iter().position(|name| name == node.name());
            for dependency in node.dependencies() {
                let dep = order.iter().position(|name| name == dependency);
                assert!(dep < own, "{dependency} must precede {}", node.name());
            }
        }
    }

    #[rstest]
    #[case::independent(vec![("a", vec![]), ("b", vec![]), ("c", vec![])], vec!["a", "b", "c"])]
    #[case::chain(
        vec![("api", vec!["cache"]), ("cache", vec!["db"]), ("db", vec![])],
        vec!["db", "cache", "api"]
    )]
    #[case::earliest_ready_wins(
        vec![("api", vec!["db"]), ("metrics", vec![]), ("db", vec![])],
        vec!["metrics", "db", "api"]
    )]
    #[case::diamond(
        vec![
            ("top", vec!["left", "right"]),
            ("left", vec!["base"]),
            ("right", vec!["base"]),
            ("base", vec![]),
        ],
        vec!["base", "left", "right", "top"]
    )]
    fn resolves_in_dependency_order(#[case] nodes: Nodes, #[case] expected: Vec<&str>) {
        let graph = graph(&nodes);

        let order = graph.resolve().expect("acyclic graph");

        assert_eq!(order, expected);
        assert_topological(&graph, &order);
    }

    #[rstest]
    fn unknown_dependencies_are_satisfied() {
        let graph = graph(&[("api", vec!["external"])]);

        assert_eq!(graph.resolve().expect("resolves"), vec!["api"]);
    }

    #[rstest]
    #[case::pair(vec![("a", vec!["b"]), ("b", vec!["a"]), ("c", vec![])], vec!["a", "b"])]
    #[case::self_edge(vec![("loop", vec!["loop"])], vec!["loop"])]
    #[case::downstream_of_cycle(
        vec![("a", vec!["b"]), ("b", vec!["a"]), ("c", vec!["a"])],
        vec!["a", "b", "c"]
    )]
    fn cycles_report_unresolved_nodes(#[case] nodes: Nodes, #[case] unresolved: Vec<&str>) {
        let error = graph(&nodes).resolve().expect_err("cycle expected");

        assert_eq!(error.unresolved(), unresolved);
    }

    #[rstest]
    fn display_lists_edges() {
        let graph = graph(&[("api", vec!["cache", "db"]), ("db", vec![])]);

        assert_eq!(graph.to_string(), "api -> cache, db\ndb\n");
    }
}
