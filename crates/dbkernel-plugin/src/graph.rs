//! Dependency graph and cycle-tolerant topological sort.

use indexmap::IndexMap;

/// Directed graph of `module -> dependency` edges.
///
/// Nodes keep insertion order, so the sort is deterministic.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: IndexMap<String, Vec<String>>,
}

/// Result of [`DependencyGraph::topological_order`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologicalOrder {
    /// Every node, dependencies before dependents.
    pub order: Vec<String>,
    /// Edges `(from, to)` dropped to break cycles.
    pub skipped_edges: Vec<(String, String)>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with no edges (no-op if present).
    pub fn add_node(&mut self, id: impl Into<String>) {
        self.edges.entry(id.into()).or_default();
    }

    /// Add `from -> to`, creating both nodes.
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) {
        let to = to.into();
        self.add_node(to.clone());
        let deps = self.edges.entry(from.into()).or_default();
        if !deps.contains(&to) {
            deps.push(to);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.edges.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }

    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.edges.get(id).map_or(&[], Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }

    /// Depth-first topological sort.
    ///
    /// An edge that reaches a node still on the DFS stack closes a cycle; it
    /// is logged and skipped, so the sort always terminates and always
    /// covers every node.
    pub fn topological_order(&self) -> TopologicalOrder {
        let mut marks: IndexMap<&str, Mark> = IndexMap::with_capacity(self.edges.len());
        let mut result = TopologicalOrder::default();

        for root in self.edges.keys() {
            if marks.contains_key(root.as_str()) {
                continue;
            }

            // (node, index of the next dependency to visit)
            let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
            marks.insert(root.as_str(), Mark::OnStack);

            while let Some((node, next)) = stack.last_mut() {
                let deps = self.dependencies_of(node);
                if let Some(dep) = deps.get(*next) {
                    *next += 1;
                    match marks.get(dep.as_str()) {
                        None => {
                            marks.insert(dep.as_str(), Mark::OnStack);
                            stack.push((dep.as_str(), 0));
                        }
                        Some(Mark::OnStack) => {
                            tracing::warn!(
                                from = *node,
                                to = dep.as_str(),
                                "dependency cycle detected, skipping edge"
                            );
                            result.skipped_edges.push((node.to_string(), dep.clone()));
                        }
                        Some(Mark::Done) => {}
                    }
                } else {
                    let node = *node;
                    stack.pop();
                    marks.insert(node, Mark::Done);
                    result.order.push(node.to_string());
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|n| n == id).unwrap()
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("app", "db");
        graph.add_edge("app", "cache");
        graph.add_edge("cache", "db");
        graph.add_edge("reports", "app");
        graph.add_node("standalone");

        let sorted = graph.topological_order();
        assert!(sorted.skipped_edges.is_empty());
        assert_eq!(sorted.order.len(), 5);

        for node in graph.nodes() {
            for dep in graph.dependencies_of(node) {
                assert!(
                    position(&sorted.order, dep) < position(&sorted.order, node),
                    "{dep} should precede {node}"
                );
            }
        }
    }

    #[test]
    fn test_two_node_cycle_terminates() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("a", "b");
        graph.add_edge("b", "a");

        let sorted = graph.topological_order();
        // "b" is inserted first (as the target of the first edge), so the
        // walk starts there and the closing edge is a -> b.
        assert_eq!(sorted.order, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(sorted.skipped_edges, vec![("a".to_string(), "b".to_string())]);
    }

    #[test]
    fn test_self_loop_and_longer_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("a", "a");
        graph.add_edge("x", "y");
        graph.add_edge("y", "z");
        graph.add_edge("z", "x");
        graph.add_edge("w", "z");

        let sorted = graph.topological_order();
        let mut nodes = sorted.order.clone();
        nodes.sort();
        assert_eq!(nodes, vec!["a", "w", "x", "y", "z"]);
        assert_eq!(sorted.skipped_edges.len(), 2);
        assert!(position(&sorted.order, "z") < position(&sorted.order, "w"));
    }

    #[test]
    fn test_order_is_deterministic() {
        let mut graph = DependencyGraph::new();
        for id in ["e", "d", "c", "b", "a"] {
            graph.add_node(id);
        }
        let first = graph.topological_order();
        assert_eq!(first.order, vec!["e", "d", "c", "b", "a"]);
        assert_eq!(first, graph.topological_order());
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("a", "b");
        graph.add_edge("a", "b");
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.len(), 2);
    }
}
