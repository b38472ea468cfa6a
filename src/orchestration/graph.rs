use crate::error::{CircularDependencyError, InitError};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

/// Directed graph of initializers and their prerequisites
///
/// Nodes keep insertion order and edges keep declaration order, so the resolved
/// order is deterministic.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    edges: Vec<Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; returns `false` if the name is already present
    pub fn add_node(&mut self, name: &str) -> bool {
        if self.index.contains_key(name) {
            return false;
        }
        self.index.insert(name.to_string(), self.nodes.len());
        self.nodes.push(name.to_string());
        self.edges.push(Vec::new());
        true
    }

    /// Declare that `node` depends on `dependency`
    ///
    /// The node is added if needed. The dependency does not have to exist yet;
    /// unknown names are reported by [`DependencyGraph::resolve`].
    pub fn add_edge(&mut self, node: &str, dependency: &str) {
        self.add_node(node);
        if let Some(&i) = self.index.get(node) {
            if !self.edges[i].iter().any(|d| d == dependency) {
                self.edges[i].push(dependency.to_string());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn dependencies(&self, node: &str) -> &[String] {
        self.index
            .get(node)
            .map_or(&[][..], |&i| self.edges[i].as_slice())
    }

    /// Compute an order in which every node follows all of its dependencies
    ///
    /// Depth-first traversal over an explicit stack with three-colour marking.
    ///
    /// # Errors
    ///
    /// * `InitError::UnknownDependency` - an edge names a node that was never added
    /// * `InitError::CircularDependency` - the graph has a cycle; the error carries
    ///   the path around it with the first name repeated at the end
    pub fn resolve(&self) -> Result<Vec<String>, InitError> {
        let mut adjacency = Vec::with_capacity(self.nodes.len());
        for (i, deps) in self.edges.iter().enumerate() {
            let mut targets = Vec::with_capacity(deps.len());
            for dep in deps {
                match self.index.get(dep) {
                    Some(&j) => targets.push(j),
                    None => {
                        return Err(InitError::UnknownDependency {
                            initializer: self.nodes[i].clone(),
                            dependency: dep.clone(),
                        })
                    }
                }
            }
            adjacency.push(targets);
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut order = Vec::with_capacity(self.nodes.len());
        // (node, index of the next edge to follow)
        let mut stack: Vec<(usize, usize)> = Vec::new();

        for root in 0..self.nodes.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            marks[root] = Mark::Visiting;
            stack.push((root, 0));

            while let Some(frame) = stack.last_mut() {
                let (node, next) = *frame;
                if next < adjacency[node].len() {
                    frame.1 += 1;
                    let dep = adjacency[node][next];
                    match marks[dep] {
                        Mark::Unvisited => {
                            marks[dep] = Mark::Visiting;
                            stack.push((dep, 0));
                        }
                        Mark::Visiting => return Err(self.cycle_error(&stack, dep)),
                        Mark::Visited => {}
                    }
                } else {
                    marks[node] = Mark::Visited;
                    order.push(self.nodes[node].clone());
                    stack.pop();
                }
            }
        }

        Ok(order)
    }

    fn cycle_error(&self, stack: &[(usize, usize)], repeated: usize) -> InitError {
        let start = stack
            .iter()
            .position(|&(node, _)| node == repeated)
            .unwrap_or(0);
        let mut cycle: Vec<String> = stack[start..]
            .iter()
            .map(|&(node, _)| self.nodes[node].clone())
            .collect();
        cycle.push(self.nodes[repeated].clone());
        CircularDependencyError { cycle }.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;

    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for node in nodes {
            g.add_node(node);
        }
        for (node, dep) in edges {
            g.add_edge(node, dep);
        }
        g
    }

    #[test]
    fn test_dependencies_come_first() {
        let g = graph(
            &["api", "database", "cache", "storage"],
            &[("api", "database"), ("api", "cache"), ("database", "storage")],
        );
        assert_eq!(
            g.resolve().unwrap(),
            vec!["storage", "database", "cache", "api"]
        );
    }

    #[test]
    fn test_order_is_deterministic() {
        let g = graph(&["c", "b", "a"], &[]);
        assert_eq!(g.resolve().unwrap(), vec!["c", "b", "a"]);
        assert_eq!(g.resolve().unwrap(), g.resolve().unwrap());
    }

    #[test]
    fn test_two_node_cycle() {
        let g = graph(&["a", "b"], &[("a", "b"), ("b", "a")]);
        match g.resolve() {
            Err(InitError::CircularDependency(e)) => {
                assert_eq!(e.cycle, vec!["a", "b", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_path_excludes_entry_nodes() {
        let g = graph(
            &["entry", "x", "y", "z"],
            &[("entry", "x"), ("x", "y"), ("y", "z"), ("z", "x")],
        );
        let err = g.resolve().unwrap_err();
        assert_eq!(err.to_string(), "CircularDependencyError: x -> y -> z -> x");
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let g = graph(&["a"], &[("a", "a")]);
        assert!(matches!(
            g.resolve(),
            Err(InitError::CircularDependency(_))
        ));
    }

    #[test]
    fn test_unknown_dependency() {
        let g = graph(&["api"], &[("api", "ghost")]);
        match g.resolve() {
            Err(InitError::UnknownDependency {
                initializer,
                dependency,
            }) => {
                assert_eq!(initializer, "api");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("expected unknown dependency, got {:?}", other),
        }
    }

    #[test]
    fn test_deep_chain_does_not_recurse() {
        let mut g = DependencyGraph::new();
        let n = 50_000;
        for i in 0..n {
            g.add_node(&format!("n{}", i));
        }
        for i in 1..n {
            g.add_edge(&format!("n{}", i - 1), &format!("n{}", i));
        }
        let order = g.resolve().unwrap();
        assert_eq!(order.first().map(String::as_str), Some("n49999"));
        assert_eq!(order.last().map(String::as_str), Some("n0"));
    }

    #[test]
    fn test_duplicate_nodes_and_edges_are_ignored() {
        let mut g = DependencyGraph::new();
        assert!(g.add_node("a"));
        assert!(!g.add_node("a"));
        g.add_edge("b", "a");
        g.add_edge("b", "a");
        assert_eq!(g.len(), 2);
        assert_eq!(g.dependencies("b"), ["a".to_string()]);
    }

    /// Edges always point from a higher to a lower index, so the graph is acyclic
    #[quickcheck]
    fn prop_order_respects_every_edge(size: u8, raw_edges: Vec<(u8, u8)>) -> TestResult {
        let n = (size % 16) as usize + 1;
        let mut g = DependencyGraph::new();
        // Register in reverse to make sure order is not simply registration order
        for i in (0..n).rev() {
            g.add_node(&i.to_string());
        }
        let edges: Vec<(usize, usize)> = raw_edges
            .into_iter()
            .map(|(a, b)| (a as usize % n, b as usize % n))
            .filter(|(a, b)| a > b)
            .collect();
        for (a, b) in &edges {
            g.add_edge(&a.to_string(), &b.to_string());
        }

        let order = match g.resolve() {
            Ok(order) => order,
            Err(_) => return TestResult::failed(),
        };
        if order.len() != n {
            return TestResult::failed();
        }
        let position = |name: String| order.iter().position(|o| *o == name);
        TestResult::from_bool(edges.iter().all(|(a, b)| {
            position(b.to_string()) < position(a.to_string())
        }))
    }

    /// Closing any path back to its start is always reported as a cycle
    #[quickcheck]
    fn prop_back_edge_is_detected(size: u8) -> bool {
        let n = (size % 10) as usize + 2;
        let mut g = DependencyGraph::new();
        for i in 0..n {
            g.add_node(&i.to_string());
        }
        for i in 1..n {
            g.add_edge(&(i - 1).to_string(), &i.to_string());
        }
        g.add_edge(&(n - 1).to_string(), "0");
        match g.resolve() {
            Err(InitError::CircularDependency(e)) => {
                e.cycle.len() == n + 1 && e.cycle.first() == e.cycle.last()
            }
            _ => false,
        }
    }
}
