//! Dependency graph over resource entries
//!
//! Builds a DAG keyed by resource id, detects cycles, assigns levels, and
//! emits a level-stable topological order. The graph is reconstructed per
//! reconcile; there is no cross-reconcile state.

use std::collections::{BTreeMap, HashMap, HashSet};

use loom_common::crd::TResource;
use thiserror::Error;

/// Errors raised while building or validating the graph
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// A resource entry has an empty id
    #[error("resource id cannot be empty")]
    EmptyId,

    /// Two resource entries share an id
    #[error("duplicate resource id: {0}")]
    DuplicateId(String),

    /// A dependIds entry references an id that is not in the graph
    #[error("resource {id} depends on non-existent resource: {dependency}")]
    DanglingDependency {
        /// The resource declaring the dependency
        id: String,
        /// The missing dependency id
        dependency: String,
    },

    /// A back edge was found during DFS
    #[error("circular dependency detected: {from} -> {to}")]
    Cycle {
        /// Tail of the back edge
        from: String,
        /// Head of the back edge
        to: String,
    },
}

impl From<GraphError> for loom_common::Error {
    fn from(err: GraphError) -> Self {
        loom_common::Error::graph(err.to_string())
    }
}

/// A node in the dependency graph
#[derive(Clone, Debug)]
pub struct GraphNode {
    /// The resource entry this node wraps
    pub resource: TResource,
    /// The entry's id
    pub id: String,
    /// Ids this entry follows
    pub depends_on: Vec<String>,
    /// Depth in the graph; all dependencies sit on strictly lower levels
    pub level: usize,
}

/// A directed acyclic graph of resource dependencies.
///
/// Insertion order is retained so that, given a fixed input ordering, the
/// topological order within a level is deterministic.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, GraphNode>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes in the graph
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a resource entry to the graph.
    ///
    /// Fails on an empty or duplicate id.
    pub fn add(&mut self, resource: TResource) -> Result<(), GraphError> {
        if resource.id.is_empty() {
            return Err(GraphError::EmptyId);
        }
        if self.nodes.contains_key(&resource.id) {
            return Err(GraphError::DuplicateId(resource.id));
        }

        let node = GraphNode {
            id: resource.id.clone(),
            depends_on: resource.depend_ids.clone(),
            level: 0,
            resource,
        };
        self.order.push(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Validate the graph: every dependency exists and no cycle is present
    pub fn validate(&self) -> Result<(), GraphError> {
        for id in &self.order {
            let node = &self.nodes[id];
            for dependency in &node.depends_on {
                if !self.nodes.contains_key(dependency) {
                    return Err(GraphError::DanglingDependency {
                        id: id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }
        self.detect_cycles()
    }

    /// DFS with a recursion-stack marker; any back edge is fatal
    fn detect_cycles(&self) -> Result<(), GraphError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();

        for id in &self.order {
            if !visited.contains(id) {
                self.dfs_check_cycle(id, &mut visited, &mut rec_stack)?;
            }
        }
        Ok(())
    }

    fn dfs_check_cycle(
        &self,
        id: &str,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
    ) -> Result<(), GraphError> {
        visited.insert(id.to_string());
        rec_stack.insert(id.to_string());

        for dependency in &self.nodes[id].depends_on {
            if !visited.contains(dependency) {
                self.dfs_check_cycle(dependency, visited, rec_stack)?;
            } else if rec_stack.contains(dependency) {
                return Err(GraphError::Cycle {
                    from: id.to_string(),
                    to: dependency.clone(),
                });
            }
        }

        rec_stack.remove(id);
        Ok(())
    }

    /// Assign levels: level 0 has no unresolved dependencies, level k+1
    /// has all dependencies on levels <= k.
    ///
    /// Fixpoint iteration bounded by n+1 passes; the bound is exact for
    /// any DAG. Must be called after `validate`.
    fn calculate_levels(&mut self) {
        let mut levels: HashMap<String, usize> = HashMap::new();
        let mut resolved: HashSet<String> = HashSet::new();

        let max_iterations = self.nodes.len() + 1;
        for _ in 0..max_iterations {
            let mut all_resolved = true;

            for id in &self.order {
                if resolved.contains(id) {
                    continue;
                }

                let node = &self.nodes[id];
                let mut level = 0usize;
                let mut deps_resolved = true;
                for dependency in &node.depends_on {
                    match levels.get(dependency) {
                        Some(dep_level) if resolved.contains(dependency) => {
                            level = level.max(dep_level + 1);
                        }
                        _ => {
                            deps_resolved = false;
                            break;
                        }
                    }
                }

                if deps_resolved {
                    levels.insert(id.clone(), level);
                    resolved.insert(id.clone());
                } else {
                    all_resolved = false;
                }
            }

            if all_resolved {
                break;
            }
        }

        for (id, level) in levels {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.level = level;
            }
        }
    }

    /// Return nodes in a level-stable topological order.
    ///
    /// Level 0 first; within a level, input order. Validates the graph
    /// first, so dangling dependencies and cycles surface here too.
    pub fn topological_sort(&mut self) -> Result<Vec<GraphNode>, GraphError> {
        self.validate()?;
        self.calculate_levels();

        let max_level = self
            .nodes
            .values()
            .map(|n| n.level)
            .max()
            .unwrap_or(0);

        let mut result = Vec::with_capacity(self.nodes.len());
        for level in 0..=max_level {
            for id in &self.order {
                let node = &self.nodes[id];
                if node.level == level {
                    result.push(node.clone());
                }
            }
        }
        Ok(result)
    }

    /// Group nodes by level, for per-level concurrency in the apply
    /// orchestrator. Must be called after `topological_sort`.
    pub fn by_level(&self) -> BTreeMap<usize, Vec<GraphNode>> {
        let mut result: BTreeMap<usize, Vec<GraphNode>> = BTreeMap::new();
        for id in &self.order {
            let node = &self.nodes[id];
            result.entry(node.level).or_default().push(node.clone());
        }
        result
    }
}

/// Build and validate a graph from a list of resource entries
pub fn build_graph(resources: &[TResource]) -> Result<DependencyGraph, GraphError> {
    let mut graph = DependencyGraph::new();
    for resource in resources {
        graph.add(resource.clone())?;
    }
    graph.validate()?;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(id: &str, deps: &[&str]) -> TResource {
        TResource {
            id: id.to_string(),
            depend_ids: deps.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_add_rejects_empty_id() {
        let mut graph = DependencyGraph::new();
        assert_eq!(graph.add(res("", &[])), Err(GraphError::EmptyId));
    }

    #[test]
    fn test_add_rejects_duplicate_id() {
        let mut graph = DependencyGraph::new();
        graph.add(res("a", &[])).unwrap();
        assert_eq!(
            graph.add(res("a", &[])),
            Err(GraphError::DuplicateId("a".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_dangling_dependency() {
        let mut graph = DependencyGraph::new();
        graph.add(res("a", &["ghost"])).unwrap();
        assert_eq!(
            graph.validate(),
            Err(GraphError::DanglingDependency {
                id: "a".to_string(),
                dependency: "ghost".to_string(),
            })
        );
    }

    /// A two-node cycle is rejected; the reconciler records the error
    /// without touching the cluster.
    #[test]
    fn test_cycle_rejected() {
        let mut graph = DependencyGraph::new();
        graph.add(res("a", &["b"])).unwrap();
        graph.add(res("b", &["a"])).unwrap();
        assert!(matches!(graph.validate(), Err(GraphError::Cycle { .. })));
    }

    #[test]
    fn test_self_cycle_rejected() {
        let mut graph = DependencyGraph::new();
        graph.add(res("a", &["a"])).unwrap();
        assert!(matches!(graph.validate(), Err(GraphError::Cycle { .. })));
    }

    /// Linear chain: ns <- cm <- deploy sorts in order
    #[test]
    fn test_linear_chain_sorts_in_order() {
        let mut graph = build_graph(&[
            res("deploy", &["cm"]),
            res("ns", &[]),
            res("cm", &["ns"]),
        ])
        .unwrap();

        let sorted = graph.topological_sort().unwrap();
        let ids: Vec<_> = sorted.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["ns", "cm", "deploy"]);
        assert_eq!(sorted[0].level, 0);
        assert_eq!(sorted[1].level, 1);
        assert_eq!(sorted[2].level, 2);
    }

    /// Diamond: a <- {b, c} <- d gives the level map {0:[a], 1:[b,c], 2:[d]}
    #[test]
    fn test_diamond_levels() {
        let mut graph = build_graph(&[
            res("a", &[]),
            res("b", &["a"]),
            res("c", &["a"]),
            res("d", &["b", "c"]),
        ])
        .unwrap();

        graph.topological_sort().unwrap();
        let levels = graph.by_level();

        let ids_at = |level: usize| -> Vec<&str> {
            levels[&level].iter().map(|n| n.id.as_str()).collect()
        };
        assert_eq!(ids_at(0), vec!["a"]);
        assert_eq!(ids_at(1), vec!["b", "c"]);
        assert_eq!(ids_at(2), vec!["d"]);
    }

    /// Invariant: no node appears before any of its dependencies
    #[test]
    fn test_sort_never_lists_dependent_before_dependency() {
        let mut graph = build_graph(&[
            res("e", &["d"]),
            res("a", &[]),
            res("d", &["b", "c"]),
            res("b", &["a"]),
            res("c", &["a"]),
        ])
        .unwrap();

        let sorted = graph.topological_sort().unwrap();
        let position: HashMap<&str, usize> = sorted
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();

        for node in &sorted {
            for dependency in &node.depends_on {
                assert!(
                    position[dependency.as_str()] < position[node.id.as_str()],
                    "{} sorted before its dependency {}",
                    node.id,
                    dependency
                );
            }
        }
    }

    /// Determinism: identical input ordering yields identical output
    #[test]
    fn test_sort_is_deterministic_for_fixed_input() {
        let input = [
            res("z", &[]),
            res("m", &[]),
            res("a", &["z", "m"]),
            res("q", &["z"]),
        ];

        let first: Vec<String> = build_graph(&input)
            .unwrap()
            .topological_sort()
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        let second: Vec<String> = build_graph(&input)
            .unwrap()
            .topological_sort()
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();

        assert_eq!(first, second);
        // Within level 0, input order is retained
        assert_eq!(&first[..2], &["z".to_string(), "m".to_string()]);
    }

    #[test]
    fn test_empty_graph_sorts_empty() {
        let mut graph = DependencyGraph::new();
        assert!(graph.topological_sort().unwrap().is_empty());
        assert!(graph.is_empty());
    }

    #[test]
    fn test_build_graph_rejects_cycle() {
        let err = build_graph(&[res("a", &["b"]), res("b", &["a"])]).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
    }
}
