//! Role hierarchy graph
//!
//! The hierarchy is a DAG of roles where an edge `parent -> child` means the
//! child inherits every permission granted to the parent. Nodes live in an
//! arena indexed by `usize`; adjacency lists hold arena indices, so a
//! traversal never leaves this structure.
//!
//! Role counts are small (tens to low hundreds), so every query is a plain
//! depth-first walk with a visited set. The visited set also bounds the walk
//! if a cycle ever slips in through a loaded edge list.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::error::RbacError;
use crate::types::{RoleEdge, RoleId};

/// Graph-related errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// Adding the edge would close a loop
    #[error("Edge {parent} -> {child} would create a cycle: {path}")]
    CycleDetected {
        /// Proposed parent
        parent: RoleId,
        /// Proposed child
        child: RoleId,
        /// Existing path from child back to parent, joined with `->`
        path: String,
    },

    /// The edge is already present
    #[error("Edge {parent} -> {child} already exists")]
    DuplicateEdge {
        /// Parent role
        parent: RoleId,
        /// Child role
        child: RoleId,
    },

    /// A loaded edge set already contains a cycle
    #[error("Role hierarchy contains a cycle: {0}")]
    CorruptHierarchy(String),
}

impl From<GraphError> for RbacError {
    fn from(err: GraphError) -> Self {
        RbacError::Validation(err.to_string())
    }
}

#[derive(Debug, Clone)]
struct RoleNode {
    id: RoleId,
    parents: Vec<usize>,
    children: Vec<usize>,
}

impl RoleNode {
    fn new(id: RoleId) -> Self {
        Self {
            id,
            parents: Vec::new(),
            children: Vec::new(),
        }
    }
}

/// Arena-backed DAG of roles.
///
/// # Example
///
/// ```
/// use blog_rbac::graph::RoleGraph;
///
/// let mut graph = RoleGraph::new();
/// graph.add_edge(1, 2).unwrap();
/// graph.add_edge(2, 3).unwrap();
///
/// assert!(graph.expand(1).contains(&3));
/// assert!(graph.ancestors(3).contains(&1));
/// assert!(graph.would_create_cycle(3, 1));
/// assert!(graph.add_edge(3, 1).is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct RoleGraph {
    index: HashMap<RoleId, usize>,
    nodes: Vec<RoleNode>,
    edge_count: usize,
}

impl RoleGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a persisted edge list.
    ///
    /// Duplicate edges collapse into one. The edge set is checked as a whole,
    /// and a cycle is reported with its full path.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CorruptHierarchy`] if the edges contain a cycle.
    pub fn from_edges<I>(edges: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = RoleEdge>,
    {
        let mut graph = Self::new();
        for edge in edges {
            graph.insert_unchecked(edge.parent, edge.child);
        }

        if let Some(cycle) = graph.find_cycle() {
            let path: Vec<String> = cycle.iter().map(|id| id.to_string()).collect();
            return Err(GraphError::CorruptHierarchy(path.join(" -> ")));
        }

        Ok(graph)
    }

    /// Number of edges.
    pub fn len(&self) -> usize {
        self.edge_count
    }

    /// Check if the graph has no edges.
    pub fn is_empty(&self) -> bool {
        self.edge_count == 0
    }

    /// Check whether `parent -> child` exists.
    pub fn contains_edge(&self, parent: RoleId, child: RoleId) -> bool {
        match (self.index.get(&parent), self.index.get(&child)) {
            (Some(&p), Some(&c)) => self.nodes[p].children.contains(&c),
            _ => false,
        }
    }

    /// `role` plus every descendant reachable by following parent -> child edges.
    ///
    /// A role the graph has never seen expands to itself.
    pub fn expand(&self, role: RoleId) -> HashSet<RoleId> {
        let mut result = self.walk(role, |node| &node.children);
        result.insert(role);
        result
    }

    /// Every ancestor of `role`, transitively. Does not include `role`.
    pub fn ancestors(&self, role: RoleId) -> HashSet<RoleId> {
        let mut result = self.walk(role, |node| &node.parents);
        result.remove(&role);
        result
    }

    /// True if `parent` is already reachable from `child`, so that adding
    /// `parent -> child` would close a loop. A self-edge always would.
    pub fn would_create_cycle(&self, parent: RoleId, child: RoleId) -> bool {
        self.expand(child).contains(&parent)
    }

    /// Insert `parent -> child`.
    ///
    /// # Errors
    ///
    /// - [`GraphError::DuplicateEdge`] if the edge exists
    /// - [`GraphError::CycleDetected`] if the edge would close a loop
    pub fn add_edge(&mut self, parent: RoleId, child: RoleId) -> Result<(), GraphError> {
        if self.contains_edge(parent, child) {
            return Err(GraphError::DuplicateEdge { parent, child });
        }

        if self.would_create_cycle(parent, child) {
            let path = self
                .path(child, parent)
                .unwrap_or_else(|| vec![child, parent])
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(GraphError::CycleDetected {
                parent,
                child,
                path,
            });
        }

        self.insert_unchecked(parent, child);
        Ok(())
    }

    /// Remove `parent -> child`. Returns whether the edge was present.
    pub fn remove_edge(&mut self, parent: RoleId, child: RoleId) -> bool {
        let (p, c) = match (self.index.get(&parent), self.index.get(&child)) {
            (Some(&p), Some(&c)) => (p, c),
            _ => return false,
        };

        let before = self.nodes[p].children.len();
        self.nodes[p].children.retain(|&i| i != c);
        if self.nodes[p].children.len() == before {
            return false;
        }
        self.nodes[c].parents.retain(|&i| i != p);
        self.edge_count -= 1;
        true
    }

    /// Find one cycle, if any, as a closed path (first and last ids equal).
    pub fn find_cycle(&self) -> Option<Vec<RoleId>> {
        // 0 = unvisited, 1 = on the current path, 2 = done
        let mut state = vec![0u8; self.nodes.len()];

        for start in 0..self.nodes.len() {
            if state[start] != 0 {
                continue;
            }

            let mut path: Vec<usize> = vec![start];
            let mut cursor: Vec<usize> = vec![0];
            state[start] = 1;

            while let Some(&node) = path.last() {
                let depth = path.len() - 1;
                let next = self.nodes[node].children.get(cursor[depth]).copied();
                cursor[depth] += 1;

                match next {
                    Some(child) if state[child] == 1 => {
                        let from = path.iter().position(|&n| n == child).unwrap_or(0);
                        let mut cycle: Vec<RoleId> =
                            path[from..].iter().map(|&i| self.nodes[i].id).collect();
                        cycle.push(self.nodes[child].id);
                        return Some(cycle);
                    }
                    Some(child) if state[child] == 0 => {
                        state[child] = 1;
                        path.push(child);
                        cursor.push(0);
                    }
                    Some(_) => {}
                    None => {
                        state[node] = 2;
                        path.pop();
                        cursor.pop();
                    }
                }
            }
        }

        None
    }

    /// Path from `from` down to `to` following parent -> child edges.
    fn path(&self, from: RoleId, to: RoleId) -> Option<Vec<RoleId>> {
        let start = *self.index.get(&from)?;
        let target = *self.index.get(&to)?;

        let mut came_from: HashMap<usize, usize> = HashMap::new();
        let mut visited: HashSet<usize> = HashSet::from([start]);
        let mut stack = vec![start];

        while let Some(node) = stack.pop() {
            if node == target {
                let mut path = vec![self.nodes[node].id];
                let mut current = node;
                while let Some(&prev) = came_from.get(&current) {
                    path.push(self.nodes[prev].id);
                    current = prev;
                }
                path.reverse();
                return Some(path);
            }
            for &child in &self.nodes[node].children {
                if visited.insert(child) {
                    came_from.insert(child, node);
                    stack.push(child);
                }
            }
        }

        None
    }

    fn walk<F>(&self, role: RoleId, next: F) -> HashSet<RoleId>
    where
        F: Fn(&RoleNode) -> &Vec<usize>,
    {
        let mut result = HashSet::new();
        let Some(&start) = self.index.get(&role) else {
            return result;
        };

        let mut visited: HashSet<usize> = HashSet::from([start]);
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            result.insert(self.nodes[node].id);
            for &n in next(&self.nodes[node]) {
                if visited.insert(n) {
                    stack.push(n);
                }
            }
        }

        result
    }

    fn node_index(&mut self, role: RoleId) -> usize {
        if let Some(&i) = self.index.get(&role) {
            return i;
        }
        let i = self.nodes.len();
        self.nodes.push(RoleNode::new(role));
        self.index.insert(role, i);
        i
    }

    fn insert_unchecked(&mut self, parent: RoleId, child: RoleId) {
        let p = self.node_index(parent);
        let c = self.node_index(child);
        if self.nodes[p].children.contains(&c) {
            return;
        }
        self.nodes[p].children.push(c);
        self.nodes[c].parents.push(p);
        self.edge_count += 1;
    }
}
