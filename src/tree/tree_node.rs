use std::fmt::{Debug, Display};

use approx::relative_eq;

use crate::tree::neighbors::Neighbor;

/// A node of a rooted binary tree. Nodes are derived from the edge list by
/// [`crate::tree::Tree::generate_nodes`] and are indexed by their `id`.
#[derive(Clone)]
pub struct Node {
    pub id: usize,
    pub is_root: bool,
    pub is_leaf: bool,
    pub parent: Option<usize>,
    /// Edge ending at this node, `None` for the root.
    pub e_in: Option<usize>,
    /// Edges starting at this node, in the order they appear in the edge list.
    pub e_out: Vec<usize>,
    pub daughters: Vec<usize>,
    /// Maximum number of edges from this node down to any leaf below it.
    pub height: usize,
    /// Distance from the root along branch lengths.
    pub time: f64,
    /// Distance from the most recent point of the tree, i.e. `max(time) - time`.
    pub age: f64,
    pub(crate) neighbors: Vec<Neighbor>,
}

impl Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_leaf {
            write!(f, "leaf {}", self.id + 1)
        } else {
            write!(f, "node {}", self.id + 1)
        }
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{}: parent: {:?}, daughters: {:?}, e_in: {:?}, e_out: {:?}, time: {}, age: {}",
            self.id, self.parent, self.daughters, self.e_in, self.e_out, self.time, self.age,
        )
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        (self.id == other.id)
            && (self.parent == other.parent)
            && (self.daughters.iter().min() == other.daughters.iter().min())
            && (self.daughters.iter().max() == other.daughters.iter().max())
            && relative_eq!(self.time, other.time)
            && relative_eq!(self.age, other.age)
    }
}

impl Node {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            is_root: false,
            is_leaf: false,
            parent: None,
            e_in: None,
            e_out: Vec::new(),
            daughters: Vec::new(),
            height: 0,
            time: 0.0,
            age: 0.0,
            neighbors: Vec::new(),
        }
    }

    pub(crate) fn add_parent(&mut self, parent: usize, edge: usize) {
        self.parent = Some(parent);
        self.e_in = Some(edge);
    }

    pub(crate) fn add_daughter(&mut self, daughter: usize, edge: usize) {
        self.daughters.push(daughter);
        self.e_out.push(edge);
    }
}

/// A directed branch from `start` (ancestral) to `end`. The edge list is the source of truth
/// for the tree topology and branch lengths.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub id: usize,
    pub start: usize,
    pub end: usize,
    pub length: f64,
    pub parent: Option<usize>,
    /// Number of mutations along the edge, see [`crate::tree::Tree::assign_nmuts`].
    pub nmuts: usize,
}

impl Edge {
    pub fn new(id: usize, start: usize, end: usize, length: f64) -> Self {
        Self {
            id,
            start,
            end,
            length,
            parent: None,
            nmuts: 0,
        }
    }

    pub fn connects(&self, a: usize, b: usize) -> bool {
        (self.start == a && self.end == b) || (self.start == b && self.end == a)
    }
}
