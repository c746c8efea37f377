use std::fmt::{self, Display};

use anyhow::bail;
use itertools::Itertools;

use crate::Result;

pub mod canonical;
pub mod neighbors;
pub mod nni;
pub mod time_ratios;
pub mod tree_builder;
pub mod tree_node;
pub mod validation;

pub use canonical::canonical_key;
pub use neighbors::{Direction, Neighbor};
pub use nni::{random_nni, random_nnis, rooted_nni, NniLengths, NniMove};
pub use tree_builder::{
    enumerate_topologies, generate_coalescent_tree, generate_random_tree, max_topologies,
    topologies, CoalescentParams, Topologies, LARGE_TREE, NUM_TREES,
};
pub use tree_node::{Edge, Node};
pub use validation::{is_age_time_consistent, is_tip_age_valid, InfeasibleTreeError};

/// Shortest admissible branch length.
pub const BLEN_MIN: f64 = 1e-3;
/// Longest admissible branch length of a generated tree.
pub const BLEN_MAX: f64 = 100.0;
/// Score of a tree that was never evaluated, or that could not be evaluated.
pub const MAX_NLNL: f64 = 1e20;

/// Ploidy of a normal genome.
pub const NORM_PLOIDY: f64 = 2.0;
/// Number of autosomes.
pub const NUM_CHR: f64 = 22.0;

/// Per-unit-time mutation rates of the copy-number model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MutationRates {
    /// Rate of substitution-like events, used when no component rates are given.
    pub mu: f64,
    pub dup: f64,
    pub del: f64,
    pub chr_gain: f64,
    pub chr_loss: f64,
    pub wgd: f64,
}

impl Default for MutationRates {
    fn default() -> Self {
        Self {
            mu: 0.02,
            dup: 0.0,
            del: 0.0,
            chr_gain: 0.0,
            chr_loss: 0.0,
            wgd: 0.0,
        }
    }
}

impl MutationRates {
    /// Total mutation rate of a genome with `num_total_bins` sites. With `only_seg` only
    /// segment duplications and deletions contribute.
    pub fn total_per_year(&self, num_total_bins: usize, only_seg: bool) -> f64 {
        let seg = NORM_PLOIDY * num_total_bins as f64 * (self.dup + self.del);
        if only_seg {
            seg
        } else {
            NORM_PLOIDY * NUM_CHR * (self.chr_gain + self.chr_loss) + seg + self.wgd
        }
    }

    /// Expected number of events per unit time, `mu` if no component rate is set.
    pub fn event_rate(&self, num_total_bins: usize) -> f64 {
        let total = self.total_per_year(num_total_bins, false);
        if total > 0.0 {
            total
        } else {
            self.mu
        }
    }
}

/// Rooted binary tree of `nleaf` leaves, one of which is the normal genome attached to the root.
///
/// The edge list is authoritative. Nodes, times, ages and adjacencies are derived from it and
/// have to be regenerated whenever it changes.
#[derive(Debug, Clone)]
pub struct Tree {
    pub nleaf: usize,
    pub(crate) edges: Vec<Edge>,
    pub(crate) nodes: Vec<Node>,
    pub root: usize,
    /// Log-likelihood of the tree, `-MAX_NLNL` until the tree is evaluated.
    pub score: f64,
    pub rates: MutationRates,
    has_neighbors: bool,
}

impl Tree {
    /// Creates a tree from an edge list and derives its nodes. Edge ids are reassigned to the
    /// positions in the list.
    pub fn from_edge_list(nleaf: usize, mut edges: Vec<Edge>) -> Result<Self> {
        for (i, edge) in edges.iter_mut().enumerate() {
            edge.id = i;
        }
        let mut tree = Tree {
            nleaf,
            edges,
            nodes: Vec::new(),
            root: 0,
            score: -MAX_NLNL,
            rates: MutationRates::default(),
            has_neighbors: false,
        };
        tree.generate_nodes()?;
        tree.calculate_node_times();
        tree.calculate_age_from_time();
        Ok(tree)
    }

    /// Creates a tree from `(start, end, length)` triples.
    pub fn from_edges(nleaf: usize, edges: &[(usize, usize, f64)]) -> Result<Self> {
        let edges = edges
            .iter()
            .enumerate()
            .map(|(i, &(start, end, length))| Edge::new(i, start, end, length))
            .collect();
        Self::from_edge_list(nleaf, edges)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: usize) -> &Node {
        &self.nodes[id]
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, id: usize) -> &Edge {
        &self.edges[id]
    }

    /// Rebuilds the node table from the edge list. Fails unless the edges form a single
    /// rooted binary tree whose leaves are exactly the nodes `0..nleaf`.
    pub fn generate_nodes(&mut self) -> Result<()> {
        self.has_neighbors = false;
        if self.nleaf < 2 {
            bail!(InfeasibleTreeError::new(
                format!("A tree needs at least 2 leaves, got {}", self.nleaf),
                self
            ));
        }
        let ntotn = 2 * self.nleaf - 1;
        if self.edges.len() != ntotn - 1 {
            bail!(InfeasibleTreeError::new(
                format!(
                    "A tree with {} leaves has {} edges, got {}",
                    self.nleaf,
                    ntotn - 1,
                    self.edges.len()
                ),
                self
            ));
        }

        let mut nodes: Vec<Node> = (0..ntotn).map(Node::new).collect();
        let mut malformed = None;
        for (i, edge) in self.edges.iter().enumerate() {
            if edge.start >= ntotn || edge.end >= ntotn {
                malformed = Some(format!(
                    "Edge {} -> {} is out of range",
                    edge.start + 1,
                    edge.end + 1
                ));
                break;
            }
            if nodes[edge.end].parent.is_some() || edge.start == edge.end {
                malformed = Some(format!("Node {} has more than one parent", edge.end + 1));
                break;
            }
            nodes[edge.end].add_parent(edge.start, i);
            nodes[edge.start].add_daughter(edge.end, i);
        }
        for node in nodes.iter_mut() {
            node.is_leaf = node.daughters.is_empty();
            node.is_root = node.parent.is_none();
        }
        self.nodes = nodes;
        if let Some(reason) = malformed {
            bail!(InfeasibleTreeError::new(reason, self));
        }
        for i in 0..self.edges.len() {
            self.edges[i].parent = self.nodes[self.edges[i].start].e_in;
        }

        let roots = self
            .nodes
            .iter()
            .filter(|n| n.is_root)
            .map(|n| n.id)
            .collect_vec();
        if roots.len() != 1 {
            bail!(InfeasibleTreeError::new(
                format!("Tree must have exactly one root, found {}", roots.len()),
                self
            ));
        }
        self.root = roots[0];
        if let Some(node) = self.nodes.iter().find(|n| n.is_leaf != (n.id < self.nleaf)) {
            bail!(InfeasibleTreeError::new(
                format!("Leaves must be numbered 1 to {}, found {}", self.nleaf, node),
                self
            ));
        }
        if let Some(node) = self.nodes.iter().find(|n| !matches!(n.daughters.len(), 0 | 2)) {
            bail!(InfeasibleTreeError::new(
                format!("{} does not have two daughters", node),
                self
            ));
        }
        if self.preorder().len() != ntotn {
            bail!(InfeasibleTreeError::new(
                "Not all nodes are reachable from the root",
                self
            ));
        }
        self.compute_heights();
        Ok(())
    }

    fn compute_heights(&mut self) {
        for id in self.postorder() {
            let height = self.nodes[id]
                .daughters
                .iter()
                .map(|&d| self.nodes[d].height + 1)
                .max()
                .unwrap_or(0);
            self.nodes[id].height = height;
        }
    }

    /// Sets the time of each node to the sum of branch lengths on its path from the root.
    pub fn calculate_node_times(&mut self) {
        for id in 0..self.nodes.len() {
            let time = self
                .ancestral_edges(id)
                .iter()
                .fold(0.0, |acc, &e| acc + self.edges[e].length);
            self.nodes[id].time = time;
        }
    }

    /// Sets the age of each node to its distance from the latest node of the tree.
    pub fn calculate_age_from_time(&mut self) {
        let max_time = self.tree_height();
        for node in self.nodes.iter_mut() {
            node.age = max_time - node.time;
        }
    }

    /// Edges on the path from the node up to the root, nearest first.
    pub fn ancestral_edges(&self, node: usize) -> Vec<usize> {
        let mut edges = Vec::new();
        let mut cur = &self.nodes[node];
        while let (Some(e_in), Some(parent)) = (cur.e_in, cur.parent) {
            edges.push(e_in);
            cur = &self.nodes[parent];
        }
        edges
    }

    /// Nodes on the path from the node up to the root, starting with the node itself.
    pub fn ancestral_nodes(&self, node: usize) -> Vec<usize> {
        let mut nodes = vec![node];
        let mut cur = &self.nodes[node];
        while let Some(parent) = cur.parent {
            nodes.push(parent);
            cur = &self.nodes[parent];
        }
        nodes
    }

    pub fn preorder(&self) -> Vec<usize> {
        self.preorder_subroot(self.root)
    }

    pub fn preorder_subroot(&self, subroot: usize) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![subroot];
        while let Some(id) = stack.pop() {
            // Guards against cycles in a malformed edge list.
            if order.len() >= self.nodes.len() {
                break;
            }
            order.push(id);
            stack.extend(self.nodes[id].daughters.iter().rev());
        }
        order
    }

    pub fn postorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if order.len() >= self.nodes.len() {
                break;
            }
            order.push(id);
            stack.extend(self.nodes[id].daughters.iter());
        }
        order.reverse();
        order
    }

    /// Internal nodes with every node listed after all of its descendants.
    pub fn internal_postorder(&self) -> Vec<usize> {
        self.postorder()
            .into_iter()
            .filter(|&id| !self.nodes[id].is_leaf)
            .collect()
    }

    /// Leaves in the subtree rooted at the node.
    pub fn tips_below(&self, node: usize) -> Vec<usize> {
        self.preorder_subroot(node)
            .into_iter()
            .filter(|&id| self.nodes[id].is_leaf)
            .collect()
    }

    /// Maximum number of edges between the node and the leaves below it.
    pub fn node_depth(&self, node: usize) -> usize {
        self.nodes[node].height
    }

    /// Largest age among the leaves below the node.
    pub fn descendants_max_age(&self, node: usize) -> f64 {
        self.tips_below(node)
            .into_iter()
            .map(|id| self.nodes[id].age)
            .fold(f64::MIN, f64::max)
    }

    /// Edges ending at an internal node.
    pub fn internal_edges(&self) -> Vec<usize> {
        self.edges
            .iter()
            .filter(|e| !self.nodes[e.end].is_leaf)
            .map(|e| e.id)
            .collect()
    }

    pub fn edge_between(&self, a: usize, b: usize) -> Option<usize> {
        self.edges.iter().find(|e| e.connects(a, b)).map(|e| e.id)
    }

    pub fn sibling(&self, node: usize) -> Option<usize> {
        let parent = self.nodes[node].parent?;
        self.nodes[parent]
            .daughters
            .iter()
            .copied()
            .find(|&d| d != node)
    }

    /// The leaf attached directly to the root that represents the normal genome.
    pub fn normal_leaf(&self) -> Option<usize> {
        let leaves = self.nodes[self.root]
            .daughters
            .iter()
            .copied()
            .filter(|&d| self.nodes[d].is_leaf)
            .collect_vec();
        if leaves.contains(&(self.nleaf - 1)) {
            Some(self.nleaf - 1)
        } else {
            leaves.first().copied()
        }
    }

    pub fn node_times(&self) -> Vec<f64> {
        self.nodes.iter().map(|n| n.time).collect()
    }

    pub fn node_ages(&self) -> Vec<f64> {
        self.nodes.iter().map(|n| n.age).collect()
    }

    pub fn edge_lengths(&self) -> Vec<f64> {
        self.edges.iter().map(|e| e.length).collect()
    }

    /// Replaces all branch lengths, in edge order, and recomputes times and ages.
    pub fn set_edge_lengths(&mut self, lengths: &[f64]) -> Result<()> {
        if lengths.len() != self.edges.len() {
            bail!(
                "Expected {} branch lengths, got {}",
                self.edges.len(),
                lengths.len()
            );
        }
        for (edge, &length) in self.edges.iter_mut().zip(lengths) {
            edge.length = length;
        }
        self.calculate_node_times();
        self.calculate_age_from_time();
        Ok(())
    }

    /// Sets the length of the edge connecting the two nodes and shifts the times of the nodes
    /// below it.
    pub fn set_edge_length(&mut self, start: usize, end: usize, length: f64) -> Result<()> {
        let Some(id) = self.edge_between(start, end) else {
            bail!("No edge between nodes {} and {}", start + 1, end + 1);
        };
        self.set_blen(id, length);
        Ok(())
    }

    pub fn set_blen(&mut self, edge: usize, length: f64) {
        let delta = length - self.edges[edge].length;
        self.edges[edge].length = length;
        self.update_node_time(self.edges[edge].end, delta);
        self.calculate_age_from_time();
    }

    /// Largest node time, i.e. the distance from the root to the latest leaf.
    pub fn tree_height(&self) -> f64 {
        self.nodes.iter().map(|n| n.time).fold(0.0, f64::max)
    }

    pub fn total_length(&self) -> f64 {
        self.edges.iter().map(|e| e.length).sum()
    }

    /// Multiplies every branch length by `ratio`.
    pub fn scale_time(&mut self, ratio: f64) {
        for edge in self.edges.iter_mut() {
            edge.length *= ratio;
        }
        self.calculate_node_times();
        self.calculate_age_from_time();
    }

    /// Multiplies the length of every branch ending at an internal node by `ratio`.
    pub fn scale_time_internal(&mut self, ratio: f64) {
        for edge in self.edges.iter_mut() {
            if !self.nodes[edge.end].is_leaf {
                edge.length *= ratio;
            }
        }
        self.calculate_node_times();
        self.calculate_age_from_time();
    }

    /// Shrinks the tree uniformly so that its height does not exceed `max_height`.
    pub fn constrain_height(&mut self, max_height: f64) {
        let height = self.tree_height();
        if height > max_height && height > 0.0 {
            self.scale_time(max_height / height);
        }
    }

    /// Adds `offsets[i]` to the branch leading to leaf `i`, moving the leaves sampled later
    /// further away from the root.
    pub fn shift_tip_times(&mut self, offsets: &[f64]) -> Result<()> {
        for (leaf, &offset) in offsets.iter().enumerate() {
            if leaf >= self.nleaf {
                bail!("Got {} tip offsets for {} leaves", offsets.len(), self.nleaf);
            }
            if let Some(e_in) = self.nodes[leaf].e_in {
                self.edges[e_in].length += offset;
            }
        }
        self.calculate_node_times();
        self.calculate_age_from_time();
        Ok(())
    }

    /// Sets the number of mutations of each edge to the expected number of events along it,
    /// truncated, and returns them in edge order.
    pub fn assign_nmuts(&mut self, rate: f64) -> Vec<usize> {
        for edge in self.edges.iter_mut() {
            edge.nmuts = (rate * edge.length).max(0.0) as usize;
        }
        self.edges.iter().map(|e| e.nmuts).collect()
    }

    /// Newick string of the tree with 1-based node ids and branch lengths printed with
    /// `precision` decimals. Internal nodes carry their id as a label.
    pub fn to_newick(&self, precision: usize) -> String {
        format!("{};", self.subtree_newick(self.root, precision, false))
    }

    /// Like [`Tree::to_newick`] but with the number of mutations as branch lengths.
    pub fn to_newick_with_nmuts(&self) -> String {
        format!("{};", self.subtree_newick(self.root, 0, true))
    }

    fn subtree_newick(&self, id: usize, precision: usize, nmuts: bool) -> String {
        let node = &self.nodes[id];
        let mut out = String::new();
        if !node.is_leaf {
            let children = node
                .daughters
                .iter()
                .map(|&d| self.subtree_newick(d, precision, nmuts))
                .join(",");
            out = format!("({children})");
        }
        out.push_str(&(id + 1).to_string());
        if let Some(e_in) = node.e_in {
            let edge = &self.edges[e_in];
            if nmuts {
                out.push_str(&format!(":{}", edge.nmuts));
            } else {
                out.push_str(&format!(":{:.*}", precision, edge.length));
            }
        }
        out
    }

    /// Tab-separated edge table with 1-based node ids.
    pub fn edge_table(&self, with_nmuts: bool) -> String {
        let mut out = String::from("start\tend\tlength");
        if with_nmuts {
            out.push_str("\tnmut");
        }
        out.push('\n');
        for edge in &self.edges {
            out.push_str(&format!(
                "{}\t{}\t{:.5}",
                edge.start + 1,
                edge.end + 1,
                edge.length
            ));
            if with_nmuts {
                out.push_str(&format!("\t{}", edge.nmuts));
            }
            out.push('\n');
        }
        out
    }
}

impl Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "EDGES:\tid\tstart\tend\tlength")?;
        for edge in &self.edges {
            writeln!(
                f,
                "\t{}\t{}\t{}\t{}",
                edge.id + 1,
                edge.start + 1,
                edge.end + 1,
                edge.length
            )?;
        }
        writeln!(f, "NODES:\tid\tparent\td1\td2\ttime\tage")?;
        for node in &self.nodes {
            let parent = node.parent.map_or(0, |p| p + 1);
            let d = |i: usize| node.daughters.get(i).map_or(0, |d| d + 1);
            writeln!(
                f,
                "\t{}\t{}\t{}\t{}\t{:.5}\t{:.5}",
                node.id + 1,
                parent,
                d(0),
                d(1),
                node.time,
                node.age
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod nni_tests;
