use anyhow::bail;

use crate::tree::{InfeasibleTreeError, Tree, BLEN_MIN};
use crate::Result;

const BLEN_TOLERANCE: f64 = 1e-10;

impl Tree {
    /// Internal nodes in the order of their ratio slots: the root first, then the remaining
    /// internal nodes by ascending id.
    pub fn ratio_nodes(&self) -> Vec<usize> {
        let mut nodes = vec![self.root];
        nodes.extend(
            self.nodes
                .iter()
                .filter(|n| !n.is_leaf && !n.is_root)
                .map(|n| n.id),
        );
        nodes
    }

    /// Position of the node in the ratio vector, `None` for leaves.
    pub fn ratio_slot(&self, node: usize) -> Option<usize> {
        self.ratio_nodes().iter().position(|&id| id == node)
    }

    /// Reparametrises the node ages as a vector of `nleaf - 1` values: slot 0 holds the age of
    /// the root and every other slot the position of an internal node's age between the oldest
    /// leaf below it and its parent, as a ratio in `(0, 1)`.
    ///
    /// With `edge` given, only the slot of that edge's lower node is filled and the remaining
    /// slots are zero.
    ///
    /// Fails with [`InfeasibleTreeError`] if an internal node is not strictly between its
    /// admissible bounds.
    pub fn get_ratio_from_age(&self, edge: Option<usize>) -> Result<Vec<f64>> {
        let slots = self.ratio_nodes();
        let mut ratios = vec![0.0; self.nleaf - 1];
        match edge {
            Some(e) => {
                let edge = &self.edges[e];
                if self.nodes[edge.end].is_leaf {
                    bail!(
                        "Ratios are only defined for internal branches, {} -> {} ends in a leaf",
                        edge.start + 1,
                        edge.end + 1
                    );
                }
                let slot = self.slot_of(&slots, edge.end)?;
                ratios[slot] = self.age_ratio(edge.start, edge.end)?;
            }
            None => {
                ratios[0] = self.nodes[self.root].age;
                for (slot, &node) in slots.iter().enumerate().skip(1) {
                    let parent = self.parent_of(node)?;
                    ratios[slot] = self.age_ratio(parent, node)?;
                }
            }
        }
        Ok(ratios)
    }

    /// Lower bound of the age of an internal node: the oldest leaf below it plus one shortest
    /// branch per level above that leaf.
    fn age_floor(&self, node: usize) -> (f64, f64) {
        let max_tj = self.descendants_max_age(node);
        let dj = (self.node_depth(node) + 1) as f64;
        (max_tj, dj)
    }

    fn age_ratio(&self, parent: usize, child: usize) -> Result<f64> {
        let (max_tj, dj) = self.age_floor(child);
        let t1 = self.nodes[parent].age - max_tj - dj * BLEN_MIN;
        let t2 = self.nodes[child].age - max_tj - (dj - 1.0) * BLEN_MIN;
        let ratio = t2 / t1;
        if !(t1 > 0.0 && t2 > 0.0 && ratio < 1.0) {
            bail!(InfeasibleTreeError::new(
                format!(
                    "Age {} of node {} is not within its bounds below parent {} of age {}",
                    self.nodes[child].age,
                    child + 1,
                    parent + 1,
                    self.nodes[parent].age
                ),
                self
            ));
        }
        Ok(ratio)
    }

    fn parent_of(&self, node: usize) -> Result<usize> {
        match self.nodes[node].parent {
            Some(parent) => Ok(parent),
            None => bail!(InfeasibleTreeError::new(
                format!("Node {} has no parent", node + 1),
                self
            )),
        }
    }

    /// Inverse of [`Tree::get_ratio_from_age`]: sets the age of the root to `ratios[0]`, places
    /// every other internal node according to its ratio, top-down, and rewrites the branch
    /// lengths accordingly. Leaf ages are kept. The branch to the normal leaf keeps its length
    /// unless that would put the normal leaf after the latest sample, in which case it is cut
    /// so that the normal leaf ends at the latest sample time.
    pub fn update_edges_from_ratios(&mut self, ratios: &[f64]) -> Result<()> {
        if ratios.len() != self.nleaf - 1 {
            bail!(
                "Expected {} ratios for a tree with {} leaves, got {}",
                self.nleaf - 1,
                self.nleaf,
                ratios.len()
            );
        }
        let slots = self.ratio_nodes();
        let normal = self.normal_leaf();
        let mut ages = self.node_ages();
        let mut lengths = self.edge_lengths();
        ages[self.root] = ratios[0];
        let latest = (0..self.nleaf)
            .filter(|&l| Some(l) != normal)
            .map(|l| ages[l])
            .fold(f64::INFINITY, f64::min);

        for parent in self.preorder() {
            if self.nodes[parent].is_leaf {
                continue;
            }
            for (&child, &edge) in self.nodes[parent]
                .daughters
                .iter()
                .zip(&self.nodes[parent].e_out)
            {
                if parent == self.root && Some(child) == normal {
                    let length = lengths[edge].min(ages[self.root] - latest).max(BLEN_MIN);
                    ages[child] = ages[self.root] - length;
                    lengths[edge] = length;
                    continue;
                }
                if !self.nodes[child].is_leaf {
                    let ratio = ratios[self.slot_of(&slots, child)?];
                    if !(ratio > 0.0 && ratio < 1.0) {
                        bail!(InfeasibleTreeError::new(
                            format!("Ratio {} of node {} is not in (0, 1)", ratio, child + 1),
                            self
                        ));
                    }
                    let (max_tj, dj) = self.age_floor(child);
                    ages[child] = (ages[parent] - max_tj - dj * BLEN_MIN) * ratio
                        + max_tj
                        + (dj - 1.0) * BLEN_MIN;
                }
                let length = ages[parent] - ages[child];
                if length < BLEN_MIN - BLEN_TOLERANCE {
                    bail!(InfeasibleTreeError::new(
                        format!(
                            "Ratios give branch {} -> {} a length of {length}",
                            parent + 1,
                            child + 1
                        ),
                        self
                    ));
                }
                lengths[edge] = length;
            }
        }
        for (edge, length) in self.edges.iter_mut().zip(lengths) {
            edge.length = length;
        }
        self.calculate_node_times();
        self.calculate_age_from_time();
        Ok(())
    }

    /// Moves the lower node of an internal branch to the age given by `ratio` and adjusts the
    /// adjacent branches so that every other node keeps its age.
    pub fn update_edge_from_ratio(&mut self, ratio: f64, edge: usize) -> Result<()> {
        let (parent, child) = (self.edges[edge].start, self.edges[edge].end);
        if self.nodes[child].is_leaf {
            bail!(
                "Ratios are only defined for internal branches, {} -> {} ends in a leaf",
                parent + 1,
                child + 1
            );
        }
        if !(ratio > 0.0 && ratio < 1.0) {
            bail!(InfeasibleTreeError::new(
                format!("Ratio {} of node {} is not in (0, 1)", ratio, child + 1),
                self
            ));
        }
        let (max_tj, dj) = self.age_floor(child);
        let parent_age = self.nodes[parent].age;
        let age = (parent_age - max_tj - dj * BLEN_MIN) * ratio + max_tj + (dj - 1.0) * BLEN_MIN;
        if parent_age - age < BLEN_MIN - BLEN_TOLERANCE {
            bail!(InfeasibleTreeError::new(
                format!(
                    "Node {} cannot be placed at age {age} below parent {} of age {parent_age}",
                    child + 1,
                    parent + 1
                ),
                self
            ));
        }
        let delta = self.nodes[child].age - age;
        let below: Vec<(usize, usize)> = self.nodes[child]
            .daughters
            .iter()
            .copied()
            .zip(self.nodes[child].e_out.iter().copied())
            .collect();
        if let Some(&(daughter, _)) = below
            .iter()
            .find(|(d, _)| age - self.nodes[*d].age < BLEN_MIN - BLEN_TOLERANCE)
        {
            bail!(InfeasibleTreeError::new(
                format!(
                    "Node {} cannot be younger than {} at age {age}",
                    child + 1,
                    daughter + 1
                ),
                self
            ));
        }
        for &(daughter, e) in &below {
            self.edges[e].length = age - self.nodes[daughter].age;
        }
        self.edges[edge].length = parent_age - age;
        self.update_node_time(child, delta);
        for (daughter, _) in below {
            self.update_node_time(daughter, -delta);
        }
        self.nodes[child].age = age;
        Ok(())
    }

    fn slot_of(&self, slots: &[usize], node: usize) -> Result<usize> {
        match slots.iter().position(|&id| id == node) {
            Some(slot) => Ok(slot),
            None => bail!("Node {} has no ratio slot", node + 1),
        }
    }

    /// Adds `delta` to the age of the node and all of its ancestors.
    pub fn update_node_age(&mut self, node: usize, delta: f64) {
        for id in self.ancestral_nodes(node) {
            self.nodes[id].age += delta;
        }
    }

    /// Adds `delta` to the time of the node and all of its descendants.
    pub fn update_node_time(&mut self, node: usize, delta: f64) {
        for id in self.preorder_subroot(node) {
            self.nodes[id].time += delta;
        }
    }
}
