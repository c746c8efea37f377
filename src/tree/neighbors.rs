use anyhow::bail;

use crate::tree::{InfeasibleTreeError, Tree};
use crate::Result;

/// Orientation of an adjacency relative to the root, assigned by
/// [`Tree::generate_neighbors`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Undefined,
    TowardRoot,
    AwayFromRoot,
}

/// One entry of the undirected adjacency list of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub node: usize,
    pub length: f64,
    /// Id of the edge connecting the two nodes.
    pub id: usize,
    pub direction: Direction,
}

impl Neighbor {
    fn new(node: usize, length: f64, id: usize) -> Self {
        Self {
            node,
            length,
            id,
            direction: Direction::Undefined,
        }
    }
}

impl Tree {
    /// Builds the undirected adjacency list of every node and labels each adjacency with its
    /// direction relative to the root. The adjacencies go stale as soon as the edge list
    /// changes and have to be regenerated.
    pub fn generate_neighbors(&mut self) -> Result<()> {
        self.delete_neighbors();
        for edge in &self.edges {
            self.nodes[edge.start]
                .neighbors
                .push(Neighbor::new(edge.end, edge.length, edge.id));
            self.nodes[edge.end]
                .neighbors
                .push(Neighbor::new(edge.start, edge.length, edge.id));
        }
        self.compute_branch_direction(self.root, None)?;
        self.has_neighbors = true;
        Ok(())
    }

    pub fn delete_neighbors(&mut self) {
        for node in self.nodes.iter_mut() {
            node.neighbors.clear();
        }
        self.has_neighbors = false;
    }

    pub fn has_neighbors(&self) -> bool {
        self.has_neighbors
    }

    pub fn neighbors(&self, node: usize) -> &[Neighbor] {
        &self.nodes[node].neighbors
    }

    /// Number of adjacencies of the node, a node of degree one is a leaf.
    pub fn degree(&self, node: usize) -> usize {
        self.nodes[node].neighbors.len()
    }

    pub fn find_neighbor(&self, node: usize, target: usize) -> Result<&Neighbor> {
        match self.nodes[node].neighbors.iter().find(|n| n.node == target) {
            Some(neighbor) => Ok(neighbor),
            None => bail!(InfeasibleTreeError::new(
                format!("Node {} is not adjacent to node {}", target + 1, node + 1),
                self
            )),
        }
    }

    /// The adjacency leading towards the root, `None` for the root itself.
    pub fn toward_root_neighbor(&self, node: usize) -> Option<&Neighbor> {
        self.nodes[node]
            .neighbors
            .iter()
            .find(|n| n.direction == Direction::TowardRoot)
    }

    pub fn away_from_root_neighbors(&self, node: usize) -> impl Iterator<Item = &Neighbor> {
        self.nodes[node]
            .neighbors
            .iter()
            .filter(|n| n.direction == Direction::AwayFromRoot)
    }

    fn compute_branch_direction(&mut self, node: usize, dad: Option<usize>) -> Result<()> {
        if let Some(dad) = dad {
            let Some(pos) = self.nodes[node].neighbors.iter().position(|n| n.node == dad) else {
                bail!(InfeasibleTreeError::new(
                    format!("Node {} has no adjacency to its parent {}", node + 1, dad + 1),
                    self
                ));
            };
            self.nodes[node].neighbors[pos].direction = Direction::TowardRoot;
        }
        for i in 0..self.nodes[node].neighbors.len() {
            let neighbor = &self.nodes[node].neighbors[i];
            if Some(neighbor.node) == dad {
                continue;
            }
            match neighbor.direction {
                Direction::TowardRoot => bail!(InfeasibleTreeError::new(
                    format!("Node {} is reachable on two paths from the root", node + 1),
                    self
                )),
                Direction::AwayFromRoot => continue,
                Direction::Undefined => {}
            }
            let next = neighbor.node;
            self.nodes[node].neighbors[i].direction = Direction::AwayFromRoot;
            self.compute_branch_direction(next, Some(node))?;
        }
        Ok(())
    }
}
