use anyhow::bail;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::tree::{InfeasibleTreeError, Tree, BLEN_MIN, MAX_NLNL};
use crate::Result;

/// How branch lengths are carried through a rooted NNI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NniLengths {
    /// The swapped subtrees keep the lengths of the branches above them.
    #[default]
    KeepLengths,
    /// Every node keeps its age, the branches above the swapped subtrees are recomputed.
    /// Moves that would place a subtree below a younger node are not allowed.
    KeepAges,
}

/// A rooted nearest-neighbour interchange around the internal branch `parent -> node`:
/// `child`, a daughter of `node`, trades places with `sibling`, the other daughter of `parent`.
/// ```text
///            |
///      -- parent --
///      |          |
///  --node--    sibling
///  |      |
///  .    child
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NniMove {
    pub parent: usize,
    pub node: usize,
    pub child: usize,
    pub sibling: usize,
}

impl NniMove {
    /// The move that undoes this one on the resulting tree.
    pub fn inverse(&self) -> NniMove {
        NniMove {
            parent: self.parent,
            node: self.node,
            child: self.sibling,
            sibling: self.child,
        }
    }

    fn is_age_feasible(&self, tree: &Tree) -> bool {
        tree.nodes[self.node].age - tree.nodes[self.sibling].age >= BLEN_MIN
    }

    /// Applies the move to a copy of the tree, regenerating its nodes, times and ages.
    pub fn apply(&self, tree: &Tree, lengths: NniLengths) -> Result<Tree> {
        let (Some(e_child), Some(e_sibling)) =
            (tree.nodes[self.child].e_in, tree.nodes[self.sibling].e_in)
        else {
            bail!(InfeasibleTreeError::new(
                format!(
                    "Nodes {} and {} must both have a parent",
                    self.child + 1,
                    self.sibling + 1
                ),
                tree
            ));
        };
        if lengths == NniLengths::KeepAges && !self.is_age_feasible(tree) {
            bail!(InfeasibleTreeError::new(
                format!(
                    "Node {} is not old enough to take node {} as a daughter",
                    self.node + 1,
                    self.sibling + 1
                ),
                tree
            ));
        }

        let mut new_tree = tree.clone();
        new_tree.delete_neighbors();
        new_tree.score = -MAX_NLNL;
        new_tree.edges[e_child].start = self.parent;
        new_tree.edges[e_sibling].start = self.node;
        if lengths == NniLengths::KeepAges {
            new_tree.edges[e_child].length =
                tree.nodes[self.parent].age - tree.nodes[self.child].age;
            new_tree.edges[e_sibling].length =
                tree.nodes[self.node].age - tree.nodes[self.sibling].age;
        }
        new_tree.generate_nodes()?;
        new_tree.calculate_node_times();
        new_tree.calculate_age_from_time();
        Ok(new_tree)
    }
}

impl Tree {
    /// All rooted NNI moves of the tree. Requires the adjacencies from
    /// [`Tree::generate_neighbors`]. Moves that relocate the normal leaf are excluded, and with
    /// [`NniLengths::KeepAges`] so are moves that violate the node ages.
    pub fn nni_moves(&self, lengths: NniLengths) -> Result<Vec<NniMove>> {
        if !self.has_neighbors() {
            bail!("Adjacencies must be generated before enumerating NNI moves");
        }
        let normal = self.normal_leaf();
        let mut moves = Vec::new();
        for node in self.preorder() {
            if self.nodes[node].is_leaf || node == self.root {
                continue;
            }
            let Some(parent) = self.toward_root_neighbor(node).map(|n| n.node) else {
                bail!(InfeasibleTreeError::new(
                    format!("Node {} has no adjacency towards the root", node + 1),
                    self
                ));
            };
            let Some(sibling) = self
                .away_from_root_neighbors(parent)
                .map(|n| n.node)
                .find(|&n| n != node)
            else {
                continue;
            };
            if Some(sibling) == normal {
                continue;
            }
            for child in self.away_from_root_neighbors(node).map(|n| n.node) {
                let nni = NniMove {
                    parent,
                    node,
                    child,
                    sibling,
                };
                if lengths == NniLengths::KeepAges && !nni.is_age_feasible(self) {
                    continue;
                }
                moves.push(nni);
            }
        }
        Ok(moves)
    }
}

/// Swaps `child`, a daughter of `node`, with the sibling of `node`.
pub fn rooted_nni(tree: &Tree, node: usize, child: usize, lengths: NniLengths) -> Result<Tree> {
    if node == tree.root {
        bail!("For the rooted NNI the node mustn't be the root of the tree.");
    }
    if tree.nodes[node].is_leaf {
        bail!("For the rooted NNI the node mustn't be a leaf");
    }
    if tree.nodes[child].parent != Some(node) {
        bail!("The provided child is not the child");
    }
    let (Some(parent), Some(sibling)) = (tree.nodes[node].parent, tree.sibling(node)) else {
        bail!("For the rooted NNI the node must have a sibling");
    };
    NniMove {
        parent,
        node,
        child,
        sibling,
    }
    .apply(tree, lengths)
}

/// Applies one NNI move drawn uniformly from the admissible moves of the tree, `None` if
/// there are none.
pub fn random_nni<R: Rng + ?Sized>(
    tree: &Tree,
    rng: &mut R,
    lengths: NniLengths,
) -> Result<Option<Tree>> {
    let mut tree = tree.clone();
    tree.generate_neighbors()?;
    let moves = tree.nni_moves(lengths)?;
    match moves.choose(rng) {
        Some(nni) => Ok(Some(nni.apply(&tree, lengths)?)),
        None => Ok(None),
    }
}

/// Applies `count` successive random NNI moves, stopping early if the tree admits none.
pub fn random_nnis<R: Rng + ?Sized>(
    tree: &Tree,
    count: usize,
    rng: &mut R,
    lengths: NniLengths,
) -> Result<Tree> {
    let mut tree = tree.clone();
    for _ in 0..count {
        match random_nni(&tree, rng, lengths)? {
            Some(next) => tree = next,
            None => break,
        }
    }
    Ok(tree)
}
