use itertools::Itertools;

use crate::tree::Tree;

impl Tree {
    /// Topology key that is equal for two trees exactly when they have the same rooted
    /// topology over the same leaf labels, regardless of branch lengths, internal node ids and
    /// the order of daughters.
    pub fn canonical_key(&self) -> String {
        self.subtree_key(self.root)
    }

    fn subtree_key(&self, id: usize) -> String {
        let node = &self.nodes[id];
        if node.is_leaf {
            return (id + 1).to_string();
        }
        let children = node
            .daughters
            .iter()
            .map(|&d| self.subtree_key(d))
            .sorted()
            .join(",");
        format!("({children})")
    }
}

pub fn canonical_key(tree: &Tree) -> String {
    tree.canonical_key()
}
