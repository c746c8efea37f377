/// Builds a [`crate::tree::Tree`] from its number of leaves and `(start, end, length)` triples,
/// panicking if the edges do not form a valid tree.
/// ```
/// use cnetree::tree;
/// let tree = tree!(3; (3, 0, 1.0), (3, 1, 1.0), (4, 3, 1.0), (4, 2, 0.001));
/// assert_eq!(tree.root, 4);
/// ```
#[macro_export]
macro_rules! tree {
    ($nleaf:expr; $(($start:expr, $end:expr, $length:expr)),+ $(,)?) => {{
        use $crate::tree::Tree;
        Tree::from_edges($nleaf, &[$(($start, $end, $length as f64)),+]).unwrap()
    }};
}

#[cfg(test)]
#[cfg_attr(coverage, coverage(off))]
pub mod tests {
    use crate::tree::Tree;

    #[test]
    fn tree_macro_matches_from_edges() {
        let macro_tree = tree!(3; (3, 0, 1), (3, 1, 1), (4, 3, 2), (4, 2, 0.5));
        let tree =
            Tree::from_edges(3, &[(3, 0, 1.0), (3, 1, 1.0), (4, 3, 2.0), (4, 2, 0.5)]).unwrap();
        assert_eq!(macro_tree.edges(), tree.edges());
        assert_eq!(macro_tree.nodes(), tree.nodes());
        assert_eq!(macro_tree.root, 4);
    }
}
