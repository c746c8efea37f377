use approx::assert_relative_eq;
use assert_matches::assert_matches;
use hashbrown::HashSet;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rstest::rstest;

use crate::tree::{
    enumerate_topologies, generate_random_tree, random_nni, random_nnis, rooted_nni,
    CoalescentParams, Direction, InfeasibleTreeError, MutationRates, NniLengths, NniMove, Tree,
};
use crate::{assert_float_relative_slice_eq, tree};

fn four_leaf_tree() -> Tree {
    tree!(4; (4, 0, 1), (4, 1, 1), (5, 4, 1), (5, 2, 2), (6, 5, 1), (6, 3, 3))
}

fn with_neighbors(mut tree: Tree) -> Tree {
    tree.generate_neighbors().unwrap();
    tree
}

#[test]
fn neighbor_directions() {
    let tree = with_neighbors(four_leaf_tree());
    assert!(tree.has_neighbors());
    assert_eq!(tree.degree(6), 2);
    assert_eq!(tree.degree(5), 3);
    assert_eq!(tree.degree(0), 1);
    assert!(tree.toward_root_neighbor(6).is_none());
    for node in 0..6 {
        let up = tree.toward_root_neighbor(node).unwrap();
        assert_eq!(Some(up.node), tree.node(node).parent);
        assert_eq!(Some(up.id), tree.node(node).e_in);
        let towards_root = tree
            .neighbors(node)
            .iter()
            .filter(|n| n.direction == Direction::TowardRoot)
            .count();
        assert_eq!(towards_root, 1);
    }
    let mut down = tree.away_from_root_neighbors(5).map(|n| n.node).collect::<Vec<_>>();
    down.sort();
    assert_eq!(down, vec![2, 4]);
    let neighbor = tree.find_neighbor(5, 2).unwrap();
    assert_relative_eq!(neighbor.length, 2.0);
    assert_eq!(neighbor.id, 3);
}

#[test]
fn missing_neighbor_is_an_error() {
    let tree = with_neighbors(four_leaf_tree());
    let err = tree.find_neighbor(4, 2).unwrap_err();
    assert_matches!(err.downcast_ref::<InfeasibleTreeError>(), Some(_));
}

#[test]
fn neighbors_are_dropped_on_structure_change() {
    let mut tree = with_neighbors(four_leaf_tree());
    tree.delete_neighbors();
    assert!(!tree.has_neighbors());
    assert!(tree.neighbors(5).is_empty());
    assert!(tree.nni_moves(NniLengths::KeepLengths).is_err());
}

#[test]
fn moves_of_four_leaf_tree() {
    let tree = with_neighbors(four_leaf_tree());
    let moves = tree.nni_moves(NniLengths::KeepLengths).unwrap();
    // Node 5 has the normal leaf as sibling, so only node 4 can be swapped.
    assert_eq!(
        moves,
        vec![
            NniMove { parent: 5, node: 4, child: 0, sibling: 2 },
            NniMove { parent: 5, node: 4, child: 1, sibling: 2 },
        ]
    );
    assert_eq!(tree.nni_moves(NniLengths::KeepAges).unwrap().len(), 2);
}

#[test]
fn nni_keeping_lengths() {
    let tree = four_leaf_tree();
    let nni = NniMove { parent: 5, node: 4, child: 0, sibling: 2 };
    let new_tree = nni.apply(&tree, NniLengths::KeepLengths).unwrap();
    assert_eq!(new_tree.canonical_key(), "(((2,3),1),4)");
    assert_eq!(new_tree.node(0).parent, Some(5));
    assert_eq!(new_tree.node(2).parent, Some(4));
    assert_eq!(new_tree.edge_lengths(), tree.edge_lengths());
    assert_relative_eq!(new_tree.node(0).time, 2.0);
    assert_relative_eq!(new_tree.node(2).time, 4.0);
    assert!(!new_tree.has_neighbors());
    // The input tree is left as it was.
    assert_eq!(tree.canonical_key(), "(((1,2),3),4)");
}

#[test]
fn nni_keeping_ages() {
    let tree = four_leaf_tree();
    let nni = NniMove { parent: 5, node: 4, child: 0, sibling: 2 };
    let new_tree = nni.apply(&tree, NniLengths::KeepAges).unwrap();
    assert_eq!(new_tree.canonical_key(), "(((2,3),1),4)");
    assert_float_relative_slice_eq(&new_tree.node_ages(), &tree.node_ages(), 1e-10);
    assert_relative_eq!(new_tree.edge(0).length, 2.0);
    assert_relative_eq!(new_tree.edge(3).length, 1.0);
    assert!(new_tree.check_invariants().is_ok());
}

#[rstest]
#[case(NniLengths::KeepLengths)]
#[case(NniLengths::KeepAges)]
fn nni_then_inverse_restores_tree(#[case] lengths: NniLengths) {
    let tree = four_leaf_tree();
    for nni in with_neighbors(tree.clone()).nni_moves(lengths).unwrap() {
        let moved = nni.apply(&tree, lengths).unwrap();
        assert_ne!(moved.canonical_key(), tree.canonical_key());
        let back = nni.inverse().apply(&moved, lengths).unwrap();
        assert_eq!(back.canonical_key(), tree.canonical_key());
        assert_eq!(back.nodes(), tree.nodes());
        assert_float_relative_slice_eq(&back.node_times(), &tree.node_times(), 1e-10);
        assert_float_relative_slice_eq(&back.node_ages(), &tree.node_ages(), 1e-10);
    }
}

#[test]
fn rooted_nni_checks_arguments() {
    let tree = four_leaf_tree();
    assert!(rooted_nni(&tree, 6, 5, NniLengths::KeepLengths).is_err());
    assert!(rooted_nni(&tree, 0, 4, NniLengths::KeepLengths).is_err());
    assert!(rooted_nni(&tree, 4, 2, NniLengths::KeepLengths).is_err());
    let new_tree = rooted_nni(&tree, 4, 1, NniLengths::KeepLengths).unwrap();
    assert_eq!(new_tree.canonical_key(), "(((1,3),2),4)");
}

#[test]
fn age_infeasible_moves_are_skipped() {
    // Leaf 2 is older than node 4 and cannot be placed below it.
    let tree = tree!(4; (4, 0, 1), (4, 1, 1), (5, 4, 1), (5, 2, 0.5), (6, 5, 1), (6, 3, 3));
    let with_nb = with_neighbors(tree.clone());
    assert!(with_nb.nni_moves(NniLengths::KeepAges).unwrap().is_empty());
    assert_eq!(with_nb.nni_moves(NniLengths::KeepLengths).unwrap().len(), 2);
    let err = rooted_nni(&tree, 4, 0, NniLengths::KeepAges).unwrap_err();
    assert_matches!(err.downcast_ref::<InfeasibleTreeError>(), Some(_));
}

#[test]
fn move_count_of_random_tree() {
    let mut rng = StdRng::seed_from_u64(11);
    let tree =
        generate_random_tree(6, MutationRates::default(), &CoalescentParams::default(), &mut rng)
            .unwrap();
    let moves = with_neighbors(tree).nni_moves(NniLengths::KeepLengths).unwrap();
    // Two moves per internal branch below the common ancestor of the samples.
    assert_eq!(moves.len(), 6);
}

#[test]
fn neighbors_of_a_topology_are_distinct() {
    let tree = with_neighbors(enumerate_topologies(5, 1.0).unwrap().remove(0));
    let keys: HashSet<String> = tree
        .nni_moves(NniLengths::KeepLengths)
        .unwrap()
        .iter()
        .map(|nni| nni.apply(&tree, NniLengths::KeepLengths).unwrap().canonical_key())
        .collect();
    assert_eq!(keys.len(), 4);
    assert!(!keys.contains(&tree.canonical_key()));
}

#[test]
fn random_nnis_keep_normal_leaf_and_ages() {
    let mut rng = StdRng::seed_from_u64(5);
    let tree =
        generate_random_tree(7, MutationRates::default(), &CoalescentParams::default(), &mut rng)
            .unwrap();
    let mut current = tree.clone();
    for _ in 0..20 {
        current = random_nnis(&current, 2, &mut rng, NniLengths::KeepAges).unwrap();
        assert_eq!(current.root, tree.root);
        assert_eq!(current.normal_leaf(), Some(6));
        assert_eq!(current.node(6).parent, Some(current.root));
        assert_float_relative_slice_eq(&current.node_ages(), &tree.node_ages(), 1e-8);
        assert!(current.check_invariants().is_ok());
    }
}

#[test]
fn no_moves_for_two_samples() {
    let tree = tree!(3; (3, 0, 1), (3, 1, 1), (4, 3, 1), (4, 2, 0.001));
    let mut rng = StdRng::seed_from_u64(0);
    assert!(random_nni(&tree, &mut rng, NniLengths::KeepLengths)
        .unwrap()
        .is_none());
    let same = random_nnis(&tree, 3, &mut rng, NniLengths::KeepLengths).unwrap();
    assert_eq!(same.canonical_key(), tree.canonical_key());
}
