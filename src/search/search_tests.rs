use approx::assert_relative_eq;
use assert_matches::assert_matches;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rstest::rstest;

use crate::cmp_f64;
use crate::likelihood::TreeEvaluator;
use crate::search::test_evaluators::{CladeDistance, RejectingEvaluator, ReplacingEvaluator};
use crate::search::{
    evaluate_population, hill_climb_nni, initial_population, perturb_tree_set,
    perturb_tree_unseen, run_search, select_best, Candidate, CandidateState, ConfigError,
    EvolutionarySearch, ExhaustiveSearch, HillClimbing, InfeasiblePolicy, InitialTrees,
    SearchAlgorithm, SearchContext, SearchOptionsBuilder, TopologyRegistry,
};
use crate::tree::{
    enumerate_topologies, generate_random_tree, CoalescentParams, InfeasibleTreeError,
    MutationRates, NniLengths, Tree, MAX_NLNL,
};

fn assert_local_optimum(tree: &Tree, evaluator: &CladeDistance, lengths: NniLengths, nlnl: f64) {
    let mut tree = tree.clone();
    tree.generate_neighbors().unwrap();
    for nni in tree.nni_moves(lengths).unwrap() {
        let neighbour = nni.apply(&tree, lengths).unwrap();
        assert!(evaluator.nlnl(&neighbour).unwrap() >= nlnl - 1e-3);
    }
}

#[test]
fn builder_defaults() {
    let options = SearchOptionsBuilder::new(5).build().unwrap();
    assert_eq!(options.nleaf, 5);
    assert_eq!(options.npop, 100);
    assert_eq!(options.ngen, 50);
    assert_eq!(options.max_static, 10);
    assert_relative_eq!(options.loglh_epsilon, 0.001);
    assert_eq!(options.max_perturb_retries, 100);
    assert_eq!(options.hill_climb_pool, 20);
    assert_eq!(options.refine_pool, 5);
    assert_eq!(options.infeasible, InfeasiblePolicy::Abort);
    assert_eq!(options.nni_lengths(), NniLengths::KeepAges);
    assert_matches!(options.init_trees, InitialTrees::Random(_));
}

#[rstest]
#[case::too_few_leaves(SearchOptionsBuilder::new(2))]
#[case::empty_population(SearchOptionsBuilder::new(5).npop(0))]
#[case::pools(SearchOptionsBuilder::new(5).pools(3, 4))]
#[case::negative_epsilon(SearchOptionsBuilder::new(5).loglh_epsilon(-1.0))]
#[case::offsets(SearchOptionsBuilder::new(5).init_trees(InitialTrees::Random(CoalescentParams {
    tip_offsets: vec![0.0, 1.0],
    ..Default::default()
})))]
#[case::no_trees(SearchOptionsBuilder::new(5).init_trees(InitialTrees::Supplied(vec![])))]
#[case::wrong_size(SearchOptionsBuilder::new(5)
    .init_trees(InitialTrees::Supplied(enumerate_topologies(4, 1.0).unwrap())))]
fn builder_rejects_bad_options(#[case] builder: SearchOptionsBuilder) {
    let err = builder.build().unwrap_err();
    assert_matches!(err.downcast_ref::<ConfigError>(), Some(_));
}

#[test]
fn registry_counts_visits() {
    let registry = TopologyRegistry::new();
    assert!(registry.is_empty());
    assert!(registry.insert("((1,2),3)"));
    assert!(!registry.insert("((1,2),3)"));
    assert!(registry.contains("((1,2),3)"));
    assert_eq!(registry.visits("((1,2),3)"), 0);
    registry.record_visit("((1,2),3)");
    registry.record_visit("((1,2),3)");
    registry.record_visit("((1,3),2)");
    assert_eq!(registry.visits("((1,2),3)"), 2);
    assert_eq!(registry.visits("((2,3),1)"), 0);
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.total_visits(), 3);
}

#[test]
fn candidate_scoring() {
    let trees = enumerate_topologies(4, 1.0).unwrap();
    let evaluator = CladeDistance::new(&trees[0]);
    let registry = TopologyRegistry::new();
    let mut candidate = Candidate::new(trees[1].clone());
    assert_eq!(candidate.state(), CandidateState::Unscored);
    assert_relative_eq!(candidate.nlnl(), MAX_NLNL);
    candidate
        .evaluate(&evaluator, &registry, InfeasiblePolicy::Abort)
        .unwrap();
    assert_eq!(candidate.state(), CandidateState::Scored);
    assert_relative_eq!(candidate.nlnl(), 2.0);
    assert_relative_eq!(candidate.score(), -2.0);
    assert_eq!(registry.visits(candidate.key()), 1);
}

#[test]
fn infeasible_trees_abort_or_are_rejected() {
    let trees = enumerate_topologies(4, 1.0).unwrap();
    let evaluator = RejectingEvaluator {
        inner: CladeDistance::new(&trees[0]),
        rejected: trees[1].canonical_key(),
    };
    let registry = TopologyRegistry::new();
    let mut candidate = Candidate::new(trees[1].clone());
    let err = candidate
        .evaluate(&evaluator, &registry, InfeasiblePolicy::Abort)
        .unwrap_err();
    assert_matches!(err.downcast_ref::<InfeasibleTreeError>(), Some(_));
    assert_eq!(registry.total_visits(), 0);

    candidate
        .evaluate(&evaluator, &registry, InfeasiblePolicy::Reject)
        .unwrap();
    assert_relative_eq!(candidate.nlnl(), MAX_NLNL);
    assert_eq!(candidate.state(), CandidateState::Scored);
}

#[test]
fn evaluation_must_keep_topology() {
    let trees = enumerate_topologies(4, 1.0).unwrap();
    let evaluator = ReplacingEvaluator {
        replacement: trees[0].clone(),
    };
    let registry = TopologyRegistry::new();
    let mut candidate = Candidate::new(trees[1].clone());
    let err = candidate
        .evaluate(&evaluator, &registry, InfeasiblePolicy::Abort)
        .unwrap_err();
    let err = err.downcast::<InfeasibleTreeError>().unwrap();
    assert!(err.reason.contains(candidate.key()));
    assert_eq!(candidate.state(), CandidateState::Unscored);

    candidate
        .evaluate(&evaluator, &registry, InfeasiblePolicy::Reject)
        .unwrap();
    assert_relative_eq!(candidate.nlnl(), MAX_NLNL);
    assert_eq!(candidate.key(), trees[1].canonical_key());
    assert_eq!(candidate.tree().canonical_key(), trees[1].canonical_key());
}

#[test]
fn select_best_retires_the_rest() {
    let mut population = enumerate_topologies(4, 1.0)
        .unwrap()
        .into_iter()
        .map(Candidate::new)
        .collect::<Vec<_>>();
    for (candidate, score) in population.iter_mut().zip([-3.0, -1.0, -2.0]) {
        candidate.tree.score = score;
    }
    let retired = select_best(&mut population, 2);
    assert_eq!(retired.len(), 1);
    assert_eq!(retired[0].state(), CandidateState::Retired);
    assert_relative_eq!(retired[0].score(), -3.0);
    let scores = population.iter().map(|c| c.score()).collect::<Vec<_>>();
    assert_eq!(scores, vec![-1.0, -2.0]);
    let mut sorted = scores.clone();
    sorted.sort_by(cmp_f64());
    sorted.reverse();
    assert_eq!(sorted, scores);
    assert!(select_best(&mut population, 5).is_empty());
}

#[test]
fn initial_population_is_distinct() {
    let options = SearchOptionsBuilder::new(6).npop(15).seed(3).build().unwrap();
    let mut ctx = SearchContext::new(options);
    let population = initial_population(&mut ctx, 15).unwrap();
    assert_eq!(population.len(), 15);
    assert_eq!(ctx.registry().len(), 15);
    assert!(population
        .iter()
        .all(|c| c.state() == CandidateState::Unscored && c.tree().nleaf == 6));
}

#[test]
fn initial_population_is_capped_by_topology_count() {
    let options = SearchOptionsBuilder::new(4).npop(10).build().unwrap();
    let mut ctx = SearchContext::new(options);
    let population = initial_population(&mut ctx, 10).unwrap();
    assert!(population.len() <= 3);
    assert!(!population.is_empty());
}

#[test]
fn supplied_duplicates_are_dropped() {
    let trees = enumerate_topologies(4, 1.0).unwrap();
    let supplied = vec![trees[0].clone(), trees[1].clone(), trees[0].clone()];
    let options = SearchOptionsBuilder::new(4)
        .init_trees(InitialTrees::Supplied(supplied))
        .build()
        .unwrap();
    let mut ctx = SearchContext::new(options);
    assert_eq!(initial_population(&mut ctx, 10).unwrap().len(), 2);
}

#[test]
fn perturbation_finds_unseen_topology() {
    let mut rng = StdRng::seed_from_u64(8);
    let tree =
        generate_random_tree(7, MutationRates::default(), &CoalescentParams::default(), &mut rng)
            .unwrap();
    let options = SearchOptionsBuilder::new(7)
        .time_constrained(false)
        .build()
        .unwrap();
    let mut ctx = SearchContext::new(options);
    let parent = Candidate::new(tree);
    ctx.registry().insert(parent.key());
    let perturbation = perturb_tree_set(std::slice::from_ref(&parent), &mut ctx).unwrap();
    assert!(perturbation.novel);
    assert!(!ctx.exhausted());
    let key = perturbation.tree.canonical_key();
    assert_ne!(key, parent.key());
    assert!(ctx.registry().contains(&key));
    assert_eq!(ctx.registry().len(), 2);
}

#[test]
fn perturbation_of_exhausted_space() {
    let trees = enumerate_topologies(4, 1.0).unwrap();
    let options = SearchOptionsBuilder::new(4).build().unwrap();
    let mut ctx = SearchContext::new(options);
    let population = trees.into_iter().map(Candidate::new).collect::<Vec<_>>();
    for candidate in &population {
        ctx.registry().insert(candidate.key());
    }
    let perturbation = perturb_tree_set(&population, &mut ctx).unwrap();
    assert!(!perturbation.novel);
    assert!(ctx.exhausted());
    assert_eq!(ctx.registry().len(), 3);
    assert!(perturb_tree_set(&[], &mut ctx).is_err());
}

#[rstest]
#[case(NniLengths::KeepLengths)]
#[case(NniLengths::KeepAges)]
fn hill_climb_reaches_local_optimum(#[case] lengths: NniLengths) {
    let trees = enumerate_topologies(6, 1.0).unwrap();
    let evaluator = CladeDistance::new(&trees[40]);
    let options = SearchOptionsBuilder::new(6)
        .time_constrained(lengths == NniLengths::KeepAges)
        .build()
        .unwrap();
    let ctx = SearchContext::new(options);
    let mut start = vec![Candidate::new(trees[0].clone())];
    evaluate_population(&evaluator, &mut start, &ctx).unwrap();
    let start = start.remove(0);
    let climbed = hill_climb_nni(start.clone(), &evaluator, &ctx).unwrap();
    assert!(climbed.score() >= start.score());
    assert_eq!(climbed.state(), CandidateState::Scored);
    assert_eq!(ctx.registry().total_visits(), evaluator.calls());
    assert_local_optimum(climbed.tree(), &evaluator, lengths, climbed.nlnl());
}

#[test]
fn exhaustive_search_finds_target() {
    let trees = enumerate_topologies(5, 1.0).unwrap();
    let evaluator = CladeDistance::new(&trees[7]);
    let options = SearchOptionsBuilder::new(5).build().unwrap();
    let mut ctx = SearchContext::new(options);
    let result = ExhaustiveSearch::new(&evaluator).run(&mut ctx).unwrap();
    assert_eq!(result.best.canonical_key(), trees[7].canonical_key());
    assert_relative_eq!(result.nlnl, 1.0);
    assert_eq!(result.topologies, 15);
    assert_eq!(result.iterations, 15);
    // One evaluation plus `max_static` evaluations without improvement per topology.
    assert_eq!(result.optimisations, 15 * 11);
    assert_eq!(evaluator.calls(), 15 * 11);
    assert!(!result.exhausted);
}

#[test]
fn exhaustive_search_streams_many_topologies() {
    let trees = enumerate_topologies(7, 1.0).unwrap();
    let evaluator = CladeDistance::new(&trees[700]);
    let options = SearchOptionsBuilder::new(7).max_static(1).build().unwrap();
    let mut ctx = SearchContext::new(options);
    let result = ExhaustiveSearch::new(&evaluator).run(&mut ctx).unwrap();
    assert_eq!(result.best.canonical_key(), trees[700].canonical_key());
    assert_relative_eq!(result.nlnl, 1.0);
    assert_eq!(result.iterations, 945);
    assert_eq!(result.topologies, 945);
    assert_eq!(evaluator.calls(), 945 * 2);
}

#[test]
fn exhaustive_search_refuses_large_trees() {
    let evaluator = CladeDistance::new(&enumerate_topologies(4, 1.0).unwrap()[0]);
    let options = SearchOptionsBuilder::new(12).build().unwrap();
    let mut ctx = SearchContext::new(options);
    let err = ExhaustiveSearch::new(&evaluator).run(&mut ctx).unwrap_err();
    assert_matches!(err.downcast_ref::<ConfigError>(), Some(_));
    assert_eq!(evaluator.calls(), 0);
}

#[test]
fn exhaustive_search_with_rejected_topology() {
    let trees = enumerate_topologies(4, 1.0).unwrap();
    let rejected = trees[0].canonical_key();
    let evaluator = RejectingEvaluator {
        inner: CladeDistance::new(&trees[0]),
        rejected: rejected.clone(),
    };

    let options = SearchOptionsBuilder::new(4).build().unwrap();
    let err = ExhaustiveSearch::new(&evaluator)
        .run(&mut SearchContext::new(options))
        .unwrap_err();
    assert_matches!(err.downcast_ref::<InfeasibleTreeError>(), Some(_));

    let options = SearchOptionsBuilder::new(4)
        .infeasible(InfeasiblePolicy::Reject)
        .build()
        .unwrap();
    let result = ExhaustiveSearch::new(&evaluator)
        .run(&mut SearchContext::new(options))
        .unwrap();
    assert_ne!(result.best.canonical_key(), rejected);
    assert_relative_eq!(result.nlnl, 2.0);
}

#[test]
#[cfg_attr(feature = "ci_coverage", ignore)]
fn hill_climbing_returns_local_optimum() {
    let trees = enumerate_topologies(6, 1.0).unwrap();
    let evaluator = CladeDistance::new(&trees[50]);
    let options = SearchOptionsBuilder::new(6)
        .npop(20)
        .pools(6, 3)
        .max_perturb(10)
        .seed(4)
        .build()
        .unwrap();
    let mut ctx = SearchContext::new(options);
    let result = HillClimbing::new(&evaluator).run(&mut ctx).unwrap();
    assert!(result.topologies >= 20);
    assert_eq!(result.optimisations, evaluator.calls());
    assert_local_optimum(&result.best, &evaluator, NniLengths::KeepAges, result.nlnl);
    assert!(result.best.check_invariants().is_ok());
}

#[test]
fn hill_climbing_keeps_perturbing_small_trees() {
    let trees = enumerate_topologies(6, 1.0).unwrap();
    let evaluator = CladeDistance::new(&trees[50]);
    let run = |max_perturb: usize| {
        let options = SearchOptionsBuilder::new(6)
            .npop(20)
            .pools(6, 3)
            .max_perturb(max_perturb)
            .time_constrained(false)
            .seed(4)
            .build()
            .unwrap();
        HillClimbing::new(&evaluator)
            .run(&mut SearchContext::new(options))
            .unwrap()
    };
    // Both runs share their first iterations, the longer one keeps going.
    let short = run(1);
    let long = run(10);
    assert!(!short.exhausted);
    assert!(long.iterations > 1);
    assert!(long.iterations > short.iterations);
    assert!(long.topologies >= short.topologies);
    assert!(long.nlnl <= short.nlnl);
}

#[test]
fn perturbation_against_climb_starts() {
    let trees = enumerate_topologies(5, 1.0).unwrap();
    let options = SearchOptionsBuilder::new(5)
        .time_constrained(false)
        .build()
        .unwrap();
    let mut ctx = SearchContext::new(options);
    for tree in &trees {
        ctx.registry().insert(&tree.canonical_key());
    }
    let parent = vec![Candidate::new(trees[0].clone())];
    let starts = TopologyRegistry::new();
    starts.insert(parent[0].key());
    let perturbation = perturb_tree_unseen(&parent, &starts, &mut ctx).unwrap();
    assert!(perturbation.novel);
    assert_ne!(perturbation.tree.canonical_key(), parent[0].key());
    assert_eq!(starts.len(), 2);
    assert!(!ctx.exhausted());

    for tree in &trees {
        starts.insert(&tree.canonical_key());
    }
    let perturbation = perturb_tree_unseen(&parent, &starts, &mut ctx).unwrap();
    assert!(!perturbation.novel);
    assert!(!ctx.exhausted());
}

#[test]
fn hill_climbing_stops_on_exhausted_space() {
    let trees = enumerate_topologies(4, 1.0).unwrap();
    let evaluator = CladeDistance::new(&trees[1]);
    let options = SearchOptionsBuilder::new(4)
        .init_trees(InitialTrees::Supplied(trees.clone()))
        .build()
        .unwrap();
    let mut ctx = SearchContext::new(options);
    let result = HillClimbing::new(&evaluator).run(&mut ctx).unwrap();
    assert!(result.exhausted);
    assert_eq!(result.iterations, 1);
    assert_eq!(result.topologies, 3);
    assert_eq!(result.best.canonical_key(), trees[1].canonical_key());
    assert_relative_eq!(result.nlnl, 1.0);
}

#[test]
fn evolutionary_search_never_gets_worse() {
    let trees = enumerate_topologies(6, 1.0).unwrap();
    let evaluator = CladeDistance::new(&trees[60]);
    let start = vec![trees[0].clone(), trees[10].clone(), trees[20].clone()];
    let start_best = start
        .iter()
        .map(|t| evaluator.nlnl(t).unwrap())
        .fold(f64::INFINITY, f64::min);
    let calls_before = evaluator.calls();
    let options = SearchOptionsBuilder::new(6)
        .npop(10)
        .ngen(5)
        .time_constrained(false)
        .init_trees(InitialTrees::Supplied(start))
        .seed(2)
        .build()
        .unwrap();
    let mut ctx = SearchContext::new(options);
    let result = EvolutionarySearch::new(&evaluator).run(&mut ctx).unwrap();
    assert!(result.nlnl <= start_best);
    assert!(result.iterations >= 1 && result.iterations <= 5);
    assert!(result.topologies > 3);
    assert_eq!(result.optimisations, evaluator.calls() - calls_before);
}

#[test]
fn evolutionary_search_stops_on_exhausted_space() {
    let trees = enumerate_topologies(4, 1.0).unwrap();
    let evaluator = CladeDistance::new(&trees[2]);
    let options = SearchOptionsBuilder::new(4)
        .npop(5)
        .init_trees(InitialTrees::Supplied(trees.clone()))
        .build()
        .unwrap();
    let mut ctx = SearchContext::new(options);
    let result = EvolutionarySearch::new(&evaluator).run(&mut ctx).unwrap();
    assert!(result.exhausted);
    assert_eq!(result.topologies, 3);
    assert_eq!(result.optimisations, 3);
    // The first generation sets the best score, `max_static` more find nothing new.
    assert_eq!(result.iterations, 11);
    assert_eq!(result.best.canonical_key(), trees[2].canonical_key());
}

#[rstest]
#[case(SearchAlgorithm::Evolutionary)]
#[case(SearchAlgorithm::HillClimbing)]
#[case(SearchAlgorithm::Exhaustive)]
fn searches_are_reproducible(#[case] algorithm: SearchAlgorithm) {
    let trees = enumerate_topologies(5, 1.0).unwrap();
    let evaluator = CladeDistance::new(&trees[3]);
    let run = || {
        let options = SearchOptionsBuilder::new(5)
            .npop(6)
            .ngen(4)
            .pools(4, 2)
            .max_perturb(5)
            .seed(17)
            .build()
            .unwrap();
        run_search(algorithm, &evaluator, &mut SearchContext::new(options)).unwrap()
    };
    let first = run();
    let second = run();
    assert_eq!(first.best.canonical_key(), second.best.canonical_key());
    assert_relative_eq!(first.nlnl, second.nlnl);
    assert_eq!(first.topologies, second.topologies);
}
