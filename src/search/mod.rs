use std::cmp::Reverse;
use std::error::Error;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::bail;
use hashbrown::HashMap;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::likelihood::TreeEvaluator;
use crate::tree::{
    generate_random_tree, max_topologies, CoalescentParams, InfeasibleTreeError, MutationRates,
    NniLengths, Tree, MAX_NLNL,
};
use crate::{f64_h, Result};

pub mod evolutionary;
pub mod exhaustive;
pub mod hill_climbing;
pub mod nni_search;

pub use evolutionary::EvolutionarySearch;
pub use exhaustive::ExhaustiveSearch;
pub use hill_climbing::HillClimbing;
pub use nni_search::{
    hill_climb_nni, perturb_tree, perturb_tree_set, perturb_tree_unseen, Perturbation,
};

/// Retries of the perturbation operator before the search space counts as exhausted.
pub const MAX_TREE: usize = 100;
/// Number of initial trees that are climbed to a local optimum.
pub const MAX_TREE1: usize = 20;
/// Number of local optima kept for refinement by perturbation.
pub const MAX_TREE2: usize = 5;
/// Number of non-improving perturbations after which hill climbing stops.
pub const MAX_PERTURB: usize = 100;
/// Ratio of optimisations to distinct topologies at which an exhausted search stops.
pub const MAX_OPT: usize = 10;

/// Invalid search setup, detected before any search work starts.
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Debug for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for ConfigError {}

/// What to do when the evaluator reports an [`InfeasibleTreeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InfeasiblePolicy {
    /// Stop the search and return the error.
    #[default]
    Abort,
    /// Give the tree the worst possible score so that it is never selected.
    Reject,
}

/// Source of the starting population.
#[derive(Debug, Clone)]
pub enum InitialTrees {
    Random(CoalescentParams),
    Supplied(Vec<Tree>),
}

/// Options shared by all searches. Use [`SearchOptionsBuilder`] to create them.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Number of leaves including the normal leaf.
    pub nleaf: usize,
    pub npop: usize,
    pub ngen: usize,
    /// Number of consecutive rounds without improvement after which a search stops.
    pub max_static: usize,
    /// Smallest increase of the log-likelihood that counts as an improvement.
    pub loglh_epsilon: f64,
    pub seed: u64,
    pub init_trees: InitialTrees,
    pub rates: MutationRates,
    pub max_perturb_retries: usize,
    pub hill_climb_pool: usize,
    pub refine_pool: usize,
    pub max_perturb: usize,
    pub max_opt_ratio: usize,
    pub max_nni_rounds: usize,
    /// NNI moves keep node ages instead of branch lengths.
    pub time_constrained: bool,
    pub infeasible: InfeasiblePolicy,
}

impl SearchOptions {
    pub fn nni_lengths(&self) -> NniLengths {
        if self.time_constrained {
            NniLengths::KeepAges
        } else {
            NniLengths::KeepLengths
        }
    }
}

pub struct SearchOptionsBuilder {
    options: SearchOptions,
}

impl SearchOptionsBuilder {
    /// Creates a builder for trees with `nleaf` leaves, the normal leaf included, with the
    /// default settings: a population of 100 random coalescent trees, 50 generations and a
    /// stop after 10 rounds without improvement.
    ///
    /// # Example
    /// ```
    /// use cnetree::search::SearchOptionsBuilder;
    /// let options = SearchOptionsBuilder::new(6).npop(20).seed(3).build().unwrap();
    /// assert_eq!(options.npop, 20);
    /// assert_eq!(options.ngen, 50);
    /// ```
    pub fn new(nleaf: usize) -> SearchOptionsBuilder {
        SearchOptionsBuilder {
            options: SearchOptions {
                nleaf,
                npop: 100,
                ngen: 50,
                max_static: 10,
                loglh_epsilon: 0.001,
                seed: 0,
                init_trees: InitialTrees::Random(CoalescentParams::default()),
                rates: MutationRates::default(),
                max_perturb_retries: MAX_TREE,
                hill_climb_pool: MAX_TREE1,
                refine_pool: MAX_TREE2,
                max_perturb: MAX_PERTURB,
                max_opt_ratio: MAX_OPT,
                max_nni_rounds: 100,
                time_constrained: true,
                infeasible: InfeasiblePolicy::default(),
            },
        }
    }

    pub fn npop(mut self, npop: usize) -> SearchOptionsBuilder {
        self.options.npop = npop;
        self
    }

    pub fn ngen(mut self, ngen: usize) -> SearchOptionsBuilder {
        self.options.ngen = ngen;
        self
    }

    pub fn max_static(mut self, max_static: usize) -> SearchOptionsBuilder {
        self.options.max_static = max_static;
        self
    }

    pub fn loglh_epsilon(mut self, epsilon: f64) -> SearchOptionsBuilder {
        self.options.loglh_epsilon = epsilon;
        self
    }

    pub fn seed(mut self, seed: u64) -> SearchOptionsBuilder {
        self.options.seed = seed;
        self
    }

    pub fn init_trees(mut self, init_trees: InitialTrees) -> SearchOptionsBuilder {
        self.options.init_trees = init_trees;
        self
    }

    pub fn rates(mut self, rates: MutationRates) -> SearchOptionsBuilder {
        self.options.rates = rates;
        self
    }

    pub fn max_perturb_retries(mut self, retries: usize) -> SearchOptionsBuilder {
        self.options.max_perturb_retries = retries;
        self
    }

    /// Sets how many initial trees are climbed and how many local optima are refined.
    pub fn pools(mut self, hill_climb_pool: usize, refine_pool: usize) -> SearchOptionsBuilder {
        self.options.hill_climb_pool = hill_climb_pool;
        self.options.refine_pool = refine_pool;
        self
    }

    pub fn max_perturb(mut self, max_perturb: usize) -> SearchOptionsBuilder {
        self.options.max_perturb = max_perturb;
        self
    }

    pub fn max_opt_ratio(mut self, ratio: usize) -> SearchOptionsBuilder {
        self.options.max_opt_ratio = ratio;
        self
    }

    pub fn max_nni_rounds(mut self, rounds: usize) -> SearchOptionsBuilder {
        self.options.max_nni_rounds = rounds;
        self
    }

    pub fn time_constrained(mut self, time_constrained: bool) -> SearchOptionsBuilder {
        self.options.time_constrained = time_constrained;
        self
    }

    pub fn infeasible(mut self, policy: InfeasiblePolicy) -> SearchOptionsBuilder {
        self.options.infeasible = policy;
        self
    }

    /// Validates the options. Bails with a [`ConfigError`] if the tree size, population sizes
    /// or initial trees do not fit together.
    pub fn build(self) -> Result<SearchOptions> {
        let o = self.options;
        if o.nleaf < 3 {
            bail!(ConfigError::new(format!(
                "A search needs at least 2 samples and the normal leaf, got {} leaves",
                o.nleaf
            )));
        }
        if o.npop == 0 || o.ngen == 0 || o.max_static == 0 {
            bail!(ConfigError::new(
                "Population size, number of generations and stagnation limit must be positive"
            ));
        }
        if o.hill_climb_pool == 0 || o.refine_pool == 0 || o.refine_pool > o.hill_climb_pool {
            bail!(ConfigError::new(format!(
                "Refinement pool of {} does not fit into a climbing pool of {}",
                o.refine_pool, o.hill_climb_pool
            )));
        }
        if o.loglh_epsilon.is_nan() || o.loglh_epsilon < 0.0 {
            bail!(ConfigError::new("Likelihood tolerance must not be negative"));
        }
        match &o.init_trees {
            InitialTrees::Random(params) => {
                if !params.tip_offsets.is_empty() && params.tip_offsets.len() != o.nleaf - 1 {
                    bail!(ConfigError::new(format!(
                        "Expected {} sampling time offsets, got {}",
                        o.nleaf - 1,
                        params.tip_offsets.len()
                    )));
                }
            }
            InitialTrees::Supplied(trees) => {
                if trees.is_empty() {
                    bail!(ConfigError::new("No initial trees supplied"));
                }
                if let Some(tree) = trees.iter().find(|t| t.nleaf != o.nleaf) {
                    bail!(ConfigError::new(format!(
                        "Initial tree has {} leaves, expected {}",
                        tree.nleaf, o.nleaf
                    )));
                }
            }
        }
        Ok(o)
    }
}

/// Visit counts of every topology seen during a search, keyed by canonical key.
#[derive(Debug, Default)]
pub struct TopologyRegistry {
    visits: Mutex<HashMap<String, usize>>,
}

impl TopologyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock only loses visit counts.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.visits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a topology, returns false if it was already known.
    pub fn insert(&self, key: &str) -> bool {
        let mut visits = self.lock();
        if visits.contains_key(key) {
            false
        } else {
            visits.insert(key.to_string(), 0);
            true
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Counts one optimisation of the topology, registering it if needed.
    pub fn record_visit(&self, key: &str) {
        *self.lock().entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn visits(&self, key: &str) -> usize {
        self.lock().get(key).copied().unwrap_or(0)
    }

    /// Number of distinct topologies.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn total_visits(&self) -> usize {
        self.lock().values().sum()
    }
}

/// State of one search run: options, visited topologies and the random number generator.
pub struct SearchContext {
    pub options: SearchOptions,
    registry: TopologyRegistry,
    rng: StdRng,
    exhausted: bool,
}

impl SearchContext {
    pub fn new(options: SearchOptions) -> Self {
        let rng = StdRng::seed_from_u64(options.seed);
        Self {
            options,
            registry: TopologyRegistry::new(),
            rng,
            exhausted: false,
        }
    }

    pub fn registry(&self) -> &TopologyRegistry {
        &self.registry
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Whether the perturbation operator ran out of novel topologies.
    pub fn exhausted(&self) -> bool {
        self.exhausted
    }

    pub(crate) fn mark_exhausted(&mut self) {
        if !self.exhausted {
            warn!(
                "No novel topology found in {} perturbations, search space is exhausted",
                self.options.max_perturb_retries
            );
        }
        self.exhausted = true;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    Unscored,
    Perturbed,
    Scored,
    /// Dropped from every pool of the search.
    Retired,
}

/// A tree managed by a search, together with its canonical key.
#[derive(Debug, Clone)]
pub struct Candidate {
    tree: Tree,
    key: String,
    state: CandidateState,
}

impl Candidate {
    pub fn new(tree: Tree) -> Self {
        let key = tree.canonical_key();
        Candidate {
            tree,
            key,
            state: CandidateState::Unscored,
        }
    }

    pub fn perturbed(tree: Tree) -> Self {
        Candidate {
            state: CandidateState::Perturbed,
            ..Candidate::new(tree)
        }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn into_tree(self) -> Tree {
        self.tree
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> CandidateState {
        self.state
    }

    /// Log-likelihood, `-MAX_NLNL` before scoring.
    pub fn score(&self) -> f64 {
        self.tree.score
    }

    pub fn nlnl(&self) -> f64 {
        -self.tree.score
    }

    pub(crate) fn evaluate<E: TreeEvaluator>(
        &mut self,
        evaluator: &E,
        registry: &TopologyRegistry,
        policy: InfeasiblePolicy,
    ) -> Result<()> {
        let evaluated = evaluator.evaluate(&self.tree).and_then(|evaluation| {
            let key = evaluation.tree().canonical_key();
            if key != self.key {
                bail!(InfeasibleTreeError::new(
                    format!("Evaluation changed topology {} into {key}", self.key),
                    evaluation.tree()
                ));
            }
            Ok(evaluation)
        });
        match evaluated {
            Ok(evaluation) => {
                let nlnl = evaluation.nlnl();
                let mut tree = evaluation.into_tree();
                tree.score = -nlnl;
                self.tree = tree;
            }
            Err(e) if policy == InfeasiblePolicy::Reject && e.is::<InfeasibleTreeError>() => {
                warn!("Rejecting tree {}: {}", self.key, e);
                self.tree.score = -MAX_NLNL;
            }
            Err(e) => return Err(e),
        }
        registry.record_visit(&self.key);
        self.state = CandidateState::Scored;
        Ok(())
    }
}

/// Applies `f` to every candidate, on the rayon pool with the `parallel` feature.
pub(crate) fn for_each_candidate<F>(population: &mut [Candidate], f: F) -> Result<()>
where
    F: Fn(&mut Candidate) -> Result<()> + Sync + Send,
{
    cfg_if::cfg_if! {
        if #[cfg(feature = "parallel")] {
            use rayon::prelude::*;
            population.par_iter_mut().try_for_each(f)
        } else {
            population.iter_mut().try_for_each(f)
        }
    }
}

/// Scores every candidate of the population with the evaluator.
pub fn evaluate_population<E: TreeEvaluator>(
    evaluator: &E,
    population: &mut [Candidate],
    ctx: &SearchContext,
) -> Result<()> {
    let registry = ctx.registry();
    let policy = ctx.options.infeasible;
    for_each_candidate(population, |c| c.evaluate(evaluator, registry, policy))
}

/// Sorts the population by decreasing score and keeps the best `n`. Returns the dropped
/// candidates.
pub fn select_best(population: &mut Vec<Candidate>, n: usize) -> Vec<Candidate> {
    population.sort_by_key(|c| Reverse(f64_h::from(c.score())));
    let mut retired = population.split_off(n.min(population.len()));
    for candidate in retired.iter_mut() {
        candidate.state = CandidateState::Retired;
    }
    if !retired.is_empty() {
        debug!("Retired {} candidates", retired.len());
    }
    retired
}

/// Builds up to `n` distinct starting candidates from the configured initial trees.
pub fn initial_population(ctx: &mut SearchContext, n: usize) -> Result<Vec<Candidate>> {
    let nleaf = ctx.options.nleaf;
    let n = max_topologies(nleaf).map_or(n, |max| n.min(max));
    let mut population = Vec::with_capacity(n);
    match ctx.options.init_trees.clone() {
        InitialTrees::Supplied(trees) => {
            for tree in trees {
                let candidate = Candidate::new(tree);
                if population.len() < n && ctx.registry.insert(candidate.key()) {
                    population.push(candidate);
                }
            }
        }
        InitialTrees::Random(params) => {
            let mut duplicates = 0;
            while population.len() < n {
                let tree = generate_random_tree(nleaf, ctx.options.rates, &params, &mut ctx.rng)?;
                let candidate = Candidate::new(tree);
                if ctx.registry.insert(candidate.key()) {
                    population.push(candidate);
                } else {
                    duplicates += 1;
                    if duplicates > ctx.options.max_perturb_retries * n {
                        warn!(
                            "Stopped drawing initial trees after {duplicates} duplicates, \
                             using {} trees",
                            population.len()
                        );
                        break;
                    }
                }
            }
        }
    }
    info!("Initial population of {} distinct trees", population.len());
    Ok(population)
}

/// Best tree found by a search, with the search's counters.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub best: Tree,
    /// Negative log-likelihood of the best tree.
    pub nlnl: f64,
    /// Generations, perturbation rounds or topologies, depending on the search.
    pub iterations: usize,
    /// Number of distinct topologies seen.
    pub topologies: usize,
    /// Number of calls to the evaluator.
    pub optimisations: usize,
    pub exhausted: bool,
}

impl SearchResult {
    pub(crate) fn new(best: Candidate, iterations: usize, ctx: &SearchContext) -> Self {
        let nlnl = best.nlnl();
        let best = best.into_tree();
        if let Err(e) = best.check_invariants() {
            warn!("Best tree does not satisfy the tree invariants: {e}");
        }
        let result = SearchResult {
            best,
            nlnl,
            iterations,
            topologies: ctx.registry().len(),
            optimisations: ctx.registry().total_visits(),
            exhausted: ctx.exhausted(),
        };
        info!(
            "Best tree with negative log-likelihood {}, {} distinct topologies searched in {} \
             optimisations",
            result.nlnl, result.topologies, result.optimisations
        );
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchAlgorithm {
    Evolutionary,
    HillClimbing,
    Exhaustive,
}

/// Runs the chosen search with the evaluator.
pub fn run_search<E: TreeEvaluator>(
    algorithm: SearchAlgorithm,
    evaluator: &E,
    ctx: &mut SearchContext,
) -> Result<SearchResult> {
    match algorithm {
        SearchAlgorithm::Evolutionary => EvolutionarySearch::new(evaluator).run(ctx),
        SearchAlgorithm::HillClimbing => HillClimbing::new(evaluator).run(ctx),
        SearchAlgorithm::Exhaustive => ExhaustiveSearch::new(evaluator).run(ctx),
    }
}

#[cfg(test)]
pub(crate) mod test_evaluators;
#[cfg(test)]
mod search_tests;
