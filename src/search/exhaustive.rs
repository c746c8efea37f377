use anyhow::bail;
use log::{debug, info};

use crate::likelihood::TreeEvaluator;
use crate::search::{
    for_each_candidate, select_best, Candidate, ConfigError, InitialTrees, SearchContext,
    SearchOptions, SearchResult, TopologyRegistry,
};
use crate::tree::{topologies, LARGE_TREE};
use crate::Result;

/// Branch length of the enumerated trees before optimisation.
const START_BLEN: f64 = 1.0;
/// Number of topologies built and scored at a time.
const CHUNK_SIZE: usize = 256;

/// Scores every rooted topology of the samples. Only available below [`LARGE_TREE`] samples.
pub struct ExhaustiveSearch<'a, E: TreeEvaluator> {
    evaluator: &'a E,
}

impl<'a, E: TreeEvaluator> ExhaustiveSearch<'a, E> {
    pub fn new(evaluator: &'a E) -> Self {
        ExhaustiveSearch { evaluator }
    }

    pub fn run(&self, ctx: &mut SearchContext) -> Result<SearchResult> {
        let nleaf = ctx.options.nleaf;
        let nsample = nleaf.saturating_sub(1);
        if nsample >= LARGE_TREE {
            bail!(ConfigError::new(format!(
                "Exhaustive search is limited to fewer than {LARGE_TREE} samples, got {nsample}"
            )));
        }
        info!("Exhaustive search over all topologies of {nsample} samples");

        let evaluator = self.evaluator;
        let mut trees = topologies(nleaf, START_BLEN)?;
        let mut best: Option<Candidate> = None;
        let mut iterations = 0;
        loop {
            let mut chunk = Vec::with_capacity(CHUNK_SIZE);
            for tree in trees.by_ref().take(CHUNK_SIZE) {
                let mut tree = tree?;
                if let InitialTrees::Random(params) = &ctx.options.init_trees {
                    if !params.tip_offsets.is_empty() {
                        tree.shift_tip_times(&params.tip_offsets)?;
                    }
                }
                tree.rates = ctx.options.rates;
                let candidate = Candidate::new(tree);
                ctx.registry().insert(candidate.key());
                chunk.push(candidate);
            }
            if chunk.is_empty() {
                break;
            }
            iterations += chunk.len();
            let options = &ctx.options;
            let registry = ctx.registry();
            for_each_candidate(&mut chunk, |c| {
                optimise_to_convergence(c, evaluator, registry, options)
            })?;
            // The earlier best stays ahead of later trees with the same score.
            if let Some(previous) = best.take() {
                chunk.insert(0, previous);
            }
            select_best(&mut chunk, 1);
            best = chunk.pop();
            debug!("Scored {iterations} topologies");
        }
        let Some(best) = best else {
            bail!("No topology was scored");
        };
        Ok(SearchResult::new(best, iterations, ctx))
    }
}

/// Re-evaluates the candidate from its best state until `max_static` evaluations in a row
/// bring no improvement, with at most `ngen` evaluations.
fn optimise_to_convergence<E: TreeEvaluator>(
    candidate: &mut Candidate,
    evaluator: &E,
    registry: &TopologyRegistry,
    options: &SearchOptions,
) -> Result<()> {
    candidate.evaluate(evaluator, registry, options.infeasible)?;
    let mut stale = 0;
    for _ in 1..options.ngen {
        if stale >= options.max_static {
            break;
        }
        let mut next = candidate.clone();
        next.evaluate(evaluator, registry, options.infeasible)?;
        if next.score() > candidate.score() + options.loglh_epsilon {
            *candidate = next;
            stale = 0;
        } else {
            stale += 1;
        }
    }
    Ok(())
}
