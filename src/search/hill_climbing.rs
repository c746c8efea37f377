use anyhow::bail;
use log::{debug, info};
use rand::Rng;

use crate::likelihood::TreeEvaluator;
use crate::search::{
    evaluate_population, hill_climb_nni, initial_population, perturb_tree_unseen, select_best,
    Candidate, SearchContext, SearchResult, TopologyRegistry,
};
use crate::Result;

/// Iterated local search: the best initial trees are climbed with NNI moves, then the best
/// local optima are repeatedly perturbed and climbed again.
///
/// A perturbation has to reach a topology that no earlier climb started from. Neighbours
/// scored during a climb do not count, so a perturbed tree may already have been scored.
pub struct HillClimbing<'a, E: TreeEvaluator> {
    evaluator: &'a E,
}

impl<'a, E: TreeEvaluator> HillClimbing<'a, E> {
    pub fn new(evaluator: &'a E) -> Self {
        HillClimbing { evaluator }
    }

    pub fn run(&self, ctx: &mut SearchContext) -> Result<SearchResult> {
        let npop = ctx.options.npop;
        let mut pool = initial_population(ctx, npop)?;
        evaluate_population(self.evaluator, &mut pool, ctx)?;
        select_best(&mut pool, ctx.options.hill_climb_pool);

        let starts = TopologyRegistry::new();
        let mut climbed = Vec::with_capacity(pool.len());
        for candidate in pool {
            starts.insert(candidate.key());
            let optimum = hill_climb_nni(candidate, self.evaluator, ctx)?;
            starts.insert(optimum.key());
            climbed.push(optimum);
        }
        let mut pool = climbed;
        select_best(&mut pool, ctx.options.refine_pool);
        let Some(first) = pool.first() else {
            bail!("No initial tree could be scored");
        };
        info!("Best local optimum after climbing: {}", first.score());

        let epsilon = ctx.options.loglh_epsilon;
        let mut count = 0;
        let mut iterations = 0;
        while count < ctx.options.max_perturb {
            count += 1;
            iterations += 1;
            let i = ctx.rng().gen_range(0..pool.len());
            let mut perturbation = perturb_tree_unseen(&pool[i..=i], &starts, ctx)?;
            if !perturbation.novel {
                debug!("No unseen neighbour of pool member {i}, perturbing the whole pool");
                perturbation = perturb_tree_unseen(&pool, &starts, ctx)?;
            }
            if !perturbation.novel {
                ctx.mark_exhausted();
                info!("Stopping hill climbing, no unseen topology left");
                break;
            }
            let mut perturbed = vec![Candidate::perturbed(perturbation.tree)];
            evaluate_population(self.evaluator, &mut perturbed, ctx)?;
            let Some(candidate) = perturbed.pop() else {
                continue;
            };
            let candidate = hill_climb_nni(candidate, self.evaluator, ctx)?;
            starts.insert(candidate.key());

            let best = pool[0].score();
            let last = pool.len() - 1;
            if candidate.score() > best + epsilon {
                debug!("Perturbation {iterations}: new best {}", candidate.score());
                pool[last] = candidate;
                count = 0;
            } else if candidate.score() > pool[last].score() {
                pool[last] = candidate;
            } else {
                continue;
            }
            select_best(&mut pool, ctx.options.refine_pool);
        }

        let Some(best) = pool.into_iter().next() else {
            bail!("No tree left in the pool");
        };
        Ok(SearchResult::new(best, iterations, ctx))
    }
}
