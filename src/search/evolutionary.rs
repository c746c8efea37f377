use anyhow::bail;
use log::{debug, info};

use crate::likelihood::TreeEvaluator;
use crate::search::{
    evaluate_population, initial_population, perturb_tree_set, select_best, Candidate,
    SearchContext, SearchResult,
};
use crate::tree::MAX_NLNL;
use crate::Result;

/// Generational search: every generation adds `npop` perturbed offspring to the population and
/// keeps the `npop` best trees.
pub struct EvolutionarySearch<'a, E: TreeEvaluator> {
    evaluator: &'a E,
}

impl<'a, E: TreeEvaluator> EvolutionarySearch<'a, E> {
    pub fn new(evaluator: &'a E) -> Self {
        EvolutionarySearch { evaluator }
    }

    pub fn run(&self, ctx: &mut SearchContext) -> Result<SearchResult> {
        let npop = ctx.options.npop;
        let mut population = initial_population(ctx, npop)?;
        if population.is_empty() {
            bail!("Empty initial population");
        }
        let mut best = f64::NEG_INFINITY;
        let mut stale = 0;
        let mut generation = 0;
        while generation < ctx.options.ngen {
            // Offspring come from the population as it was at the start of the generation.
            let mut offspring = Vec::with_capacity(npop);
            for _ in 0..npop {
                let perturbation = perturb_tree_set(&population, ctx)?;
                if perturbation.novel {
                    offspring.push(Candidate::perturbed(perturbation.tree));
                } else if ctx.exhausted() {
                    break;
                }
            }
            if generation == 0 {
                evaluate_population(self.evaluator, &mut population, ctx)?;
            }
            evaluate_population(self.evaluator, &mut offspring, ctx)?;
            let novel = offspring.len();
            population.append(&mut offspring);
            select_best(&mut population, npop);
            generation += 1;

            let top = population[0].score();
            info!(
                "Generation {generation}: best log-likelihood {top}, mean {}, {novel} new trees",
                mean_score(&population)
            );
            if top > best + ctx.options.loglh_epsilon {
                best = top;
                stale = 0;
            } else {
                stale += 1;
            }
            if stale >= ctx.options.max_static {
                debug!("No improvement in {stale} generations");
                break;
            }
            let registry = ctx.registry();
            if ctx.exhausted()
                && registry.total_visits() > ctx.options.max_opt_ratio * registry.len()
            {
                info!("Search space exhausted after {generation} generations");
                break;
            }
        }
        let Some(best) = population.into_iter().next() else {
            bail!("No tree left in the population");
        };
        Ok(SearchResult::new(best, generation, ctx))
    }
}

fn mean_score(population: &[Candidate]) -> f64 {
    let scored = population
        .iter()
        .map(|c| c.score())
        .filter(|&s| s > -MAX_NLNL)
        .collect::<Vec<_>>();
    if scored.is_empty() {
        f64::NAN
    } else {
        scored.iter().sum::<f64>() / scored.len() as f64
    }
}
