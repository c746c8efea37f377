use anyhow::bail;
use log::debug;
use rand::seq::SliceRandom;

use crate::likelihood::TreeEvaluator;
use crate::search::{evaluate_population, select_best, Candidate, SearchContext, TopologyRegistry};
use crate::tree::{random_nnis, Tree};
use crate::Result;

/// A tree produced by the perturbation operator.
#[derive(Debug, Clone)]
pub struct Perturbation {
    pub tree: Tree,
    /// False if no unseen topology was found within the retry limit.
    pub novel: bool,
}

/// Applies a burst of random NNI moves, half as many as there are samples beyond two.
pub fn perturb_tree(tree: &Tree, ctx: &mut SearchContext) -> Result<Tree> {
    let nsample = tree.nleaf.saturating_sub(1);
    let count = (nsample.saturating_sub(2) / 2).max(1);
    let lengths = ctx.options.nni_lengths();
    random_nnis(tree, count, ctx.rng(), lengths)
}

/// Perturbs a randomly chosen member of `trees` until the result has a topology that the
/// registry has not seen, and registers it. After `max_perturb_retries` failed attempts the
/// context is marked exhausted and the last perturbed tree is returned as not novel.
pub fn perturb_tree_set(trees: &[Candidate], ctx: &mut SearchContext) -> Result<Perturbation> {
    let perturbation = perturb_until_novel(trees, None, ctx)?;
    if !perturbation.novel {
        ctx.mark_exhausted();
    }
    Ok(perturbation)
}

/// Like [`perturb_tree_set`], but a topology only has to be missing from `seen`. The result is
/// inserted into `seen` and the registry of the context. Running out of retries does not mark
/// the context exhausted.
pub fn perturb_tree_unseen(
    trees: &[Candidate],
    seen: &TopologyRegistry,
    ctx: &mut SearchContext,
) -> Result<Perturbation> {
    let perturbation = perturb_until_novel(trees, Some(seen), ctx)?;
    if perturbation.novel {
        ctx.registry().insert(&perturbation.tree.canonical_key());
    }
    Ok(perturbation)
}

fn perturb_until_novel(
    trees: &[Candidate],
    seen: Option<&TopologyRegistry>,
    ctx: &mut SearchContext,
) -> Result<Perturbation> {
    if trees.is_empty() {
        bail!("Cannot perturb an empty set of trees");
    }
    let mut retries = 0;
    loop {
        let Some(parent) = trees.choose(ctx.rng()) else {
            bail!("Cannot perturb an empty set of trees");
        };
        let tree = perturb_tree(parent.tree(), ctx)?;
        let key = tree.canonical_key();
        let novel = match seen {
            Some(seen) => seen.insert(&key),
            None => ctx.registry().insert(&key),
        };
        if novel {
            return Ok(Perturbation { tree, novel: true });
        }
        retries += 1;
        if retries > ctx.options.max_perturb_retries {
            return Ok(Perturbation { tree, novel: false });
        }
    }
}

/// Steepest-ascent local search over NNI neighbourhoods. Each round scores every neighbour of
/// the current tree and moves to the best one if it improves the log-likelihood by more than
/// `loglh_epsilon`. The candidate must already be scored.
pub fn hill_climb_nni<E: TreeEvaluator>(
    candidate: Candidate,
    evaluator: &E,
    ctx: &SearchContext,
) -> Result<Candidate> {
    let lengths = ctx.options.nni_lengths();
    let mut current = candidate;
    for round in 0..ctx.options.max_nni_rounds {
        let mut tree = current.tree().clone();
        tree.generate_neighbors()?;
        let mut neighbours = tree
            .nni_moves(lengths)?
            .iter()
            .map(|nni| nni.apply(&tree, lengths).map(Candidate::perturbed))
            .collect::<Result<Vec<_>>>()?;
        if neighbours.is_empty() {
            break;
        }
        for neighbour in &neighbours {
            ctx.registry().insert(neighbour.key());
        }
        evaluate_population(evaluator, &mut neighbours, ctx)?;
        select_best(&mut neighbours, 1);
        let Some(best) = neighbours.pop() else {
            break;
        };
        if best.score() > current.score() + ctx.options.loglh_epsilon {
            debug!(
                "NNI round {round}: log-likelihood {} -> {}",
                current.score(),
                best.score()
            );
            current = best;
        } else {
            break;
        }
    }
    Ok(current)
}
