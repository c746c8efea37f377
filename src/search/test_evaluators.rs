use std::sync::atomic::{AtomicUsize, Ordering};

use hashbrown::HashSet;

use crate::likelihood::{Evaluation, TreeEvaluator};
use crate::tree::{InfeasibleTreeError, Tree};
use crate::Result;

fn clades(tree: &Tree) -> HashSet<Vec<usize>> {
    tree.internal_postorder()
        .into_iter()
        .map(|node| {
            let mut tips = tree.tips_below(node);
            tips.sort();
            tips
        })
        .collect()
}

/// Scores a tree by the number of clades of a target tree it lacks, plus one.
pub(crate) struct CladeDistance {
    target: HashSet<Vec<usize>>,
    calls: AtomicUsize,
}

impl CladeDistance {
    pub(crate) fn new(target: &Tree) -> Self {
        CladeDistance {
            target: clades(target),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TreeEvaluator for CladeDistance {
    fn evaluate(&self, tree: &Tree) -> Result<Evaluation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let present = clades(tree);
        let missing = self.target.difference(&present).count();
        Ok(Evaluation::new(missing as f64 + 1.0, tree.clone()))
    }
}

/// Reports one topology as infeasible and scores the rest like [`CladeDistance`].
pub(crate) struct RejectingEvaluator {
    pub(crate) inner: CladeDistance,
    pub(crate) rejected: String,
}

impl TreeEvaluator for RejectingEvaluator {
    fn evaluate(&self, tree: &Tree) -> Result<Evaluation> {
        if tree.canonical_key() == self.rejected {
            return Err(InfeasibleTreeError::new("rejected topology", tree).into());
        }
        self.inner.evaluate(tree)
    }
}

/// Returns a fixed tree in place of the evaluated one.
pub(crate) struct ReplacingEvaluator {
    pub(crate) replacement: Tree,
}

impl TreeEvaluator for ReplacingEvaluator {
    fn evaluate(&self, _tree: &Tree) -> Result<Evaluation> {
        Ok(Evaluation::new(1.0, self.replacement.clone()))
    }
}
