use crate::tree::Tree;
use crate::Result;

/// Outcome of optimising the continuous parameters of one tree topology.
#[derive(Debug, Clone)]
pub struct Evaluation {
    nlnl: f64,
    tree: Tree,
}

impl Evaluation {
    pub fn new(nlnl: f64, tree: Tree) -> Self {
        Evaluation { nlnl, tree }
    }
    /// Negative log-likelihood of the optimised tree.
    pub fn nlnl(&self) -> f64 {
        self.nlnl
    }
    pub fn tree(&self) -> &Tree {
        &self.tree
    }
    pub fn into_tree(self) -> Tree {
        self.tree
    }
}

/// The likelihood engine the searches delegate scoring to. An implementation owns the
/// observed copy-number data and its model options.
///
/// `evaluate` may change branch lengths and mutation rates but must return a tree with the
/// same topology and leaf set. Trees are shared across the rayon pool when the `parallel`
/// feature is on, hence `Sync`.
pub trait TreeEvaluator: Sync {
    /// Optimises the parameters of `tree` and returns the optimised tree with its negative
    /// log-likelihood.
    fn evaluate(&self, tree: &Tree) -> Result<Evaluation>;

    /// Negative log-likelihood of `tree` as it is, without optimisation.
    fn nlnl(&self, tree: &Tree) -> Result<f64> {
        Ok(self.evaluate(tree)?.nlnl())
    }
}

impl<E: TreeEvaluator + ?Sized> TreeEvaluator for &E {
    fn evaluate(&self, tree: &Tree) -> Result<Evaluation> {
        (**self).evaluate(tree)
    }

    fn nlnl(&self, tree: &Tree) -> Result<f64> {
        (**self).nlnl(tree)
    }
}
