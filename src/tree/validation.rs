use std::error::Error;
use std::fmt;

use anyhow::bail;
use approx::relative_eq;

use crate::tree::{Tree, BLEN_MIN};
use crate::Result;

const AGE_TOLERANCE: f64 = 1e-6;

/// A tree whose branch lengths or node ages violate the timing constraints of the model.
/// Carries a textual dump of the offending tree.
pub struct InfeasibleTreeError {
    pub reason: String,
    pub dump: String,
}

impl InfeasibleTreeError {
    pub(crate) fn new(reason: impl Into<String>, tree: &Tree) -> Self {
        Self {
            reason: reason.into(),
            dump: tree.to_string(),
        }
    }
}

impl fmt::Debug for InfeasibleTreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n{}", self.reason, self.dump)
    }
}

impl fmt::Display for InfeasibleTreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Infeasible tree: {}", self.reason)
    }
}

impl Error for InfeasibleTreeError {}

/// Checks that the tip ages agree with the sampling offsets: the latest sample has age zero and
/// every other tip is older by its distance to the latest sampling time.
pub fn is_tip_age_valid(tip_ages: &[f64], tip_offsets: &[f64]) -> bool {
    if tip_ages.len() != tip_offsets.len() {
        return false;
    }
    let max_offset = tip_offsets.iter().copied().fold(f64::MIN, f64::max);
    tip_ages
        .iter()
        .zip(tip_offsets)
        .all(|(age, offset)| relative_eq!(*age, max_offset - offset, epsilon = AGE_TOLERANCE))
}

/// Checks that `time + age` is the same for every node, i.e. ages were derived from the
/// current times.
pub fn is_age_time_consistent(times: &[f64], ages: &[f64]) -> bool {
    if times.len() != ages.len() || times.is_empty() {
        return false;
    }
    let total = times[0] + ages[0];
    times
        .iter()
        .zip(ages)
        .all(|(t, a)| relative_eq!(t + a, total, epsilon = AGE_TOLERANCE))
}

impl Tree {
    /// Fails if any branch is shorter than `min` or longer than `max`.
    pub fn check_blens(&self, min: f64, max: f64) -> Result<()> {
        for edge in &self.edges {
            if edge.length < min - AGE_TOLERANCE || edge.length > max + AGE_TOLERANCE {
                bail!(InfeasibleTreeError::new(
                    format!(
                        "Branch {} -> {} has length {} outside [{min}, {max}]",
                        edge.start + 1,
                        edge.end + 1,
                        edge.length
                    ),
                    self
                ));
            }
        }
        Ok(())
    }

    /// Verifies the structural and timing invariants of a tree with derived nodes: branch
    /// lengths of at least [`BLEN_MIN`], times accumulated from the root, ages derived from
    /// times and parents older than their children.
    pub fn check_invariants(&self) -> Result<()> {
        if self.nodes.iter().filter(|n| n.is_root).count() != 1 {
            bail!(InfeasibleTreeError::new("Tree must have exactly one root", self));
        }
        self.check_blens(BLEN_MIN, f64::INFINITY)?;
        if !relative_eq!(self.nodes[self.root].time, 0.0) {
            bail!(InfeasibleTreeError::new("Root time must be zero", self));
        }
        for edge in &self.edges {
            let (start, end) = (&self.nodes[edge.start], &self.nodes[edge.end]);
            if !relative_eq!(end.time, start.time + edge.length, epsilon = AGE_TOLERANCE) {
                bail!(InfeasibleTreeError::new(
                    format!("Time of {} does not match its ancestral branches", end),
                    self
                ));
            }
            if start.age <= end.age {
                bail!(InfeasibleTreeError::new(
                    format!("{} is not older than its daughter {}", start, end),
                    self
                ));
            }
        }
        if !is_age_time_consistent(&self.node_times(), &self.node_ages()) {
            bail!(InfeasibleTreeError::new(
                "Node ages are not consistent with node times",
                self
            ));
        }
        Ok(())
    }
}
