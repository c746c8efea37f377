use anyhow::bail;
use log::debug;
use rand::seq::index::sample;
use rand::Rng;

use crate::tree::{Edge, InfeasibleTreeError, MutationRates, Tree, BLEN_MAX, BLEN_MIN};
use crate::Result;

/// Number of distinct rooted topologies over `n + 1` samples, `(2n - 1)!!`.
pub const NUM_TREES: [usize; 11] = [
    1, 1, 3, 15, 105, 945, 10395, 135135, 2027025, 34459425, 654729075,
];

/// Number of samples from which on the topologies are no longer enumerated.
pub const LARGE_TREE: usize = 11;

const MAX_COALESCENT_ATTEMPTS: usize = 1000;

/// Number of distinct topologies of a tree with `nleaf` leaves, one of them the normal leaf
/// attached to the root. `None` if there are too many to enumerate.
pub fn max_topologies(nleaf: usize) -> Option<usize> {
    NUM_TREES.get(nleaf.checked_sub(2)?).copied()
}

/// Parameters of the coalescent used to draw random initial trees.
#[derive(Debug, Clone, PartialEq)]
pub struct CoalescentParams {
    /// Effective population size.
    pub ne: f64,
    /// Exponential growth rate, zero for a constant population.
    pub beta: f64,
    /// Generation time, scales all branch lengths.
    pub gtime: f64,
    /// Sampling time of each sample relative to the first one. Empty if all samples were taken
    /// at the same time.
    pub tip_offsets: Vec<f64>,
}

impl Default for CoalescentParams {
    fn default() -> Self {
        Self {
            ne: 2.0,
            beta: 0.0,
            gtime: 1.0,
            tip_offsets: Vec::new(),
        }
    }
}

impl CoalescentParams {
    fn real_time(&self, tau: f64) -> f64 {
        let t = if self.beta > 0.0 {
            (1.0 + self.beta * tau).ln() / self.beta
        } else {
            tau
        };
        t * self.gtime
    }
}

fn exp_waiting_time<R: Rng + ?Sized>(rate: f64, rng: &mut R) -> f64 {
    let u: f64 = 1.0 - rng.gen::<f64>();
    -u.ln() / rate
}

/// Draws a random tree with `nleaf - 1` samples from the coalescent, without checking the
/// branch length bounds. The samples are leaves `0..nleaf - 1`, the root is `nleaf`, the
/// normal leaf `nleaf - 1` hangs off the root with a branch of [`BLEN_MIN`] and the most
/// recent common ancestor of the samples is `2 * nleaf - 2`.
pub fn generate_coalescent_tree<R: Rng + ?Sized>(
    nleaf: usize,
    params: &CoalescentParams,
    rng: &mut R,
) -> Result<Tree> {
    if nleaf < 2 {
        bail!("A tree needs at least 2 leaves, got {nleaf}");
    }
    if params.ne <= 0.0 || params.gtime <= 0.0 {
        bail!(
            "Population size and generation time must be positive, got {} and {}",
            params.ne,
            params.gtime
        );
    }
    let nsample = nleaf - 1;
    let mut edges = Vec::with_capacity(2 * nleaf - 2);
    let mut lineages: Vec<(usize, f64)> = (0..nsample).map(|i| (i, 0.0)).collect();
    let mut next_id = nleaf + 1;
    let mut tau = 0.0;
    while lineages.len() > 1 {
        let k = lineages.len() as f64;
        tau += exp_waiting_time(k * (k - 1.0) / 2.0 / params.ne, rng);
        let t = params.real_time(tau);
        let picked = sample(rng, lineages.len(), 2).into_vec();
        let (i, j) = (picked[0].max(picked[1]), picked[0].min(picked[1]));
        let (a, ta) = lineages.swap_remove(i);
        let (b, tb) = lineages.swap_remove(j);
        edges.push(Edge::new(edges.len(), next_id, a, t - ta));
        edges.push(Edge::new(edges.len(), next_id, b, t - tb));
        lineages.push((next_id, t));
        next_id += 1;
    }
    let (mrca, t_mrca) = lineages[0];
    let t_root = params.real_time(tau + exp_waiting_time(1.0 / params.ne, rng));
    edges.push(Edge::new(edges.len(), nleaf, mrca, t_root - t_mrca));
    edges.push(Edge::new(edges.len(), nleaf, nleaf - 1, BLEN_MIN));
    Tree::from_edge_list(nleaf, edges)
}

/// Draws coalescent trees until one has all branch lengths within [`BLEN_MIN`] and
/// [`BLEN_MAX`], then shifts the samples by their sampling offsets.
pub fn generate_random_tree<R: Rng + ?Sized>(
    nleaf: usize,
    rates: MutationRates,
    params: &CoalescentParams,
    rng: &mut R,
) -> Result<Tree> {
    for attempt in 0..MAX_COALESCENT_ATTEMPTS {
        let mut tree = generate_coalescent_tree(nleaf, params, rng)?;
        if tree.check_blens(BLEN_MIN, BLEN_MAX).is_err() {
            debug!("Rejected coalescent tree {attempt} with a branch out of bounds");
            continue;
        }
        if !params.tip_offsets.is_empty() {
            tree.shift_tip_times(&params.tip_offsets)?;
        }
        tree.rates = rates;
        return Ok(tree);
    }
    bail!(
        "Could not draw a coalescent tree with branch lengths in [{BLEN_MIN}, {BLEN_MAX}] in \
         {MAX_COALESCENT_ATTEMPTS} attempts"
    )
}

impl Tree {
    /// Creates a tree whose samples are placed by their sampling times: the branch leading to
    /// sample `i` is set so that the sample lies `total_time + tip_offsets[i]` below the root.
    /// Samples without an offset are placed at `total_time`, the normal leaf is not moved.
    pub fn with_tip_times(
        nleaf: usize,
        edges: Vec<Edge>,
        tip_offsets: &[f64],
        total_time: f64,
    ) -> Result<Tree> {
        let mut tree = Tree::from_edge_list(nleaf, edges)?;
        let normal = tree.normal_leaf();
        for leaf in (0..nleaf).filter(|&l| Some(l) != normal) {
            let path = tree.ancestral_edges(leaf);
            let Some((&terminal, above_edges)) = path.split_first() else {
                continue;
            };
            let above: f64 = above_edges.iter().map(|&e| tree.edges[e].length).sum();
            let offset = tip_offsets.get(leaf).copied().unwrap_or(0.0);
            let length = total_time + offset - above;
            if length < BLEN_MIN {
                bail!(InfeasibleTreeError::new(
                    format!(
                        "Sample {} cannot be placed at time {} below its ancestors at {above}",
                        leaf + 1,
                        total_time + offset
                    ),
                    &tree
                ));
            }
            tree.edges[terminal].length = length;
        }
        tree.calculate_node_times();
        tree.calculate_age_from_time();
        Ok(tree)
    }
}

#[derive(Debug, Clone)]
enum Clade {
    Leaf(usize),
    Pair(Box<Clade>, Box<Clade>),
}

impl Clade {
    /// Every clade obtained by attaching `leaf` to one of the branches of this clade,
    /// including the branch above it.
    fn insert_everywhere(&self, leaf: usize) -> Vec<Clade> {
        let mut out = vec![Clade::Pair(Box::new(self.clone()), Box::new(Clade::Leaf(leaf)))];
        if let Clade::Pair(a, b) = self {
            for a_new in a.insert_everywhere(leaf) {
                out.push(Clade::Pair(Box::new(a_new), b.clone()));
            }
            for b_new in b.insert_everywhere(leaf) {
                out.push(Clade::Pair(a.clone(), Box::new(b_new)));
            }
        }
        out
    }

    /// Appends the edges of the clade, numbering internal nodes from `next_id` so that
    /// daughters come before their parents. Returns the id of the clade's root and its number
    /// of levels above the leaves.
    fn push_edges(
        &self,
        next_id: &mut usize,
        edges: &mut Vec<(usize, usize, usize)>,
    ) -> (usize, usize) {
        match self {
            Clade::Leaf(id) => (*id, 0),
            Clade::Pair(a, b) => {
                let (a_id, a_level) = a.push_edges(next_id, edges);
                let (b_id, b_level) = b.push_edges(next_id, edges);
                let id = *next_id;
                *next_id += 1;
                let level = a_level.max(b_level) + 1;
                edges.push((id, a_id, level - a_level));
                edges.push((id, b_id, level - b_level));
                (id, level)
            }
        }
    }
}

/// Lazy enumeration of every rooted topology over `nleaf - 1` samples by stepwise addition.
/// The trees are ultrametric with each internal node `blen` above its highest daughter, the
/// normal leaf hangs off the root with a branch of [`BLEN_MIN`].
///
/// Partial topologies are expanded depth first, so only a few of them are held at a time.
pub struct Topologies {
    nleaf: usize,
    blen: f64,
    stack: Vec<(Clade, usize)>,
}

impl Topologies {
    fn build(&self, clade: &Clade) -> Result<Tree> {
        let nleaf = self.nleaf;
        let mut next_id = nleaf + 1;
        let mut levels = Vec::with_capacity(2 * nleaf - 2);
        let (mrca, _) = clade.push_edges(&mut next_id, &mut levels);
        let mut edges: Vec<(usize, usize, f64)> = levels
            .into_iter()
            .map(|(start, end, diff)| (start, end, diff as f64 * self.blen))
            .collect();
        edges.push((nleaf, mrca, self.blen));
        edges.push((nleaf, nleaf - 1, BLEN_MIN));
        Tree::from_edges(nleaf, &edges)
    }
}

impl Iterator for Topologies {
    type Item = Result<Tree>;

    fn next(&mut self) -> Option<Self::Item> {
        let nsample = self.nleaf - 1;
        while let Some((clade, leaf)) = self.stack.pop() {
            if leaf == nsample {
                return Some(self.build(&clade));
            }
            self.stack.extend(
                clade
                    .insert_everywhere(leaf)
                    .into_iter()
                    .rev()
                    .map(|c| (c, leaf + 1)),
            );
        }
        None
    }
}

/// Starts a lazy enumeration of the topologies of `nleaf - 1` samples, see [`Topologies`].
pub fn topologies(nleaf: usize, blen: f64) -> Result<Topologies> {
    if nleaf < 2 || nleaf - 1 >= LARGE_TREE {
        bail!(
            "Enumerating all topologies requires between 1 and {} samples, got {}",
            LARGE_TREE - 1,
            nleaf.saturating_sub(1)
        );
    }
    if blen < BLEN_MIN {
        bail!("Branch length {blen} is below the minimum of {BLEN_MIN}");
    }
    Ok(Topologies {
        nleaf,
        blen,
        stack: vec![(Clade::Leaf(0), 1)],
    })
}

/// Collects every topology of `nleaf - 1` samples, see [`Topologies`].
pub fn enumerate_topologies(nleaf: usize, blen: f64) -> Result<Vec<Tree>> {
    let trees = topologies(nleaf, blen)?.collect::<Result<Vec<_>>>()?;
    debug!("Enumerated {} topologies of {} samples", trees.len(), nleaf - 1);
    Ok(trees)
}
