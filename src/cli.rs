use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use cnetree::tree::{CoalescentParams, MutationRates};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub(super) struct Cli {
    /// Log debug output
    #[arg(short, long)]
    pub(super) verbose: bool,

    #[command(subcommand)]
    pub(super) command: Commands,
}

#[derive(Subcommand)]
pub(super) enum Commands {
    /// Simulates random coalescent trees of the samples and a normal genome
    Simulate {
        /// Number of sampled genomes, the normal genome not included
        #[arg(short, long)]
        nsample: usize,

        /// Number of trees to simulate
        #[arg(short = 'r', long, default_value_t = 1)]
        ntree: usize,

        /// Seed of the random number generator
        #[arg(short, long, default_value_t = 0)]
        seed: u64,

        #[command(flatten)]
        coalescent: CoalescentArgs,

        #[command(flatten)]
        rates: RateArgs,

        /// Output file for the trees in newick format
        #[arg(short, long, value_name = "TREE_FILE")]
        output: PathBuf,

        /// Directory for the edge tables of the trees, with mutation counts
        #[arg(short, long, value_name = "DIR")]
        edge_tables: Option<PathBuf>,
    },
    /// Lists every rooted topology of a small number of samples
    Enumerate {
        /// Number of sampled genomes, the normal genome not included
        #[arg(short, long)]
        nsample: usize,

        /// Length of the branches between coalescence levels
        #[arg(short, long, default_value_t = 1.0)]
        blen: f64,

        /// Output file for the trees in newick format
        #[arg(short, long, value_name = "TREE_FILE")]
        output: PathBuf,
    },
}

#[derive(Args)]
pub(super) struct CoalescentArgs {
    /// Effective population size
    #[arg(long, default_value_t = 2.0)]
    ne: f64,

    /// Exponential growth rate of the population
    #[arg(long, default_value_t = 0.0)]
    beta: f64,

    /// Generation time
    #[arg(long, default_value_t = 1.0)]
    gtime: f64,

    /// Sampling time offset of each sample, comma separated
    #[arg(short, long, value_delimiter = ',')]
    tip_offsets: Vec<f64>,
}

impl From<CoalescentArgs> for CoalescentParams {
    fn from(args: CoalescentArgs) -> Self {
        CoalescentParams {
            ne: args.ne,
            beta: args.beta,
            gtime: args.gtime,
            tip_offsets: args.tip_offsets,
        }
    }
}

#[derive(Args)]
pub(super) struct RateArgs {
    /// Mutation rate used when no other rate is given
    #[arg(long, default_value_t = 0.02)]
    mu: f64,

    /// Segment duplication rate per site
    #[arg(long, default_value_t = 0.0)]
    dup: f64,

    /// Segment deletion rate per site
    #[arg(long, default_value_t = 0.0)]
    del: f64,

    /// Chromosome gain rate
    #[arg(long, default_value_t = 0.0)]
    chr_gain: f64,

    /// Chromosome loss rate
    #[arg(long, default_value_t = 0.0)]
    chr_loss: f64,

    /// Whole genome doubling rate
    #[arg(long, default_value_t = 0.0)]
    wgd: f64,

    /// Number of sites of a genome
    #[arg(long, default_value_t = 4401)]
    pub(super) nbins: usize,
}

impl From<&RateArgs> for MutationRates {
    fn from(args: &RateArgs) -> Self {
        MutationRates {
            mu: args.mu,
            dup: args.dup,
            del: args.del,
            chr_gain: args.chr_gain,
            chr_loss: args.chr_loss,
            wgd: args.wgd,
        }
    }
}
