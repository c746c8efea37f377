use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Error};
use clap::Parser;
use ftail::Ftail;
use log::{info, LevelFilter};
use rand::rngs::StdRng;
use rand::SeedableRng;

use cnetree::io::{write_edge_table_to_file, write_newick_to_file};
use cnetree::tree::{enumerate_topologies, generate_random_tree, CoalescentParams, MutationRates};

mod cli;
use crate::cli::{Cli, Commands};

type Result<T> = std::result::Result<T, Error>;

const NEWICK_PRECISION: usize = 5;

fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            bail!("Unable to parse command line arguments: \n {}", error)
        }
    };
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    Ftail::new()
        .console(level)
        .init()
        .map_err(|e| anyhow!("Unable to set up logging: {e:?}"))?;
    info!("Successfully parsed the command line parameters");

    match cli.command {
        Commands::Simulate {
            nsample,
            ntree,
            seed,
            coalescent,
            rates,
            output,
            edge_tables,
        } => {
            let nbins = rates.nbins;
            simulate(
                nsample,
                ntree,
                seed,
                coalescent.into(),
                (&rates).into(),
                nbins,
                &output,
                edge_tables.as_deref(),
            )
        }
        Commands::Enumerate {
            nsample,
            blen,
            output,
        } => {
            let trees = enumerate_topologies(nsample + 1, blen)?;
            info!("Found {} topologies of {} samples", trees.len(), nsample);
            write_newick_to_file(&trees, NEWICK_PRECISION, &output)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn simulate(
    nsample: usize,
    ntree: usize,
    seed: u64,
    params: CoalescentParams,
    rates: MutationRates,
    nbins: usize,
    output: &Path,
    edge_tables: Option<&Path>,
) -> Result<()> {
    if !params.tip_offsets.is_empty() && params.tip_offsets.len() != nsample {
        bail!(
            "Got {} sampling time offsets for {} samples",
            params.tip_offsets.len(),
            nsample
        );
    }
    info!("Simulating {ntree} trees of {nsample} samples with seed {seed}");
    let mut rng = StdRng::seed_from_u64(seed);
    let rate = rates.event_rate(nbins);
    let mut trees = Vec::with_capacity(ntree);
    for _ in 0..ntree {
        let mut tree = generate_random_tree(nsample + 1, rates, &params, &mut rng)?;
        tree.assign_nmuts(rate);
        trees.push(tree);
    }
    write_newick_to_file(&trees, NEWICK_PRECISION, output)?;
    if let Some(dir) = edge_tables {
        fs::create_dir_all(dir)?;
        for (i, tree) in trees.iter().enumerate() {
            write_edge_table_to_file(tree, true, &dir.join(format!("tree_{}.txt", i + 1)))?;
        }
    }
    info!("Run done");
    Ok(())
}
