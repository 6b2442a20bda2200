//! Main entry point for the braak_dge application.
//!
//! The pipeline runs as one sequential workflow over a fixed input
//! snapshot:
//! 1. Read the intensity matrix, sample metadata and probe annotations.
//! 2. Resolve the canonical sample table and drop unusable probes.
//! 3. Normalize (log2 + quantile) and collapse probes to genes.
//! 4. Screen outlier samples on the first principal component.
//! 5. Run the two-group and ordinal trend tests, each with its own FDR
//!    family, and reconcile their significant sets.
//! 6. Write result tables, gene lists and run provenance.

mod annotation;
mod cli;
mod dedup;
mod enrichment;
mod error;
mod expression;
mod io;
mod metadata;
mod normalization;
mod outlier;
mod overlap;
mod pipeline;
mod stats;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use log::info;

fn main() -> Result<()> {
    env_logger::init();

    let args = Cli::parse();
    info!("starting analysis with arguments: {:?}", args);

    rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads)
        .build_global()?;
    info!("using {} threads", args.threads);

    cli::run(&args)?;

    info!("analysis finished successfully");
    Ok(())
}
