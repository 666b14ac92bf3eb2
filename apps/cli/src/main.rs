//! burnwatch CLI: burned-area detection from satellite imagery.
//!
//! Acquires tiles, computes NDVI rasters, trains and runs the burned-area
//! classifier, and evaluates its predictions against labels.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
