//! Markwise CLI: enrich a bookmark feed with generated names and
//! descriptions, then organize it into a folder tree.

mod commands;
mod records;
mod render;

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
