//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod graph;
mod run;

pub use run::RunArgs;

use anyhow::Result;
use clap::Subcommand;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Submit jobs and monitor them until they finish
    Run(RunArgs),
    /// Print the job status transition table
    Graph,
}

pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run(args) => run::handle_run(args).await,
        Commands::Graph => graph::print_graph(),
    }
}
