//! Stepline operator CLI entry point.
//!
//! Binary name: `stepline`
//!
//! Parses CLI arguments, opens the state store, then dispatches to the
//! appropriate command handler.

mod cli;
mod state;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,stepline=debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    let state = AppState::init().await?;

    match cli.command {
        Commands::Start { subjects, optional } => {
            cli::run::start(&state, &subjects, &optional, cli.json).await?;
        }
        Commands::Stop => {
            cli::run::stop(&state, cli.json).await?;
        }
        Commands::Status => {
            cli::status::status(&state, cli.json).await?;
        }
        Commands::Queue => {
            cli::queue::list(&state, cli.json).await?;
        }
    }

    Ok(())
}
