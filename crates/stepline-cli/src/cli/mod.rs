//! CLI command definitions and dispatch for the `stepline` binary.
//!
//! Uses clap derive macros for argument parsing. The CLI is the operator
//! surface of the engine: it starts and stops runs and inspects their state;
//! the run loop itself lives in embedding hosts.

pub mod queue;
pub mod run;
pub mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Operate resumable workflow runs.
#[derive(Parser)]
#[command(name = "stepline", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a subject batch, persist it as the queue, and arm the run.
    Start {
        /// Path to a JSON file: an array of objects mapping field names to
        /// string values. Every field is required to be non-empty unless
        /// listed with --optional.
        subjects: PathBuf,

        /// Field names allowed to be empty (repeatable).
        #[arg(long = "optional", value_name = "FIELD")]
        optional: Vec<String>,
    },

    /// Request a graceful stop; workers honor it at their next suspension
    /// point, finishing any step already in flight.
    Stop,

    /// Show the run checkpoint, counters, and queue depth.
    Status,

    /// List the subjects still in the queue.
    #[command(alias = "ls")]
    Queue,
}
