//! Command-line argument definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "bulksms", version, about = "Bulk SMS campaign dispatcher")]
pub struct Cli {
    /// Path to the dispatch database
    #[arg(long, default_value = "bulksms.db", global = true)]
    pub db: PathBuf,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate a campaign file without sending anything
    Validate {
        /// Campaign JSON file
        file: PathBuf,
    },
    /// Import a campaign file and run it to completion
    Run {
        /// Campaign JSON file
        file: PathBuf,
        /// Override the campaign's send speed (messages per hour)
        #[arg(long)]
        speed: Option<u32>,
    },
    /// Resume the active (paused or interrupted) session, if any
    Resume,
    /// Record an opt-out for a phone number
    Optout {
        /// E.164 phone number
        phone: String,
        /// Reason recorded with the opt-out
        #[arg(long, default_value = "operator request")]
        reason: String,
    },
    /// Delete exhausted message rows
    ClearExhausted,
}
