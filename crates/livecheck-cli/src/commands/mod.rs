//! CLI command definitions.

pub mod analyze;
pub mod inspect;
pub mod verify;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Livecheck - face liveness frame pipeline
#[derive(Parser)]
#[command(name = "livecheck")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TOML config file; LIVECHECK_* environment variables override it
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay still images as a camera session and print one JSON line per frame
    Analyze(analyze::AnalyzeArgs),
    /// Print a detection model's tensor contract
    Inspect(inspect::InspectArgs),
    /// Hash a model file and compare it with an expected SHA-256
    VerifyModel(verify::VerifyArgs),
}
