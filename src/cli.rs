use clap::{Parser, command};
use std::path::PathBuf;

/// Prepare and launch one cycle of the real-time flash flood system
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the YAML run configuration
    pub config: PathBuf,

    /// Prepare control documents and assimilation data but do not invoke
    /// the simulation engine
    #[arg(long)]
    pub dry_run: bool,
}

pub fn get_args() -> Args {
    Args::parse()
}
