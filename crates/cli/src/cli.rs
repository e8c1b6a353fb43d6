use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Batch compiler driver for kiln.
///
/// Submits the jobs of a manifest to a scheduler, waits for every group
/// and prints a per-group summary.
#[derive(Parser, Debug)]
#[command(name = "kiln", version, about = "Batch compiler driver for kiln")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile every job in a manifest.
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Manifest TOML with `[[group]]` and `[[group.job]]` tables
    pub manifest: PathBuf,

    /// Scheduler config file (default: built-in defaults plus KILN_* overrides)
    #[arg(long, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Compile on the dispatch thread instead of launching workers
    #[arg(long)]
    pub direct: bool,

    /// Number of worker processes
    #[arg(long)]
    pub workers: Option<usize>,

    /// Keep workers alive and talk to them over stdin/stdout
    #[arg(long)]
    pub pipes: bool,

    /// Offer to retry failed jobs
    #[arg(long)]
    pub retry: bool,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}
