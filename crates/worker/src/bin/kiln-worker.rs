//! kiln-worker: compiles batches handed over by a kiln scheduler.
//!
//! File mode answers one batch and exits:
//!   kiln-worker --input <request> --output <response>
//! Pipe mode serves batches over stdin/stdout until stdin closes:
//!   kiln-worker --pipe
//!
//! Logs go to stderr, which the scheduler's process inherits.

use std::io::{stdin, stdout, BufReader, BufWriter};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::debug;

use kiln_core::DigestCompiler;

/// Kiln worker process.
#[derive(Parser, Debug)]
#[command(name = "kiln-worker", version, about)]
struct Cli {
    /// Request file to compile.
    #[arg(long, requires = "output", conflicts_with = "pipe")]
    input: Option<PathBuf>,

    /// Response file to write.
    #[arg(long, requires = "input")]
    output: Option<PathBuf>,

    /// Serve frames over stdin/stdout instead of files.
    #[arg(long)]
    pipe: bool,
}

fn main() -> Result<()> {
    kiln_core::config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let compiler = DigestCompiler;

    if cli.pipe {
        let served = kiln_worker::serve_pipe(
            &compiler,
            BufReader::new(stdin().lock()),
            BufWriter::new(stdout().lock()),
        )
        .context("pipe worker failed")?;
        debug!(batches = served, "pipe worker done");
        return Ok(());
    }

    let (Some(input), Some(output)) = (cli.input, cli.output) else {
        bail!("either --pipe or both --input and --output are required");
    };
    let jobs = kiln_worker::serve_file(&compiler, &input, &output)
        .with_context(|| format!("failed to answer {}", input.display()))?;
    debug!(jobs, output = %output.display(), "batch answered");
    Ok(())
}
