mod cli;
mod manifest;
mod report;

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use kiln_core::Job;
use kiln_scheduler::{GroupResults, Scheduler, SchedulerConfig};

use crate::cli::{CliArgs, Command, RunArgs};
use crate::manifest::Manifest;
use crate::report::Report;

fn main() -> Result<ExitCode> {
    kiln_core::config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    match args.command {
        Command::Run(run_args) => run(run_args),
    }
}

fn run(args: RunArgs) -> Result<ExitCode> {
    let config = load_config(&args)?;
    let manifest = Manifest::from_file(&args.manifest)?;
    let base_dir = args
        .manifest
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let groups = manifest.build_jobs(&base_dir)?;

    let applied: Arc<Mutex<Vec<GroupResults>>> = Arc::default();
    let sink = Arc::clone(&applied);
    let mut scheduler = Scheduler::builder(config)
        .on_results(move |results| {
            if let Ok(mut sink) = sink.lock() {
                sink.push(results);
            }
        })
        .retry_prompt(ask_retry_on_stdin)
        .start()
        .context("failed to start scheduler")?;

    let started = Instant::now();
    let mut total = 0;
    for (group, jobs) in groups {
        if group.critical {
            scheduler.mark_critical(kiln_core::GroupId(group.id));
        }
        total += jobs.len();
        scheduler.add_jobs(jobs, group.apply)?;
    }
    info!(groups = manifest.groups.len(), jobs = total, "manifest submitted");

    // Critical groups first, then everything else.
    scheduler.process_async_results(true, true)?;
    scheduler.finish_all_compilation()?;

    let mut results = scheduler.drain_staged_results();
    if let Ok(mut applied) = applied.lock() {
        results.append(&mut *applied);
    }
    let report = Report::new(&results, started.elapsed(), scheduler.metrics());
    scheduler.shutdown()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }

    Ok(if report.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn load_config(args: &RunArgs) -> Result<SchedulerConfig> {
    let mut config = match &args.config {
        Some(path) => SchedulerConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SchedulerConfig::from_env().context("invalid KILN_* environment")?,
    };

    if args.direct {
        config.allow_out_of_process_workers = false;
    }
    if let Some(workers) = args.workers {
        config.num_worker_threads = workers;
    }
    if args.pipes {
        config.use_pipes = true;
    }
    if args.retry {
        config.prompt_to_retry_on_error = true;
    }
    config.worker_executable = resolve_worker(&config.worker_executable);
    config.validate()?;
    Ok(config)
}

/// A bare worker name resolves to a sibling of this executable when one
/// exists there, otherwise it is left to `PATH`.
fn resolve_worker(configured: &Path) -> PathBuf {
    if configured.components().count() != 1 {
        return configured.to_path_buf();
    }
    let sibling = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(configured)))
        .map(|p| match std::env::consts::EXE_EXTENSION {
            "" => p,
            ext if p.extension().is_none() => p.with_extension(ext),
            _ => p,
        });
    match sibling {
        Some(path) if path.is_file() => path,
        _ => configured.to_path_buf(),
    }
}

fn ask_retry_on_stdin(failed: &[&Job]) -> bool {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{} job(s) failed:", failed.len());
    for job in failed.iter().take(10) {
        let first = job.errors().first().map(String::as_str).unwrap_or("no diagnostics");
        let _ = writeln!(stderr, "  group {} job {}: {first}", job.group(), job.id());
    }
    let _ = write!(stderr, "retry failed jobs? [y/N] ");
    let _ = stderr.flush();

    let mut answer = String::new();
    if let Err(e) = std::io::stdin().lock().read_line(&mut answer) {
        warn!(error = %e, "could not read retry answer");
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}
