//! Run command
//!
//! Submits every job in a JSON description file, then runs the monitoring
//! loop until all of them are final.

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use gantry_core::JobStatus;
use gantry_core::dto::job::{JobSnapshot, JobSpec};
use gantry_gateway::{FileCredentialProvider, ProcessGateway};
use gantry_manager::{Config, JobManager, ManagerContext, MonitoringLoop, SubmitOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Args)]
pub struct RunArgs {
    /// JSON file holding a list of job descriptions
    jobs: PathBuf,

    /// Keep submitting remaining batches when one fails
    #[arg(long)]
    keep_going: bool,

    /// Leave jobs that failed to submit in `failed` instead of `new`
    #[arg(long)]
    keep_on_fail: bool,

    /// Stop monitoring after this many rounds
    #[arg(long)]
    rounds: Option<usize>,

    /// Bridge program executing remote commands
    #[arg(long, env = "GANTRY_GATEWAY")]
    gateway: PathBuf,

    /// Extra argument for the bridge program (repeatable)
    #[arg(long = "gateway-arg")]
    gateway_args: Vec<String>,

    /// Grid credential file
    #[arg(long, env = "GANTRY_CREDENTIAL")]
    credential: PathBuf,

    /// Lifetime of the credential file, in hours
    #[arg(long, default_value_t = 12)]
    credential_hours: i64,
}

pub async fn handle_run(args: RunArgs) -> Result<()> {
    let raw = std::fs::read_to_string(&args.jobs)
        .with_context(|| format!("Failed to read {}", args.jobs.display()))?;
    let specs: Vec<JobSpec> =
        serde_json::from_str(&raw).context("Failed to parse job descriptions")?;

    let config = Config::from_env().context("Failed to load configuration")?;
    let shutdown = CancellationToken::new();
    let gateway = ProcessGateway::new(&args.gateway).with_args(args.gateway_args);
    let credentials = FileCredentialProvider::new(
        &args.credential,
        chrono::Duration::hours(args.credential_hours),
    );
    let ctx = ManagerContext::new(
        config,
        Arc::new(gateway),
        Arc::new(credentials),
        shutdown.clone(),
    )?;

    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping");
            interrupt.cancel();
        }
    });

    let manager = JobManager::new(Arc::clone(&ctx));
    let opts = SubmitOptions {
        keep_going: args.keep_going,
        keep_on_fail: args.keep_on_fail,
    };

    println!("{}", format!("Submitting {} job(s):", specs.len()).bold());
    for spec in specs {
        let name = spec.name.clone();
        let job = manager.create_job(spec);
        match manager.submit(job.root, opts).await {
            Ok(report) => {
                println!(
                    "  {} Job {} ({}): {} target(s) submitted",
                    "✓".green(),
                    job.to_string().cyan(),
                    name,
                    report.submitted.len()
                );
                for (fqid, reason) in &report.failures {
                    println!("    {} {}: {}", "✗".red(), fqid, reason.dimmed());
                }
            }
            Err(e) => println!(
                "  {} Job {} ({}): {}",
                "✗".red(),
                job.to_string().cyan(),
                name,
                e
            ),
        }
    }
    println!();

    let settled = MonitoringLoop::new(Arc::clone(&ctx))
        .run_until_settled(args.rounds)
        .await;

    print_summary(&manager.snapshots());
    if !settled {
        println!("{}", "Some jobs are still active.".yellow());
    }

    shutdown.cancel();
    ctx.pool.shutdown().await;
    Ok(())
}

fn print_summary(jobs: &[JobSnapshot]) {
    println!("{}", "Summary:".bold());
    for job in jobs {
        println!(
            "  {} Job {} {} {}",
            "▸".cyan(),
            job.fqid.dimmed(),
            job.name,
            colorize_status(job.status)
        );
        for (status, count) in job.status_counts() {
            println!("      {:>5} {}", count, colorize_status(status));
        }
    }
}

fn colorize_status(status: JobStatus) -> ColoredString {
    let text = status.as_str();
    match status {
        JobStatus::Completed => text.green(),
        JobStatus::Failed | JobStatus::Unknown | JobStatus::Incomplete => text.red(),
        JobStatus::Killed | JobStatus::Removed => text.dimmed(),
        JobStatus::Running | JobStatus::Completing => text.cyan(),
        _ => text.yellow(),
    }
}
