mod arg_parser;
mod config;

use arg_parser::{ArgParser, SubCommand};
use config::ServerConfig;

use anyhow::{Context, Result};
use clap::Parser;
use joblib::types::{JobId, OutputSource};
use joblib::{JobCoordinator, JobStatus};
use std::io::Write;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Jobs re-execute this binary to reach the init stage. That has to happen before any
    // threads exist, so it comes ahead of the runtime and argument parsing.
    let mut raw_args = std::env::args();
    if raw_args.nth(1).as_deref() == Some(joblib::INIT_MARKER) {
        joblib::isolation::init::run(raw_args);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = ArgParser::parse();
    let config = ServerConfig::load(args.config.as_deref())?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    let status = runtime.block_on(async move {
        match args.sub_command {
            SubCommand::Run {
                user,
                force,
                command,
                args,
            } => run(config, &user, force, command, args).await,
        }
    })?;

    std::process::exit(exit_code(&status))
}

/// Run one job to completion, streaming its output to our own stdout and stderr.
async fn run(
    config: ServerConfig,
    user: &str,
    force: bool,
    command: String,
    args: Vec<String>,
) -> Result<JobStatus> {
    let coordinator = JobCoordinator::spawn(config.jobs, config.policy)
        .context("Failed to start job coordinator")?;
    let result = run_job(&coordinator, user, force, command, args).await;
    coordinator
        .shutdown()
        .await
        .context("Failed to shut down job coordinator")?;
    result
}

async fn run_job(
    coordinator: &JobCoordinator,
    user: &str,
    force: bool,
    command: String,
    args: Vec<String>,
) -> Result<JobStatus> {
    let job_id = coordinator
        .start_job(user, command.as_str(), args)
        .await
        .with_context(|| format!("Failed to start {}", command))?;
    tracing::info!(%job_id, "job running, Ctrl-C stops it");

    let mut output = coordinator.stream_output(job_id).await?;
    let mut stopping = false;
    loop {
        tokio::select! {
            record = output.next() => match record {
                Some(record) => print_record(record.source, &record.text)?,
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                stop_in_background(coordinator.clone(), job_id, force);
            }
        }
    }

    let status = coordinator.wait_job(job_id).await?;
    eprintln!("job {} {}", job_id, status);
    Ok(status)
}

/// Stop without blocking the output loop, so everything printed on the way down still shows.
fn stop_in_background(coordinator: JobCoordinator, job_id: JobId, force: bool) {
    tokio::spawn(async move {
        if let Err(err) = coordinator.stop_job(job_id, force).await {
            tracing::warn!(%job_id, error = %err, "stop failed");
        }
    });
}

fn print_record(source: OutputSource, text: &str) -> Result<()> {
    let written = match source {
        OutputSource::Stdout => writeln!(std::io::stdout().lock(), "{}", text),
        OutputSource::Stderr => writeln!(std::io::stderr().lock(), "{}", text),
    };
    written.context("Failed to write job output")
}

/// Shell-style exit code for the job's final status.
fn exit_code(status: &JobStatus) -> i32 {
    match status {
        JobStatus::Exited { code } => *code,
        JobStatus::Killed { signal } => 128 + signal,
        _ => 1,
    }
}
