use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use blinkgate_core::Orchestrator;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod calibrate;
mod config;
mod enroll;
mod replay;
mod store;

use config::Config;
use enroll::EnrollOutcome;
use replay::SessionTrace;
use store::EnrollmentStore;

#[derive(Parser)]
#[command(name = "blinkgate", version, about = "Blink-gated face enrollment")]
struct Cli {
    /// TOML file overriding the environment configuration
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay an EAR trace through the blink detector and report the blinks
    Calibrate {
        /// JSON array of per-frame EAR values (null for no face)
        trace: PathBuf,
    },
    /// Enroll an identity from a recorded session trace
    Enroll {
        #[arg(long)]
        identity: String,
        #[arg(long)]
        trace: PathBuf,
    },
    /// List active enrollments
    List,
    /// Show the active enrollment of an identity
    Show {
        #[arg(long)]
        identity: String,
    },
    /// Remove the enrollment of an identity
    Remove {
        #[arg(long)]
        identity: String,
    },
    /// Show configuration and enrollment count
    Status,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Calibrate { trace } => {
            let ears = calibrate::load_trace(&trace)?;
            let report = calibrate::calibrate(&ears, config.liveness.blink)?;
            tracing::info!(blinks = report.blink_count, frames = report.frames, "calibration done");
            print_json(&report)?;
        }
        Command::Enroll { identity, trace } => return enroll(&config, identity, &trace).await,
        Command::List => {
            let store = open_store(&config).await?;
            print_json(&store.list().await?)?;
        }
        Command::Show { identity } => {
            let store = open_store(&config).await?;
            let Some(record) = store.get(&identity).await? else {
                eprintln!("no enrollment for {identity}");
                return Ok(ExitCode::FAILURE);
            };
            tracing::debug!(dim = record.descriptor.len(), "descriptor decrypted");
            print_json(&record.info)?;
        }
        Command::Remove { identity } => {
            let store = open_store(&config).await?;
            let removed = store.remove(&identity).await?;
            print_json(&serde_json::json!({ "identity": identity, "removed": removed }))?;
            if !removed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Status => {
            let store = open_store(&config).await?;
            print_json(&serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "db_path": config.db_path,
                "image_dir": config.image_dir,
                "enrollments": store.count().await?,
                "liveness": config.liveness,
            }))?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn enroll(config: &Config, identity: String, trace_path: &Path) -> Result<ExitCode> {
    let trace = SessionTrace::load(trace_path)?;
    let max_capture_attempts = trace.frames.len();
    let store = open_store(config).await?;

    let ports = replay::replay_ports(trace, store);
    let mut orchestrator = Orchestrator::new(identity, config.liveness.clone(), ports)
        .context("invalid liveness configuration")?;
    orchestrator.on_state_change(|change| {
        if let Some(failure) = &change.failure {
            tracing::warn!(from = ?change.from, %failure, "enrollment failed");
        }
    });

    let mut interrupt = None;
    let outcome = enroll::run(&mut orchestrator, max_capture_attempts, |handle| {
        interrupt = Some(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, cancelling enrollment");
                handle.cancel();
            }
        }));
    })
    .await;
    if let Some(task) = interrupt {
        task.abort();
    }

    let outcome = outcome.context("enrollment aborted")?;
    print_json(&outcome)?;
    Ok(match outcome {
        EnrollOutcome::Enrolled { .. } => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

async fn open_store(config: &Config) -> Result<EnrollmentStore> {
    EnrollmentStore::open(&config.db_path, &config.image_dir)
        .await
        .with_context(|| format!("failed to open store at {}", config.db_path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
