//! jobtrack: start long-running remote jobs and track them to completion.
//!
//! Active jobs are persisted under the state directory, so a job started
//! without `--wait` (or interrupted) can be picked up again by `watch`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobtrack_client::HttpProgressService;
use jobtrack_core::defaults;
use jobtrack_jobs::{
    CoordinatorConfig, CoordinatorEvent, CoordinatorPhase, CoordinatorRegistry,
    CoordinatorStatus, EventEnvelope, FinishReport, JobClass, ProgressService, RecoveryBootstrap,
    TrackedUnit,
};
use jobtrack_store::FileStore;

#[derive(Parser)]
#[command(name = "jobtrack")]
#[command(author, version, about = "Track long-running remote jobs to completion")]
#[command(propagate_version = true)]
struct Cli {
    /// Directory holding persisted job records (default: $JOBTRACK_STATE_DIR or .jobtrack)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a job (scrape, vectorization or corpus_vectorization)
    Start {
        /// Job class to start
        class: JobClass,

        /// Site to scrape; repeat for several sites
        #[arg(long = "site", value_name = "NAME")]
        sites: Vec<String>,

        /// Block until the job finishes
        #[arg(long)]
        wait: bool,
    },

    /// Resume jobs left running by a previous process and wait for them
    Watch,

    /// Stop tracking a job and clear its persisted record
    Stop {
        /// Job class to stop
        class: JobClass,
    },

    /// Show the persisted record of every job class
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_tracing();

    let cli = Cli::parse();
    let state_dir = cli.state_dir.unwrap_or_else(|| {
        std::env::var_os("JOBTRACK_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(defaults::STATE_DIR))
    });

    let service =
        HttpProgressService::from_env().context("Failed to configure the progress service")?;
    let registry = build_registry(Arc::new(service), &state_dir, CoordinatorConfig::from_env());

    let result = match cli.command {
        Commands::Start { class, sites, wait } => cmd_start(&registry, class, &sites, wait).await,
        Commands::Watch => cmd_watch(&registry).await,
        Commands::Stop { class } => cmd_stop(&registry, class),
        Commands::Status { json } => cmd_status(&registry, json),
    };

    registry.shutdown();
    result
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: "jobtrack=info")
fn init_tracing() -> Option<WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "jobtrack=info,jobtrack_jobs=info,jobtrack_client=info,jobtrack_store=info".into()
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = Path::new(path).parent().unwrap_or(Path::new("."));
        let file_name = Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("jobtrack.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        // Logs go to stderr; stdout is reserved for command output.
        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stderr)"),
        "Logging initialized"
    );
    guard
}

fn build_registry(
    service: Arc<dyn ProgressService>,
    state_dir: &Path,
    config: CoordinatorConfig,
) -> CoordinatorRegistry {
    CoordinatorRegistry::builder(service, Arc::new(FileStore::new(state_dir)))
        .with_config(config)
        .build()
}

/// Site names become tracked units numbered from 1 in argument order.
fn site_units(sites: &[String]) -> Vec<TrackedUnit> {
    sites
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(i, name)| TrackedUnit::new(i as u64 + 1, name))
        .collect()
}

async fn cmd_start(
    registry: &CoordinatorRegistry,
    job_class: JobClass,
    sites: &[String],
    wait: bool,
) -> anyhow::Result<()> {
    if !job_class.is_multi_unit() && !sites.is_empty() {
        warn!(%job_class, "--site is ignored for single-unit job classes");
    }

    let events = registry.events();
    let episode_id = registry
        .start(job_class, site_units(sites))
        .await
        .with_context(|| format!("Failed to start {job_class}"))?;
    println!("{job_class}: started (episode {episode_id})");

    if wait {
        wait_for_finish(registry, events, BTreeSet::from([job_class])).await
    } else {
        println!("{job_class}: run `jobtrack watch` to follow progress");
        Ok(())
    }
}

async fn cmd_watch(registry: &CoordinatorRegistry) -> anyhow::Result<()> {
    let events = registry.events();
    let report = RecoveryBootstrap::run(registry);

    for job_class in &report.discarded {
        println!("{job_class}: discarded stale record");
    }
    for (job_class, error) in &report.failed {
        eprintln!("{job_class}: could not resume: {error}");
    }
    if report.recovered.is_empty() {
        println!("No running jobs to watch");
        return Ok(());
    }
    for job_class in &report.recovered {
        println!("{job_class}: resumed");
    }

    wait_for_finish(registry, events, report.recovered.iter().copied().collect()).await
}

fn cmd_stop(registry: &CoordinatorRegistry, job_class: JobClass) -> anyhow::Result<()> {
    if registry.stop(job_class)? {
        println!("{job_class}: stopped");
        return Ok(());
    }

    // Not tracked by this process; drop whatever a previous run left behind.
    let records = registry.records();
    let had_record = !matches!(records.load(job_class), Ok(None));
    records
        .clear(job_class)
        .with_context(|| format!("Failed to clear the {job_class} record"))?;
    if had_record {
        println!("{job_class}: cleared persisted record");
    } else {
        println!("{job_class}: not running");
    }
    Ok(())
}

fn cmd_status(registry: &CoordinatorRegistry, json: bool) -> anyhow::Result<()> {
    let rows = status_rows(registry);
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    for row in &rows {
        let job_class = row["jobClass"].as_str().unwrap_or("?");
        if let Some(error) = row["error"].as_str() {
            println!("{job_class}: unreadable record ({error})");
        } else if row["active"].as_bool().unwrap_or(false) {
            let units: Vec<&str> = row["units"]
                .as_array()
                .map(|u| u.iter().filter_map(|v| v.as_str()).collect())
                .unwrap_or_default();
            println!(
                "{job_class}: active since {} ({})",
                row["startedAt"].as_str().unwrap_or("?"),
                units.join(", ")
            );
        } else {
            println!("{job_class}: idle");
        }
    }
    Ok(())
}

fn status_rows(registry: &CoordinatorRegistry) -> Vec<serde_json::Value> {
    JobClass::ALL
        .iter()
        .map(|job_class| match registry.records().load(*job_class) {
            Ok(Some(record)) => serde_json::json!({
                "jobClass": job_class.as_str(),
                "active": record.active,
                "units": record.unit_names,
                "startedAt": record.started_at.to_rfc3339(),
            }),
            Ok(None) => serde_json::json!({
                "jobClass": job_class.as_str(),
                "active": false,
            }),
            Err(e) => serde_json::json!({
                "jobClass": job_class.as_str(),
                "active": false,
                "error": e.to_string(),
            }),
        })
        .collect()
}

/// Print progress until every class in `pending` leaves Running.
///
/// Ctrl-C returns early; the records are kept for the next `watch`.
async fn wait_for_finish(
    registry: &CoordinatorRegistry,
    mut events: broadcast::Receiver<EventEnvelope>,
    mut pending: BTreeSet<JobClass>,
) -> anyhow::Result<()> {
    let mut failures = 0usize;

    while !pending.is_empty() {
        let received = tokio::select! {
            received = events.recv() => received,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, detaching");
                println!("Interrupted; run `jobtrack watch` to resume");
                return Ok(());
            }
        };

        let envelope = match received {
            Ok(envelope) => envelope,
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "Progress printer lagged");
                pending.retain(|c| registry.status(*c).phase != CoordinatorPhase::Idle);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let job_class = envelope.payload.job_class();
        if !pending.contains(&job_class) {
            continue;
        }
        match envelope.payload {
            CoordinatorEvent::Progress { status } => {
                for line in progress_lines(&status) {
                    println!("{line}");
                }
            }
            CoordinatorEvent::Finished { report } => {
                println!("{}", finish_line(&report));
                failures += report.incomplete_units().len();
                pending.remove(&job_class);
            }
            CoordinatorEvent::Aborted { error, .. } => {
                eprintln!("{job_class}: aborted: {error}");
                failures += 1;
                pending.remove(&job_class);
            }
            CoordinatorEvent::Stopped { .. } => {
                println!("{job_class}: stopped");
                pending.remove(&job_class);
            }
            CoordinatorEvent::Started { .. } | CoordinatorEvent::StartFailed { .. } => {}
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} unit(s) did not complete");
    }
    Ok(())
}

fn progress_lines(status: &CoordinatorStatus) -> Vec<String> {
    status
        .units
        .iter()
        .map(|unit| match status.snapshots.get(&unit.id) {
            Some(s) => format!(
                "{} [{}] {}/{} ({:.0}%) {}",
                status.job_class,
                unit.name,
                s.current,
                s.total,
                s.fraction() * 100.0,
                s.status
            ),
            None => format!("{} [{}] waiting", status.job_class, unit.name),
        })
        .collect()
}

fn finish_line(report: &FinishReport) -> String {
    let incomplete = report.incomplete_units();
    let done = report.units.len() - incomplete.len();
    let mut line = format!(
        "{}: finished, {done}/{} unit(s) completed",
        report.job_class,
        report.units.len()
    );
    if !incomplete.is_empty() {
        let names: Vec<&str> = incomplete.iter().map(|u| u.name.as_str()).collect();
        line.push_str(&format!(" (incomplete: {})", names.join(", ")));
    }
    line
}
