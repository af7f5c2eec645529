//! Threat Pipeline Binary
//!
//! Runs one scoring and delta publication pass over the topology graph.
//!
//! ## Configuration
//!
//! Environment variables (a `.env` file is loaded first):
//! - see [`threat_delta::PipelineConfig`] for thresholds, retries and paths
//! - `RUST_LOG`: Log level filter (default: `threat_pipeline=info,threat_delta=info`)
//! - `LOG_FORMAT`: "json" for structured logs, "pretty" for development (default: pretty)
//! - `GITHUB_TOKEN`, `SRC_GITHUB_*`, `OUT_GITHUB_*`: GitHub backend (feature `github`)
//! - `OUT_GITHUB_COMMIT_MESSAGE`: commit message for published objects
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin threat_pipeline -- --data-dir ./data            # dry run
//! cargo run --bin threat_pipeline -- --data-dir ./data --commit   # publish
//! cargo run --bin threat_pipeline -- --commit --safe              # publish under the safe prefix
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use threat_delta::{
    ChangeRecord, ContentStore, FsContentStore, IdentifierTailScorer, PipelineConfig,
    PublicationOrchestrator, RunMode, RunReport, Scorer,
};

#[derive(Parser)]
#[command(name = "threat_pipeline")]
#[command(about = "Score the topology graph and publish the threat delta feed", long_about = None)]
#[command(version)]
struct Cli {
    /// Execute Publishing (default: dry run, report only)
    #[arg(long)]
    commit: bool,

    /// Route every write to the safe path prefix
    #[arg(long)]
    safe: bool,

    /// Print the full run report as JSON
    #[arg(long)]
    json: bool,

    /// Storage backend
    #[arg(long, value_enum, default_value = "fs", env = "PIPELINE_BACKEND")]
    backend: Backend,

    /// Root directory of the filesystem backend
    #[arg(long, default_value = "./data", env = "PIPELINE_DATA_DIR")]
    data_dir: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    /// Local directory
    Fs,
    /// GitHub contents API (feature `github`)
    Github,
}

/// Initialize the tracing subscriber with JSON or pretty format
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "threat_pipeline=info,threat_delta=info".into());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .flatten_event(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

/// `id: prev → curr (score: x.xx)`
fn describe(change: &ChangeRecord) -> String {
    let prev = change
        .prev_status()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "new".to_string());
    let curr = change
        .curr_status()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "removed".to_string());
    let score = change
        .curr
        .as_ref()
        .or(change.prev.as_ref())
        .map(|f| f.threat_score)
        .unwrap_or_default();
    format!("{}: {} → {} (score: {:.2})", change.id, prev, curr, score)
}

fn print_summary(report: &RunReport) {
    println!("Run {} ({})", report.run_id, report.mode);
    println!("Snapshot: {}", report.snapshot_id);
    println!(
        "Nodes: {} ({} suspicious, {} malicious)",
        report.nodes, report.suspicious, report.malicious
    );
    println!("Changes: {}", report.feed.changes.len());

    let crossings: Vec<&ChangeRecord> = report.feed.threshold_crossings().take(3).collect();
    if !crossings.is_empty() {
        println!("Top priority changes:");
        for change in crossings {
            println!("  {}", describe(change));
        }
    }

    if !report.warnings.is_empty() {
        println!("Scoring degraded for {} node(s)", report.warnings.len());
    }

    match &report.published {
        Some(receipt) if receipt.superseded => println!(
            "Published {} to history only: a newer run already owns the latest pointer",
            receipt.history_path
        ),
        Some(receipt) => println!(
            "Published {} after {} attempt(s)",
            receipt.history_path, receipt.attempts
        ),
        None => println!("Dry run: nothing written. Re-run with --commit to publish."),
    }
}

async fn execute<S, I>(orchestrator: PublicationOrchestrator<S, I>, cli: &Cli) -> ExitCode
where
    S: ContentStore,
    I: ContentStore,
{
    let mode = if cli.commit { RunMode::Commit } else { RunMode::DryRun };

    match orchestrator.run(mode).await {
        Ok(report) => {
            if cli.json {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{}", json),
                    Err(e) => {
                        eprintln!("failed to serialize run report: {}", e);
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                print_summary(&report);
            }
            ExitCode::SUCCESS
        }
        Err(failure) => {
            let report = failure.report();
            match serde_json::to_string_pretty(&report) {
                Ok(json) => eprintln!("{}", json),
                Err(_) => eprintln!("{}", failure),
            }
            ExitCode::FAILURE
        }
    }
}

fn config_error(e: impl std::fmt::Display) -> ExitCode {
    tracing::error!(error = %e, "Invalid configuration");
    eprintln!("configuration error: {}", e);
    ExitCode::FAILURE
}

#[tokio::main]
async fn main() -> ExitCode {
    let dotenv = dotenvy::dotenv();
    init_tracing();
    if let Ok(path) = dotenv {
        info!(path = %path.display(), "Loaded environment file");
    }

    let cli = Cli::parse();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = cli.commit,
        safe = cli.safe,
        "Starting threat pipeline"
    );

    let config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(e) => return config_error(e),
    };
    let scorer: Arc<dyn Scorer> = Arc::new(IdentifierTailScorer);

    match cli.backend {
        Backend::Fs => {
            let store = Arc::new(FsContentStore::new(cli.data_dir.clone()));
            match PublicationOrchestrator::from_config(store.clone(), store, scorer, &config, cli.safe) {
                Ok(orchestrator) => execute(orchestrator, &cli).await,
                Err(e) => config_error(e),
            }
        }
        #[cfg(feature = "github")]
        Backend::Github => {
            use threat_delta::{GitHubContentStore, GitHubRepo};

            let build = || -> Result<_, threat_delta::StoreError> {
                let token = std::env::var("GITHUB_TOKEN")
                    .map_err(|_| threat_delta::StoreError::Backend("GITHUB_TOKEN is not set".into()))?;
                let source = GitHubContentStore::new(GitHubRepo::from_env("SRC")?, token.clone(), config.io_timeout)?;
                let mut output = GitHubContentStore::new(GitHubRepo::from_env("OUT")?, token, config.io_timeout)?;
                if let Ok(message) = std::env::var("OUT_GITHUB_COMMIT_MESSAGE") {
                    output = output.with_commit_message(message);
                }
                Ok((Arc::new(source), Arc::new(output)))
            };

            match build() {
                Ok((source, output)) => {
                    match PublicationOrchestrator::from_config(source, output, scorer, &config, cli.safe) {
                        Ok(orchestrator) => execute(orchestrator, &cli).await,
                        Err(e) => config_error(e),
                    }
                }
                Err(e) => config_error(e),
            }
        }
        #[cfg(not(feature = "github"))]
        Backend::Github => config_error("built without the `github` feature"),
    }
}
