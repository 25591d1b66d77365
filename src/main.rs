use std::path::PathBuf;

use anyhow::Context;
use chrono::{Local, NaiveDateTime};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod calendar;
mod config;
mod diff;
mod engine;
mod error;
mod feedback;
mod generate;
mod grades;
mod ingest;
mod models;
mod prune;
mod report;
mod store;
mod tracker;

use crate::config::{EngineArgs, EngineConfig};
use crate::generate::{ReplayGenerator, TextGenerator};
use crate::store::HistoryStore;

#[derive(Parser)]
#[command(name = "coursework-digest")]
#[command(about = "Daily differential report over coursework snapshots", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a snapshot against history and write the daily report
    Run {
        #[arg(long)]
        snapshot: PathBuf,
        #[arg(long, env = "DIGEST_STATE_DIR", default_value = "state")]
        state_dir: PathBuf,
        /// JSON file of feedback candidates and study guides to replay
        #[arg(long)]
        replay: Option<PathBuf>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
        /// Also write the structured result as JSON
        #[arg(long)]
        json_out: Option<PathBuf>,
        /// Evaluate as of this local time instead of now
        #[arg(long)]
        now: Option<NaiveDateTime>,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Convert a gradebook CSV export into a snapshot file
    Import {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, default_value = "snapshot.json")]
        out: PathBuf,
        #[arg(long)]
        captured_at: Option<NaiveDateTime>,
    },
    /// Show tracked issues and retained feedback
    History {
        #[arg(long, env = "DIGEST_STATE_DIR", default_value = "state")]
        state_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            snapshot,
            state_dir,
            replay,
            out,
            json_out,
            now,
            engine,
        } => {
            let config = EngineConfig::from(engine);
            config.validate().context("invalid engine configuration")?;

            let snapshot = ingest::load_snapshot(&snapshot)?;
            let store = HistoryStore::open(&state_dir).context("failed to open state directory")?;
            let prior = store.load();

            let generator = match replay {
                Some(path) => match ReplayGenerator::from_path(&path).await {
                    Ok(generator) => Some(generator),
                    Err(err) => {
                        error!(error = %err, "text generator unavailable, continuing without it");
                        None
                    }
                },
                None => None,
            };

            let now = now.unwrap_or_else(|| Local::now().naive_local());
            let outcome = engine::run_cycle(
                snapshot,
                &prior,
                &config,
                generator.as_ref().map(|g| g as &dyn TextGenerator),
                now,
            )
            .await;

            let markdown = report::build_report(&outcome.report, config.grade_warn_threshold);
            match std::fs::write(&out, markdown) {
                Ok(()) => println!("Report written to {}.", out.display()),
                Err(err) => error!(path = %out.display(), error = %err, "failed to write report"),
            }
            if let Some(path) = json_out {
                let body = serde_json::to_string_pretty(&outcome.report)?;
                match std::fs::write(&path, body) {
                    Ok(()) => info!(path = %path.display(), "structured result written"),
                    Err(err) => error!(path = %path.display(), error = %err, "failed to write JSON result"),
                }
            }

            store
                .commit(&outcome.next_state)
                .context("failed to commit history; this run was not recorded")?;
            println!("{}", report::subject_line(&outcome.report));
        }
        Commands::Import {
            csv,
            out,
            captured_at,
        } => {
            let captured_at = captured_at.unwrap_or_else(|| Local::now().naive_local());
            let snapshot = ingest::import_csv(&csv, captured_at)?;
            ingest::write_snapshot(&out, &snapshot)?;
            println!(
                "Imported {} courses from {} into {}.",
                snapshot.courses.len(),
                csv.display(),
                out.display()
            );
        }
        Commands::History { state_dir } => {
            let store = HistoryStore::open(&state_dir).context("failed to open state directory")?;
            let state = store.load();

            match state.last_run_at {
                Some(at) => println!("{} runs recorded, last at {}.", state.run_seq, at),
                None => println!("No runs recorded yet."),
            }
            if state.issues.is_empty() {
                println!("No open issues.");
            } else {
                println!("Open issues:");
                for issue in &state.issues {
                    println!(
                        "- {} for {} consecutive runs (since {})",
                        issue.label, issue.consecutive_runs, issue.first_observed
                    );
                }
            }
            println!("{} feedback entries retained.", state.feedback.len());
            for entry in state.feedback.iter().rev().take(5) {
                println!("- {} ({}): {}", entry.date, entry.weekday, entry.components.encouragement);
            }
        }
    }

    Ok(())
}
