// SPDX-License-Identifier: PMPL-1.0-or-later
//! Concord replay
//!
//! Loads a JSON array of raw subsystem payloads, pushes them through
//! detection, runs a backfill pass and prints the outcome as JSON on stdout.
//! Logs go to stderr.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use concord_detector::SourcePayload;
use concord_engine::{
    AnalyzeOptions, ConcordEngine, ConflictStats, DateRange, DetectionReport, DetectionRun,
    EngineConfig, PushSummary,
};
use serde::Serialize;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Replay raw insights through the Concord detector.
#[derive(Parser, Debug)]
#[command(name = "concord-replay", version = VERSION, about = "Replay insights through Concord detection")]
struct Cli {
    /// JSON file holding an array of source payloads.
    input: PathBuf,

    /// Engine configuration (JSON). Defaults plus CONCORD_* overrides otherwise.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Evaluate reporting gaps as of this RFC 3339 instant instead of now.
    #[arg(long)]
    as_of: Option<DateTime<Utc>>,

    /// Analyze every conflict opened by the replay.
    #[arg(long)]
    analyze: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

#[derive(Serialize)]
struct ReplayOutput {
    push: PushSummary,
    detection: DetectionReport,
    stats: ConflictStats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            EngineConfig::from_json_str(&raw)?
        }
        None => EngineConfig::from_env()?,
    };
    let engine = ConcordEngine::new(config)?;

    let raw = std::fs::read_to_string(&cli.input)
        .with_context(|| format!("reading {}", cli.input.display()))?;
    let payloads: Vec<SourcePayload> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing payloads in {}", cli.input.display()))?;
    tracing::info!(payloads = payloads.len(), input = %cli.input.display(), "Replaying insights");

    let push = engine.push_insight_batch(payloads).await;
    let detection = engine
        .run_detection(DetectionRun {
            range: DateRange {
                from: None,
                to: cli.as_of,
            },
            ..Default::default()
        })
        .await?;

    if cli.analyze {
        let mut ids = push.conflicts_created.clone();
        ids.extend(detection.conflicts.iter().map(|c| c.id.clone()));
        for outcome in engine.batch_analyze(&ids, AnalyzeOptions::default()).await {
            if let Err(e) = outcome.result {
                tracing::warn!(conflict_id = %outcome.conflict_id, error = %e, "Analysis failed");
            }
        }
    }

    let output = ReplayOutput {
        push,
        detection,
        stats: engine.get_conflict_stats(None).await,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
