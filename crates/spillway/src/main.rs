//! spillway CLI: read NDJSON records from stdin into bucketed files and ship them.

use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use spillway::error::InputSnafu;
use spillway::{
    CliArgs, Config, IngestError, JsonLines, MemoryBackend, Pipeline, PipelineError, RequestContext,
    SystemClock, Tracker, init_tracing, shutdown_signal,
};
use spillway_core::init_metrics;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = CliArgs::parse();
    let config = match Config::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config, args.owner).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Pipeline failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, owner: Option<String>) -> Result<(), PipelineError> {
    let owner = owner.unwrap_or_else(|| config.node.owner_uri());
    info!(
        owner = %owner,
        data_dir = %config.node.data_dir.display(),
        destination = %config.upload.destination,
        granularity = %config.rolling.granularity,
        "Starting spillway"
    );

    let tracker = Tracker::new(Arc::new(MemoryBackend::new()), owner, Arc::new(SystemClock));
    let pipeline: Pipeline<serde_json::Value> =
        Pipeline::from_config(&config, tracker, Arc::new(JsonLines)).await?;

    if config.metrics.enabled {
        let status = pipeline.clone();
        init_metrics(
            &config.metrics.address,
            Arc::new(move || status.health().healthy),
        )?;
    }

    pipeline.start().await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let result = ingest_stdin(&pipeline, &shutdown).await;
    pipeline.shutdown().await;
    result
}

/// Feed stdin lines into the pipeline until EOF or a shutdown signal.
async fn ingest_stdin(
    pipeline: &Pipeline<serde_json::Value>,
    shutdown: &CancellationToken,
) -> Result<(), PipelineError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut accepted = 0u64;

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            err = pipeline.ingest().halted() => return Err(err.into()),
            line = lines.next_line() => line.context(InputSnafu)?,
        };
        let Some(line) = line else {
            info!(accepted, "Input closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let ctx = RequestContext::new(Utc::now()).with_request_id(Uuid::new_v4().to_string());
        let value = match serde_json::from_str::<serde_json::Value>(&line) {
            Ok(value) => value,
            Err(e) => {
                warn!(request = ?ctx.request_id, error = %e, "Skipping malformed input line");
                continue;
            }
        };
        match pipeline.ingest().record_with_context(&ctx, |_| value) {
            Ok(()) => {}
            Err(IngestError::ShuttingDown) => break,
            Err(e) => return Err(e.into()),
        }
        accepted += 1;
    }
    Ok(())
}
