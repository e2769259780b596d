//! ES Sync CLI
//!
//! Streams NDJSON documents into a primary and a secondary Elasticsearch
//! target and completes the incremental sync.

use clap::Parser;
use es_ingest::{BulkChannelFactory, EsClient, RetryPolicy};
use es_sync::{DateFields, IncrementalSyncOrchestrator};
use es_sync_core::config::SyncConfig;
use es_sync_core::prelude::*;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "es-sync")]
#[command(about = "Incremental dual-target Elasticsearch sync")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "ES_SYNC_CONFIG")]
    config: Option<String>,

    /// NDJSON documents to sync, `-` for stdin
    #[arg(short, long, default_value = "-")]
    input: String,

    /// Upper bound on each drain during completion (e.g. "30s")
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    max_drain_wait: Option<Duration>,

    /// Log level, overrides the configured one
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = SyncConfig::load(args.config.as_deref())?;
    init_tracing(&config, args.log_level.as_deref());
    config.validate()?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting es-sync");

    let client = EsClient::new(
        config.elasticsearch.clone(),
        RetryPolicy::from(&config.retry),
    )?;
    let transport: Arc<dyn ClusterApi> = Arc::new(client);
    let factory = Arc::new(BulkChannelFactory::new(config.channel.clone()));

    let registry = config.descriptor_registry()?;
    let cancel = CancellationToken::new();
    let mut orchestrator = IncrementalSyncOrchestrator::<Value>::new(
        transport,
        factory,
        registry.get(&config.primary.type_name())?,
        registry.get(&config.secondary.type_name())?,
    )
    .with_config(config.orchestrator.clone())
    .with_date_fields(DateFields::from(&config.channel))
    .with_cancellation(cancel.clone())
    .on_complete(|ctx| async move {
        info!(
            run_id = %ctx.run_id,
            strategy = %ctx.strategy,
            primary = %ctx.primary.write_alias,
            secondary = %ctx.secondary.write_alias,
            "Sync published"
        );
        Ok(())
    });

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    let result = run(&mut orchestrator, &args, config.orchestrator.bootstrap_method).await;

    if let Err(e) = orchestrator.dispose().await {
        warn!(error = %e, "Failed to dispose orchestrator");
    }

    match result {
        Ok(acknowledged) => {
            info!(acknowledged, "es-sync finished");
            Ok(())
        }
        Err(e) => {
            match e.downcast_ref::<SyncError>() {
                Some(sync) if sync.is_usage_error() => error!(error = %e, "es-sync misconfigured"),
                _ => error!(error = %e, "es-sync failed"),
            }
            Err(e)
        }
    }
}

async fn run(
    orchestrator: &mut IncrementalSyncOrchestrator<Value>,
    args: &Args,
    method: BootstrapMethod,
) -> anyhow::Result<bool> {
    let strategy = orchestrator.start(method).await?;
    info!(%strategy, run_id = %orchestrator.run_id(), "Orchestrator started");

    let (written, rejected) = if args.input == "-" {
        write_documents(orchestrator, BufReader::new(tokio::io::stdin())).await?
    } else {
        let file = tokio::fs::File::open(&args.input).await?;
        write_documents(orchestrator, BufReader::new(file)).await?
    };
    info!(written, rejected, "Input exhausted");

    Ok(orchestrator.complete(args.max_drain_wait).await?)
}

async fn write_documents<R>(
    orchestrator: &IncrementalSyncOrchestrator<Value>,
    reader: R,
) -> anyhow::Result<(u64, u64)>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let (mut written, mut rejected) = (0u64, 0u64);
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if orchestrator.cancellation_token().is_cancelled() {
            return Err(SyncError::Cancelled.into());
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let doc: Value = match serde_json::from_str(line) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed document");
                rejected += 1;
                continue;
            }
        };
        if orchestrator.wait_to_write(doc).await? {
            written += 1;
        } else {
            rejected += 1;
        }
    }
    Ok((written, rejected))
}

fn init_tracing(config: &SyncConfig, level_override: Option<&str>) {
    let level = level_override.unwrap_or(config.observability.log_level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.observability.log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}
