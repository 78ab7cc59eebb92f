mod artifacts;
mod builder;
mod config;
mod dataset;
mod engine;
mod error;
mod executor;
mod instance_log;
mod lifecycle;
mod patch;
mod pipeline;
mod reporter;


use builder::DockerImageBuilder;
use clap::Parser;
use config::HarnessConfig;
use engine::DockerEngine;
use patchbay_common::types::OutcomeKind;
use pipeline::Pipeline;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info, warn};

/// Evaluate candidate patches against repository test suites in Docker
#[derive(Debug, Parser)]
#[command(name = "patchbay-worker", version)]
struct Args {
    /// Dataset of instances (JSON array or JSONL)
    #[arg(long, env = "PATCHBAY_DATASET")]
    dataset: PathBuf,

    /// Harness configuration file (JSON)
    #[arg(long, env = "PATCHBAY_CONFIG")]
    config: Option<PathBuf>,

    /// Override the eval script deadline, in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Override the per-repository log root
    #[arg(long)]
    log_root: Option<PathBuf>,

    /// Override where the summary file is written
    #[arg(long)]
    summary: Option<PathBuf>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();
    info!("Patchbay Worker booting...");

    let mut config = HarnessConfig::load_or_default(args.config.as_deref()).map_err(|e| {
        error!("Failed to load harness configuration: {:#}", e);
        e
    })?;
    if let Some(timeout) = args.timeout {
        config.timeout_secs = timeout;
    }
    if let Some(log_root) = args.log_root {
        config.log_root = log_root;
    }
    if let Some(summary) = args.summary {
        config.summary_path = summary;
    }
    config.validate()?;

    let instances = dataset::load_instances(&args.dataset)?;
    info!(
        instances = instances.len(),
        timeout_secs = config.timeout_secs,
        log_root = %config.log_root.display(),
        "Loaded dataset {}",
        args.dataset.display()
    );

    let engine = DockerEngine::connect(config.stop_timeout_secs)?;
    let builder = DockerImageBuilder::new(
        engine.client().clone(),
        config.image_build_root.clone(),
        config.pull_missing_images,
    );
    info!("Connected to Docker");

    // Finish the instance in flight, then stop
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("Received shutdown signal, finishing current instance...");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }

    let summary_path = config.summary_path.clone();
    let pipeline = Pipeline::new(Arc::new(engine), Arc::new(builder), config);
    let ledger = pipeline.run_batch(&instances, &shutdown).await;

    for (repo, entry) in ledger.iter() {
        debug!(repo = %repo, image = %entry.docker_image, outcome = %entry.outcome, "Summary entry");
    }

    ledger.persist(&summary_path).map_err(|e| {
        error!("Failed to write summary: {:#}", e);
        e
    })?;

    info!(
        evaluated = ledger.len(),
        success = ledger.count(OutcomeKind::Success),
        test_failure = ledger.count(OutcomeKind::TestFailure),
        apply_failure = ledger.count(OutcomeKind::ApplyFailure),
        build_failure = ledger.count(OutcomeKind::BuildFailure),
        timeout = ledger.count(OutcomeKind::Timeout),
        unexpected_error = ledger.count(OutcomeKind::UnexpectedError),
        "Summary written to {}",
        summary_path.display()
    );

    info!("Worker shutdown complete");
    Ok(())
}
