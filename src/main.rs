// Example runner for the `wakesafe_vision` library: analyses photos from disk as one
// batch and prints the batch outcome and the metrics snapshot as JSON.
//
// No vision models ship with the crate, so every detector here wraps an
// `UnloadedModel` and abstains. Real deployments hand their own providers to
// `FatigueAnalyzer::from_models`.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wakesafe_vision::core_modules::providers::{ChannelResultSink, FileImageSource, UnloadedModel};
use wakesafe_vision::{BatchOrchestrator, EngineConfig, FatigueAnalyzer, MetricsCollector};

#[derive(Debug, Parser)]
#[command(name = "wakesafe_vision", about = "Driver fatigue analysis over a batch of photos")]
struct Args {
    /// JSON config file. Missing fields keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum number of photos analysed at the same time.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Seconds before a single photo is given up on. 0 disables the timeout.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Directory the photo paths are relative to.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Photos to analyse.
    #[arg(required = true)]
    photos: Vec<String>,
}

fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    }
    .with_env_overrides()?;

    if let Some(limit) = args.concurrency {
        config.concurrency_limit = limit;
    }
    if let Some(secs) = args.timeout_secs {
        config.item_timeout_secs = (secs > 0).then_some(secs);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(&args).context("invalid configuration")?;
    info!(?config, "starting wakesafe vision runner");

    let source = match &args.root {
        Some(root) => FileImageSource::with_root(root),
        None => FileImageSource::new(),
    };
    let (sink, mut records) = ChannelResultSink::channel();
    let consumer = tokio::spawn(async move {
        while let Some(record) = records.recv().await {
            info!(item_id = %record.item_id, prediction = %record.result.prediction, "result delivered");
        }
    });

    let metrics = Arc::new(MetricsCollector::new(config.metrics));
    let model = Arc::new(UnloadedModel);
    let analyzer = FatigueAnalyzer::from_models(
        config.clone(),
        model.clone(),
        model.clone(),
        model,
        Arc::clone(&metrics),
    )
    .with_source(Arc::new(source))
    .with_sink(Arc::new(sink));

    for (name, ready) in analyzer.adapters_ready() {
        if !ready {
            warn!(detector = name, "detector model not loaded, it will abstain");
        }
    }

    let batch = BatchOrchestrator::new(Arc::new(analyzer));
    let items = args
        .photos
        .iter()
        .map(|photo| (photo.clone(), photo.clone()))
        .collect();
    let outcome = batch.run_batch_from_sources(items, batch.default_limit()).await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    println!("{}", serde_json::to_string_pretty(&metrics.snapshot())?);

    // Dropping the orchestrator drops the sink and lets the consumer drain and exit.
    drop(batch);
    consumer.await?;
    Ok(())
}
