//! Dataset builder.
//!
//! Loads a YAML configuration, opens the configured Zarr sources, and writes
//! train/validation/test batches, uploading them when `output.upload` is set.

mod report;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use data_sources::ZarrSourceFactory;
use dataset::Pipeline;
use nowcasting_common::{Configuration, SplitName};
use storage::{ObjectStorage, ObjectStorageConfig};

#[derive(Parser, Debug)]
#[command(name = "dataset-builder")]
#[command(about = "Prepare nowcasting training batches from Zarr sources")]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "DATASET_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Only build this split (train, validation or test)
    #[arg(short, long)]
    split: Option<SplitName>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(&args.log_level))
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!(config = %args.config.display(), "Starting dataset builder");

    let config = Arc::new(
        Configuration::from_yaml_file(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?,
    );
    info!(
        batch_size = config.process.batch_size,
        workers = config.process.num_workers,
        split_method = %config.split.method,
        output = %config.output.local_path.display(),
        "Loaded configuration"
    );

    let factory = Arc::new(ZarrSourceFactory::new(config.clone()));
    let mut pipeline = Pipeline::new(config.clone(), factory);
    if let Some(upload) = &config.output.upload {
        let storage = ObjectStorage::new(&ObjectStorageConfig::from(upload))
            .context("connecting to object storage")?;
        info!(bucket = storage.bucket(), prefix = %upload.prefix, "Uploading batches");
        pipeline = pipeline.with_storage(Arc::new(storage));
    }

    let reports = pipeline.run(args.split).await.context("preparing splits")?;

    for report in &reports {
        println!("{}", report::render(report));
    }

    let failed: usize = reports.iter().map(|r| r.failures.len()).sum();
    if failed > 0 {
        error!(failed, "Some batches failed");
        bail!("{} batch(es) failed", failed);
    }

    info!("Dataset preparation complete");
    Ok(())
}
