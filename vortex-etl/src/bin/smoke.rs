//! Loader smoke test binary
//!
//! Loads `train.csv` from the data directory with a 224x224 image field
//! and a binary label, iterates one epoch and checks batch shapes.
//! With `--with-data false` the data directory is removed first, which
//! exercises serving from cache or zero substitution.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vortex_etl::{BatchLoader, FieldConfig, LoaderConfig};

#[derive(Parser, Debug)]
#[command(name = "etl-smoke", version, about = "Smoke test for the batch loader")]
struct Args {
    /// Directory holding train.csv and the images it references
    #[arg(short = 'p', long = "data-dir", default_value = "./images/")]
    data_dir: PathBuf,

    /// Cache directory
    #[arg(short = 'c', long = "cache-dir", default_value = "/cache/")]
    cache_dir: PathBuf,

    /// Run against the data directory ("false" deletes it first)
    #[arg(short = 'd', long = "with-data", default_value = "true")]
    with_data: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.with_data.eq_ignore_ascii_case("false") && args.data_dir.exists() {
        info!("Removing data directory {}", args.data_dir.display());
        std::fs::remove_dir_all(&args.data_dir)?;
    }
    std::fs::create_dir_all(&args.cache_dir)?;

    let config = LoaderConfig::new(
        "train.csv",
        1,
        vec![FieldConfig::image(224, 224), FieldConfig::label(true)],
    )
    .with_manifest_root(&args.data_dir)
    .with_subset_fraction(1.0)
    .with_block_size(2)
    .with_cache_directory(&args.cache_dir);

    let loader = match BatchLoader::new(config) {
        Ok(loader) => loader,
        Err(e) => {
            error!("Failed to create loader: {}", e);
            return Err(e.into());
        }
    };

    for batch in &loader {
        let batch = batch?;
        let (inputs, targets) = batch.into_pair();
        let image_shape = inputs[0].shape();
        let label_shape = targets[0].shape();
        if image_shape != [1, 3, 224, 224] || label_shape != [1, 1] {
            error!(
                "Unexpected shapes: inputs {:?}, targets {:?}",
                image_shape, label_shape
            );
            return Err("batch shape mismatch".into());
        }
    }

    let snapshot = loader.metrics().snapshot();
    info!(
        "Tests ran successfully: {} batches, {} cache hits",
        snapshot.batches_produced, snapshot.cache_hits
    );
    info!("Loader metrics: {}", serde_json::to_string(&snapshot)?);
    Ok(())
}
