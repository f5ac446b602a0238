//! Story Resolver: batch entrypoint.
//! Loads config, opens the JSON store and runs one pipeline stage:
//!
//! ```text
//! story-resolver [import <file.json> | embed | dedup | cluster | all | stats | audit]
//! ```
//!
//! Config errors abort before the store is touched.

use anyhow::{Context, Result};
use story_resolver::metrics::Metrics;
use story_resolver::{JsonFileStore, Pipeline, PipelineConfig, Stage};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Compact logs by default; `LOG_FORMAT=json` for structured output.
/// `RUST_LOG` overrides the default filter.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("story_resolver=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let stage = Stage::from_args(&args)?;

    let cfg = PipelineConfig::load_default().context("loading pipeline config")?;
    let metrics = Metrics::install()?;

    let store = JsonFileStore::open(&cfg.store.dir).await?;
    info!(?stage, store = %store.dir().display(), "starting stage");

    let pipeline = Pipeline::new(&cfg, &store)?;
    let summary = pipeline.run(&stage, chrono::Utc::now()).await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let Some(path) = &cfg.metrics.textfile {
        metrics.write_textfile(path)?;
        info!(path = %path.display(), "metrics textfile written");
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    if let Err(e) = run().await {
        error!(error = ?e, "story-resolver failed");
        std::process::exit(1);
    }
}
