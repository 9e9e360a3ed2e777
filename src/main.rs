//! ratsgeo - municipal council documents to Parquet, RDF and GeoJSON.
//!
//! Fetches OParl papers, extracts PDF text, finds and geocodes toponyms and
//! writes the three output layers with crash-safe checkpointing.

use ratsgeo::cli;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    // Initialize logging based on verbosity
    let default_filter = if cli::is_verbose() {
        "ratsgeo=info"
    } else {
        "ratsgeo=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    cli::run().await
}
