//! Output sinks: partitioned Parquet, RDF graph and GeoJSON.
//!
//! All sinks are append-only during a run; the graph and the GeoJSON layer
//! get a finalization step once the run completes cleanly.

mod geojson;
mod parquet;
mod rdf;

use std::path::PathBuf;

use thiserror::Error;

pub use geojson::GeoJsonWriter;
pub use parquet::ParquetWriter;
pub use rdf::RdfWriter;

/// Writer-level failure (disk full, codec error). Aborts the current batch
/// and terminates the run without advancing the checkpoint.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] ::parquet::errors::ParquetError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
