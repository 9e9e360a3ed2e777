//! ratsgeo - resumable pipeline from OParl council documents to Parquet,
//! RDF and GeoJSON.
//!
//! Core library exposing the pipeline components; the binary in `main.rs`
//! is a thin CLI shell.

pub mod cli;
pub mod client;
pub mod config;
pub mod extract;
pub mod models;
pub mod pipeline;
pub mod retry;
pub mod spatial;
pub mod state;
pub mod storage;
