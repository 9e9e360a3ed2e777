//! Pipeline configuration.
//!
//! The configuration record is supplied by the CLI (or any other loader);
//! the orchestrator only sees this struct. Files are parsed as YAML or TOML
//! depending on extension.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Invalid configuration at startup. Fatal: the run does not begin.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Unsupported config format: {0} (expected .yaml, .yml or .toml)")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// OParl API access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// System endpoint of the OParl-like API.
    pub base_url: String,
    /// Inclusive lower bound for the `modified_since` filter.
    pub window_start: DateTime<Utc>,
    /// Inclusive upper bound of the window.
    pub window_end: DateTime<Utc>,
    #[serde(default = "default_http_timeout_sec")]
    pub http_timeout_sec: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_base_sec")]
    pub retry_backoff_base_sec: f64,
    /// Maximum pages to fetch; `None` = unlimited.
    #[serde(default)]
    pub page_limit: Option<u32>,
}

fn default_http_timeout_sec() -> u64 {
    30
}
fn default_retry_attempts() -> u32 {
    5
}
fn default_retry_backoff_base_sec() -> f64 {
    2.0
}

impl ApiConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_sec)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: Duration::from_secs_f64(self.retry_backoff_base_sec),
            ..Default::default()
        }
    }
}

/// PDF download and text extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Parallel download workers per batch.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Pause before each download, to be gentle with the source host.
    #[serde(default = "default_per_download_delay_sec")]
    pub per_download_delay_sec: f64,
    /// PDFs larger than this are spilled to a scoped temp file.
    #[serde(default = "default_memory_threshold_bytes")]
    pub memory_threshold_bytes: u64,
    /// Hard cap on the downloaded response size.
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,
    #[serde(default = "default_download_timeout_sec")]
    pub download_timeout_sec: u64,
    #[serde(default = "default_download_retries")]
    pub download_retries: u32,
    /// Rasterize-and-OCR fallback for scanned documents.
    #[serde(default)]
    pub enable_ocr: bool,
    /// Tesseract language code.
    #[serde(default = "default_ocr_language")]
    pub ocr_language: String,
}

fn default_max_workers() -> usize {
    3
}
fn default_per_download_delay_sec() -> f64 {
    1.0
}
fn default_memory_threshold_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_max_download_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_download_timeout_sec() -> u64 {
    60
}
fn default_download_retries() -> u32 {
    3
}
fn default_ocr_language() -> String {
    "deu".to_string()
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            per_download_delay_sec: default_per_download_delay_sec(),
            memory_threshold_bytes: default_memory_threshold_bytes(),
            max_download_bytes: default_max_download_bytes(),
            download_timeout_sec: default_download_timeout_sec(),
            download_retries: default_download_retries(),
            enable_ocr: false,
            ocr_language: default_ocr_language(),
        }
    }
}

impl ExtractionConfig {
    pub fn per_download_delay(&self) -> Duration {
        Duration::from_secs_f64(self.per_download_delay_sec)
    }
}

/// Gazetteer, NER and fuzzy matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialConfig {
    /// GeoJSON gazetteer of known toponyms with coordinates.
    pub gazetteer_path: PathBuf,
    /// NER tagger identifier; `None` disables the NER pass entirely
    /// (the extractor degrades to gazetteer + regex).
    #[serde(default)]
    pub ner_model: Option<String>,
    /// Minimum similarity for fuzzy gazetteer validation.
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,
    /// Newline-separated list of NER false positives to suppress.
    #[serde(default)]
    pub blocklist_path: Option<PathBuf>,
}

fn default_fuzzy_threshold() -> f64 {
    0.85
}

/// Remote geocoding service (Nominatim-style).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocodingConfig {
    pub service_url: String,
    /// Minimum interval between outbound requests.
    #[serde(default = "default_rate_limit_sec")]
    pub rate_limit_sec: f64,
    #[serde(default = "default_geocode_timeout_sec")]
    pub timeout_sec: u64,
    #[serde(default = "default_geocode_retries")]
    pub retries: u32,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    /// Country appended to the locality suffix ("<name>, <city>, <country>").
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

fn default_rate_limit_sec() -> f64 {
    1.0
}
fn default_geocode_timeout_sec() -> u64 {
    10
}
fn default_geocode_retries() -> u32 {
    3
}
fn default_true() -> bool {
    true
}
fn default_country() -> String {
    "Deutschland".to_string()
}
fn default_cache_size() -> usize {
    1024
}

impl GeocodingConfig {
    pub fn rate_limit(&self) -> Duration {
        Duration::from_secs_f64(self.rate_limit_sec)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }
}

/// Columnar output options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetConfig {
    #[serde(default = "default_partition_cols")]
    pub partition_cols: Vec<String>,
    /// One of "snappy", "zstd", "gzip".
    #[serde(default = "default_compression")]
    pub compression: String,
}

fn default_partition_cols() -> Vec<String> {
    vec!["city".into(), "year".into(), "month".into()]
}
fn default_compression() -> String {
    "snappy".to_string()
}

impl Default for ParquetConfig {
    fn default() -> Self {
        Self {
            partition_cols: default_partition_cols(),
            compression: default_compression(),
        }
    }
}

/// Output directory and sink options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the persisted layout (dataset, graph, GeoJSON).
    pub base_path: PathBuf,
    #[serde(default)]
    pub parquet: ParquetConfig,
    /// Base URI for minted RDF resources. Defaults to a city-derived URI.
    #[serde(default)]
    pub rdf_base_uri: Option<String>,
}

impl StorageConfig {
    pub fn dataset_dir(&self) -> PathBuf {
        self.base_path.join("council_data.parquet")
    }

    pub fn locations_dir(&self) -> PathBuf {
        self.base_path.join("council_locations.parquet")
    }

    pub fn ntriples_path(&self) -> PathBuf {
        self.base_path.join("metadata.nt")
    }

    pub fn turtle_path(&self) -> PathBuf {
        self.base_path.join("metadata.ttl")
    }

    pub fn geojson_path(&self, city: &str) -> PathBuf {
        self.base_path.join(format!("{city}_map.geojson"))
    }
}

/// Batch driving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Stop after this many papers; `None` = unlimited.
    #[serde(default)]
    pub paper_limit: Option<usize>,
    /// Skip papers already completed in any earlier run.
    #[serde(default = "default_true")]
    pub skip_existing: bool,
    /// Move previously failed papers back to pending before starting.
    #[serde(default)]
    pub reprocess_failed: bool,
}

fn default_batch_size() -> usize {
    50
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            paper_limit: None,
            skip_existing: true,
            reprocess_failed: false,
        }
    }
}

/// State store location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    /// Path to the embedded database; defaults to
    /// `<storage.base_path>/pipeline_state.db`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

/// Complete configuration record handed to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Partition tag and geocoder locality.
    pub city: String,
    pub api: ApiConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    pub spatial: SpatialConfig,
    pub geocoding: GeocodingConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub state: StateConfig,
}

impl PipelineConfig {
    /// Load a configuration file, dispatching on extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        let config: Self = match ext.as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
            "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants. Called by `load`; callers constructing
    /// the record programmatically should call it themselves.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.city.trim().is_empty() {
            return Err(ConfigError::Invalid("city must not be empty".into()));
        }
        url::Url::parse(&self.api.base_url)
            .map_err(|e| ConfigError::Invalid(format!("api.base_url: {e}")))?;
        url::Url::parse(&self.geocoding.service_url)
            .map_err(|e| ConfigError::Invalid(format!("geocoding.service_url: {e}")))?;
        if self.api.window_start > self.api.window_end {
            return Err(ConfigError::Invalid(
                "api.window_start must not be after api.window_end".into(),
            ));
        }
        if self.orchestrator.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.batch_size must be positive".into(),
            ));
        }
        if self.extraction.max_workers == 0 {
            return Err(ConfigError::Invalid(
                "extraction.max_workers must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.spatial.fuzzy_threshold) {
            return Err(ConfigError::Invalid(
                "spatial.fuzzy_threshold must lie in [0, 1]".into(),
            ));
        }
        match self.storage.parquet.compression.as_str() {
            "snappy" | "zstd" | "gzip" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "storage.parquet.compression: unknown codec '{other}'"
                )))
            }
        }
        for col in &self.storage.parquet.partition_cols {
            if !matches!(col.as_str(), "city" | "year" | "month") {
                return Err(ConfigError::Invalid(format!(
                    "storage.parquet.partition_cols: unsupported column '{col}'"
                )));
            }
        }
        Ok(())
    }

    /// Effective state database path.
    pub fn state_db_path(&self) -> PathBuf {
        self.state
            .db_path
            .clone()
            .unwrap_or_else(|| self.storage.base_path.join("pipeline_state.db"))
    }

    /// Base URI under which paper and location resources are minted.
    pub fn rdf_base_uri(&self) -> String {
        self.storage
            .rdf_base_uri
            .clone()
            .unwrap_or_else(|| format!("http://{}.oparl-analytics.org/", self.city.to_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
city: augsburg
api:
  base_url: "https://oparl.example.org/system"
  window_start: "2023-01-01T00:00:00Z"
  window_end: "2025-12-31T23:59:59Z"
spatial:
  gazetteer_path: "data/gazetteer/streets.geojson"
geocoding:
  service_url: "https://nominatim.example.org"
storage:
  base_path: "data/processed"
"#
    }

    #[test]
    fn defaults_fill_in() {
        let config: PipelineConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.api.http_timeout_sec, 30);
        assert_eq!(config.api.retry_attempts, 5);
        assert_eq!(config.extraction.max_workers, 3);
        assert_eq!(config.extraction.memory_threshold_bytes, 10 * 1024 * 1024);
        assert!(!config.extraction.enable_ocr);
        assert_eq!(config.spatial.fuzzy_threshold, 0.85);
        assert_eq!(config.geocoding.rate_limit_sec, 1.0);
        assert!(config.geocoding.verify_tls);
        assert_eq!(config.orchestrator.batch_size, 50);
        assert!(config.orchestrator.skip_existing);
        assert_eq!(
            config.storage.parquet.partition_cols,
            vec!["city", "year", "month"]
        );
        assert_eq!(config.storage.parquet.compression, "snappy");
        assert_eq!(
            config.state_db_path(),
            PathBuf::from("data/processed/pipeline_state.db")
        );
        assert_eq!(config.rdf_base_uri(), "http://augsburg.oparl-analytics.org/");
    }

    #[test]
    fn rejects_inverted_window() {
        let mut config: PipelineConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        std::mem::swap(&mut config.api.window_start, &mut config.api.window_end);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_compression() {
        let mut config: PipelineConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        config.storage.parquet.compression = "lz77".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_toml_too() {
        let toml_src = r#"
city = "augsburg"

[api]
base_url = "https://oparl.example.org/system"
window_start = "2023-01-01T00:00:00Z"
window_end = "2025-12-31T23:59:59Z"

[spatial]
gazetteer_path = "data/gazetteer/streets.geojson"

[geocoding]
service_url = "https://nominatim.example.org"

[storage]
base_path = "data/processed"
"#;
        let config: PipelineConfig = toml::from_str(toml_src).unwrap();
        config.validate().unwrap();
        assert_eq!(config.city, "augsburg");
    }
}
