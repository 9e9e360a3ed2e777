//! GeoJSON sink (RFC 7946).
//!
//! Finalization reads the flat locations dataset back and emits a single
//! FeatureCollection covering every resolved location of every completed
//! paper, across runs. Unresolved locations stay in the Parquet dataset and
//! the graph but never appear here.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use arrow_array::{Array, Float64Array, StringArray, UInt32Array};
use chrono::Utc;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::StorageError;

#[derive(Debug, Serialize, Deserialize)]
pub struct PointGeometry {
    #[serde(rename = "type")]
    pub kind: String,
    /// `[longitude, latitude]` per RFC 7946.
    pub coordinates: [f64; 2],
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FeatureProperties {
    pub canonical_name: String,
    pub category: String,
    pub provenance: String,
    pub method: String,
    pub mention_count: u32,
    pub paper_id: String,
    pub paper_name: String,
    pub paper_date: Option<String>,
    pub pdf_url: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: String,
    pub geometry: PointGeometry,
    pub properties: FeatureProperties,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub count: usize,
    pub city: String,
    pub generated_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: String,
    pub features: Vec<Feature>,
    pub metadata: CollectionMetadata,
}

/// Builds the map layer from the locations dataset.
pub struct GeoJsonWriter {
    locations_dir: PathBuf,
    output_path: PathBuf,
    city: String,
}

impl GeoJsonWriter {
    pub fn new(locations_dir: PathBuf, output_path: PathBuf, city: &str) -> Self {
        Self {
            locations_dir,
            output_path,
            city: city.to_string(),
        }
    }

    /// Read all part files and write the FeatureCollection. Returns the
    /// number of features emitted.
    pub fn finalize(&self) -> Result<usize, StorageError> {
        let mut features = Vec::new();

        let entries = match fs::read_dir(&self.locations_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No locations dataset; writing empty FeatureCollection");
                return self.write_collection(features);
            }
            Err(e) => return Err(StorageError::io(&self.locations_dir, e)),
        };

        let mut part_files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "parquet"))
            .collect();
        part_files.sort();

        for path in &part_files {
            self.collect_features(path, &mut features)?;
        }

        self.write_collection(features)
    }

    fn collect_features(
        &self,
        path: &Path,
        features: &mut Vec<Feature>,
    ) -> Result<(), StorageError> {
        let file = File::open(path).map_err(|e| StorageError::io(path, e))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

        for batch in reader {
            let batch = batch?;
            let strings = |name: &str| -> Option<StringArray> {
                batch
                    .column_by_name(name)
                    .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                    .cloned()
            };
            let floats = |name: &str| -> Option<Float64Array> {
                batch
                    .column_by_name(name)
                    .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
                    .cloned()
            };

            let (Some(latitude), Some(longitude)) = (floats("latitude"), floats("longitude"))
            else {
                warn!("Part file {} lacks coordinate columns", path.display());
                continue;
            };
            let (Some(canonical_name), Some(category), Some(provenance), Some(method)) = (
                strings("canonical_name"),
                strings("category"),
                strings("provenance"),
                strings("method"),
            ) else {
                warn!("Part file {} lacks location columns", path.display());
                continue;
            };
            let (Some(paper_id), Some(paper_name), Some(pdf_url)) =
                (strings("paper_id"), strings("paper_name"), strings("pdf_url"))
            else {
                warn!("Part file {} lacks paper columns", path.display());
                continue;
            };
            let paper_date = strings("paper_date");
            let display_name = strings("display_name");
            let mention_count = batch
                .column_by_name("mention_count")
                .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
                .cloned();

            for row in 0..batch.num_rows() {
                // Only resolved locations become map features.
                if latitude.is_null(row) || longitude.is_null(row) {
                    continue;
                }
                features.push(Feature {
                    kind: "Feature".into(),
                    geometry: PointGeometry {
                        kind: "Point".into(),
                        coordinates: [longitude.value(row), latitude.value(row)],
                    },
                    properties: FeatureProperties {
                        canonical_name: canonical_name.value(row).to_string(),
                        category: category.value(row).to_string(),
                        provenance: provenance.value(row).to_string(),
                        method: method.value(row).to_string(),
                        mention_count: mention_count
                            .as_ref()
                            .map_or(1, |col| if col.is_null(row) { 1 } else { col.value(row) }),
                        paper_id: paper_id.value(row).to_string(),
                        paper_name: paper_name.value(row).to_string(),
                        paper_date: paper_date.as_ref().and_then(|col| {
                            if col.is_null(row) {
                                None
                            } else {
                                Some(col.value(row).to_string())
                            }
                        }),
                        pdf_url: pdf_url.value(row).to_string(),
                        display_name: display_name.as_ref().and_then(|col| {
                            if col.is_null(row) {
                                None
                            } else {
                                Some(col.value(row).to_string())
                            }
                        }),
                    },
                });
            }
        }
        debug!("Collected features from {}", path.display());
        Ok(())
    }

    fn write_collection(&self, features: Vec<Feature>) -> Result<usize, StorageError> {
        let count = features.len();
        let collection = FeatureCollection {
            kind: "FeatureCollection".into(),
            features,
            metadata: CollectionMetadata {
                count,
                city: self.city.clone(),
                generated_at: Utc::now().to_rfc3339(),
            },
        };

        if let Some(parent) = self.output_path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(&collection)?;
        fs::write(&self.output_path, json).map_err(|e| StorageError::io(&self.output_path, e))?;

        info!(
            "GeoJSON written: {} feature(s) to {}",
            count,
            self.output_path.display()
        );
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::models::{Location, LocationCategory, MatchMethod, Paper, ProcessedPaper, Provenance};
    use crate::storage::ParquetWriter;

    fn processed_with_locations() -> ProcessedPaper {
        let mut resolved = Location::new(
            "https://x/paper/1",
            "https://x/file/1.pdf",
            LocationCategory::Street,
            "Ludwigstraße".into(),
            MatchMethod::GazetteerDirect,
        );
        resolved.latitude = Some(48.3456);
        resolved.longitude = Some(10.8901);
        resolved.provenance = Provenance::Gazetteer;

        let unresolved = Location::new(
            "https://x/paper/1",
            "https://x/file/1.pdf",
            LocationCategory::OtherPlace,
            "Unbekannter Ort".into(),
            MatchMethod::NerRaw,
        );

        ProcessedPaper {
            paper: Paper {
                id: "https://x/paper/1".into(),
                name: "Testvorlage".into(),
                date: Some("2024-05-13".parse().unwrap()),
                ..Default::default()
            },
            pdf_url: "https://x/file/1.pdf".into(),
            full_text: "text".into(),
            extraction_method: "text_layer".into(),
            page_count: 1,
            locations: vec![resolved, unresolved],
        }
    }

    #[test]
    fn only_resolved_locations_become_features() {
        let dir = tempfile::tempdir().unwrap();
        let storage: StorageConfig =
            serde_yaml::from_str(&format!("base_path: {:?}", dir.path())).unwrap();

        let parquet = ParquetWriter::new(&storage, "augsburg").unwrap();
        parquet
            .write_batch(1, 1, &[processed_with_locations()])
            .unwrap();

        let writer = GeoJsonWriter::new(
            storage.locations_dir(),
            storage.geojson_path("augsburg"),
            "augsburg",
        );
        let count = writer.finalize().unwrap();
        assert_eq!(count, 1);

        let contents = std::fs::read_to_string(storage.geojson_path("augsburg")).unwrap();
        let collection: FeatureCollection = serde_json::from_str(&contents).unwrap();
        assert_eq!(collection.kind, "FeatureCollection");
        assert_eq!(collection.features.len(), 1);

        let feature = &collection.features[0];
        assert_eq!(feature.geometry.kind, "Point");
        // [lon, lat] ordering.
        assert_eq!(feature.geometry.coordinates, [10.8901, 48.3456]);
        assert_eq!(feature.properties.canonical_name, "Ludwigstraße");
        assert_eq!(feature.properties.pdf_url, "https://x/file/1.pdf");
        assert_eq!(feature.properties.paper_name, "Testvorlage");
        assert_eq!(feature.properties.paper_date.as_deref(), Some("2024-05-13"));
    }

    #[test]
    fn missing_dataset_yields_empty_collection() {
        let dir = tempfile::tempdir().unwrap();
        let writer = GeoJsonWriter::new(
            dir.path().join("does-not-exist"),
            dir.path().join("map.geojson"),
            "augsburg",
        );
        assert_eq!(writer.finalize().unwrap(), 0);

        let contents = std::fs::read_to_string(dir.path().join("map.geojson")).unwrap();
        let collection: FeatureCollection = serde_json::from_str(&contents).unwrap();
        assert!(collection.features.is_empty());
        assert_eq!(collection.metadata.count, 0);
    }

    #[test]
    fn features_accumulate_across_batches() {
        let dir = tempfile::tempdir().unwrap();
        let storage: StorageConfig =
            serde_yaml::from_str(&format!("base_path: {:?}", dir.path())).unwrap();

        let parquet = ParquetWriter::new(&storage, "augsburg").unwrap();
        parquet
            .write_batch(1, 1, &[processed_with_locations()])
            .unwrap();
        // Second run appends its own part file.
        parquet
            .write_batch(2, 1, &[processed_with_locations()])
            .unwrap();

        let writer = GeoJsonWriter::new(
            storage.locations_dir(),
            storage.geojson_path("augsburg"),
            "augsburg",
        );
        assert_eq!(writer.finalize().unwrap(), 2);
    }
}
