//! Partitioned Parquet sink.
//!
//! Two datasets are maintained:
//! - `council_data.parquet/`: one row per paper, partitioned by
//!   (city, year, month), with a nested list of its locations;
//! - `council_locations.parquet/`: one flat row per location with the
//!   paper's metadata, consumed by the GeoJSON finalization.
//!
//! Append semantics: every batch becomes new files; existing files are
//! never rewritten. Readers observe the union of all part files.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::builder::{
    Float64Builder, ListBuilder, StringBuilder, StructBuilder, UInt32Builder,
};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field, Fields};
use chrono::Datelike;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::models::{Location, ProcessedPaper};

use super::StorageError;

fn location_fields() -> Fields {
    Fields::from(vec![
        Field::new("canonical_name", DataType::Utf8, true),
        Field::new("category", DataType::Utf8, true),
        Field::new("latitude", DataType::Float64, true),
        Field::new("longitude", DataType::Float64, true),
        Field::new("provenance", DataType::Utf8, true),
        Field::new("display_name", DataType::Utf8, true),
        Field::new("pdf_url", DataType::Utf8, true),
    ])
}

/// Append-only writer for the partitioned council datasets.
pub struct ParquetWriter {
    dataset_dir: PathBuf,
    locations_dir: PathBuf,
    city: String,
    compression: Compression,
}

impl ParquetWriter {
    pub fn new(storage: &StorageConfig, city: &str) -> Result<Self, StorageError> {
        let dataset_dir = storage.dataset_dir();
        let locations_dir = storage.locations_dir();
        fs::create_dir_all(&dataset_dir).map_err(|e| StorageError::io(&dataset_dir, e))?;
        fs::create_dir_all(&locations_dir).map_err(|e| StorageError::io(&locations_dir, e))?;

        let compression = match storage.parquet.compression.as_str() {
            "zstd" => Compression::ZSTD(ZstdLevel::default()),
            "gzip" => Compression::GZIP(GzipLevel::default()),
            _ => Compression::SNAPPY,
        };

        info!(
            "Parquet writer initialized: {} (compression: {})",
            dataset_dir.display(),
            storage.parquet.compression
        );
        Ok(Self {
            dataset_dir,
            locations_dir,
            city: city.to_string(),
            compression,
        })
    }

    /// Append one batch of processed papers. Returns the number of rows
    /// written to the papers dataset.
    pub fn write_batch(
        &self,
        run_id: i64,
        batch_seq: u64,
        papers: &[ProcessedPaper],
    ) -> Result<usize, StorageError> {
        if papers.is_empty() {
            return Ok(0);
        }

        // Partition rows on (year, month) of the paper date; papers without
        // a date fall back to the modified timestamp.
        let mut partitions: BTreeMap<(i32, u32), Vec<&ProcessedPaper>> = BTreeMap::new();
        for paper in papers {
            let (year, month) = partition_of(paper);
            partitions.entry((year, month)).or_default().push(paper);
        }

        let mut rows = 0;
        for ((year, month), group) in partitions {
            let dir = self
                .dataset_dir
                .join(format!("city={}", self.city))
                .join(format!("year={year}"))
                .join(format!("month={month:02}"));
            fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
            let path = dir.join(part_file_name(run_id, batch_seq));

            let batch = papers_record_batch(&group)?;
            self.write_file(&path, batch)?;
            debug!("Wrote {} paper row(s) to {}", group.len(), path.display());
            rows += group.len();
        }

        self.write_locations_batch(run_id, batch_seq, papers)?;
        Ok(rows)
    }

    /// Flat per-location side table with paper metadata.
    fn write_locations_batch(
        &self,
        run_id: i64,
        batch_seq: u64,
        papers: &[ProcessedPaper],
    ) -> Result<usize, StorageError> {
        let rows: Vec<(&ProcessedPaper, &Location)> = papers
            .iter()
            .flat_map(|p| p.locations.iter().map(move |l| (p, l)))
            .collect();
        if rows.is_empty() {
            return Ok(0);
        }

        let batch = locations_record_batch(&self.city, &rows)?;
        let path = self.locations_dir.join(part_file_name(run_id, batch_seq));
        self.write_file(&path, batch)?;
        debug!("Wrote {} location row(s) to {}", rows.len(), path.display());
        Ok(rows.len())
    }

    fn write_file(&self, path: &Path, batch: RecordBatch) -> Result<(), StorageError> {
        let file = File::create(path).map_err(|e| StorageError::io(path, e))?;
        let props = WriterProperties::builder()
            .set_compression(self.compression)
            .build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(())
    }
}

fn part_file_name(run_id: i64, batch_seq: u64) -> String {
    format!("part-{run_id:04}-{batch_seq:05}.parquet")
}

fn partition_of(paper: &ProcessedPaper) -> (i32, u32) {
    if let Some(date) = paper.paper.date {
        return (date.year(), date.month());
    }
    if let Some(modified) = paper.paper.modified {
        return (modified.year(), modified.month());
    }
    (1970, 1)
}

fn papers_record_batch(papers: &[&ProcessedPaper]) -> Result<RecordBatch, StorageError> {
    let mut paper_id = StringBuilder::new();
    let mut title = StringBuilder::new();
    let mut reference = StringBuilder::new();
    let mut date = StringBuilder::new();
    let mut document_type = StringBuilder::new();
    let mut pdf_url = StringBuilder::new();
    let mut full_text = StringBuilder::new();
    let mut extraction_method = StringBuilder::new();
    let mut page_count = UInt32Builder::new();
    let mut locations = ListBuilder::new(StructBuilder::from_fields(location_fields(), 0));

    for processed in papers {
        let paper = &processed.paper;
        paper_id.append_value(&paper.id);
        title.append_value(&paper.name);
        reference.append_option(paper.reference.as_deref());
        date.append_option(paper.date.map(|d| d.to_string()));
        document_type.append_option(paper.paper_type.as_deref());
        pdf_url.append_value(&processed.pdf_url);
        full_text.append_value(&processed.full_text);
        extraction_method.append_value(&processed.extraction_method);
        page_count.append_value(processed.page_count);

        let entry = locations.values();
        for location in &processed.locations {
            entry
                .field_builder::<StringBuilder>(0)
                .expect("canonical_name builder")
                .append_value(&location.canonical_name);
            entry
                .field_builder::<StringBuilder>(1)
                .expect("category builder")
                .append_value(location.category.as_str());
            entry
                .field_builder::<Float64Builder>(2)
                .expect("latitude builder")
                .append_option(location.latitude);
            entry
                .field_builder::<Float64Builder>(3)
                .expect("longitude builder")
                .append_option(location.longitude);
            entry
                .field_builder::<StringBuilder>(4)
                .expect("provenance builder")
                .append_value(location.provenance.as_str());
            entry
                .field_builder::<StringBuilder>(5)
                .expect("display_name builder")
                .append_option(location.display_name.as_deref());
            entry
                .field_builder::<StringBuilder>(6)
                .expect("pdf_url builder")
                .append_value(&location.pdf_url);
            entry.append(true);
        }
        locations.append(true);
    }

    let batch = RecordBatch::try_from_iter(vec![
        ("paper_id", Arc::new(paper_id.finish()) as ArrayRef),
        ("title", Arc::new(title.finish()) as ArrayRef),
        ("reference", Arc::new(reference.finish()) as ArrayRef),
        ("date", Arc::new(date.finish()) as ArrayRef),
        ("document_type", Arc::new(document_type.finish()) as ArrayRef),
        ("pdf_url", Arc::new(pdf_url.finish()) as ArrayRef),
        ("full_text", Arc::new(full_text.finish()) as ArrayRef),
        (
            "extraction_method",
            Arc::new(extraction_method.finish()) as ArrayRef,
        ),
        ("page_count", Arc::new(page_count.finish()) as ArrayRef),
        ("locations", Arc::new(locations.finish()) as ArrayRef),
    ])?;
    Ok(batch)
}

fn locations_record_batch(
    city: &str,
    rows: &[(&ProcessedPaper, &Location)],
) -> Result<RecordBatch, StorageError> {
    let mut paper_id = StringBuilder::new();
    let mut paper_name = StringBuilder::new();
    let mut paper_date = StringBuilder::new();
    let mut pdf_url = StringBuilder::new();
    let mut category = StringBuilder::new();
    let mut canonical_name = StringBuilder::new();
    let mut latitude = Float64Builder::new();
    let mut longitude = Float64Builder::new();
    let mut display_name = StringBuilder::new();
    let mut provenance = StringBuilder::new();
    let mut method = StringBuilder::new();
    let mut mention_count = UInt32Builder::new();
    let mut city_col = StringBuilder::new();

    for (processed, location) in rows {
        paper_id.append_value(&location.paper_id);
        paper_name.append_value(&processed.paper.name);
        paper_date.append_option(processed.paper.date.map(|d| d.to_string()));
        pdf_url.append_value(&location.pdf_url);
        category.append_value(location.category.as_str());
        canonical_name.append_value(&location.canonical_name);
        latitude.append_option(location.latitude);
        longitude.append_option(location.longitude);
        display_name.append_option(location.display_name.as_deref());
        provenance.append_value(location.provenance.as_str());
        method.append_value(location.method.as_str());
        mention_count.append_value(location.mention_count);
        city_col.append_value(city);
    }

    let batch = RecordBatch::try_from_iter(vec![
        ("paper_id", Arc::new(paper_id.finish()) as ArrayRef),
        ("paper_name", Arc::new(paper_name.finish()) as ArrayRef),
        ("paper_date", Arc::new(paper_date.finish()) as ArrayRef),
        ("pdf_url", Arc::new(pdf_url.finish()) as ArrayRef),
        ("category", Arc::new(category.finish()) as ArrayRef),
        (
            "canonical_name",
            Arc::new(canonical_name.finish()) as ArrayRef,
        ),
        ("latitude", Arc::new(latitude.finish()) as ArrayRef),
        ("longitude", Arc::new(longitude.finish()) as ArrayRef),
        ("display_name", Arc::new(display_name.finish()) as ArrayRef),
        ("provenance", Arc::new(provenance.finish()) as ArrayRef),
        ("method", Arc::new(method.finish()) as ArrayRef),
        ("mention_count", Arc::new(mention_count.finish()) as ArrayRef),
        ("city", Arc::new(city_col.finish()) as ArrayRef),
    ])?;
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LocationCategory, MatchMethod, Paper, Provenance};
    use arrow_array::{Array, StringArray};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    fn processed_paper(id: &str, date: &str, with_location: bool) -> ProcessedPaper {
        let mut locations = Vec::new();
        if with_location {
            let mut location = Location::new(
                id,
                "https://x/f.pdf",
                LocationCategory::Street,
                "Ludwigstraße".into(),
                MatchMethod::GazetteerDirect,
            );
            location.latitude = Some(48.3456);
            location.longitude = Some(10.8901);
            location.provenance = Provenance::Gazetteer;
            locations.push(location);
        }
        ProcessedPaper {
            paper: Paper {
                id: id.to_string(),
                name: "Testvorlage".into(),
                date: Some(date.parse().unwrap()),
                ..Default::default()
            },
            pdf_url: "https://x/f.pdf".into(),
            full_text: "Sanierung der Ludwigstraße".into(),
            extraction_method: "text_layer".into(),
            page_count: 3,
            locations,
        }
    }

    fn storage_config(dir: &Path) -> StorageConfig {
        serde_yaml::from_str(&format!("base_path: {:?}", dir)).unwrap()
    }

    #[test]
    fn batches_land_in_date_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ParquetWriter::new(&storage_config(dir.path()), "augsburg").unwrap();

        let papers = vec![
            processed_paper("https://x/paper/1", "2024-05-13", true),
            processed_paper("https://x/paper/2", "2023-11-02", false),
        ];
        let rows = writer.write_batch(1, 1, &papers).unwrap();
        assert_eq!(rows, 2);

        let may = dir
            .path()
            .join("council_data.parquet/city=augsburg/year=2024/month=05");
        let november = dir
            .path()
            .join("council_data.parquet/city=augsburg/year=2023/month=11");
        assert!(may.join("part-0001-00001.parquet").exists());
        assert!(november.join("part-0001-00001.parquet").exists());
    }

    #[test]
    fn append_creates_new_files_per_batch() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ParquetWriter::new(&storage_config(dir.path()), "augsburg").unwrap();

        let papers = vec![processed_paper("https://x/paper/1", "2024-05-13", true)];
        writer.write_batch(1, 1, &papers).unwrap();
        let papers = vec![processed_paper("https://x/paper/2", "2024-05-20", true)];
        writer.write_batch(1, 2, &papers).unwrap();

        let partition = dir
            .path()
            .join("council_data.parquet/city=augsburg/year=2024/month=05");
        let files: Vec<_> = std::fs::read_dir(partition).unwrap().collect();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn locations_side_table_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ParquetWriter::new(&storage_config(dir.path()), "augsburg").unwrap();

        let papers = vec![processed_paper("https://x/paper/1", "2024-05-13", true)];
        writer.write_batch(2, 1, &papers).unwrap();

        let path = dir
            .path()
            .join("council_locations.parquet/part-0002-00001.parquet");
        let file = File::open(&path).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();

        let mut names = Vec::new();
        let mut pdf_urls = Vec::new();
        for batch in reader {
            let batch = batch.unwrap();
            let name_col = batch
                .column_by_name("canonical_name")
                .unwrap()
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap()
                .clone();
            let url_col = batch
                .column_by_name("pdf_url")
                .unwrap()
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap()
                .clone();
            for i in 0..batch.num_rows() {
                names.push(name_col.value(i).to_string());
                pdf_urls.push(url_col.value(i).to_string());
            }
        }
        assert_eq!(names, vec!["Ludwigstraße"]);
        // Provenance invariant: the side table carries the source PDF.
        assert_eq!(pdf_urls, vec!["https://x/f.pdf"]);
    }
}
