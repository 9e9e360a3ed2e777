//! Pipeline orchestration: bounded batches with durable checkpoints.
//!
//! The orchestrator drives the dataflow fetch -> extract -> locate ->
//! geocode -> write -> mark, one batch at a time. A batch is the unit of
//! atomic progress: sinks are written before papers are marked completed and
//! the checkpoint advances only after the marks. Papers completed by any
//! earlier run are skipped, which makes a crashed run resumable by simply
//! starting again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::client::{FetchError, OParlClient};
use crate::config::PipelineConfig;
use crate::extract::PdfExtractor;
use crate::models::{Paper, PaperStatus, ProcessedPaper};
use crate::spatial::{Gazetteer, GazetteerError, Geocoder, LocationExtractor, NerTagger};
use crate::state::{StateError, StateStore};
use crate::storage::{GeoJsonWriter, ParquetWriter, RdfWriter, StorageError};

/// Run-level failure; terminates the pipeline with a non-zero exit status.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Gazetteer(#[from] GazetteerError),

    #[error("HTTP client setup failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Aggregate counters for one orchestrator invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub papers_fetched: u64,
    pub papers_processed: u64,
    pub papers_failed: u64,
    pub papers_skipped: u64,
    pub papers_skipped_existing: u64,
    pub locations_extracted: u64,
    pub locations_geocoded: u64,
    pub batches_completed: u64,
}

/// Drives the pipeline to completion for one city and time window.
pub struct Orchestrator {
    config: PipelineConfig,
    state: StateStore,
    client: OParlClient,
    extractor: Arc<PdfExtractor>,
    locator: LocationExtractor,
    geocoder: Geocoder,
    parquet: ParquetWriter,
    rdf: RdfWriter,
    geojson: GeoJsonWriter,
    stop: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Wire up all components from the configuration record.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let state = StateStore::open(&config.state_db_path())?;
        let client = OParlClient::new(&config.api)?;
        let extractor = Arc::new(PdfExtractor::new(config.extraction.clone())?);

        let gazetteer = Arc::new(Gazetteer::load(&config.spatial.gazetteer_path)?);
        let tagger = config
            .spatial
            .ner_model
            .as_deref()
            .map(NerTagger::new);
        if tagger.is_none() {
            info!("NER disabled; extracting with gazetteer and regex only");
        }
        let mut locator = LocationExtractor::new(
            gazetteer.clone(),
            tagger,
            config.spatial.fuzzy_threshold,
        );
        if let Some(blocklist) = &config.spatial.blocklist_path {
            locator = locator.with_blocklist_file(blocklist);
        }

        let geocoder = Geocoder::new(&config.geocoding, &config.city)?;
        let parquet = ParquetWriter::new(&config.storage, &config.city)?;
        let rdf = RdfWriter::new(
            config.storage.ntriples_path(),
            config.storage.turtle_path(),
            config.rdf_base_uri(),
        );
        let geojson = GeoJsonWriter::new(
            config.storage.locations_dir(),
            config.storage.geojson_path(&config.city),
            &config.city,
        );

        Ok(Self {
            config,
            state,
            client,
            extractor,
            locator,
            geocoder,
            parquet,
            rdf,
            geojson,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Handle for a stop signal: the orchestrator finishes the current
    /// batch, writes its checkpoint and exits cleanly.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Run the pipeline to completion. Individual paper failures are
    /// recorded and skipped; only infrastructural failures surface as
    /// errors.
    pub async fn run(&self) -> Result<RunStats, PipelineError> {
        let config_json = serde_json::to_string(&self.config).ok();
        let run_id = self
            .state
            .begin_run(&self.config.city, config_json.as_deref())?;

        if self.config.orchestrator.reprocess_failed {
            if let Some(previous) = self.previous_run_id(run_id)? {
                let reset = self.state.reset_failed(previous)?;
                info!("Reprocessing {} previously failed paper(s)", reset);
            }
        }
        if let Some(previous) = self.previous_run_id(run_id)? {
            if let Some(checkpoint) = self.state.latest_checkpoint(previous)? {
                info!(
                    "Resuming after checkpoint: run {} batch {} (last paper {})",
                    checkpoint.run_id, checkpoint.batch_seq, checkpoint.last_completed_paper_id
                );
            }
        }

        match self.run_inner(run_id).await {
            Ok(stats) => {
                let stats_json = serde_json::to_string(&stats).ok();
                self.state
                    .finish_run(run_id, "completed", stats_json.as_deref())?;
                self.log_summary(&stats);
                Ok(stats)
            }
            Err(e) => {
                // Best effort: the state store may itself be the failure.
                let _ = self.state.fail_in_progress(run_id, "run aborted");
                let _ = self.state.finish_run(run_id, "failed", None);
                Err(e)
            }
        }
    }

    async fn run_inner(&self, run_id: i64) -> Result<RunStats, PipelineError> {
        let mut stats = RunStats::default();
        let completed = if self.config.orchestrator.skip_existing {
            let ids = self.state.completed_paper_ids()?;
            info!("Skipping {} already completed paper(s)", ids.len());
            ids
        } else {
            Default::default()
        };

        let mut stream = self
            .client
            .iterate_papers(
                self.config.api.window_start,
                self.config.api.window_end,
                self.config.api.page_limit,
            )
            .await?;

        let batch_size = self.config.orchestrator.batch_size;
        let mut batch: Vec<Paper> = Vec::with_capacity(batch_size);
        let mut batch_seq: u64 = 0;

        loop {
            if self.stop.load(Ordering::Relaxed) {
                info!("Stop requested; finishing current batch");
                break;
            }
            if let Some(limit) = self.config.orchestrator.paper_limit {
                if stats.papers_fetched >= limit as u64 {
                    info!("Reached paper limit: {}", limit);
                    break;
                }
            }

            let paper = match stream.next().await {
                Ok(Some(paper)) => paper,
                Ok(None) => break,
                Err(e) => {
                    // The current batch is abandoned and the checkpoint does
                    // not advance. With at least one batch completed this is
                    // still a clean exit; otherwise the run failed.
                    if stats.batches_completed == 0 {
                        return Err(e.into());
                    }
                    error!("Paper stream failed mid-run: {} - stopping early", e);
                    batch.clear();
                    break;
                }
            };

            stats.papers_fetched += 1;

            // The endpoint only filters on the lower bound.
            if paper
                .modified
                .is_some_and(|modified| modified > self.config.api.window_end)
            {
                continue;
            }
            if self.config.orchestrator.skip_existing && completed.contains(&paper.id) {
                stats.papers_skipped_existing += 1;
                continue;
            }

            batch.push(paper);
            if batch.len() >= batch_size {
                batch_seq += 1;
                let drained = std::mem::take(&mut batch);
                self.process_batch(run_id, batch_seq, drained, &mut stats)
                    .await?;
            }
        }

        if !batch.is_empty() {
            batch_seq += 1;
            let drained = std::mem::take(&mut batch);
            self.process_batch(run_id, batch_seq, drained, &mut stats)
                .await?;
        }

        self.finalize()?;
        Ok(stats)
    }

    /// Push one batch through extraction, enrichment and the sinks, then
    /// mark and checkpoint.
    async fn process_batch(
        &self,
        run_id: i64,
        batch_seq: u64,
        papers: Vec<Paper>,
        stats: &mut RunStats,
    ) -> Result<(), PipelineError> {
        info!("Processing batch {} ({} paper(s))", batch_seq, papers.len());

        // Papers without an accessible PDF are skipped, not failed.
        let mut workable: Vec<(Paper, String)> = Vec::with_capacity(papers.len());
        for paper in papers {
            match paper.pdf_url() {
                Some(url) => {
                    let url = url.to_string();
                    self.state
                        .mark(run_id, &paper.id, PaperStatus::InProgress, None)?;
                    workable.push((paper, url));
                }
                None => {
                    self.state.mark(
                        run_id,
                        &paper.id,
                        PaperStatus::Skipped,
                        Some("no accessible file"),
                    )?;
                    stats.papers_skipped += 1;
                }
            }
        }
        if workable.is_empty() {
            return Ok(());
        }

        // Parallel downloads through a small semaphore-bounded pool with a
        // per-download delay; join_all keeps arrival order.
        let pool = Arc::new(Semaphore::new(self.config.extraction.max_workers));
        let delay = self.config.extraction.per_download_delay();
        let futures = workable.iter().map(|(paper, url)| {
            let pool = pool.clone();
            let extractor = self.extractor.clone();
            let paper_id = paper.id.clone();
            let url = url.clone();
            async move {
                let _permit = pool.acquire().await.expect("semaphore closed");
                tokio::time::sleep(delay).await;
                extractor.extract(&paper_id, &url).await
            }
        });
        let extractions = futures_util::future::join_all(futures).await;

        let mut processed: Vec<ProcessedPaper> = Vec::with_capacity(workable.len());
        for ((paper, url), extraction) in workable.into_iter().zip(extractions) {
            if !extraction.succeeded() {
                let message = extraction
                    .error
                    .unwrap_or_else(|| "extraction failed".to_string());
                warn!("Extraction failed for {}: {}", paper.id, message);
                self.state
                    .mark(run_id, &paper.id, PaperStatus::Failed, Some(&message))?;
                stats.papers_failed += 1;
                continue;
            }

            // Location extraction is cheap and CPU-bound; run it inline.
            let mut locations = self.locator.extract(&extraction.text, &paper.id, &url);
            stats.locations_extracted += locations.len() as u64;

            for location in locations.iter_mut() {
                self.geocoder.resolve(location).await;
                if location.is_resolved() {
                    stats.locations_geocoded += 1;
                }
            }

            processed.push(ProcessedPaper {
                paper,
                pdf_url: url,
                full_text: extraction.text,
                extraction_method: extraction.method.as_str().to_string(),
                page_count: extraction.page_count,
                locations,
            });
        }

        if processed.is_empty() {
            info!("Batch {} had no extractable papers", batch_seq);
            return Ok(());
        }

        // Sinks are written before the completion marks; a write failure
        // leaves every paper in-progress and the checkpoint untouched.
        self.parquet.write_batch(run_id, batch_seq, &processed)?;
        self.rdf.append_papers(&processed)?;

        for item in &processed {
            self.state
                .mark(run_id, &item.paper.id, PaperStatus::Completed, None)?;
            stats.papers_processed += 1;
        }

        let last_id = &processed.last().expect("non-empty batch").paper.id;
        self.state.write_checkpoint(run_id, batch_seq, last_id)?;
        stats.batches_completed += 1;

        info!(
            "Batch {} complete: {} paper(s), {} total processed",
            batch_seq,
            processed.len(),
            stats.papers_processed
        );
        Ok(())
    }

    /// Convert the triples log to Turtle and flush the FeatureCollection.
    fn finalize(&self) -> Result<(), PipelineError> {
        let triples = self.rdf.finalize()?;
        let features = self.geojson.finalize()?;
        info!(
            "Finalized outputs: {} triple(s), {} map feature(s)",
            triples, features
        );
        Ok(())
    }

    fn previous_run_id(&self, current: i64) -> Result<Option<i64>, StateError> {
        Ok(self
            .state
            .recent_runs(10)?
            .into_iter()
            .map(|(run_id, _, _, _)| run_id)
            .find(|&run_id| run_id != current))
    }

    fn log_summary(&self, stats: &RunStats) {
        info!("Run summary for {}:", self.config.city);
        info!("  papers fetched:    {}", stats.papers_fetched);
        info!("  papers processed:  {}", stats.papers_processed);
        info!("  papers failed:     {}", stats.papers_failed);
        info!("  papers skipped:    {}", stats.papers_skipped);
        info!("  skipped existing:  {}", stats.papers_skipped_existing);
        info!("  locations found:   {}", stats.locations_extracted);
        info!("  locations geocoded:{}", stats.locations_geocoded);
        info!("  batches completed: {}", stats.batches_completed);
        info!(
            "  geocoder requests: {}",
            self.geocoder.requests_issued()
        );
    }
}
