//! PDF download and text extraction with layered fallbacks.
//!
//! Extraction strategy, in order:
//! 1. In-process text layer via lopdf (fast, covers text-based PDFs)
//! 2. `pdftotext -layout` (better for tables and odd encodings)
//! 3. Tesseract OCR over rasterized pages (scanned documents, optional)
//!
//! Downloads above the memory threshold stream into a scoped temp file that
//! is removed on every exit path. Document-level failures never escape as
//! errors: `extract` always returns an `ExtractionResult` and the caller
//! inspects the method tag.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use futures_util::StreamExt;
use lopdf::Document;
use reqwest::Client;
use tempfile::{NamedTempFile, TempDir};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ExtractionConfig;
use crate::retry::{is_retryable_status, RetryPolicy};

/// OCR is slow; cap the number of rasterized pages per document.
const OCR_MAX_PAGES: usize = 10;

/// How the text was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMethod {
    /// Embedded text layer (lopdf).
    TextLayer,
    /// Layout-aware external parser (pdftotext).
    Layout,
    /// Optical recognition over rasterized pages (tesseract).
    Ocr,
    /// No method produced text.
    Failed,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextLayer => "text_layer",
            Self::Layout => "layout",
            Self::Ocr => "ocr",
            Self::Failed => "failed",
        }
    }
}

/// Outcome of extracting one paper's PDF.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub paper_id: String,
    pub pdf_url: String,
    pub text: String,
    /// Page count as reported by the PDF parser (not OCR pseudo-pages).
    pub page_count: u32,
    pub method: ExtractionMethod,
    /// Whether the download was spilled to a temp file.
    pub used_spill: bool,
    pub error: Option<String>,
}

impl ExtractionResult {
    pub fn succeeded(&self) -> bool {
        self.method != ExtractionMethod::Failed
    }

    fn failed(paper_id: &str, pdf_url: &str, error: String) -> Self {
        Self {
            paper_id: paper_id.to_string(),
            pdf_url: pdf_url.to_string(),
            text: String::new(),
            page_count: 0,
            method: ExtractionMethod::Failed,
            used_spill: false,
            error: Some(error),
        }
    }
}

#[derive(Debug, Error)]
enum DownloadError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("response exceeded size cap of {0} bytes")]
    TooLarge(u64),

    #[error("could not write spill file: {0}")]
    Spill(#[from] std::io::Error),
}

impl DownloadError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status(status) => is_retryable_status(*status),
            Self::TooLarge(_) | Self::Spill(_) => false,
        }
    }
}

/// Downloaded PDF content, either buffered or spilled to disk.
///
/// The temp file is deleted when this value drops, whichever way the
/// extraction ends.
enum PdfContent {
    Memory(Vec<u8>),
    Spilled(NamedTempFile),
}

impl PdfContent {
    fn used_spill(&self) -> bool {
        matches!(self, Self::Spilled(_))
    }
}

/// Extractor for PDF documents referenced by papers.
///
/// Safe to share across worker tasks: each call manages its own download
/// buffer, temp files and parser state.
pub struct PdfExtractor {
    client: Client,
    config: ExtractionConfig,
    retry: RetryPolicy,
}

impl PdfExtractor {
    pub fn new(config: ExtractionConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("ratsgeo/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(config.download_timeout_sec))
            .gzip(true)
            .build()?;
        let retry = RetryPolicy::new(
            config.download_retries,
            std::time::Duration::from_secs(2),
        );
        Ok(Self {
            client,
            config,
            retry,
        })
    }

    /// Download and extract the text of one PDF.
    pub async fn extract(&self, paper_id: &str, pdf_url: &str) -> ExtractionResult {
        let content = match self.download(pdf_url).await {
            Ok(content) => content,
            Err(e) => {
                debug!("Download failed for {}: {}", pdf_url, e);
                return ExtractionResult::failed(paper_id, pdf_url, format!("Download failed: {e}"));
            }
        };

        let used_spill = content.used_spill();
        let enable_ocr = self.config.enable_ocr;
        let ocr_language = self.config.ocr_language.clone();
        let paper_id = paper_id.to_string();
        let pdf_url = pdf_url.to_string();

        // Parsing is CPU-bound and the external tools block; keep it off the
        // async executor.
        let result = tokio::task::spawn_blocking(move || {
            extract_with_fallbacks(&content, enable_ocr, &ocr_language)
        })
        .await;

        match result {
            Ok(Ok((text, method, page_count))) => ExtractionResult {
                paper_id,
                pdf_url,
                text,
                page_count,
                method,
                used_spill,
                error: None,
            },
            Ok(Err(message)) => {
                let mut result = ExtractionResult::failed(&paper_id, &pdf_url, message);
                result.used_spill = used_spill;
                result
            }
            Err(e) => ExtractionResult::failed(&paper_id, &pdf_url, format!("extraction task: {e}")),
        }
    }

    /// Download with size cap and spill-to-disk, retrying transient failures.
    async fn download(&self, url: &str) -> Result<PdfContent, DownloadError> {
        let mut attempt = 0u32;
        loop {
            match self.try_download(url).await {
                Ok(content) => return Ok(content),
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Download attempt {} failed for {}: {} - retrying in {:?}",
                        attempt + 1,
                        url,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_download(&self, url: &str) -> Result<PdfContent, DownloadError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status.as_u16()));
        }

        let max_bytes = self.config.max_download_bytes;
        let threshold = self.config.memory_threshold_bytes;

        // When the server announces a large body, stream straight to disk.
        let announced = response.content_length();
        if let Some(len) = announced {
            if len > max_bytes {
                return Err(DownloadError::TooLarge(max_bytes));
            }
        }
        let mut spill = match announced {
            Some(len) if len > threshold => {
                debug!("Large PDF announced ({} bytes) - spilling to disk", len);
                Some(NamedTempFile::new()?)
            }
            _ => None,
        };

        let mut buffer: Vec<u8> = Vec::new();
        let mut total: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            total += chunk.len() as u64;
            if total > max_bytes {
                return Err(DownloadError::TooLarge(max_bytes));
            }

            match &mut spill {
                Some(file) => file.write_all(&chunk)?,
                None => {
                    buffer.extend_from_slice(&chunk);
                    // Content-Length lied or was absent; spill once the
                    // buffer crosses the threshold.
                    if total > threshold {
                        debug!("PDF grew past {} bytes - spilling to disk", threshold);
                        let mut file = NamedTempFile::new()?;
                        file.write_all(&buffer)?;
                        buffer = Vec::new();
                        spill = Some(file);
                    }
                }
            }
        }

        match spill {
            Some(mut file) => {
                file.flush()?;
                Ok(PdfContent::Spilled(file))
            }
            None => Ok(PdfContent::Memory(buffer)),
        }
    }
}

/// Run the extraction chain. Returns (text, method, page_count) or an error
/// message when every method came up empty.
fn extract_with_fallbacks(
    content: &PdfContent,
    enable_ocr: bool,
    ocr_language: &str,
) -> Result<(String, ExtractionMethod, u32), String> {
    // Pass 1: in-process text layer.
    let (layer_text, parsed_pages) = match content {
        PdfContent::Memory(bytes) => extract_text_layer_mem(bytes),
        PdfContent::Spilled(file) => extract_text_layer_file(file.path()),
    };
    if let Some(text) = non_blank(layer_text) {
        return Ok((text, ExtractionMethod::TextLayer, parsed_pages));
    }

    // The external tools need a file; materialize in-memory content once.
    let scratch;
    let path: &Path = match content {
        PdfContent::Spilled(file) => file.path(),
        PdfContent::Memory(bytes) => {
            scratch = write_scratch_pdf(bytes).map_err(|e| format!("temp file: {e}"))?;
            scratch.path()
        }
    };

    let page_count = if parsed_pages > 0 {
        parsed_pages
    } else {
        pdfinfo_page_count(path).unwrap_or(0)
    };

    // Pass 2: layout-aware parser.
    match run_pdftotext(path) {
        Ok(text) => {
            if let Some(text) = non_blank(Some(text)) {
                return Ok((text, ExtractionMethod::Layout, page_count));
            }
        }
        Err(ToolError::NotFound(tool)) => debug!("{} not installed, skipping layout pass", tool),
        Err(ToolError::Failed(message)) => debug!("pdftotext failed: {}", message),
    }

    // Pass 3: OCR, when configured.
    if enable_ocr {
        match run_ocr(path, ocr_language) {
            Ok(text) => {
                if let Some(text) = non_blank(Some(text)) {
                    return Ok((text, ExtractionMethod::Ocr, page_count));
                }
            }
            Err(ToolError::NotFound(tool)) => warn!("OCR enabled but {} not installed", tool),
            Err(ToolError::Failed(message)) => debug!("OCR failed: {}", message),
        }
    }

    Err("No text extracted from PDF".to_string())
}

fn non_blank(text: Option<String>) -> Option<String> {
    let text = text?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn write_scratch_pdf(bytes: &[u8]) -> std::io::Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file)
}

fn extract_text_layer_mem(bytes: &[u8]) -> (Option<String>, u32) {
    match Document::load_mem(bytes) {
        Ok(doc) => text_layer_of(&doc),
        Err(e) => {
            debug!("lopdf could not parse document: {}", e);
            (None, 0)
        }
    }
}

fn extract_text_layer_file(path: &Path) -> (Option<String>, u32) {
    match Document::load(path) {
        Ok(doc) => text_layer_of(&doc),
        Err(e) => {
            debug!("lopdf could not parse document: {}", e);
            (None, 0)
        }
    }
}

/// Concatenate per-page text, newline-separated, in page order.
fn text_layer_of(doc: &Document) -> (Option<String>, u32) {
    let pages = doc.get_pages();
    let page_count = pages.len() as u32;
    let mut parts: Vec<String> = Vec::with_capacity(pages.len());
    for number in pages.keys() {
        match doc.extract_text(&[*number]) {
            Ok(text) => {
                // lopdf emits this marker for fonts it cannot decode.
                parts.push(text.replace("?Identity-H Unimplemented?", ""));
            }
            Err(e) => debug!("text layer failed on page {}: {}", number, e),
        }
    }
    let full = parts.join("\n");
    if full.trim().is_empty() {
        (None, page_count)
    } else {
        (Some(full), page_count)
    }
}

#[derive(Debug)]
enum ToolError {
    NotFound(&'static str),
    Failed(String),
}

/// Map a Command result the way all three external tools need it.
fn tool_output(
    result: std::io::Result<std::process::Output>,
    tool: &'static str,
) -> Result<String, ToolError> {
    match result {
        Ok(output) if output.status.success() => {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        }
        Ok(output) => Err(ToolError::Failed(
            String::from_utf8_lossy(&output.stderr).to_string(),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ToolError::NotFound(tool)),
        Err(e) => Err(ToolError::Failed(e.to_string())),
    }
}

fn run_pdftotext(path: &Path) -> Result<String, ToolError> {
    let output = Command::new("pdftotext")
        .args(["-layout", "-enc", "UTF-8"])
        .arg(path)
        .arg("-")
        .output();
    tool_output(output, "pdftotext")
}

fn pdfinfo_page_count(path: &Path) -> Option<u32> {
    let output = Command::new("pdfinfo").arg(path).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .find(|line| line.starts_with("Pages:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
}

/// Rasterize pages with pdftoppm and OCR each with tesseract.
fn run_ocr(path: &Path, language: &str) -> Result<String, ToolError> {
    let temp_dir = TempDir::new().map_err(|e| ToolError::Failed(e.to_string()))?;
    let prefix = temp_dir.path().join("page");

    let status = Command::new("pdftoppm")
        .args(["-png", "-r", "150", "-l", &OCR_MAX_PAGES.to_string()])
        .arg(path)
        .arg(&prefix)
        .status();
    match status {
        Ok(s) if s.success() => {}
        Ok(_) => return Err(ToolError::Failed("pdftoppm failed".into())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ToolError::NotFound("pdftoppm"))
        }
        Err(e) => return Err(ToolError::Failed(e.to_string())),
    }

    let mut images: Vec<PathBuf> = std::fs::read_dir(temp_dir.path())
        .map_err(|e| ToolError::Failed(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "png"))
        .collect();
    images.sort();

    if images.is_empty() {
        return Err(ToolError::Failed("no images rasterized from PDF".into()));
    }

    let mut parts = Vec::with_capacity(images.len());
    for image in &images {
        let output = Command::new("tesseract")
            .arg(image)
            .arg("stdout")
            .args(["-l", language])
            .output();
        match tool_output(output, "tesseract") {
            Ok(text) => parts.push(text),
            Err(ToolError::NotFound(tool)) => return Err(ToolError::NotFound(tool)),
            Err(ToolError::Failed(message)) => {
                warn!("OCR failed for {}: {}", image.display(), message)
            }
        }
    }

    Ok(parts.join("\n"))
}
