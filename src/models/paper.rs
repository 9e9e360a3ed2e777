//! Paper models for OParl council documents.
//!
//! A Paper is the unit of processing: one council document record with zero
//! or more attached files. The API-assigned URL is the stable identifier
//! across runs.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Processing status of a paper within the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaperStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl PaperStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Whether the status is terminal for the current run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// A file attached to a paper (OParl `File` object, inlined).
///
/// Transient: consumed during extraction, never persisted as an entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperFile {
    /// Direct download URL for the file content.
    #[serde(rename = "accessUrl", default)]
    pub access_url: Option<String>,
    /// MIME type as reported by the API.
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
    /// Size in bytes, when the API reports it.
    #[serde(default)]
    pub size: Option<u64>,
    /// Original filename.
    #[serde(rename = "fileName", default)]
    pub file_name: Option<String>,
}

impl PaperFile {
    /// Whether this file looks like a PDF we can extract from.
    pub fn is_pdf(&self) -> bool {
        match &self.mime_type {
            Some(m) => m.contains("pdf"),
            // Many endpoints omit the MIME type; trust the access URL then.
            None => self
                .access_url
                .as_deref()
                .is_some_and(|u| u.to_lowercase().contains(".pdf")),
        }
    }
}

/// A council document record as delivered by the OParl list endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Paper {
    /// API-assigned URL; globally unique and stable across runs.
    pub id: String,
    /// Human-readable title.
    #[serde(default)]
    pub name: String,
    /// Reference code (e.g. "BSV/2024/0815").
    #[serde(default)]
    pub reference: Option<String>,
    /// Publication date.
    #[serde(default, deserialize_with = "lenient_date")]
    pub date: Option<NaiveDate>,
    /// Document-type label (e.g. "Beschlussvorlage").
    #[serde(rename = "paperType", default)]
    pub paper_type: Option<String>,
    /// Pre-selected main file, when the API provides one.
    #[serde(rename = "mainFile", default)]
    pub main_file: Option<PaperFile>,
    /// All attached files.
    #[serde(rename = "file", default)]
    pub files: Vec<PaperFile>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
}

/// A paper after extraction and enrichment, ready for the sinks.
#[derive(Debug, Clone)]
pub struct ProcessedPaper {
    pub paper: Paper,
    pub pdf_url: String,
    pub full_text: String,
    /// Extraction-method tag ("text_layer", "layout", "ocr").
    pub extraction_method: String,
    pub page_count: u32,
    pub locations: Vec<crate::models::Location>,
}

/// Endpoints deliver `date` as a plain date or a full datetime; take the
/// date part and drop anything unparseable rather than failing the record.
fn lenient_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.and_then(|s| s.get(..10).and_then(|d| d.parse().ok())))
}

impl Paper {
    /// Pick the PDF URL to extract from: the main file when present,
    /// otherwise the first attached file that looks like a PDF.
    pub fn pdf_url(&self) -> Option<&str> {
        if let Some(main) = &self.main_file {
            if let Some(url) = main.access_url.as_deref() {
                return Some(url);
            }
        }
        self.files
            .iter()
            .find(|f| f.is_pdf())
            .and_then(|f| f.access_url.as_deref())
    }

    /// Trailing path segment of the API URL, used for compact URIs.
    pub fn short_id(&self) -> &str {
        self.id.rsplit('/').next().unwrap_or(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for status in [
            PaperStatus::Pending,
            PaperStatus::InProgress,
            PaperStatus::Completed,
            PaperStatus::Failed,
            PaperStatus::Skipped,
        ] {
            assert_eq!(PaperStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(PaperStatus::from_str("bogus"), None);
    }

    #[test]
    fn pdf_url_prefers_main_file() {
        let paper = Paper {
            id: "https://api.example.org/paper/42".into(),
            main_file: Some(PaperFile {
                access_url: Some("https://api.example.org/file/1.pdf".into()),
                mime_type: Some("application/pdf".into()),
                ..Default::default()
            }),
            files: vec![PaperFile {
                access_url: Some("https://api.example.org/file/2.pdf".into()),
                mime_type: Some("application/pdf".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(paper.pdf_url(), Some("https://api.example.org/file/1.pdf"));
        assert_eq!(paper.short_id(), "42");
    }

    #[test]
    fn pdf_url_falls_back_to_first_pdf_file() {
        let paper = Paper {
            id: "https://api.example.org/paper/43".into(),
            files: vec![
                PaperFile {
                    access_url: Some("https://api.example.org/file/3.docx".into()),
                    mime_type: Some("application/msword".into()),
                    ..Default::default()
                },
                PaperFile {
                    access_url: Some("https://api.example.org/file/4.pdf".into()),
                    mime_type: Some("application/pdf".into()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(paper.pdf_url(), Some("https://api.example.org/file/4.pdf"));
    }

    #[test]
    fn parses_oparl_envelope_item() {
        let json = r#"{
            "id": "https://oparl.example.org/paper/9",
            "name": "Sanierung der Ludwigstraße",
            "reference": "BSV/24/0009",
            "date": "2024-05-13",
            "paperType": "Beschlussvorlage",
            "mainFile": {
                "accessUrl": "https://oparl.example.org/file/9.pdf",
                "mimeType": "application/pdf",
                "size": 52341,
                "fileName": "vorlage.pdf"
            }
        }"#;
        let paper: Paper = serde_json::from_str(json).unwrap();
        assert_eq!(paper.short_id(), "9");
        assert_eq!(paper.date.unwrap().to_string(), "2024-05-13");
        assert!(paper.main_file.unwrap().is_pdf());
    }

    #[test]
    fn tolerates_datetime_in_date_field() {
        let json = r#"{"id": "https://x/paper/1", "date": "2024-05-13T00:00:00+02:00"}"#;
        let paper: Paper = serde_json::from_str(json).unwrap();
        assert_eq!(paper.date.unwrap().to_string(), "2024-05-13");

        let json = r#"{"id": "https://x/paper/2", "date": "kein Datum"}"#;
        let paper: Paper = serde_json::from_str(json).unwrap();
        assert!(paper.date.is_none());
    }
}
