//! OParl API client with lazy, memory-bounded pagination.
//!
//! The list endpoint delivers `{ "data": [...], "links": { "next": ... } }`
//! envelopes. `PaperStream` pulls one page at a time and yields individual
//! papers, so arbitrarily long result sets never materialize in memory.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ApiConfig;
use crate::models::Paper;
use crate::retry::{is_retryable_status, RetryPolicy};

/// Pause between successive page fetches, to be nice to the API.
const PAGE_DELAY: Duration = Duration::from_millis(200);

/// API failure that ends the paper stream.
///
/// Transient failures (timeouts, 5xx, 429) are retried internally; this
/// error only surfaces once the retry budget is exhausted or the failure is
/// terminal. The state store already reflects which papers were seen, so the
/// next run resumes cleanly.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed for {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Malformed response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("Gave up on {url} after {attempts} attempts")]
    Exhausted { url: String, attempts: u32 },

    #[error("API response missing expected field: {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Default, Deserialize)]
struct PageLinks {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListEnvelope {
    #[serde(default)]
    data: Vec<serde_json::Value>,
    #[serde(default)]
    links: PageLinks,
}

/// Client for an OParl-like system endpoint.
pub struct OParlClient {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl OParlClient {
    pub fn new(config: &ApiConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(concat!("ratsgeo/", env!("CARGO_PKG_VERSION")))
            .timeout(config.http_timeout())
            .gzip(true)
            .build()
            .map_err(|source| FetchError::Http {
                url: config.base_url.clone(),
                source,
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            retry: config.retry_policy(),
        })
    }

    /// Fetch a JSON document with retry on transient failures.
    async fn get_json(&self, url: &str) -> Result<serde_json::Value, FetchError> {
        let mut attempt = 0u32;
        loop {
            match self.try_get_json(url).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Retryable failure fetching {} (attempt {}): {} - waiting {:?}",
                        url,
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    warn!("Exhausted retries for {}: {}", url, e);
                    return Err(FetchError::Exhausted {
                        url: url.to_string(),
                        attempts: attempt + 1,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_get_json(&self, url: &str) -> Result<serde_json::Value, FetchError> {
        let response =
            self.client
                .get(url)
                .send()
                .await
                .map_err(|source| FetchError::Http {
                    url: url.to_string(),
                    source,
                })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .json()
            .await
            .map_err(|e| FetchError::Decode {
                url: url.to_string(),
                message: e.to_string(),
            })
    }

    /// Resolve the paper list endpoint by walking system -> body -> paper.
    async fn papers_endpoint(&self) -> Result<String, FetchError> {
        let system = self.get_json(&self.base_url).await?;

        // "body" may be a URL or a list of URLs.
        let bodies_url = match system.get("body") {
            Some(serde_json::Value::String(url)) => url.clone(),
            Some(serde_json::Value::Array(urls)) => urls
                .first()
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or(FetchError::MissingField("body"))?,
            _ => return Err(FetchError::MissingField("body")),
        };

        debug!("Fetching body list from {}", bodies_url);
        let bodies = self.get_json(&bodies_url).await?;
        let first_body = bodies
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|a| a.first())
            .ok_or(FetchError::MissingField("data"))?;

        // The list entry usually inlines the paper endpoint; fetch the body
        // detail only when it does not.
        if let Some(paper_url) = first_body.get("paper").and_then(|p| p.as_str()) {
            return Ok(paper_url.to_string());
        }
        let body_id = first_body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or(FetchError::MissingField("id"))?;
        let body = self.get_json(body_id).await?;
        body.get("paper")
            .and_then(|p| p.as_str())
            .map(str::to_string)
            .ok_or(FetchError::MissingField("paper"))
    }

    /// Start a lazy stream of papers modified within the window.
    ///
    /// The endpoint filters on `modified_since`; papers dated outside the
    /// window may still be yielded (the orchestrator filters on the upper
    /// bound).
    pub async fn iterate_papers(
        &self,
        window_start: DateTime<Utc>,
        _window_end: DateTime<Utc>,
        page_limit: Option<u32>,
    ) -> Result<PaperStream, FetchError> {
        let papers_url = self.papers_endpoint().await?;

        let mut url = url::Url::parse(&papers_url).map_err(|e| FetchError::Decode {
            url: papers_url.clone(),
            message: e.to_string(),
        })?;
        url.query_pairs_mut()
            .append_pair("modified_since", &window_start.to_rfc3339());

        info!("Streaming papers from {}", url);
        Ok(PaperStream {
            client: self.client.clone(),
            retry: self.retry,
            next_url: Some(url.to_string()),
            buffer: VecDeque::new(),
            pages_fetched: 0,
            page_limit,
        })
    }
}

/// Lazy sequence of papers; pulls the next page only when the buffer runs
/// dry. Finite, but must never be collected into memory wholesale.
pub struct PaperStream {
    client: Client,
    retry: RetryPolicy,
    next_url: Option<String>,
    buffer: VecDeque<Paper>,
    pages_fetched: u32,
    page_limit: Option<u32>,
}

impl PaperStream {
    /// Yield the next paper, or `None` when the stream is exhausted.
    pub async fn next(&mut self) -> Result<Option<Paper>, FetchError> {
        loop {
            if let Some(paper) = self.buffer.pop_front() {
                return Ok(Some(paper));
            }

            if let Some(limit) = self.page_limit {
                if self.pages_fetched >= limit {
                    info!("Reached page limit: {}", limit);
                    return Ok(None);
                }
            }

            let Some(url) = self.next_url.take() else {
                return Ok(None);
            };

            self.fetch_page(&url).await?;
            if self.pages_fetched > 1 {
                tokio::time::sleep(PAGE_DELAY).await;
            }
            if self.pages_fetched % 10 == 0 {
                info!("Fetched {} pages so far", self.pages_fetched);
            }
        }
    }

    async fn fetch_page(&mut self, url: &str) -> Result<(), FetchError> {
        let mut attempt = 0u32;
        let envelope: ListEnvelope = loop {
            let result = async {
                let response =
                    self.client
                        .get(url)
                        .send()
                        .await
                        .map_err(|source| FetchError::Http {
                            url: url.to_string(),
                            source,
                        })?;
                let status = response.status();
                if !status.is_success() {
                    return Err(FetchError::Status {
                        url: url.to_string(),
                        status: status.as_u16(),
                    });
                }
                response
                    .json::<ListEnvelope>()
                    .await
                    .map_err(|e| classify_body_error(url, status, e))
            }
            .await;

            match result {
                Ok(envelope) => break envelope,
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Page fetch failed (attempt {}): {} - waiting {:?}",
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    return Err(FetchError::Exhausted {
                        url: url.to_string(),
                        attempts: attempt + 1,
                    });
                }
                Err(e) => return Err(e),
            }
        };

        for item in envelope.data {
            match serde_json::from_value::<Paper>(item) {
                Ok(paper) if !paper.id.is_empty() => self.buffer.push_back(paper),
                Ok(_) => warn!("Skipping paper record without id"),
                Err(e) => warn!("Skipping undecodable paper record: {}", e),
            }
        }

        self.next_url = envelope.links.next;
        self.pages_fetched += 1;
        debug!(
            "Page {} delivered {} papers (next: {})",
            self.pages_fetched,
            self.buffer.len(),
            self.next_url.as_deref().unwrap_or("-")
        );
        Ok(())
    }
}

/// A JSON decode failure on a 2xx page is malformed data, not a transient
/// network hiccup.
fn classify_body_error(url: &str, _status: StatusCode, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Http {
            url: url.to_string(),
            source: e,
        }
    } else {
        FetchError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

impl FetchError {
    /// Timeouts, connection failures, 429 and 5xx are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            Self::Status { status, .. } => is_retryable_status(*status),
            Self::Decode { .. } | Self::Exhausted { .. } | Self::MissingField(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_parses_with_missing_links() {
        let envelope: ListEnvelope = serde_json::from_str(r#"{"data": []}"#).unwrap();
        assert!(envelope.data.is_empty());
        assert!(envelope.links.next.is_none());
    }

    #[test]
    fn envelope_parses_papers_and_next() {
        let json = r#"{
            "data": [
                {"id": "https://api.example.org/paper/1", "name": "Erste Vorlage"},
                {"id": "https://api.example.org/paper/2", "name": "Zweite Vorlage"}
            ],
            "links": {"next": "https://api.example.org/paper?page=2"}
        }"#;
        let envelope: ListEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.data.len(), 2);
        assert_eq!(
            envelope.links.next.as_deref(),
            Some("https://api.example.org/paper?page=2")
        );
    }

    #[test]
    fn status_retryability() {
        let terminal = FetchError::Status {
            url: "https://x".into(),
            status: 404,
        };
        assert!(!terminal.is_retryable());

        let transient = FetchError::Status {
            url: "https://x".into(),
            status: 503,
        };
        assert!(transient.is_retryable());

        let throttled = FetchError::Status {
            url: "https://x".into(),
            status: 429,
        };
        assert!(throttled.is_retryable());
    }
}
