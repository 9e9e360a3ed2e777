//! Hierarchical geocoder for extracted toponyms.
//!
//! Resolution order: already-resolved (gazetteer) locations are left alone,
//! then the LRU cache, then the remote Nominatim-style service. All outbound
//! requests pass through one mutex-guarded critical section that enforces a
//! minimum inter-request interval, regardless of caller concurrency.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::GeocodingConfig;
use crate::models::{Location, LocationCategory, Provenance};
use crate::retry::{is_retryable_status, RetryPolicy};

#[derive(Debug, Error)]
enum GeocodeError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("no result")]
    Empty,
}

impl GeocodeError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status(status) => is_retryable_status(*status),
            Self::Empty => false,
        }
    }
}

/// Nominatim search result row. Coordinates come as strings.
#[derive(Debug, Deserialize)]
struct GeocodeHit {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Clone)]
enum CachedOutcome {
    Resolved {
        latitude: f64,
        longitude: f64,
        display_name: Option<String>,
    },
    Unresolved,
}

/// Cache and throttle state. One lock guards both, which also makes the
/// lock the global critical section around outbound requests.
struct GeocoderState {
    cache: LruCache<(LocationCategory, String), CachedOutcome>,
    last_request: Option<Instant>,
}

/// Resolves toponyms to coordinates via a remote geocoding service.
pub struct Geocoder {
    client: Client,
    search_url: String,
    locality_suffix: String,
    min_interval: Duration,
    retry: RetryPolicy,
    state: Mutex<GeocoderState>,
    requests_issued: AtomicU64,
}

impl Geocoder {
    pub fn new(config: &GeocodingConfig, city: &str) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("ratsgeo/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout())
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;

        let search_url = format!("{}/search", config.service_url.trim_end_matches('/'));
        let cache_size = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            client,
            search_url,
            locality_suffix: format!(", {}, {}", capitalize(city), config.country),
            min_interval: config.rate_limit(),
            retry: RetryPolicy::new(config.retries, Duration::from_secs(2)),
            state: Mutex::new(GeocoderState {
                cache: LruCache::new(cache_size),
                last_request: None,
            }),
            requests_issued: AtomicU64::new(0),
        })
    }

    /// Number of outbound requests issued so far in this run.
    pub fn requests_issued(&self) -> u64 {
        self.requests_issued.load(Ordering::Relaxed)
    }

    /// Attach coordinates and provenance to a location. Idempotent: a
    /// location the gazetteer already resolved is left untouched, and
    /// registry identifiers (plan references, parcel numbers) are never sent
    /// to the remote service.
    pub async fn resolve(&self, location: &mut Location) {
        if location.is_resolved() || location.provenance == Provenance::Gazetteer {
            return;
        }
        if !location.category.is_geocodable() {
            location.provenance = Provenance::Unresolved;
            return;
        }

        let key = (location.category, location.canonical_name.to_lowercase());

        // The lock is held across the outbound request on purpose: the
        // throttle is a global critical section.
        let mut state = self.state.lock().await;

        if let Some(outcome) = state.cache.get(&key) {
            debug!("Geocode cache hit: {}", location.canonical_name);
            apply(location, outcome.clone());
            return;
        }

        let query = format!("{}{}", location.canonical_name, self.locality_suffix);
        let outcome = self.query_remote(&mut state, &query).await;
        state.cache.put(key, outcome.clone());
        apply(location, outcome);
    }

    /// Issue the throttled remote lookup with retry on transient failures.
    async fn query_remote(&self, state: &mut GeocoderState, query: &str) -> CachedOutcome {
        let mut attempt = 0u32;
        loop {
            self.throttle(state).await;
            self.requests_issued.fetch_add(1, Ordering::Relaxed);

            match self.try_query(query).await {
                Ok(hit) => {
                    let parsed = hit
                        .lat
                        .parse::<f64>()
                        .ok()
                        .zip(hit.lon.parse::<f64>().ok());
                    let Some((latitude, longitude)) =
                        parsed.and_then(|(lat, lon)| validate_coords(lat, lon))
                    else {
                        warn!("Discarding unusable coordinates for '{}'", query);
                        return CachedOutcome::Unresolved;
                    };
                    debug!("Geocoded '{}' -> ({}, {})", query, latitude, longitude);
                    return CachedOutcome::Resolved {
                        latitude,
                        longitude,
                        display_name: hit.display_name,
                    };
                }
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Geocoding attempt {} failed for '{}': {} - retrying in {:?}",
                        attempt + 1,
                        query,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!("Geocoding gave up for '{}': {}", query, e);
                    return CachedOutcome::Unresolved;
                }
            }
        }
    }

    async fn try_query(&self, query: &str) -> Result<GeocodeHit, GeocodeError> {
        let response = self
            .client
            .get(&self.search_url)
            .query(&[("q", query), ("format", "json"), ("limit", "1")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GeocodeError::Status(status.as_u16()));
        }

        let mut hits: Vec<GeocodeHit> = response.json().await.map_err(GeocodeError::Http)?;
        if hits.is_empty() {
            return Err(GeocodeError::Empty);
        }
        Ok(hits.remove(0))
    }

    /// Block until the minimum interval since the previous request has
    /// elapsed, then stamp the request start.
    async fn throttle(&self, state: &mut GeocoderState) {
        if let Some(last) = state.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        state.last_request = Some(Instant::now());
    }
}

/// Keep only coordinates inside the valid WGS84 ranges; anything else is
/// treated as an empty result.
fn validate_coords(latitude: f64, longitude: f64) -> Option<(f64, f64)> {
    if (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude) {
        Some((latitude, longitude))
    } else {
        None
    }
}

fn apply(location: &mut Location, outcome: CachedOutcome) {
    match outcome {
        CachedOutcome::Resolved {
            latitude,
            longitude,
            display_name,
        } => {
            location.latitude = Some(latitude);
            location.longitude = Some(longitude);
            location.display_name = display_name;
            location.provenance = Provenance::RemoteGeocoder;
        }
        CachedOutcome::Unresolved => {
            location.latitude = None;
            location.longitude = None;
            location.provenance = Provenance::Unresolved;
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
