//! Local gazetteer: authoritative toponyms with coordinates.
//!
//! Loaded once at startup from a GeoJSON FeatureCollection and read-only for
//! the rest of the run, so it can be shared across workers without locking.
//! A gazetteer hit short-circuits remote geocoding entirely.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::models::LocationCategory;

#[derive(Debug, Error)]
pub enum GazetteerError {
    #[error("Failed to read gazetteer {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse gazetteer {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    properties: FeatureProperties,
    #[serde(default)]
    geometry: Option<Geometry>,
}

#[derive(Debug, Default, Deserialize)]
struct FeatureProperties {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, alias = "alt_names", alias = "alternative_names")]
    aliases: Vec<String>,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    coordinates: Vec<f64>,
}

/// One known toponym. Read-only after load.
#[derive(Debug, Clone)]
pub struct GazetteerEntry {
    pub canonical: String,
    /// Lowercased canonical form, the primary match key.
    pub normalized: String,
    /// Lowercased alternate spellings.
    pub aliases: Vec<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub category: LocationCategory,
}

/// Immutable set of known toponyms with an exact-lookup index.
pub struct Gazetteer {
    entries: Vec<GazetteerEntry>,
    by_name: HashMap<String, usize>,
}

impl Gazetteer {
    pub fn load(path: &Path) -> Result<Self, GazetteerError> {
        let contents = fs::read_to_string(path).map_err(|source| GazetteerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let collection: FeatureCollection =
            serde_json::from_str(&contents).map_err(|e| GazetteerError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        let gazetteer = Self::from_features(collection);
        info!(
            "Gazetteer loaded: {} entries from {}",
            gazetteer.len(),
            path.display()
        );
        Ok(gazetteer)
    }

    /// Build from an in-memory GeoJSON string (tests, embedded data).
    pub fn from_geojson(geojson: &str) -> Result<Self, GazetteerError> {
        let collection: FeatureCollection =
            serde_json::from_str(geojson).map_err(|e| GazetteerError::Parse {
                path: PathBuf::from("<inline>"),
                message: e.to_string(),
            })?;
        Ok(Self::from_features(collection))
    }

    fn from_features(collection: FeatureCollection) -> Self {
        let mut entries = Vec::new();
        let mut by_name = HashMap::new();

        for feature in collection.features {
            let Some(name) = feature.properties.name else {
                continue;
            };
            let name = name.trim().to_string();
            if name.is_empty() {
                continue;
            }

            let (latitude, longitude) = match &feature.geometry {
                Some(geom) if geom.kind == "Point" && geom.coordinates.len() == 2 => {
                    // GeoJSON order is [lon, lat].
                    (Some(geom.coordinates[1]), Some(geom.coordinates[0]))
                }
                _ => (None, None),
            };

            let category = feature
                .properties
                .category
                .as_deref()
                .and_then(LocationCategory::from_str)
                .unwrap_or(LocationCategory::Street);

            let normalized = name.to_lowercase();
            let aliases: Vec<String> = feature
                .properties
                .aliases
                .iter()
                .map(|a| a.trim().to_lowercase())
                .filter(|a| !a.is_empty())
                .collect();

            let index = entries.len();
            if by_name.contains_key(&normalized) {
                continue;
            }
            by_name.insert(normalized.clone(), index);
            for alias in &aliases {
                by_name.entry(alias.clone()).or_insert(index);
            }

            entries.push(GazetteerEntry {
                canonical: name,
                normalized,
                aliases,
                latitude,
                longitude,
                category,
            });
        }

        Self { entries, by_name }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GazetteerEntry> {
        self.entries.iter()
    }

    /// Exact case-insensitive lookup by canonical name or alias.
    pub fn lookup(&self, name: &str) -> Option<&GazetteerEntry> {
        self.by_name
            .get(&name.trim().to_lowercase())
            .map(|&i| &self.entries[i])
    }

    /// Best fuzzy match for a candidate toponym, or `None` below threshold.
    ///
    /// A match counts when the Jaro-Winkler similarity reaches `threshold`
    /// or the edit distance is at most 2 (short names trip the ratio test).
    pub fn best_fuzzy_match(&self, candidate: &str, threshold: f64) -> Option<&GazetteerEntry> {
        let needle = candidate.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }

        let mut best: Option<(&GazetteerEntry, f64)> = None;
        for entry in &self.entries {
            let mut score = strsim::jaro_winkler(&needle, &entry.normalized);
            for alias in &entry.aliases {
                score = score.max(strsim::jaro_winkler(&needle, alias));
            }
            if strsim::levenshtein(&needle, &entry.normalized) <= 2 {
                score = score.max(threshold);
            }
            if score >= threshold && best.map_or(true, |(_, s)| score > s) {
                best = Some((entry, score));
            }
        }
        best.map(|(entry, _)| entry)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_gazetteer() -> Gazetteer {
        Gazetteer::from_geojson(
            r#"{
                "type": "FeatureCollection",
                "features": [
                    {
                        "type": "Feature",
                        "properties": {"name": "Ludwigstraße", "alt_names": ["Ludwigstr."]},
                        "geometry": {"type": "Point", "coordinates": [10.8901, 48.3456]}
                    },
                    {
                        "type": "Feature",
                        "properties": {"name": "Königsplatz"},
                        "geometry": {"type": "Point", "coordinates": [10.8933, 48.3653]}
                    },
                    {
                        "type": "Feature",
                        "properties": {"name": "Oberhausen", "category": "district"},
                        "geometry": null
                    }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn loads_names_and_coordinates() {
        let gazetteer = sample_gazetteer();
        assert_eq!(gazetteer.len(), 3);

        let entry = gazetteer.lookup("ludwigstraße").unwrap();
        assert_eq!(entry.canonical, "Ludwigstraße");
        assert_eq!(entry.latitude, Some(48.3456));
        assert_eq!(entry.longitude, Some(10.8901));
        assert_eq!(entry.category, LocationCategory::Street);
    }

    #[test]
    fn alias_resolves_to_same_entry() {
        let gazetteer = sample_gazetteer();
        let entry = gazetteer.lookup("Ludwigstr.").unwrap();
        assert_eq!(entry.canonical, "Ludwigstraße");
    }

    #[test]
    fn district_category_is_honored() {
        let gazetteer = sample_gazetteer();
        let entry = gazetteer.lookup("Oberhausen").unwrap();
        assert_eq!(entry.category, LocationCategory::District);
        assert!(entry.latitude.is_none());
    }

    #[test]
    fn fuzzy_match_tolerates_typos() {
        let gazetteer = sample_gazetteer();
        let entry = gazetteer.best_fuzzy_match("Ludwigstrase", 0.85).unwrap();
        assert_eq!(entry.canonical, "Ludwigstraße");

        assert!(gazetteer.best_fuzzy_match("Hauptbahnhof", 0.85).is_none());
    }

    #[test]
    fn empty_candidate_never_matches() {
        let gazetteer = sample_gazetteer();
        assert!(gazetteer.best_fuzzy_match("  ", 0.85).is_none());
    }
}
