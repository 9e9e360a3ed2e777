//! Location models: toponyms extracted from document text and their
//! geocoded form.
//!
//! Every `Location` carries the paper id and the source PDF URL of the
//! document it was extracted from, so downstream consumers can always link
//! back to the authoritative file.

use serde::{Deserialize, Serialize};

/// What kind of geographic reference a toponym is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationCategory {
    /// A named street, optionally with a house number.
    Street,
    /// A city district or quarter.
    District,
    /// A development-plan code (Bebauungsplan number).
    PlanReference,
    /// A cadastral parcel number (Flurstück).
    ParcelNumber,
    /// A place name not matching any other category.
    OtherPlace,
}

impl LocationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Street => "street",
            Self::District => "district",
            Self::PlanReference => "plan_reference",
            Self::ParcelNumber => "parcel_number",
            Self::OtherPlace => "other_place",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "street" => Some(Self::Street),
            "district" => Some(Self::District),
            "plan_reference" => Some(Self::PlanReference),
            "parcel_number" => Some(Self::ParcelNumber),
            "other_place" => Some(Self::OtherPlace),
            _ => None,
        }
    }

    /// Plan references and parcel numbers are registry identifiers, not
    /// addresses; the remote geocoder cannot resolve them.
    pub fn is_geocodable(&self) -> bool {
        !matches!(self, Self::PlanReference | Self::ParcelNumber)
    }
}

/// Where the coordinates (or the lack of them) came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Resolved from the local gazetteer; no external request was made.
    Gazetteer,
    /// Resolved by the remote geocoding service.
    RemoteGeocoder,
    /// No resolution; coordinates are absent.
    Unresolved,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gazetteer => "gazetteer",
            Self::RemoteGeocoder => "remote_geocoder",
            Self::Unresolved => "unresolved",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "gazetteer" => Some(Self::Gazetteer),
            "remote_geocoder" => Some(Self::RemoteGeocoder),
            "unresolved" => Some(Self::Unresolved),
            _ => None,
        }
    }
}

/// How the extractor found a toponym in the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    /// Whole-word hit on a gazetteer entry or alias.
    GazetteerDirect,
    /// NER candidate fuzzy-matched to a gazetteer entry.
    NerValidated,
    /// NER candidate with no gazetteer match.
    NerRaw,
    /// Structured pattern (plan code, parcel number, address).
    Regex,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GazetteerDirect => "gazetteer_direct",
            Self::NerValidated => "ner_validated",
            Self::NerRaw => "ner_raw",
            Self::Regex => "regex",
        }
    }
}

/// An unresolved toponym candidate produced by one extraction pass.
#[derive(Debug, Clone)]
pub struct CandidateToponym {
    /// Surface string exactly as it appeared in the text.
    pub surface: String,
    pub category: LocationCategory,
    pub method: MatchMethod,
}

/// A toponym attributed to a paper, with coordinates once resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    /// Identifier of the paper this location was extracted from.
    pub paper_id: String,
    /// Source PDF the toponym appeared in. Never empty.
    pub pdf_url: String,
    pub category: LocationCategory,
    /// Canonical name after gazetteer normalization, or the cleaned surface
    /// string when no gazetteer entry matched.
    pub canonical_name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Display string from the geocoding source.
    pub display_name: Option<String>,
    pub provenance: Provenance,
    pub method: MatchMethod,
    /// Number of mentions collapsed into this entry.
    pub mention_count: u32,
}

impl Location {
    pub fn new(
        paper_id: &str,
        pdf_url: &str,
        category: LocationCategory,
        canonical_name: String,
        method: MatchMethod,
    ) -> Self {
        Self {
            paper_id: paper_id.to_string(),
            pdf_url: pdf_url.to_string(),
            category,
            canonical_name,
            latitude: None,
            longitude: None,
            display_name: None,
            provenance: Provenance::Unresolved,
            method,
            mention_count: 1,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }

    /// Dedup key: same canonical name (case-insensitive) in the same
    /// category is one location.
    pub fn dedup_key(&self) -> (LocationCategory, String) {
        (self.category, self.canonical_name.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips() {
        for cat in [
            LocationCategory::Street,
            LocationCategory::District,
            LocationCategory::PlanReference,
            LocationCategory::ParcelNumber,
            LocationCategory::OtherPlace,
        ] {
            assert_eq!(LocationCategory::from_str(cat.as_str()), Some(cat));
        }
    }

    #[test]
    fn registry_categories_are_not_geocodable() {
        assert!(!LocationCategory::PlanReference.is_geocodable());
        assert!(!LocationCategory::ParcelNumber.is_geocodable());
        assert!(LocationCategory::Street.is_geocodable());
        assert!(LocationCategory::District.is_geocodable());
    }

    #[test]
    fn dedup_key_ignores_case() {
        let a = Location::new(
            "p1",
            "https://x/1.pdf",
            LocationCategory::Street,
            "Ludwigstraße".into(),
            MatchMethod::GazetteerDirect,
        );
        let b = Location::new(
            "p1",
            "https://x/1.pdf",
            LocationCategory::Street,
            "ludwigstraße".into(),
            MatchMethod::Regex,
        );
        assert_eq!(a.dedup_key(), b.dedup_key());
    }
}
