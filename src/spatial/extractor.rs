//! Hybrid toponym extraction: gazetteer scan, structured-reference regexes
//! and NER candidates with fuzzy gazetteer validation.
//!
//! The extractor is total: empty text yields an empty list, never an error.
//! Every emitted location carries the paper id and PDF URL supplied by the
//! caller.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use crate::models::{CandidateToponym, Location, LocationCategory, MatchMethod, Provenance};

use super::{Gazetteer, GazetteerEntry, NerTagger};

struct Patterns {
    plan: Regex,
    parcel: Regex,
    address: Regex,
    district: Regex,
}

impl Patterns {
    fn compile() -> Self {
        Self {
            // "Bebauungsplan Nr. 45", "B-Plan 281 II"
            plan: Regex::new(
                r"(?i)(?:Bebauungsplan|B-Plan)(?:\s+(?:Nr\.?|Nummer))?\s*([A-Z]?\d+[a-z]?(?:\s*[-/]\s*\d+)?)",
            )
            .expect("plan pattern"),
            // "Flurstück Nr. 123/4", "Flur 17"
            parcel: Regex::new(
                r"(?i)Flur(?:stück)?(?:\s+(?:Nr\.?|Nummer))?\s*(\d+(?:\s*/\s*\d+)?)",
            )
            .expect("parcel pattern"),
            // "Ludwigstraße 12a"
            address: Regex::new(
                r"([A-ZÄÖÜ][a-zäöüß]+(?:straße|strasse|platz|weg|allee|gasse)|[A-ZÄÖÜ][a-zäöüß]+str\.)\s+(\d+[a-z]?)",
            )
            .expect("address pattern"),
            // "Stadtteil Oberhausen", "Stadtbezirk Lechhausen"
            district: Regex::new(r"(?:Stadtteil|Stadtbezirk)\s+([A-ZÄÖÜ][a-zäöüß\-]+)")
                .expect("district pattern"),
        }
    }
}

/// Extracts candidate locations from document text.
pub struct LocationExtractor {
    gazetteer: Arc<Gazetteer>,
    tagger: Option<NerTagger>,
    blocklist: HashSet<String>,
    fuzzy_threshold: f64,
    patterns: Patterns,
}

impl LocationExtractor {
    pub fn new(gazetteer: Arc<Gazetteer>, tagger: Option<NerTagger>, fuzzy_threshold: f64) -> Self {
        Self {
            gazetteer,
            tagger,
            blocklist: HashSet::new(),
            fuzzy_threshold,
            patterns: Patterns::compile(),
        }
    }

    /// Load the NER false-positive blocklist, one entry per line. `#` starts
    /// a comment.
    pub fn with_blocklist_file(mut self, path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => {
                self.blocklist = contents
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_lowercase)
                    .collect();
                debug!(
                    "Loaded {} blocklist entries from {}",
                    self.blocklist.len(),
                    path.display()
                );
            }
            Err(e) => warn!("Could not read blocklist {}: {}", path.display(), e),
        }
        self
    }

    #[cfg(test)]
    pub fn with_blocklist(mut self, entries: &[&str]) -> Self {
        self.blocklist = entries.iter().map(|e| e.to_lowercase()).collect();
        self
    }

    /// Extract locations from text. Coordinates are only pre-filled for
    /// gazetteer hits; everything else is resolved later by the geocoder.
    pub fn extract(&self, text: &str, paper_id: &str, pdf_url: &str) -> Vec<Location> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut locations: Vec<Location> = Vec::new();
        let haystack = text.to_lowercase();

        // Pass 1: gazetteer scan (strongest evidence, carries coordinates).
        for entry in self.gazetteer.iter() {
            let hit = contains_whole_word(&haystack, &entry.normalized)
                || entry
                    .aliases
                    .iter()
                    .any(|alias| contains_whole_word(&haystack, alias));
            if hit {
                locations.push(self.gazetteer_location(
                    entry,
                    paper_id,
                    pdf_url,
                    MatchMethod::GazetteerDirect,
                ));
            }
        }

        // Pass 2: structured references.
        for capture in self.patterns.plan.captures_iter(text) {
            let number = capture[1].trim().to_string();
            locations.push(Location::new(
                paper_id,
                pdf_url,
                LocationCategory::PlanReference,
                format!("Bebauungsplan {number}"),
                MatchMethod::Regex,
            ));
        }
        for capture in self.patterns.parcel.captures_iter(text) {
            let number = capture[1].trim().to_string();
            locations.push(Location::new(
                paper_id,
                pdf_url,
                LocationCategory::ParcelNumber,
                format!("Flurstück {number}"),
                MatchMethod::Regex,
            ));
        }
        for capture in self.patterns.address.captures_iter(text) {
            let street = capture[1].trim();
            let number = capture[2].trim();
            // A known street folds into its gazetteer entry so no remote
            // lookup is ever issued for it.
            match self.gazetteer.lookup(street) {
                Some(entry) => locations.push(self.gazetteer_location(
                    entry,
                    paper_id,
                    pdf_url,
                    MatchMethod::Regex,
                )),
                None => locations.push(Location::new(
                    paper_id,
                    pdf_url,
                    LocationCategory::Street,
                    format!("{street} {number}"),
                    MatchMethod::Regex,
                )),
            }
        }
        for capture in self.patterns.district.captures_iter(text) {
            let district = capture[1].trim();
            if district.chars().count() > 3 {
                locations.push(Location::new(
                    paper_id,
                    pdf_url,
                    LocationCategory::District,
                    district.to_string(),
                    MatchMethod::Regex,
                ));
            }
        }

        // Pass 3: NER candidates, fuzzy-validated against the gazetteer.
        if let Some(tagger) = &self.tagger {
            for surface in tagger.candidates(text) {
                if self.blocklist.contains(&surface.to_lowercase()) {
                    continue;
                }
                let candidate = CandidateToponym {
                    surface,
                    category: LocationCategory::OtherPlace,
                    method: MatchMethod::NerRaw,
                };
                match self
                    .gazetteer
                    .best_fuzzy_match(&candidate.surface, self.fuzzy_threshold)
                {
                    Some(entry) => {
                        // Take the clean gazetteer name, not the raw span.
                        locations.push(self.gazetteer_location(
                            entry,
                            paper_id,
                            pdf_url,
                            MatchMethod::NerValidated,
                        ));
                    }
                    None => {
                        locations.push(Location::new(
                            paper_id,
                            pdf_url,
                            candidate.category,
                            candidate.surface,
                            candidate.method,
                        ));
                    }
                }
            }
        }

        dedupe(locations)
    }

    fn gazetteer_location(
        &self,
        entry: &GazetteerEntry,
        paper_id: &str,
        pdf_url: &str,
        method: MatchMethod,
    ) -> Location {
        let mut location = Location::new(
            paper_id,
            pdf_url,
            entry.category,
            entry.canonical.clone(),
            method,
        );
        location.latitude = entry.latitude;
        location.longitude = entry.longitude;
        location.provenance = Provenance::Gazetteer;
        location
    }
}

/// Collapse entries sharing (canonical_name, category); the first occurrence
/// keeps its provenance, later ones only bump the mention count.
fn dedupe(locations: Vec<Location>) -> Vec<Location> {
    let mut index: HashMap<(LocationCategory, String), usize> = HashMap::new();
    let mut unique: Vec<Location> = Vec::new();

    for location in locations {
        match index.entry(location.dedup_key()) {
            std::collections::hash_map::Entry::Occupied(slot) => {
                unique[*slot.get()].mention_count += 1;
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(unique.len());
                unique.push(location);
            }
        }
    }
    unique
}

/// Whole-word containment: the needle occurs and is not flanked by
/// alphanumeric characters. Both sides must already be lowercase.
fn contains_whole_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let mut search_from = 0;
    while let Some(offset) = haystack[search_from..].find(needle) {
        let start = search_from + offset;
        let end = start + needle.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        search_from = start + needle.len();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::gazetteer::tests::sample_gazetteer;

    fn extractor(with_ner: bool) -> LocationExtractor {
        let tagger = with_ner.then(|| NerTagger::new("rule"));
        LocationExtractor::new(Arc::new(sample_gazetteer()), tagger, 0.85)
    }

    const PAPER: &str = "https://api.example.org/paper/7";
    const PDF: &str = "https://api.example.org/file/7.pdf";

    #[test]
    fn empty_text_yields_empty_list() {
        assert!(extractor(true).extract("", PAPER, PDF).is_empty());
        assert!(extractor(true).extract("   \n ", PAPER, PDF).is_empty());
    }

    #[test]
    fn gazetteer_hit_carries_coordinates_and_provenance() {
        let locations = extractor(false).extract("Sanierung der Ludwigstraße 12", PAPER, PDF);
        let hit = locations
            .iter()
            .find(|l| l.canonical_name == "Ludwigstraße")
            .unwrap();
        assert_eq!(hit.provenance, Provenance::Gazetteer);
        assert_eq!(hit.method, MatchMethod::GazetteerDirect);
        assert_eq!(hit.latitude, Some(48.3456));
        assert_eq!(hit.longitude, Some(10.8901));
        assert_eq!(hit.paper_id, PAPER);
        assert_eq!(hit.pdf_url, PDF);
    }

    #[test]
    fn gazetteer_match_is_whole_word() {
        // "Altludwigstraße" must not match the entry "Ludwigstraße".
        let locations = extractor(false).extract("Die Altludwigstraße bleibt", PAPER, PDF);
        assert!(locations
            .iter()
            .all(|l| l.canonical_name != "Ludwigstraße"));
    }

    #[test]
    fn plan_references_are_found() {
        let locations =
            extractor(false).extract("Aufstellung Bebauungsplan Nr. 281 beschlossen", PAPER, PDF);
        let plan = locations
            .iter()
            .find(|l| l.category == LocationCategory::PlanReference)
            .unwrap();
        assert_eq!(plan.canonical_name, "Bebauungsplan 281");
        assert_eq!(plan.method, MatchMethod::Regex);
        assert_eq!(plan.provenance, Provenance::Unresolved);
    }

    #[test]
    fn parcel_numbers_are_found() {
        let locations = extractor(false).extract("betrifft Flurstück Nr. 123/4", PAPER, PDF);
        let parcel = locations
            .iter()
            .find(|l| l.category == LocationCategory::ParcelNumber)
            .unwrap();
        assert_eq!(parcel.canonical_name, "Flurstück 123/4");
    }

    #[test]
    fn addresses_are_found() {
        let locations = extractor(false).extract("Neubau Wertachstraße 29b geplant", PAPER, PDF);
        let address = locations
            .iter()
            .find(|l| l.canonical_name == "Wertachstraße 29b")
            .unwrap();
        assert_eq!(address.category, LocationCategory::Street);
    }

    #[test]
    fn districts_are_found() {
        let locations = extractor(false).extract("im Stadtteil Lechhausen", PAPER, PDF);
        let district = locations
            .iter()
            .find(|l| l.category == LocationCategory::District)
            .unwrap();
        assert_eq!(district.canonical_name, "Lechhausen");
    }

    #[test]
    fn ner_candidate_is_normalized_via_gazetteer() {
        // Misspelled ss-variant in the text; the clean gazetteer name must
        // win.
        let locations = extractor(true).extract("Umbau der Ludwigstrasse geplant", PAPER, PDF);
        let hit = locations
            .iter()
            .find(|l| l.canonical_name == "Ludwigstraße")
            .unwrap();
        assert_eq!(hit.method, MatchMethod::NerValidated);
        assert_eq!(hit.provenance, Provenance::Gazetteer);
    }

    #[test]
    fn unmatched_ner_candidate_becomes_other_place() {
        let locations = extractor(true).extract("Treffen am Hallstraße", PAPER, PDF);
        assert!(locations
            .iter()
            .any(|l| l.category == LocationCategory::OtherPlace
                || l.category == LocationCategory::Street));
    }

    #[test]
    fn blocklist_suppresses_candidates() {
        let extractor = LocationExtractor::new(
            Arc::new(sample_gazetteer()),
            Some(NerTagger::new("rule")),
            0.85,
        )
        .with_blocklist(&["Verkehrsweg"]);
        let locations = extractor.extract("Der Verkehrsweg wird geprüft", PAPER, PDF);
        assert!(locations
            .iter()
            .all(|l| !l.canonical_name.eq_ignore_ascii_case("Verkehrsweg")));
    }

    #[test]
    fn duplicates_collapse_keeping_first_provenance() {
        let text = "Ludwigstraße heute, Ludwigstraße morgen, Ludwigstraße immer";
        let locations = extractor(true).extract(text, PAPER, PDF);
        let hits: Vec<_> = locations
            .iter()
            .filter(|l| l.canonical_name == "Ludwigstraße")
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].method, MatchMethod::GazetteerDirect);
        assert!(hits[0].mention_count >= 1);
    }

    #[test]
    fn whole_word_helper() {
        assert!(contains_whole_word("an der ludwigstraße.", "ludwigstraße"));
        assert!(!contains_whole_word("altludwigstraße", "ludwigstraße"));
        assert!(contains_whole_word("ludwigstraße", "ludwigstraße"));
        assert!(!contains_whole_word("", "x"));
    }
}
