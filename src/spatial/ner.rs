//! Rule-based location tagger.
//!
//! Stands in for a full NER model: flags words carrying German street-name
//! suffixes and short "Am/An der <Name>" phrases. Candidates are validated
//! downstream against the gazetteer, so precision here matters less than
//! recall. Disabled entirely when no model is configured; the extractor then
//! runs on gazetteer + regex alone.

use std::collections::BTreeSet;

use tracing::debug;

/// Suffixes that mark a word as a probable street or place name.
const LOCATION_SUFFIXES: [&str; 7] = [
    "straße", "strasse", "str.", "platz", "weg", "allee", "gasse",
];

/// Prepositions that introduce a place name ("Am Königsplatz").
const PLACE_PREPOSITIONS: [&str; 6] = ["Am", "An", "Im", "Beim", "Zum", "Zur"];

/// Minimum length for a suffix-keyword candidate; shorter hits are noise.
const MIN_CANDIDATE_LEN: usize = 5;

pub struct NerTagger {
    model: String,
}

impl NerTagger {
    pub fn new(model: &str) -> Self {
        debug!("Location tagger initialized (model: {})", model);
        Self {
            model: model.to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Candidate location surface strings, deduplicated, in text order of
    /// first appearance.
    pub fn candidates(&self, text: &str) -> Vec<String> {
        let words: Vec<&str> = text.split_whitespace().collect();
        let mut seen = BTreeSet::new();
        let mut candidates = Vec::new();

        let mut push = |candidate: String| {
            let key = candidate.to_lowercase();
            if seen.insert(key) {
                candidates.push(candidate);
            }
        };

        for (i, raw) in words.iter().enumerate() {
            let word = clean_token(raw);
            if word.is_empty() {
                continue;
            }

            let lower = word.to_lowercase();
            if word.chars().count() >= MIN_CANDIDATE_LEN
                && LOCATION_SUFFIXES.iter().any(|s| lower.contains(s))
            {
                push(word.to_string());
            }

            // "Am Königsplatz", "An der Blauen Kappe" style phrases.
            if PLACE_PREPOSITIONS.contains(&word) {
                let mut phrase = vec![word];
                let mut j = i + 1;
                // Optional article between preposition and name.
                if let Some(next) = words.get(j).map(|w| clean_token(w)) {
                    if matches!(next, "der" | "den" | "dem") {
                        phrase.push(next);
                        j += 1;
                    }
                }
                if let Some(name) = words.get(j).map(|w| clean_token(w)) {
                    if name.chars().next().is_some_and(char::is_uppercase) {
                        phrase.push(name);
                        push(phrase.join(" "));
                    }
                }
            }
        }

        candidates
    }
}

/// Strip surrounding punctuation and quotes from a token.
fn clean_token(token: &str) -> &str {
    token.trim_matches(|c: char| !c.is_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_words_are_candidates() {
        let tagger = NerTagger::new("rule");
        let candidates =
            tagger.candidates("Sanierung der Maximilianstraße und des Rathausplatzes.");
        assert!(candidates.contains(&"Maximilianstraße".to_string()));
        assert!(candidates.contains(&"Rathausplatzes".to_string()));
    }

    #[test]
    fn prepositional_phrases_are_candidates() {
        let tagger = NerTagger::new("rule");
        let candidates = tagger.candidates("Neugestaltung Am Königsplatz beschlossen");
        assert!(candidates.contains(&"Am Königsplatz".to_string()));
    }

    #[test]
    fn short_fragments_are_ignored() {
        let tagger = NerTagger::new("rule");
        let candidates = tagger.candidates("Der Weg ist frei.");
        assert!(candidates.is_empty(), "got: {candidates:?}");
    }

    #[test]
    fn duplicates_collapse() {
        let tagger = NerTagger::new("rule");
        let candidates = tagger.candidates("Ludwigstraße und nochmals Ludwigstraße");
        assert_eq!(
            candidates
                .iter()
                .filter(|c| c.as_str() == "Ludwigstraße")
                .count(),
            1
        );
    }
}
