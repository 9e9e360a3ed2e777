//! Spatial processing: gazetteer, toponym extraction and geocoding.

mod extractor;
mod gazetteer;
mod geocoder;
mod ner;

pub use extractor::LocationExtractor;
pub use gazetteer::{Gazetteer, GazetteerEntry, GazetteerError};
pub use geocoder::Geocoder;
pub use ner::NerTagger;
