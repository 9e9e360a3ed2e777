//! RDF graph sink.
//!
//! During the run, triples are appended to a newline-delimited N-Triples
//! log (`metadata.nt`), which survives across runs. Finalization parses the
//! accumulated log, drops duplicate triples and writes a compact,
//! prefix-bearing Turtle document (`metadata.ttl`).
//!
//! URI scheme:
//! - papers:    `{base}paper/{percent-encoded trailing id}`
//! - locations: `{base}location/{sha256(paper_id|category|name) prefix}`;
//!   each location node is reachable from exactly one paper.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::models::{Location, ProcessedPaper};

use super::StorageError;

const NS_RDF: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";
const NS_RDFS: &str = "http://www.w3.org/2000/01/rdf-schema#";
const NS_XSD: &str = "http://www.w3.org/2001/XMLSchema#";
const NS_DCTERMS: &str = "http://purl.org/dc/terms/";
const NS_OPARL: &str = "http://oparl.org/schema/1.1/";
const NS_GEO: &str = "http://www.opengis.net/ont/geosparql#";

/// Paper full text is stored truncated; the dataset carries the whole text.
const TEXT_LITERAL_MAX: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum RdfObject {
    Uri(String),
    Literal {
        value: String,
        lang: Option<String>,
        datatype: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Triple {
    subject: String,
    predicate: String,
    object: RdfObject,
}

impl Triple {
    fn uri(subject: &str, predicate: String, object: String) -> Self {
        Self {
            subject: subject.to_string(),
            predicate,
            object: RdfObject::Uri(object),
        }
    }

    fn literal(subject: &str, predicate: String, value: &str) -> Self {
        Self {
            subject: subject.to_string(),
            predicate,
            object: RdfObject::Literal {
                value: value.to_string(),
                lang: None,
                datatype: None,
            },
        }
    }

    fn lang_literal(subject: &str, predicate: String, value: &str, lang: &str) -> Self {
        Self {
            subject: subject.to_string(),
            predicate,
            object: RdfObject::Literal {
                value: value.to_string(),
                lang: Some(lang.to_string()),
                datatype: None,
            },
        }
    }

    fn typed_literal(subject: &str, predicate: String, value: String, datatype: String) -> Self {
        Self {
            subject: subject.to_string(),
            predicate,
            object: RdfObject::Literal {
                value,
                lang: None,
                datatype: Some(datatype),
            },
        }
    }
}

/// Append-only graph writer with Turtle finalization.
pub struct RdfWriter {
    nt_path: PathBuf,
    ttl_path: PathBuf,
    base_uri: String,
}

impl RdfWriter {
    pub fn new(nt_path: PathBuf, ttl_path: PathBuf, base_uri: String) -> Self {
        let base_uri = if base_uri.ends_with('/') {
            base_uri
        } else {
            format!("{base_uri}/")
        };
        Self {
            nt_path,
            ttl_path,
            base_uri,
        }
    }

    fn paper_uri(&self, paper_id: &str) -> String {
        let short = paper_id.rsplit('/').next().unwrap_or(paper_id);
        let encoded = utf8_percent_encode(short, NON_ALPHANUMERIC);
        format!("{}paper/{}", self.base_uri, encoded)
    }

    fn location_uri(&self, location: &Location) -> String {
        let mut hasher = Sha256::new();
        hasher.update(location.paper_id.as_bytes());
        hasher.update(b"|");
        hasher.update(location.category.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(location.canonical_name.to_lowercase().as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{}location/{}", self.base_uri, &digest[..16])
    }

    /// Append the triples of a batch to the N-Triples log.
    pub fn append_papers(&self, papers: &[ProcessedPaper]) -> Result<usize, StorageError> {
        if papers.is_empty() {
            return Ok(0);
        }
        if let Some(parent) = self.nt_path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }

        let mut out = String::new();
        let mut count = 0;
        for paper in papers {
            for triple in self.triples_for(paper) {
                out.push_str(&format_ntriple(&triple));
                out.push('\n');
                count += 1;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.nt_path)
            .map_err(|e| StorageError::io(&self.nt_path, e))?;
        file.write_all(out.as_bytes())
            .map_err(|e| StorageError::io(&self.nt_path, e))?;
        file.flush()
            .map_err(|e| StorageError::io(&self.nt_path, e))?;

        debug!("Appended {} triple(s) to {}", count, self.nt_path.display());
        Ok(count)
    }

    /// Core assertions per paper plus one node per location.
    fn triples_for(&self, processed: &ProcessedPaper) -> Vec<Triple> {
        let paper = &processed.paper;
        let subject = self.paper_uri(&paper.id);
        let mut triples = Vec::new();

        triples.push(Triple::uri(
            &subject,
            format!("{NS_RDF}type"),
            format!("{NS_OPARL}Paper"),
        ));
        if !paper.name.is_empty() {
            triples.push(Triple::lang_literal(
                &subject,
                format!("{NS_RDFS}label"),
                &paper.name,
                "de",
            ));
            triples.push(Triple::literal(
                &subject,
                format!("{NS_OPARL}name"),
                &paper.name,
            ));
        }
        if let Some(reference) = &paper.reference {
            triples.push(Triple::literal(
                &subject,
                format!("{NS_OPARL}reference"),
                reference,
            ));
        }
        if let Some(date) = paper.date {
            triples.push(Triple::typed_literal(
                &subject,
                format!("{NS_DCTERMS}date"),
                date.to_string(),
                format!("{NS_XSD}date"),
            ));
        } else if let Some(modified) = paper.modified {
            triples.push(Triple::typed_literal(
                &subject,
                format!("{NS_DCTERMS}date"),
                modified.date_naive().to_string(),
                format!("{NS_XSD}date"),
            ));
        }
        if let Some(paper_type) = &paper.paper_type {
            triples.push(Triple::literal(
                &subject,
                format!("{NS_OPARL}paperType"),
                paper_type,
            ));
        }
        if !processed.full_text.is_empty() {
            let truncated: String = processed.full_text.chars().take(TEXT_LITERAL_MAX).collect();
            triples.push(Triple::literal(
                &subject,
                format!("{NS_OPARL}text"),
                &truncated,
            ));
        }
        triples.push(Triple::uri(
            &subject,
            format!("{NS_OPARL}mainFile"),
            processed.pdf_url.clone(),
        ));

        for location in &processed.locations {
            let node = self.location_uri(location);
            triples.push(Triple::uri(
                &subject,
                format!("{NS_OPARL}relatesToLocation"),
                node.clone(),
            ));
            triples.push(Triple::uri(
                &node,
                format!("{NS_RDF}type"),
                format!("{NS_GEO}Feature"),
            ));
            triples.push(Triple::lang_literal(
                &node,
                format!("{NS_RDFS}label"),
                &location.canonical_name,
                "de",
            ));
            triples.push(Triple::literal(
                &node,
                format!("{NS_OPARL}locationType"),
                location.category.as_str(),
            ));
            triples.push(Triple::literal(
                &node,
                format!("{NS_OPARL}extractionMethod"),
                location.method.as_str(),
            ));
            triples.push(Triple::literal(
                &node,
                format!("{NS_OPARL}provenance"),
                location.provenance.as_str(),
            ));
            if let (Some(lat), Some(lon)) = (location.latitude, location.longitude) {
                triples.push(Triple::typed_literal(
                    &node,
                    format!("{NS_GEO}hasGeometry"),
                    format!("POINT({lon} {lat})"),
                    format!("{NS_GEO}wktLiteral"),
                ));
                triples.push(Triple::typed_literal(
                    &node,
                    format!("{NS_GEO}lat"),
                    lat.to_string(),
                    format!("{NS_XSD}double"),
                ));
                triples.push(Triple::typed_literal(
                    &node,
                    format!("{NS_GEO}long"),
                    lon.to_string(),
                    format!("{NS_XSD}double"),
                ));
            }
            if let Some(display_name) = &location.display_name {
                triples.push(Triple::literal(
                    &node,
                    format!("{NS_OPARL}displayName"),
                    display_name,
                ));
            }
            // Provenance link back to the source document.
            triples.push(Triple::uri(
                &node,
                format!("{NS_RDFS}seeAlso"),
                location.pdf_url.clone(),
            ));
        }

        triples
    }

    /// Parse the accumulated N-Triples log and write the prefixed Turtle
    /// document. Duplicate triples (from re-finalization or overlapping
    /// runs) collapse. Returns the number of distinct triples.
    pub fn finalize(&self) -> Result<usize, StorageError> {
        let contents = match fs::read_to_string(&self.nt_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No triples accumulated; skipping Turtle finalization");
                return Ok(0);
            }
            Err(e) => return Err(StorageError::io(&self.nt_path, e)),
        };

        let mut triples: BTreeSet<Triple> = BTreeSet::new();
        for (number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_ntriple(line) {
                Some(triple) => {
                    triples.insert(triple);
                }
                None => warn!("Skipping unparseable triple at line {}", number + 1),
            }
        }

        let turtle = serialize_turtle(&triples);
        fs::write(&self.ttl_path, turtle).map_err(|e| StorageError::io(&self.ttl_path, e))?;
        info!(
            "Finalized {} triple(s) to {}",
            triples.len(),
            self.ttl_path.display()
        );
        Ok(triples.len())
    }
}

/// Escape a literal for N-Triples / Turtle double-quoted form.
fn escape_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn format_object(object: &RdfObject) -> String {
    match object {
        RdfObject::Uri(uri) => format!("<{uri}>"),
        RdfObject::Literal {
            value,
            lang,
            datatype,
        } => {
            let mut out = format!("\"{}\"", escape_literal(value));
            if let Some(lang) = lang {
                let _ = write!(out, "@{lang}");
            } else if let Some(datatype) = datatype {
                let _ = write!(out, "^^<{datatype}>");
            }
            out
        }
    }
}

fn format_ntriple(triple: &Triple) -> String {
    format!(
        "<{}> <{}> {} .",
        triple.subject,
        triple.predicate,
        format_object(&triple.object)
    )
}

/// Parse one line of the machine-written N-Triples log.
fn parse_ntriple(line: &str) -> Option<Triple> {
    let line = line.strip_suffix('.')?.trim_end();

    let rest = line.strip_prefix('<')?;
    let (subject, rest) = rest.split_once('>')?;
    let rest = rest.trim_start().strip_prefix('<')?;
    let (predicate, rest) = rest.split_once('>')?;
    let object_part = rest.trim();

    let object = if let Some(uri) = object_part.strip_prefix('<') {
        let uri = uri.strip_suffix('>')?;
        RdfObject::Uri(uri.to_string())
    } else if let Some(rest) = object_part.strip_prefix('"') {
        // Find the closing quote, skipping escaped ones.
        let mut end = None;
        let mut escaped = false;
        for (i, c) in rest.char_indices() {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                end = Some(i);
                break;
            }
        }
        let end = end?;
        let value = unescape_literal(&rest[..end]);
        let suffix = &rest[end + 1..];
        if let Some(lang) = suffix.strip_prefix('@') {
            RdfObject::Literal {
                value,
                lang: Some(lang.to_string()),
                datatype: None,
            }
        } else if let Some(datatype) = suffix.strip_prefix("^^<") {
            let datatype = datatype.strip_suffix('>')?;
            RdfObject::Literal {
                value,
                lang: None,
                datatype: Some(datatype.to_string()),
            }
        } else {
            RdfObject::Literal {
                value,
                lang: None,
                datatype: None,
            }
        }
    } else {
        return None;
    };

    Some(Triple {
        subject: subject.to_string(),
        predicate: predicate.to_string(),
        object,
    })
}

const PREFIXES: [(&str, &str); 6] = [
    ("rdf", NS_RDF),
    ("rdfs", NS_RDFS),
    ("xsd", NS_XSD),
    ("dcterms", NS_DCTERMS),
    ("oparl", NS_OPARL),
    ("geo", NS_GEO),
];

/// Shorten a URI to prefixed form when the local part is a plain name.
fn shorten(uri: &str) -> String {
    for (prefix, namespace) in PREFIXES {
        if let Some(local) = uri.strip_prefix(namespace) {
            if !local.is_empty()
                && local
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
            {
                return format!("{prefix}:{local}");
            }
        }
    }
    format!("<{uri}>")
}

fn format_turtle_object(object: &RdfObject) -> String {
    match object {
        RdfObject::Uri(uri) => shorten(uri),
        RdfObject::Literal {
            value,
            lang,
            datatype,
        } => {
            let mut out = format!("\"{}\"", escape_literal(value));
            if let Some(lang) = lang {
                let _ = write!(out, "@{lang}");
            } else if let Some(datatype) = datatype {
                let _ = write!(out, "^^{}", shorten(datatype));
            }
            out
        }
    }
}

fn serialize_turtle(triples: &BTreeSet<Triple>) -> String {
    let mut out = String::new();
    for (prefix, namespace) in PREFIXES {
        let _ = writeln!(out, "@prefix {prefix}: <{namespace}> .");
    }
    out.push('\n');

    // Group by subject; BTreeMap keeps output deterministic.
    let mut by_subject: BTreeMap<&str, Vec<&Triple>> = BTreeMap::new();
    for triple in triples {
        by_subject.entry(&triple.subject).or_default().push(triple);
    }

    for (subject, triples) in by_subject {
        let _ = writeln!(out, "<{subject}>");
        for (i, triple) in triples.iter().enumerate() {
            let predicate = if triple.predicate == format!("{NS_RDF}type") {
                "a".to_string()
            } else {
                shorten(&triple.predicate)
            };
            let terminator = if i + 1 == triples.len() { " ." } else { " ;" };
            let _ = writeln!(
                out,
                "    {} {}{}",
                predicate,
                format_turtle_object(&triple.object),
                terminator
            );
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LocationCategory, MatchMethod, Paper, Provenance};

    fn sample_processed() -> ProcessedPaper {
        let mut location = Location::new(
            "https://api.example.org/paper/7",
            "https://api.example.org/file/7.pdf",
            LocationCategory::Street,
            "Ludwigstraße".into(),
            MatchMethod::GazetteerDirect,
        );
        location.latitude = Some(48.3456);
        location.longitude = Some(10.8901);
        location.provenance = Provenance::Gazetteer;

        ProcessedPaper {
            paper: Paper {
                id: "https://api.example.org/paper/7".into(),
                name: "Sanierung \"Altstadt\"".into(),
                reference: Some("BSV/24/0007".into()),
                date: Some("2024-05-13".parse().unwrap()),
                paper_type: Some("Beschlussvorlage".into()),
                ..Default::default()
            },
            pdf_url: "https://api.example.org/file/7.pdf".into(),
            full_text: "Sanierung der Ludwigstraße".into(),
            extraction_method: "text_layer".into(),
            page_count: 2,
            locations: vec![location],
        }
    }

    fn writer(dir: &std::path::Path) -> RdfWriter {
        RdfWriter::new(
            dir.join("metadata.nt"),
            dir.join("metadata.ttl"),
            "http://augsburg.oparl-analytics.org/".into(),
        )
    }

    #[test]
    fn every_emitted_line_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        writer.append_papers(&[sample_processed()]).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("metadata.nt")).unwrap();
        assert!(!contents.is_empty());
        for line in contents.lines() {
            assert!(parse_ntriple(line).is_some(), "unparseable: {line}");
        }
    }

    #[test]
    fn core_assertions_are_present() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        writer.append_papers(&[sample_processed()]).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("metadata.nt")).unwrap();
        let paper = "http://augsburg.oparl-analytics.org/paper/7";
        assert!(contents.contains(&format!("<{paper}> <{NS_RDF}type> <{NS_OPARL}Paper> .")));
        assert!(contents.contains(&format!("<{paper}> <{NS_DCTERMS}date>")));
        assert!(contents.contains(&format!(
            "<{paper}> <{NS_OPARL}mainFile> <https://api.example.org/file/7.pdf> ."
        )));
        assert!(contents.contains(&format!("<{paper}> <{NS_OPARL}relatesToLocation>")));
        assert!(contents.contains("POINT(10.8901 48.3456)"));
        assert!(contents.contains(&format!(
            "<{NS_RDFS}seeAlso> <https://api.example.org/file/7.pdf> ."
        )));
    }

    #[test]
    fn quotes_in_titles_are_escaped() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        writer.append_papers(&[sample_processed()]).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("metadata.nt")).unwrap();
        assert!(contents.contains(r#""Sanierung \"Altstadt\""@de"#));

        let line = contents
            .lines()
            .find(|l| l.contains("label"))
            .expect("label triple");
        let triple = parse_ntriple(line).unwrap();
        match triple.object {
            RdfObject::Literal { value, lang, .. } => {
                assert_eq!(value, "Sanierung \"Altstadt\"");
                assert_eq!(lang.as_deref(), Some("de"));
            }
            other => panic!("expected literal, got {other:?}"),
        }
    }

    #[test]
    fn finalize_dedupes_and_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());

        // Appending the same paper twice simulates overlapping runs.
        writer.append_papers(&[sample_processed()]).unwrap();
        let first_count = writer.finalize().unwrap();
        writer.append_papers(&[sample_processed()]).unwrap();
        let second_count = writer.finalize().unwrap();
        assert_eq!(first_count, second_count);

        let turtle = std::fs::read_to_string(dir.path().join("metadata.ttl")).unwrap();
        assert!(turtle.starts_with("@prefix"));
        assert!(turtle.contains("a oparl:Paper"));
        assert!(turtle.contains("geo:hasGeometry"));
        assert!(turtle.contains("^^geo:wktLiteral"));
    }

    #[test]
    fn location_uri_is_stable_and_paper_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        let processed = sample_processed();

        let uri_a = writer.location_uri(&processed.locations[0]);
        let uri_b = writer.location_uri(&processed.locations[0]);
        assert_eq!(uri_a, uri_b);

        let mut other = processed.locations[0].clone();
        other.paper_id = "https://api.example.org/paper/8".into();
        assert_ne!(uri_a, writer.location_uri(&other));
    }

    #[test]
    fn finalize_without_log_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        assert_eq!(writer.finalize().unwrap(), 0);
        assert!(!dir.path().join("metadata.ttl").exists());
    }
}
