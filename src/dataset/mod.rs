// Raw labeled dataset contract
//
// The data-preparation utilities emit a JSON array of rows:
//   { "sentence": "...", "pairs": [ { "span-s": {"span","attr"},
//     "rel": "...", "span-e": {"span","attr"} } ] }
// The field names are a fixed external contract with those scripts and must
// not drift. A pair maps to a TraitRecord as
// subject = span-s.span, attribute = rel, value = span-e.span.

pub mod builder;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use builder::{BuildStats, ExampleBuilder, TrainingExample};

/// Sentinel the data-prep scripts use for an unannotated field.
const NULL_SENTINEL: &str = "[NULL]";

/// One annotated span from the labeling sheets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSpan {
    pub span: String,
    pub attr: String,
}

/// One gold subject-relation-object annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPair {
    #[serde(rename = "span-s")]
    pub subject: RawSpan,
    pub rel: String,
    #[serde(rename = "span-e")]
    pub object: RawSpan,
}

impl RawPair {
    /// A pair is usable only if every field is non-empty and not the
    /// `[NULL]` sentinel.
    pub fn is_valid(&self) -> bool {
        [
            self.rel.as_str(),
            self.subject.span.as_str(),
            self.subject.attr.as_str(),
            self.object.span.as_str(),
            self.object.attr.as_str(),
        ]
        .iter()
        .all(|field| {
            let trimmed = field.trim();
            !trimmed.is_empty() && trimmed != NULL_SENTINEL
        })
    }
}

/// One labeled dataset row: a sentence plus its gold annotations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub sentence: String,
    pub pairs: Vec<RawPair>,
}

/// Load a dataset file (JSON array of rows).
pub fn load_dataset(path: &Path) -> Result<Vec<RawRecord>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dataset file {}", path.display()))?;
    let rows: Vec<RawRecord> = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse dataset file {}", path.display()))?;

    tracing::info!(rows = rows.len(), path = %path.display(), "Loaded dataset");
    Ok(rows)
}
