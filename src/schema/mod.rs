// Trait schema: closed attribute vocabulary plus the linearization grammar
// Versioned alongside every checkpoint trained against it

pub mod codec;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

pub use codec::{Codec, DecodeError, DroppedEntry, GrammarIssue, RawEntry};

/// One extracted fact: subject has attribute with value.
///
/// `span` is the byte range of the subject mention in the source text, when
/// known. Linearizations do not carry spans, so decoded records have none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraitRecord {
    pub subject: String,
    pub attribute: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<(usize, usize)>,
}

impl TraitRecord {
    pub fn new(
        subject: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            attribute: attribute.into(),
            value: value.into(),
            span: None,
        }
    }

    pub fn with_span(mut self, start: usize, end: usize) -> Self {
        self.span = Some((start, end));
        self
    }
}

/// Attributes recognized by the built-in v1 schema. Mirrors the relation
/// vocabulary of the curated trait dataset.
const DEFAULT_ATTRIBUTES: &[&str] = &[
    "associated_with",
    "color",
    "expressed_in",
    "flowering_time",
    "has_trait",
    "height",
    "located_in",
    "regulates",
    "resistance",
    "yield",
];

pub const DEFAULT_SCHEMA_VERSION: &str = "t2t-schema-v1";

/// Closed set of recognized attributes. Immutable at inference time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub version: String,
    pub attributes: BTreeSet<String>,
}

impl Schema {
    /// Built-in default vocabulary.
    pub fn builtin() -> Self {
        Self {
            version: DEFAULT_SCHEMA_VERSION.to_string(),
            attributes: DEFAULT_ATTRIBUTES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Load a schema definition from a JSON file:
    /// `{ "version": "...", "attributes": ["...", ...] }`
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read schema file {}", path.display()))?;
        let schema: Schema = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse schema file {}", path.display()))?;
        if schema.attributes.is_empty() {
            anyhow::bail!("Schema {} declares no attributes", path.display());
        }
        Ok(schema)
    }

    pub fn contains(&self, attribute: &str) -> bool {
        self.attributes.contains(attribute)
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_schema_has_closed_vocabulary() {
        let schema = Schema::builtin();
        assert!(schema.contains("height"));
        assert!(schema.contains("associated_with"));
        assert!(!schema.contains("definitely_not_an_attribute"));
    }

    #[test]
    fn test_schema_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        let schema = Schema::builtin();
        std::fs::write(&path, serde_json::to_string_pretty(&schema).unwrap()).unwrap();

        let loaded = Schema::from_file(&path).unwrap();
        assert_eq!(loaded, schema);
    }

    #[test]
    fn test_empty_schema_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        std::fs::write(&path, r#"{"version": "v0", "attributes": []}"#).unwrap();
        assert!(Schema::from_file(&path).is_err());
    }
}
