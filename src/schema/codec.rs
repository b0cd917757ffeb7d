// Linearization codec
//
// Encodes trait records into the flat target string the backbone is trained
// to emit, and parses generated strings back. Grammar-level parsing is split
// from vocabulary resolution so the validator can keep the good entries of a
// partially bad candidate.
//
// Grammar: a linearization is a whitespace-separated sequence of records,
// each `[subject|attribute|value]`. Backslash escapes a literal `\ [ ] |`
// inside a field. Anything else outside a record is a grammar violation.

use std::fmt;
use thiserror::Error;

use super::{Schema, TraitRecord};

/// Characters that must be escaped when they occur literally inside a field.
const ESCAPED: [char; 4] = ['\\', '[', ']', '|'];

/// Grammar-level violation detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrammarIssue {
    TextOutsideRecord(char),
    UnterminatedRecord,
    TooManyFields,
    MissingFields(usize),
    UnescapedOpenBracket,
    BadEscape(char),
    DanglingEscape,
}

impl fmt::Display for GrammarIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrammarIssue::TextOutsideRecord(c) => {
                write!(f, "unexpected character {c:?} outside a record")
            }
            GrammarIssue::UnterminatedRecord => write!(f, "unterminated record"),
            GrammarIssue::TooManyFields => write!(f, "record has more than 3 fields"),
            GrammarIssue::MissingFields(n) => write!(f, "record has {n} fields, expected 3"),
            GrammarIssue::UnescapedOpenBracket => write!(f, "unescaped '[' inside record"),
            GrammarIssue::BadEscape(c) => write!(f, "unrecognized escape sequence \\{c}"),
            GrammarIssue::DanglingEscape => write!(f, "dangling escape at end of input"),
        }
    }
}

/// Decoding failure. Malformed grammar may be repairable by the validator;
/// unknown attributes identify the offending entry so it can be dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed grammar at byte {offset}: {issue}")]
    MalformedGrammar { offset: usize, issue: GrammarIssue },

    #[error("unknown attribute `{attribute}` in entry {entry}")]
    UnknownAttribute { attribute: String, entry: usize },
}

/// A grammatically parsed record before vocabulary resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub subject: String,
    pub attribute: String,
    pub value: String,
    /// Byte offset of the record's opening bracket, for diagnostics.
    pub offset: usize,
}

/// An entry dropped during lenient resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedEntry {
    pub attribute: String,
    pub entry: usize,
}

/// Schema-aware encoder/decoder for linearizations.
#[derive(Debug, Clone)]
pub struct Codec {
    schema: Schema,
}

impl Codec {
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Encode records into their canonical linearization.
    ///
    /// Records are ordered by span start (first appearance in the source),
    /// with spanless records after spanned ones in (attribute, subject,
    /// value) lexical order, so equivalent inputs encode identically.
    pub fn encode(&self, records: &[TraitRecord]) -> String {
        let mut ordered: Vec<&TraitRecord> = records.iter().collect();
        ordered.sort_by(|a, b| {
            let ka = (a.span.map(|s| s.0).unwrap_or(usize::MAX), &a.attribute, &a.subject, &a.value);
            let kb = (b.span.map(|s| s.0).unwrap_or(usize::MAX), &b.attribute, &b.subject, &b.value);
            ka.cmp(&kb)
        });

        let mut out = String::new();
        for (i, record) in ordered.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push('[');
            push_escaped(&mut out, &record.subject);
            out.push('|');
            push_escaped(&mut out, &record.attribute);
            out.push('|');
            push_escaped(&mut out, &record.value);
            out.push(']');
        }
        out
    }

    /// Strict decode: grammar parse plus closed-vocabulary resolution.
    pub fn decode(&self, text: &str) -> Result<Vec<TraitRecord>, DecodeError> {
        let entries = parse_entries(text)?;
        self.resolve_entries(&entries)
    }

    /// Resolve parsed entries against the schema, failing on the first
    /// unknown attribute.
    pub fn resolve_entries(&self, entries: &[RawEntry]) -> Result<Vec<TraitRecord>, DecodeError> {
        for (i, entry) in entries.iter().enumerate() {
            if !self.schema.contains(&entry.attribute) {
                return Err(DecodeError::UnknownAttribute {
                    attribute: entry.attribute.clone(),
                    entry: i,
                });
            }
        }
        Ok(entries.iter().map(raw_to_record).collect())
    }

    /// Resolve parsed entries, dropping unknown-attribute entries and
    /// reporting each drop.
    pub fn resolve_entries_lenient(
        &self,
        entries: &[RawEntry],
    ) -> (Vec<TraitRecord>, Vec<DroppedEntry>) {
        let mut records = Vec::new();
        let mut dropped = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            if self.schema.contains(&entry.attribute) {
                records.push(raw_to_record(entry));
            } else {
                dropped.push(DroppedEntry {
                    attribute: entry.attribute.clone(),
                    entry: i,
                });
            }
        }
        (records, dropped)
    }
}

fn raw_to_record(entry: &RawEntry) -> TraitRecord {
    TraitRecord::new(entry.subject.clone(), entry.attribute.clone(), entry.value.clone())
}

fn push_escaped(out: &mut String, field: &str) {
    for c in field.chars() {
        if ESCAPED.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Grammar-level parse of a linearization into raw entries.
///
/// Whitespace between records is ignored; everything else outside brackets
/// is a violation. Fields are taken verbatim, no trimming.
pub fn parse_entries(text: &str) -> Result<Vec<RawEntry>, DecodeError> {
    let mut entries = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c != '[' {
            return Err(DecodeError::MalformedGrammar {
                offset,
                issue: GrammarIssue::TextOutsideRecord(c),
            });
        }
        chars.next();
        entries.push(parse_record(offset, &mut chars)?);
    }

    Ok(entries)
}

fn parse_record(
    record_offset: usize,
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
) -> Result<RawEntry, DecodeError> {
    let mut fields: Vec<String> = Vec::with_capacity(3);
    let mut current = String::new();

    while let Some((offset, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, esc)) if ESCAPED.contains(&esc) => current.push(esc),
                Some((esc_offset, esc)) => {
                    return Err(DecodeError::MalformedGrammar {
                        offset: esc_offset,
                        issue: GrammarIssue::BadEscape(esc),
                    })
                }
                None => {
                    return Err(DecodeError::MalformedGrammar {
                        offset,
                        issue: GrammarIssue::DanglingEscape,
                    })
                }
            },
            '|' => {
                if fields.len() == 2 {
                    return Err(DecodeError::MalformedGrammar {
                        offset,
                        issue: GrammarIssue::TooManyFields,
                    });
                }
                fields.push(std::mem::take(&mut current));
            }
            ']' => {
                fields.push(current);
                if fields.len() != 3 {
                    return Err(DecodeError::MalformedGrammar {
                        offset,
                        issue: GrammarIssue::MissingFields(fields.len()),
                    });
                }
                let mut it = fields.into_iter();
                return Ok(RawEntry {
                    subject: it.next().unwrap(),
                    attribute: it.next().unwrap(),
                    value: it.next().unwrap(),
                    offset: record_offset,
                });
            }
            '[' => {
                return Err(DecodeError::MalformedGrammar {
                    offset,
                    issue: GrammarIssue::UnescapedOpenBracket,
                })
            }
            _ => current.push(c),
        }
    }

    Err(DecodeError::MalformedGrammar {
        offset: record_offset,
        issue: GrammarIssue::UnterminatedRecord,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;

    fn codec() -> Codec {
        Codec::new(Schema::builtin())
    }

    #[test]
    fn test_encode_single_record() {
        let records = vec![TraitRecord::new("Rose", "height", "30cm")];
        assert_eq!(codec().encode(&records), "[Rose|height|30cm]");
    }

    #[test]
    fn test_round_trip() {
        let records = vec![
            TraitRecord::new("Rose", "height", "30cm"),
            TraitRecord::new("Rose", "color", "red"),
            TraitRecord::new("Tulip", "flowering_time", "spring"),
        ];
        let codec = codec();
        let decoded = codec.decode(&codec.encode(&records)).unwrap();
        assert_eq!(decoded.len(), 3);
        for record in &records {
            assert!(decoded.contains(record));
        }
    }

    #[test]
    fn test_escaping_is_byte_identical() {
        let nasty = "a|b \\ [c] d";
        let records = vec![TraitRecord::new(nasty, "height", nasty)];
        let codec = codec();
        let decoded = codec.decode(&codec.encode(&records)).unwrap();
        assert_eq!(decoded[0].subject, nasty);
        assert_eq!(decoded[0].value, nasty);
    }

    #[test]
    fn test_canonicalization_is_idempotent() {
        let records = vec![
            TraitRecord::new("Tulip", "yield", "low"),
            TraitRecord::new("Rose", "color", "red"),
        ];
        let codec = codec();
        let first = codec.encode(&records);
        let second = codec.encode(&codec.decode(&first).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn test_span_order_wins_over_lexical() {
        let records = vec![
            TraitRecord::new("Rose", "color", "red").with_span(10, 14),
            TraitRecord::new("Rose", "height", "30cm").with_span(0, 4),
        ];
        let encoded = codec().encode(&records);
        assert_eq!(encoded, "[Rose|height|30cm] [Rose|color|red]");
    }

    #[test]
    fn test_decode_empty_is_empty() {
        assert!(codec().decode("").unwrap().is_empty());
        assert!(codec().decode("   ").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_attribute_identifies_entry() {
        let err = codec()
            .decode("[Rose|height|30cm] [Rose|smell|sweet]")
            .unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnknownAttribute {
                attribute: "smell".to_string(),
                entry: 1,
            }
        );
    }

    #[test]
    fn test_lenient_resolution_keeps_valid_entries() {
        let entries =
            parse_entries("[A|height|1] [B|smell|2] [C|color|3]").unwrap();
        let (records, dropped) = codec().resolve_entries_lenient(&entries);
        assert_eq!(records.len(), 2);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].attribute, "smell");
        assert_eq!(dropped[0].entry, 1);
    }

    #[test]
    fn test_unterminated_record_rejected() {
        let err = codec().decode("[Rose|height|30cm").unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MalformedGrammar { issue: GrammarIssue::UnterminatedRecord, .. }
        ));
    }

    #[test]
    fn test_text_outside_record_rejected() {
        let err = codec().decode("The answer is [Rose|height|30cm]").unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MalformedGrammar { issue: GrammarIssue::TextOutsideRecord('T'), .. }
        ));
    }

    #[test]
    fn test_unescaped_delimiter_in_field_rejected() {
        // Extra '|' makes a fourth field.
        let err = codec().decode("[Ro|se|height|30cm]").unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MalformedGrammar { issue: GrammarIssue::TooManyFields, .. }
        ));
    }

    #[test]
    fn test_missing_fields_rejected() {
        let err = codec().decode("[Rose|height]").unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MalformedGrammar { issue: GrammarIssue::MissingFields(2), .. }
        ));
    }

    #[test]
    fn test_dangling_escape_rejected() {
        let err = codec().decode("[Rose|height|30cm\\").unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MalformedGrammar { issue: GrammarIssue::DanglingEscape, .. }
        ));
    }

    #[test]
    fn test_whitespace_between_records_ignored() {
        let decoded = codec()
            .decode("[A|height|1]\n\t [B|color|2]")
            .unwrap();
        assert_eq!(decoded.len(), 2);
    }
}
