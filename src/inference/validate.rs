// Candidate validation and repair
//
// Generated linearizations are untrusted. Each candidate gets a grammar
// parse, at most one repair attempt, and lenient vocabulary resolution.
// Repair handles exactly one failure shape: a final record the generation
// budget cut off. Everything else rejects the candidate.

use crate::models::Candidate;
use crate::schema::{Codec, DecodeError, DroppedEntry, GrammarIssue, TraitRecord};

/// Result of validating one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub records: Vec<TraitRecord>,
    /// Entries dropped for attributes outside the schema.
    pub dropped: Vec<DroppedEntry>,
    /// Whether the grammar needed the single repair pass.
    pub repaired: bool,
}

/// Validate one candidate linearization. `None` means the candidate is
/// unusable even after repair.
pub fn validate_candidate(codec: &Codec, text: &str) -> Option<ValidationOutcome> {
    match crate::schema::codec::parse_entries(text) {
        Ok(entries) => {
            let (records, dropped) = codec.resolve_entries_lenient(&entries);
            Some(ValidationOutcome { records, dropped, repaired: false })
        }
        Err(DecodeError::MalformedGrammar {
            offset,
            issue: GrammarIssue::UnterminatedRecord,
        }) => {
            let repaired_text = repair_unterminated(text, offset);
            let entries = crate::schema::codec::parse_entries(&repaired_text).ok()?;
            if entries.is_empty() {
                // Repair that salvages nothing is a rejection, not an empty
                // extraction.
                return None;
            }
            let (records, dropped) = codec.resolve_entries_lenient(&entries);
            Some(ValidationOutcome { records, dropped, repaired: true })
        }
        Err(_) => None,
    }
}

/// One bounded repair for a truncated final record starting at `open`.
///
/// A partial record that already has all three fields open (two unescaped
/// separators) is closed; anything shorter is dropped so no field is
/// invented.
fn repair_unterminated(text: &str, open: usize) -> String {
    let partial = &text[open..];
    let mut separators = 0;
    let mut chars = partial.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                // Skip the escaped character; a dangling escape still fails
                // the re-parse.
                chars.next();
            }
            '|' => separators += 1,
            _ => {}
        }
    }

    if separators == 2 {
        let mut closed = text.to_string();
        closed.push(']');
        closed
    } else {
        text[..open].to_string()
    }
}

/// Pick the extraction from ranked candidates.
///
/// The first candidate that survives validation with at least one record
/// wins. Note the precedence: a well-formed empty candidate does not end the
/// scan, and record-bearing candidates ranked below it still win. An empty
/// extraction is returned only when no candidate anywhere in the ranking
/// yields records. If nothing survives, there is no extraction.
pub fn select_extraction(
    codec: &Codec,
    candidates: &[Candidate],
) -> Option<Vec<TraitRecord>> {
    let mut saw_valid_empty = false;

    for (rank, candidate) in candidates.iter().enumerate() {
        let Some(outcome) = validate_candidate(codec, &candidate.text) else {
            tracing::debug!(rank = rank, text = %candidate.text, "Candidate rejected");
            continue;
        };

        for drop in &outcome.dropped {
            tracing::warn!(
                rank = rank,
                attribute = %drop.attribute,
                entry = drop.entry,
                "Dropped generated entry with unknown attribute"
            );
        }
        if outcome.repaired {
            tracing::debug!(rank = rank, "Candidate accepted after repair");
        }

        if outcome.records.is_empty() {
            saw_valid_empty = true;
            continue;
        }
        return Some(outcome.records);
    }

    if saw_valid_empty {
        Some(Vec::new())
    } else {
        None
    }
}
