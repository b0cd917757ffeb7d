// Example Builder
//
// Turns raw labeled rows into (source text, target linearization) pairs for
// the fine-tuning engine. Skips are deterministic and counted, never silent.

use anyhow::Result;

use crate::config::OversizePolicy;
use crate::models::TokenCounter;
use crate::schema::{Codec, TraitRecord};

use super::RawRecord;

/// One supervised pair: the text the backbone reads and the linearization it
/// must emit. Regenerated from the raw dataset each run, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingExample {
    pub source: String,
    pub target: String,
}

/// Build-time metrics. Reported after every dataset build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub built: usize,
    /// Rows with no usable gold pair.
    pub skipped_rows: usize,
    /// Individual pairs dropped (null/empty fields or attribute outside the
    /// schema vocabulary).
    pub skipped_pairs: usize,
    /// Rows truncated to the token budget.
    pub truncated: usize,
    /// Rows dropped for exceeding the token budget.
    pub dropped_oversize: usize,
}

pub struct ExampleBuilder<'a> {
    codec: &'a Codec,
    counter: &'a dyn TokenCounter,
    max_seq_len: usize,
    policy: OversizePolicy,
}

impl<'a> ExampleBuilder<'a> {
    pub fn new(
        codec: &'a Codec,
        counter: &'a dyn TokenCounter,
        max_seq_len: usize,
        policy: OversizePolicy,
    ) -> Self {
        Self { codec, counter, max_seq_len, policy }
    }

    /// Build training examples from raw rows, reporting what was kept,
    /// truncated and skipped.
    pub fn build_all(&self, rows: &[RawRecord]) -> Result<(Vec<TrainingExample>, BuildStats)> {
        let mut examples = Vec::with_capacity(rows.len());
        let mut stats = BuildStats::default();

        for row in rows {
            if let Some(example) = self.build_row(row, &mut stats)? {
                examples.push(example);
            }
        }
        stats.built = examples.len();

        tracing::info!(
            built = stats.built,
            skipped_rows = stats.skipped_rows,
            skipped_pairs = stats.skipped_pairs,
            truncated = stats.truncated,
            dropped_oversize = stats.dropped_oversize,
            "Dataset build complete"
        );

        Ok((examples, stats))
    }

    fn build_row(&self, row: &RawRecord, stats: &mut BuildStats) -> Result<Option<TrainingExample>> {
        let mut records = Vec::new();
        for pair in &row.pairs {
            if !pair.is_valid() {
                stats.skipped_pairs += 1;
                continue;
            }
            if !self.codec.schema().contains(&pair.rel) {
                tracing::warn!(
                    attribute = %pair.rel,
                    "Gold pair uses an attribute outside the schema, skipping"
                );
                stats.skipped_pairs += 1;
                continue;
            }

            let span = row
                .sentence
                .find(&pair.subject.span)
                .map(|start| (start, start + pair.subject.span.len()));
            let mut record =
                TraitRecord::new(&pair.subject.span, &pair.rel, &pair.object.span);
            record.span = span;
            records.push(record);
        }

        if records.is_empty() {
            stats.skipped_rows += 1;
            return Ok(None);
        }

        let tokens = self.counter.count_tokens(&row.sentence)?;
        let source = if tokens > self.max_seq_len {
            match self.policy {
                OversizePolicy::Drop => {
                    stats.dropped_oversize += 1;
                    return Ok(None);
                }
                OversizePolicy::Truncate => {
                    let prefix = self.counter.truncate_to(&row.sentence, self.max_seq_len)?;
                    records.retain(|record| match record.span {
                        Some((_, end)) => end <= prefix.len(),
                        None => prefix.contains(&record.subject) && prefix.contains(&record.value),
                    });
                    if records.is_empty() {
                        // Truncation cut away every gold record.
                        stats.dropped_oversize += 1;
                        return Ok(None);
                    }
                    stats.truncated += 1;
                    prefix
                }
            }
        } else {
            row.sentence.clone()
        };

        let target = self.codec.encode(&records);
        Ok(Some(TrainingExample { source, target }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{RawPair, RawSpan};
    use crate::schema::Schema;

    /// Token counter that treats whitespace-separated words as tokens.
    struct WordCounter;

    impl TokenCounter for WordCounter {
        fn count_tokens(&self, text: &str) -> Result<usize> {
            Ok(text.split_whitespace().count())
        }

        fn truncate_to(&self, text: &str, max_tokens: usize) -> Result<String> {
            let words: Vec<&str> = text.split_whitespace().take(max_tokens).collect();
            Ok(words.join(" "))
        }
    }

    fn pair(subject: &str, rel: &str, object: &str) -> RawPair {
        RawPair {
            subject: RawSpan { span: subject.to_string(), attr: "Plant".to_string() },
            rel: rel.to_string(),
            object: RawSpan { span: object.to_string(), attr: "Value".to_string() },
        }
    }

    fn row(sentence: &str, pairs: Vec<RawPair>) -> RawRecord {
        RawRecord { sentence: sentence.to_string(), pairs }
    }

    fn build(
        rows: &[RawRecord],
        max_seq_len: usize,
        policy: OversizePolicy,
    ) -> (Vec<TrainingExample>, BuildStats) {
        let codec = Codec::new(Schema::builtin());
        let builder = ExampleBuilder::new(&codec, &WordCounter, max_seq_len, policy);
        builder.build_all(rows).unwrap()
    }

    #[test]
    fn test_gold_pair_round_trips_through_target() {
        let rows = vec![row("Rose height 30cm", vec![pair("Rose", "height", "30cm")])];
        let (examples, stats) = build(&rows, 16, OversizePolicy::Truncate);

        assert_eq!(stats.built, 1);
        assert_eq!(examples[0].source, "Rose height 30cm");

        let codec = Codec::new(Schema::builtin());
        let decoded = codec.decode(&examples[0].target).unwrap();
        assert_eq!(decoded, vec![TraitRecord::new("Rose", "height", "30cm")]);
    }

    #[test]
    fn test_null_pair_skipped_and_counted() {
        let rows = vec![row(
            "Rose height unknown",
            vec![pair("Rose", "height", "[NULL]")],
        )];
        let (examples, stats) = build(&rows, 16, OversizePolicy::Truncate);

        assert!(examples.is_empty());
        assert_eq!(stats.skipped_pairs, 1);
        assert_eq!(stats.skipped_rows, 1);
    }

    #[test]
    fn test_out_of_schema_attribute_skipped() {
        let rows = vec![row(
            "Rose smells sweet",
            vec![pair("Rose", "smell", "sweet"), pair("Rose", "color", "red")],
        )];
        let (examples, stats) = build(&rows, 16, OversizePolicy::Truncate);

        assert_eq!(stats.built, 1);
        assert_eq!(stats.skipped_pairs, 1);
        let codec = Codec::new(Schema::builtin());
        let decoded = codec.decode(&examples[0].target).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].attribute, "color");
    }

    #[test]
    fn test_oversize_drop_policy() {
        let rows = vec![row(
            "one two three four five six",
            vec![pair("one", "height", "six")],
        )];
        let (examples, stats) = build(&rows, 4, OversizePolicy::Drop);

        assert!(examples.is_empty());
        assert_eq!(stats.dropped_oversize, 1);
    }

    #[test]
    fn test_truncation_keeps_covered_records_only() {
        let rows = vec![row(
            "Rose height 30cm and Tulip color red",
            vec![pair("Rose", "height", "30cm"), pair("Tulip", "color", "red")],
        )];
        let (examples, stats) = build(&rows, 3, OversizePolicy::Truncate);

        assert_eq!(stats.truncated, 1);
        assert_eq!(examples[0].source, "Rose height 30cm");

        let codec = Codec::new(Schema::builtin());
        let decoded = codec.decode(&examples[0].target).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].subject, "Rose");
    }

    #[test]
    fn test_truncation_losing_all_records_drops_row() {
        let rows = vec![row(
            "filler words here then Tulip color red",
            vec![pair("Tulip", "color", "red")],
        )];
        let (examples, stats) = build(&rows, 3, OversizePolicy::Truncate);

        assert!(examples.is_empty());
        assert_eq!(stats.dropped_oversize, 1);
    }
}
