// End-to-end pipeline test: dataset -> examples -> fine-tune -> checkpoint
// -> extractor, with a tiny model and vocabulary on CPU.

use std::fs;

use candle_core::Device;
use tempfile::TempDir;
use tokenizers::Tokenizer;

use text2trait::config::HyperParams;
use text2trait::dataset::{load_dataset, ExampleBuilder};
use text2trait::errors::ExtractError;
use text2trait::inference::Extractor;
use text2trait::models::{LmConfig, LocalBackbone, TraitLm};
use text2trait::schema::{Codec, Schema};
use text2trait::training::{CheckpointManager, FineTuneEngine};

fn tiny_tokenizer() -> Tokenizer {
    let words = [
        "<unk>", "<sep>", "</s>", "[", "]", "|", "Rose", "Tulip", "height",
        "color", "30cm", "red", "grows", "to", "about", "petals", "are",
    ];
    let vocab: serde_json::Map<String, serde_json::Value> = words
        .iter()
        .enumerate()
        .map(|(i, word)| (word.to_string(), serde_json::json!(i)))
        .collect();
    let definition = serde_json::json!({
        "version": "1.0",
        "pre_tokenizer": {"type": "Whitespace"},
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"},
    });
    Tokenizer::from_bytes(definition.to_string().as_bytes()).unwrap()
}

fn write_dataset(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("train.json");
    fs::write(
        &path,
        r#"[
            {"sentence": "Rose grows to about 30cm",
             "pairs": [{"span-s": {"span": "Rose", "attr": "Plant"},
                        "rel": "height",
                        "span-e": {"span": "30cm", "attr": "Measure"}}]},
            {"sentence": "Tulip petals are red",
             "pairs": [{"span-s": {"span": "Tulip", "attr": "Plant"},
                        "rel": "color",
                        "span-e": {"span": "red", "attr": "Color"}}]}
        ]"#,
    )
    .unwrap();
    path
}

fn params() -> HyperParams {
    HyperParams {
        epochs: 1,
        batch_size: 2,
        max_seq_len: 12,
        learning_rate: 1e-3,
        checkpoint_every: 1,
        max_checkpoints: 2,
        ..HyperParams::default()
    }
}

#[tokio::test]
async fn test_train_then_extract_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let dataset_path = write_dataset(&temp_dir);
    let params = params();
    let schema = Schema::builtin();

    let lm = TraitLm::new(LmConfig::small(), Device::Cpu).unwrap();
    let mut backbone = LocalBackbone::new(lm, tiny_tokenizer()).unwrap();

    let rows = load_dataset(&dataset_path).unwrap();
    let codec = Codec::new(schema.clone());
    let (examples, stats) = {
        let builder =
            ExampleBuilder::new(&codec, &backbone, params.max_seq_len, params.oversize_policy);
        builder.build_all(&rows).unwrap()
    };
    assert_eq!(stats.built, 2);
    assert_eq!(stats.skipped_rows, 0);

    let checkpoint_dir = temp_dir.path().join("checkpoints");
    let manager = CheckpointManager::new(checkpoint_dir.clone(), params.max_checkpoints).unwrap();
    let mut engine = FineTuneEngine::new(&params, &manager, &schema.version);
    let report = engine.run(&mut backbone, &examples).unwrap();

    assert!(report.final_epoch_loss.is_finite());
    let listed = manager.list_checkpoints().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, report.last_checkpoint.id);

    // The published checkpoint must be loadable and enforce the length guard.
    let extractor = Extractor::load(
        &checkpoint_dir.join(&report.last_checkpoint.id),
        schema,
        Device::Cpu,
    )
    .unwrap();
    assert_eq!(extractor.meta().epoch, 1);

    let long_input = "Rose grows ".repeat(10);
    let err = extractor.extract(long_input.trim()).await.unwrap_err();
    assert!(matches!(err, ExtractError::InputTooLong { .. }));
}

#[tokio::test]
async fn test_checkpoint_refused_for_other_schema_version() {
    let temp_dir = TempDir::new().unwrap();
    let params = params();

    let lm = TraitLm::new(LmConfig::small(), Device::Cpu).unwrap();
    let backbone = LocalBackbone::new(lm, tiny_tokenizer()).unwrap();

    let manager = CheckpointManager::new(temp_dir.path().to_path_buf(), 2).unwrap();
    let meta = manager
        .create_checkpoint(&backbone, "t2t-schema-v1", 1, 1.0, &params)
        .unwrap();

    let mut other_schema = Schema::builtin();
    other_schema.version = "t2t-schema-v9".to_string();
    let err = Extractor::load(&temp_dir.path().join(&meta.id), other_schema, Device::Cpu)
        .err()
        .expect("load must fail on schema mismatch");
    assert!(err.to_string().contains("t2t-schema-v9"));
}
