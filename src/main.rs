// text2trait - structured trait extraction from text
// Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};

use text2trait::config::{load_params, HyperParams};
use text2trait::errors::ConfigError;
use text2trait::dataset::{load_dataset, ExampleBuilder};
use text2trait::inference::Extractor;
use text2trait::models::{get_device, LocalBackbone};
use text2trait::schema::{Codec, Schema};
use text2trait::training::{load_checkpoint_meta, CheckpointManager, FineTuneEngine};

#[derive(Parser, Debug)]
#[command(name = "text2trait")]
#[command(about = "Structured trait extraction from scientific text", version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Schema definition file (JSON); defaults to the built-in schema
    #[arg(long, global = true)]
    schema: Option<PathBuf>,
}

#[derive(Parser, Debug)]
enum Command {
    /// Fine-tune the backbone on a labeled dataset
    Train {
        /// Labeled dataset (JSON array of rows)
        dataset: PathBuf,

        /// Hyperparameter file (TOML); defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Checkpoint output directory
        #[arg(long, default_value = "checkpoints")]
        checkpoint_dir: PathBuf,

        /// Resume from this checkpoint ID instead of the base backbone
        #[arg(long)]
        resume: Option<String>,
    },
    /// Extract trait records from one input text
    Extract {
        /// Checkpoint directory to load
        #[arg(long)]
        checkpoint: PathBuf,

        /// Text to extract from; reads stdin when omitted
        text: Option<String>,

        /// Read the input text from a file instead
        #[arg(long, conflicts_with = "text")]
        input: Option<PathBuf>,

        /// Emit records as JSON instead of tab-separated lines
        #[arg(long)]
        json: bool,
    },
    /// Build the dataset and report statistics without training
    DatasetStats {
        /// Labeled dataset (JSON array of rows)
        dataset: PathBuf,

        /// Hyperparameter file (TOML); defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// List published checkpoints, newest first
    Checkpoints {
        /// Checkpoint directory
        #[arg(long, default_value = "checkpoints")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let schema = match &args.schema {
        Some(path) => Schema::from_file(path)?,
        None => Schema::builtin(),
    };

    match args.command {
        Command::Train { dataset, config, checkpoint_dir, resume } => {
            run_train(schema, &dataset, config.as_deref(), checkpoint_dir, resume)
        }
        Command::Extract { checkpoint, text, input, json } => {
            run_extract(schema, &checkpoint, text, input, json).await
        }
        Command::DatasetStats { dataset, config } => {
            run_dataset_stats(schema, &dataset, config.as_deref())
        }
        Command::Checkpoints { dir } => run_checkpoints(dir),
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn load_params_or_default(config: Option<&Path>) -> Result<HyperParams> {
    let params = match config {
        Some(path) => load_params(path)?,
        None => HyperParams::default(),
    };
    Ok(params)
}

fn run_train(
    schema: Schema,
    dataset: &Path,
    config: Option<&Path>,
    checkpoint_dir: PathBuf,
    resume: Option<String>,
) -> Result<()> {
    let params = load_params_or_default(config)?;
    let device = get_device()?;
    let manager = CheckpointManager::new(checkpoint_dir, params.max_checkpoints)?;

    let mut backbone = match resume {
        Some(checkpoint_id) => {
            let dir = manager.checkpoint_path(&checkpoint_id)?;
            let meta = load_checkpoint_meta(&dir.join("checkpoint.json"))?;
            meta.check_schema(&schema.version)?;
            tracing::info!(checkpoint_id = %checkpoint_id, "Resuming from checkpoint");
            LocalBackbone::load(&dir, device)?
        }
        None => LocalBackbone::load(Path::new(&params.backbone), device)
            .with_context(|| format!("Failed to load base backbone from {}", params.backbone))?,
    };

    // Mirror the inference-side capacity check so oversize sources surface
    // before any epoch runs, not as per-batch skips.
    if params.max_seq_len > backbone.lm_config().max_seq_len {
        return Err(ConfigError::Invalid {
            key: "max_seq_len",
            reason: format!(
                "allows {} source tokens but the model supports {}",
                params.max_seq_len,
                backbone.lm_config().max_seq_len
            ),
        }
        .into());
    }

    let rows = load_dataset(dataset)?;
    let codec = Codec::new(schema.clone());
    let (examples, stats) = {
        let builder =
            ExampleBuilder::new(&codec, &backbone, params.max_seq_len, params.oversize_policy);
        builder.build_all(&rows)?
    };
    println!(
        "Built {} examples ({} rows skipped, {} pairs skipped, {} truncated, {} dropped oversize)",
        stats.built, stats.skipped_rows, stats.skipped_pairs, stats.truncated, stats.dropped_oversize
    );

    let mut engine = FineTuneEngine::new(&params, &manager, &schema.version);
    let report = engine.run(&mut backbone, &examples)?;

    println!(
        "Training complete: {} epochs, final epoch loss {:.4}",
        report.epochs_run, report.final_epoch_loss
    );
    println!("Latest checkpoint: {}", report.last_checkpoint.id);
    Ok(())
}

async fn run_extract(
    schema: Schema,
    checkpoint: &Path,
    text: Option<String>,
    input_file: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let input = match (text, input_file) {
        (Some(text), _) => text,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file {}", path.display()))?
            .trim()
            .to_string(),
        (None, None) => {
            if io::stdin().is_terminal() {
                anyhow::bail!("No input text: pass it as an argument, via --input, or on stdin");
            }
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer.trim().to_string()
        }
    };
    if input.is_empty() {
        anyhow::bail!("Input text is empty");
    }

    let device = get_device()?;
    let extractor = Extractor::load(checkpoint, schema, device)?;
    let records = extractor.extract(&input).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        for record in &records {
            println!("{}\t{}\t{}", record.subject, record.attribute, record.value);
        }
    }
    Ok(())
}

fn run_dataset_stats(schema: Schema, dataset: &Path, config: Option<&Path>) -> Result<()> {
    let params = load_params_or_default(config)?;
    let device = get_device()?;
    let backbone = LocalBackbone::load(Path::new(&params.backbone), device)
        .with_context(|| format!("Failed to load base backbone from {}", params.backbone))?;

    let rows = load_dataset(dataset)?;
    let codec = Codec::new(schema);
    let builder =
        ExampleBuilder::new(&codec, &backbone, params.max_seq_len, params.oversize_policy);
    let (_, stats) = builder.build_all(&rows)?;

    println!("Rows:            {}", rows.len());
    println!("Examples built:  {}", stats.built);
    println!("Rows skipped:    {}", stats.skipped_rows);
    println!("Pairs skipped:   {}", stats.skipped_pairs);
    println!("Rows truncated:  {}", stats.truncated);
    println!("Oversize drops:  {}", stats.dropped_oversize);
    Ok(())
}

fn run_checkpoints(dir: PathBuf) -> Result<()> {
    let manager = CheckpointManager::new(dir, usize::MAX)?;
    let checkpoints = manager.list_checkpoints()?;

    if checkpoints.is_empty() {
        println!("No checkpoints found");
        return Ok(());
    }
    for meta in checkpoints {
        println!(
            "{}  epoch {}  loss {:.4}  {}  {}",
            meta.id,
            meta.epoch,
            meta.epoch_loss,
            meta.schema_version,
            meta.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        );
    }
    Ok(())
}
