// Fine-tuning engine
//
// Drives the epoch loop over pre-built training examples. The run is a small
// state machine; every transition is logged so an interrupted run can be
// diagnosed from the log alone:
//   Idle -> Loading -> TrainingEpoch -> Checkpointing -> TrainingEpoch ...
//                                    -> Done | Failed

use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fmt;

use crate::config::HyperParams;
use crate::dataset::TrainingExample;
use crate::errors::TrainError;
use crate::models::Backbone;

use super::checkpoint::{CheckpointManager, CheckpointMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Loading,
    TrainingEpoch(usize),
    Checkpointing(usize),
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Loading => write!(f, "loading"),
            RunState::TrainingEpoch(e) => write!(f, "training_epoch({e})"),
            RunState::Checkpointing(e) => write!(f, "checkpointing({e})"),
            RunState::Done => write!(f, "done"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone)]
pub struct TrainReport {
    pub epochs_run: usize,
    pub final_epoch_loss: f32,
    pub last_checkpoint: CheckpointMeta,
}

pub struct FineTuneEngine<'a> {
    params: &'a HyperParams,
    manager: &'a CheckpointManager,
    schema_version: String,
    state: RunState,
}

impl<'a> FineTuneEngine<'a> {
    pub fn new(
        params: &'a HyperParams,
        manager: &'a CheckpointManager,
        schema_version: &str,
    ) -> Self {
        Self {
            params,
            manager,
            schema_version: schema_version.to_string(),
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        tracing::info!(from = %self.state, to = %next, "Training state transition");
        self.state = next;
    }

    /// Run the full fine-tuning loop. The backbone must already be loaded
    /// (fresh base weights or a resumed checkpoint).
    pub fn run(
        &mut self,
        backbone: &mut dyn Backbone,
        examples: &[TrainingExample],
    ) -> Result<TrainReport, TrainError> {
        self.transition(RunState::Loading);
        if examples.is_empty() {
            self.transition(RunState::Failed);
            return Err(TrainError::EmptyDataset);
        }
        if let Err(e) = self.params.validate() {
            self.transition(RunState::Failed);
            return Err(e.into());
        }

        tracing::info!(
            examples = examples.len(),
            epochs = self.params.epochs,
            batch_size = self.params.batch_size,
            learning_rate = self.params.learning_rate,
            "Starting fine-tuning run"
        );

        let mut last_checkpoint: Option<CheckpointMeta> = None;
        let mut final_epoch_loss = 0.0_f32;

        for epoch in 1..=self.params.epochs {
            self.transition(RunState::TrainingEpoch(epoch));

            let epoch_loss = match self.run_epoch(backbone, examples, epoch) {
                Ok(loss) => loss,
                Err(e) => {
                    self.transition(RunState::Failed);
                    return Err(e);
                }
            };
            final_epoch_loss = epoch_loss;

            tracing::info!(epoch = epoch, epoch_loss = epoch_loss, "Epoch complete");

            let cadence_hit = epoch % self.params.checkpoint_every == 0;
            if cadence_hit || epoch == self.params.epochs {
                self.transition(RunState::Checkpointing(epoch));
                match self.manager.create_checkpoint(
                    backbone,
                    &self.schema_version,
                    epoch,
                    epoch_loss,
                    self.params,
                ) {
                    Ok(meta) => last_checkpoint = Some(meta),
                    Err(e) => {
                        // A failed write is not fatal; training continues and
                        // the next interval retries.
                        tracing::warn!(epoch = epoch, error = %format!("{e:#}"), "Checkpoint write failed");
                    }
                }
            }
        }

        let last_checkpoint = match last_checkpoint {
            Some(meta) => meta,
            None => {
                self.transition(RunState::Failed);
                return Err(TrainError::NoCheckpointPersisted);
            }
        };

        self.transition(RunState::Done);
        Ok(TrainReport {
            epochs_run: self.params.epochs,
            final_epoch_loss,
            last_checkpoint,
        })
    }

    /// One pass over the shuffled dataset. Returns the mean batch loss.
    fn run_epoch(
        &self,
        backbone: &mut dyn Backbone,
        examples: &[TrainingExample],
        epoch: usize,
    ) -> Result<f32, TrainError> {
        // Deterministic per-epoch order: same seed and epoch, same batches.
        let mut order: Vec<usize> = (0..examples.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.params.shuffle_seed.wrapping_add(epoch as u64));
        order.shuffle(&mut rng);

        let batches: Vec<&[usize]> = order.chunks(self.params.batch_size).collect();
        let progress = epoch_progress_bar(epoch, batches.len());

        let mut loss_sum = 0.0_f64;
        for (step, batch_indices) in batches.iter().enumerate() {
            let batch: Vec<TrainingExample> = batch_indices
                .iter()
                .map(|&i| examples[i].clone())
                .collect();

            let loss = backbone
                .train_batch(&batch, self.params.learning_rate)
                .map_err(|e| TrainError::Backbone(format!("{e:#}")))?;

            if !loss.is_finite() {
                progress.abandon();
                return Err(TrainError::Diverged { epoch, step, loss });
            }

            loss_sum += loss as f64;
            progress.inc(1);
        }
        progress.finish_and_clear();

        Ok((loss_sum / batches.len() as f64) as f32)
    }
}

fn epoch_progress_bar(epoch: usize, batches: usize) -> ProgressBar {
    let bar = ProgressBar::new(batches as u64);
    bar.set_style(
        ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {pos}/{len} batches")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.set_message(format!("epoch {epoch}"));
    bar
}
