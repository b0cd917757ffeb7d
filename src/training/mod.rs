// Training module - fine-tuning loop and checkpoint management

pub mod checkpoint;
pub mod engine;

pub use checkpoint::{load_checkpoint_meta, CheckpointManager, CheckpointMeta};
pub use engine::{FineTuneEngine, RunState, TrainReport};
