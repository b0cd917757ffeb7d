// Configuration module
// Public interface for hyperparameter loading

mod loader;
mod settings;

pub use loader::load_params;
pub use settings::{DecodeStrategy, HyperParams, OversizePolicy};
