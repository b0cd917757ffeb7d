// Inference module - candidate generation, validation and the async facade

pub mod engine;
pub mod extractor;
pub mod validate;

pub use engine::InferenceEngine;
pub use extractor::Extractor;
pub use validate::{select_extraction, validate_candidate, ValidationOutcome};
