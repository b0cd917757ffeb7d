// Backbone models
// The opaque generative capability behind the extraction pipeline

pub mod backbone;
pub mod local;
pub mod trait_lm;

pub use backbone::{Backbone, Candidate, DecodeConfig, TokenCounter};
pub use local::LocalBackbone;
pub use trait_lm::{LmConfig, TraitLm};

use anyhow::Result;
use candle_core::Device;

/// Pick the best available compute device.
pub fn get_device() -> Result<Device> {
    Ok(Device::cuda_if_available(0)?)
}
