//! # Ember Core
//!
//! Inference core for LLaMA-style decoder-only transformers.
//!
//! This crate provides:
//! - **Model** layers (RMSNorm, rotary embeddings, grouped-query attention,
//!   SwiGLU feed-forward) composed into a full transformer forward pass
//! - **Checkpoint loading** from SafeTensors and PyTorch pickles, non-strict
//! - **Greedy generation** over batches of mixed-length prompts, with an
//!   optional KV cache

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod generation;
pub mod model;

pub use error::{EmberError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{EmberError, Result};
    pub use crate::generation::{GenerationConfig, Generator};
    pub use crate::model::{CausalLm, Checkpoint, KvCache, ModelArgs, Tokenizer, Transformer};
}
