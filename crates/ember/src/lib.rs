//! # Ember
//!
//! Greedy text generation for LLaMA-style decoder-only transformers.
//!
//! Ember loads a checkpoint (`consolidated.00.pth` or SafeTensors) and a
//! HuggingFace tokenizer, then continues batches of prompts token by token:
//! - **Mixed-length batches**: shorter prompts start generating while longer
//!   ones are still being read
//! - **KV cache**: optional incremental decoding
//! - **Cancellation**: cooperative, checked between decoding steps
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ember::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let engine = Engine::builder()
//!         .checkpoint("llama-7b/")
//!         .tokenizer("tokenizer.json")
//!         .max_gen_len(64)
//!         .build()?;
//!
//!     for completion in engine.generate(&["The capital of France is"])? {
//!         println!("{}", completion.text);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use ember_core::*;

pub mod cli;
mod engine;

pub use engine::{
    Completion, Engine, EngineBuilder, EngineConfig, CONSOLIDATED_CHECKPOINT, PARAMS_FILE,
};

/// Commonly used types.
pub mod prelude {
    pub use crate::engine::{Completion, Engine, EngineBuilder, EngineConfig};
    pub use crate::{
        error::{EmberError, Result},
        generation::{GenerationConfig, Generator},
        model::{CausalLm, Checkpoint, ModelArgs, Tokenizer, Transformer},
    };

    // Re-export useful external types
    pub use anyhow;
    pub use tracing;
}
