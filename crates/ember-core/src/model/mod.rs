//! Model definition and loading.
//!
//! Provides the building blocks of a LLaMA-style decoder:
//! - Model configuration
//! - Checkpoint and tokenizer loading
//! - Norm, rotary, attention and feed-forward layers
//! - The full transformer forward pass

mod attention;
mod block;
mod config;
mod feed_forward;
mod kv_cache;
mod loader;
pub mod ops;
mod rmsnorm;
mod rope;
mod tokenizer;
mod transformer;

pub use attention::{repeat_kv, Attention};
pub use block::TransformerBlock;
pub use config::{ffn_hidden_dim, ModelArgs};
pub use feed_forward::FeedForward;
pub use kv_cache::{KvCache, LayerCache};
pub use loader::{Checkpoint, LoadReport, ParamLoader, WeightInit, DEFAULT_INIT_STD};
pub use rmsnorm::RmsNorm;
pub use rope::{RotaryEmbedding, RotarySlice, ROPE_THETA};
pub use tokenizer::Tokenizer;
pub use transformer::{CausalLm, Transformer};
