//! Batched greedy text generation.

mod buffer;
mod generator;

pub use buffer::TokenBuffer;
pub use generator::{GenerationConfig, Generator, SequenceState};
