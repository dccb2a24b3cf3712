//! Transformer decoder block.
//!
//! A single pre-norm block combining:
//! - RMSNorm before attention
//! - Grouped-query causal self-attention
//! - RMSNorm before the feed-forward network
//! - SwiGLU feed-forward
//!
//! Both sublayers add their output back onto the residual stream.

use super::attention::Attention;
use super::config::ModelArgs;
use super::feed_forward::FeedForward;
use super::kv_cache::LayerCache;
use super::loader::{ParamLoader, WeightInit};
use super::rmsnorm::RmsNorm;
use super::rope::RotarySlice;
use crate::error::Result;
use candle_core::Tensor;

/// A single transformer decoder block.
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    /// Pre-attention norm.
    attention_norm: RmsNorm,
    /// Self-attention.
    attention: Attention,
    /// Pre-FFN norm.
    ffn_norm: RmsNorm,
    /// Feed-forward network.
    feed_forward: FeedForward,
    /// Block index (for debugging).
    layer_idx: usize,
}

impl TransformerBlock {
    /// Create a new transformer block.
    pub fn new(
        attention_norm: RmsNorm,
        attention: Attention,
        ffn_norm: RmsNorm,
        feed_forward: FeedForward,
        layer_idx: usize,
    ) -> Self {
        Self {
            attention_norm,
            attention,
            ffn_norm,
            feed_forward,
            layer_idx,
        }
    }

    /// Load the parameters of block `layer_idx` from `layers.{layer_idx}.*`.
    pub fn load(loader: &mut ParamLoader<'_>, layer_idx: usize, args: &ModelArgs) -> Result<Self> {
        let prefix = format!("layers.{layer_idx}");

        let attention = Attention::load(loader, &format!("{prefix}.attention"), args)?;
        let feed_forward = FeedForward::load(loader, &format!("{prefix}.feed_forward"), args)?;
        let attention_norm = RmsNorm::new(
            loader.get(&format!("{prefix}.attention_norm.weight"), &[args.dim], WeightInit::Ones)?,
            args.norm_eps,
        )?;
        let ffn_norm = RmsNorm::new(
            loader.get(&format!("{prefix}.ffn_norm.weight"), &[args.dim], WeightInit::Ones)?,
            args.norm_eps,
        )?;

        Ok(Self::new(attention_norm, attention, ffn_norm, feed_forward, layer_idx))
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [batch, seq_len, dim]
    /// * `rotary` - Rotation angles for the absolute positions of `x`
    /// * `mask` - Optional additive causal mask
    /// * `cache` - Optional layer KV cache to read from and update
    ///
    /// # Returns
    ///
    /// Output hidden states [batch, seq_len, dim]
    pub fn forward(
        &self,
        x: &Tensor,
        rotary: &RotarySlice,
        mask: Option<&Tensor>,
        cache: Option<&mut LayerCache>,
    ) -> Result<Tensor> {
        let normed = self.attention_norm.forward(x)?;
        let attn_output = self.attention.forward(&normed, rotary, mask, cache)?;
        let h = (x + attn_output)?;

        let normed = self.ffn_norm.forward(&h)?;
        let ffn_output = self.feed_forward.forward(&normed)?;
        Ok((h + ffn_output)?)
    }

    /// Get the block index.
    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }
}
