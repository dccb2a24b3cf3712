//! Model configuration.

use crate::error::{EmberError, Result};
use serde::{Deserialize, Deserializer, Serialize};

/// Configuration for a LLaMA-style decoder.
///
/// This is the complete configuration surface of the model. Missing keys in a
/// JSON file fall back to [`ModelArgs::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelArgs {
    /// Model (residual stream) dimension.
    pub dim: usize,
    /// Number of transformer blocks.
    pub n_layers: usize,
    /// Number of query heads.
    pub n_heads: usize,
    /// Number of key/value heads. `None` means one per query head.
    pub n_kv_heads: Option<usize>,
    /// Vocabulary size.
    ///
    /// Zero means the size comes from the tokenizer. A negative value in JSON
    /// (`-1` in stock LLaMA `params.json`) reads as zero.
    #[serde(deserialize_with = "vocab_size_or_unset")]
    pub vocab_size: usize,
    /// Feed-forward hidden width is rounded up to a multiple of this.
    pub multiple_of: usize,
    /// Optional scale applied to the feed-forward hidden width.
    pub ffn_dim_multiplier: Option<f64>,
    /// RMS norm epsilon.
    pub norm_eps: f64,
    /// Maximum rows in one generation call.
    pub max_batch_size: usize,
    /// Maximum total sequence length (prompt plus generated tokens).
    pub max_seq_len: usize,
    /// Default cap on generated tokens.
    pub max_gen_len: usize,
}

impl Default for ModelArgs {
    fn default() -> Self {
        // LLaMA-7B shape
        Self {
            dim: 4096,
            n_layers: 32,
            n_heads: 32,
            n_kv_heads: None,
            vocab_size: 32000,
            multiple_of: 256,
            ffn_dim_multiplier: None,
            norm_eps: 1e-5,
            max_batch_size: 32,
            max_seq_len: 1024,
            max_gen_len: 32,
        }
    }
}

impl ModelArgs {
    /// Tiny config for tests and quick iteration.
    pub fn tiny() -> Self {
        Self {
            dim: 64,
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: None,
            vocab_size: 96,
            multiple_of: 32,
            ffn_dim_multiplier: None,
            norm_eps: 1e-5,
            max_batch_size: 4,
            max_seq_len: 64,
            max_gen_len: 16,
        }
    }

    /// Load from a JSON file and validate.
    ///
    /// The vocabulary size may be left unset for the tokenizer to fill in.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let args: Self = serde_json::from_str(&contents)?;
        args.validate_layout()?;
        Ok(args)
    }

    /// Check the invariants every layer relies on.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(EmberError::Config("vocab_size must be positive".to_string()));
        }
        self.validate_layout()
    }

    fn validate_layout(&self) -> Result<()> {
        let positive = [
            ("dim", self.dim),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("multiple_of", self.multiple_of),
            ("max_batch_size", self.max_batch_size),
            ("max_seq_len", self.max_seq_len),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(EmberError::Config(format!("{name} must be positive")));
            }
        }

        if self.dim % self.n_heads != 0 {
            return Err(EmberError::Config(format!(
                "dim {} is not divisible by n_heads {}",
                self.dim, self.n_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(EmberError::Config(format!(
                "head dim {} must be even for rotary pairs",
                self.head_dim()
            )));
        }

        let n_kv_heads = self.n_kv_heads();
        if n_kv_heads == 0 || self.n_heads % n_kv_heads != 0 {
            return Err(EmberError::Config(format!(
                "n_heads {} is not a multiple of n_kv_heads {}",
                self.n_heads, n_kv_heads
            )));
        }

        if !(self.norm_eps > 0.0) {
            return Err(EmberError::Config(format!(
                "norm_eps must be positive, got {}",
                self.norm_eps
            )));
        }
        if let Some(multiplier) = self.ffn_dim_multiplier {
            if !(multiplier > 0.0) {
                return Err(EmberError::Config(format!(
                    "ffn_dim_multiplier must be positive, got {multiplier}"
                )));
            }
        }

        Ok(())
    }

    /// Dimension of one attention head.
    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Number of key/value heads.
    pub fn n_kv_heads(&self) -> usize {
        self.n_kv_heads.unwrap_or(self.n_heads)
    }

    /// Query heads sharing one key/value head.
    pub fn n_rep(&self) -> usize {
        self.n_heads / self.n_kv_heads()
    }

    /// Effective feed-forward hidden width.
    ///
    /// Checkpoint weight shapes depend on this exact rounding.
    pub fn ffn_hidden_dim(&self) -> usize {
        ffn_hidden_dim(4 * self.dim, self.multiple_of, self.ffn_dim_multiplier)
    }
}

fn vocab_size_or_unset<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let value = i64::deserialize(deserializer)?;
    Ok(usize::try_from(value).unwrap_or(0))
}

/// Hidden width of the gated MLP.
///
/// The nominal width is reduced by 2/3, optionally scaled, then rounded up to
/// the nearest multiple of `multiple_of`. Float-to-int casts truncate.
pub fn ffn_hidden_dim(
    hidden_dim: usize,
    multiple_of: usize,
    ffn_dim_multiplier: Option<f64>,
) -> usize {
    let mut hidden = 2 * hidden_dim / 3;
    if let Some(multiplier) = ffn_dim_multiplier {
        hidden = (multiplier * hidden as f64) as usize;
    }
    multiple_of * hidden.div_ceil(multiple_of)
}
