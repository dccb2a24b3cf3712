//! Rotary Position Embeddings (RoPE).
//!
//! RoPE encodes position information by rotating query and key vectors
//! in the complex plane. Adjacent feature pairs `(x0, x1)` of each head are
//! treated as one complex value and rotated by a position-dependent angle:
//!
//! `(x0, x1) -> (x0 cos t - x1 sin t, x0 sin t + x1 cos t)`
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

use crate::error::{EmberError, Result};
use candle_core::{DType, Device, Tensor};

/// Base of the rotary frequency progression.
pub const ROPE_THETA: f64 = 10000.0;

/// Precomputed rotary table.
///
/// Built once per model on the compute device and shared read-only by all
/// layers.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Cosine table [max_positions, head_dim / 2].
    cos_cache: Tensor,
    /// Sine table [max_positions, head_dim / 2].
    sin_cache: Tensor,
    /// Head dimension.
    head_dim: usize,
    /// Number of positions in the table.
    max_positions: usize,
}

impl RotaryEmbedding {
    /// Create a new rotary table.
    ///
    /// # Arguments
    ///
    /// * `head_dim` - Dimension of each attention head (must be even)
    /// * `max_positions` - Number of positions to precompute
    /// * `theta` - Base frequency
    /// * `device` - Device for the tables
    pub fn new(head_dim: usize, max_positions: usize, theta: f64, device: &Device) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(EmberError::Config(format!(
                "rotary head dim must be even and positive, got {head_dim}"
            )));
        }

        // Inverse frequencies: 1 / (theta^(2i/d)) for i in [0, d/2)
        let half_dim = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / theta.powf(2.0 * i as f64 / head_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        let positions: Vec<f32> = (0..max_positions).map(|p| p as f32).collect();
        let positions = Tensor::from_vec(positions, (max_positions, 1), device)?;

        // Outer product -> [max_positions, half_dim]
        let freqs = positions.matmul(&inv_freq)?;

        Ok(Self {
            cos_cache: freqs.cos()?,
            sin_cache: freqs.sin()?,
            head_dim,
            max_positions,
        })
    }

    /// Rows of the table for positions `start_pos..start_pos + seq_len`.
    pub fn slice(&self, start_pos: usize, seq_len: usize) -> Result<RotarySlice> {
        if start_pos + seq_len > self.max_positions {
            return Err(EmberError::ShapeMismatch(format!(
                "positions {}..{} exceed rotary table of {}",
                start_pos,
                start_pos + seq_len,
                self.max_positions
            )));
        }
        Ok(RotarySlice {
            cos: self.cos_cache.narrow(0, start_pos, seq_len)?,
            sin: self.sin_cache.narrow(0, start_pos, seq_len)?,
        })
    }

    /// Number of positions in the table.
    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}

/// Rotation angles for a contiguous run of positions.
#[derive(Debug, Clone)]
pub struct RotarySlice {
    /// [seq_len, head_dim / 2]
    cos: Tensor,
    /// [seq_len, head_dim / 2]
    sin: Tensor,
}

impl RotarySlice {
    /// Number of positions covered.
    pub fn seq_len(&self) -> usize {
        self.cos.dims()[0]
    }

    /// Rotate `x` of shape [batch, seq_len, heads, head_dim].
    ///
    /// The slice must cover exactly `seq_len` positions and `head_dim / 2`
    /// angles. Computed in f32, returned in the input dtype.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, heads, head_dim) = x.dims4()?;
        let (positions, angles) = self.cos.dims2()?;
        if positions != seq_len || angles * 2 != head_dim {
            return Err(EmberError::ShapeMismatch(format!(
                "rotary table [{positions}, {angles}] does not fit input [{batch}, {seq_len}, {heads}, {head_dim}]"
            )));
        }

        let dtype = x.dtype();
        let pairs = x
            .to_dtype(DType::F32)?
            .reshape((batch, seq_len, heads, angles, 2))?;
        let x0 = pairs.narrow(4, 0, 1)?.squeeze(4)?;
        let x1 = pairs.narrow(4, 1, 1)?.squeeze(4)?;

        // Broadcast over batch and heads: [1, seq_len, 1, angles]
        let cos = self.cos.reshape((1, seq_len, 1, angles))?;
        let sin = self.sin.reshape((1, seq_len, 1, angles))?;

        let out0 = (x0.broadcast_mul(&cos)? - x1.broadcast_mul(&sin)?)?;
        let out1 = (x0.broadcast_mul(&sin)? + x1.broadcast_mul(&cos)?)?;

        let rotated = Tensor::stack(&[out0, out1], 4)?.reshape((batch, seq_len, heads, head_dim))?;
        Ok(rotated.to_dtype(dtype)?)
    }
}
