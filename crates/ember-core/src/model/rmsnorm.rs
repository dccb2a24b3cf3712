//! Root Mean Square Layer Normalization.
//!
//! RMSNorm is a simpler alternative to LayerNorm that only
//! normalizes by the root mean square, without centering.
//!
//! # Formula
//!
//! `RMSNorm(x) = x / sqrt(mean(x^2) + eps) * weight`
//!
//! The normalization runs in f32 and is cast back to the input dtype before
//! the learned scale is applied.
//!
//! # Reference
//!
//! [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)

use super::ops::mean_square;
use crate::error::{EmberError, Result};
use candle_core::{DType, Device, Tensor};

/// RMS Layer Normalization.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter.
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
    /// Hidden dimension.
    hidden_size: usize,
}

impl RmsNorm {
    /// Create a new RMSNorm layer with given weight.
    pub fn new(weight: Tensor, eps: f64) -> Result<Self> {
        let hidden_size = weight.dims1().map_err(|_| {
            EmberError::ShapeMismatch(format!(
                "norm weight must be a vector, got {:?}",
                weight.dims()
            ))
        })?;
        Ok(Self {
            weight,
            eps,
            hidden_size,
        })
    }

    /// Create a new RMSNorm layer with unit scale.
    pub fn ones(hidden_size: usize, eps: f64, dtype: DType, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(hidden_size, dtype, device)?;
        Ok(Self {
            weight,
            eps,
            hidden_size,
        })
    }

    /// Normalize without applying the learned scale, in the input dtype.
    pub fn normalize(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let rsqrt = (mean_square(x)? + self.eps)?.sqrt()?.recip()?;
        let normalized = x.to_dtype(DType::F32)?.broadcast_mul(&rsqrt)?;
        Ok(normalized.to_dtype(dtype)?)
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., hidden_size]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let normalized = self.normalize(x)?;
        Ok(normalized.broadcast_mul(&self.weight)?)
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Get epsilon value.
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Get the weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}
