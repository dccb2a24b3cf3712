//! SwiGLU feed-forward block (Swish-Gated Linear Unit).
//!
//! # Formula
//!
//! `FFN(x) = w2(silu(w1(x)) * w3(x))`
//!
//! Where `silu(x) = x * sigmoid(x)`
//!
//! # Reference
//!
//! [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)

use super::config::ModelArgs;
use super::loader::{ParamLoader, WeightInit};
use super::ops::{linear, silu};
use crate::error::{EmberError, Result};
use candle_core::Tensor;

/// SwiGLU feed-forward block.
#[derive(Debug, Clone)]
pub struct FeedForward {
    /// Gate projection: [hidden_dim, dim]
    w1: Tensor,
    /// Down projection: [dim, hidden_dim]
    w2: Tensor,
    /// Up projection: [hidden_dim, dim]
    w3: Tensor,
    /// Model dimension.
    dim: usize,
    /// Inner dimension.
    hidden_dim: usize,
}

impl FeedForward {
    /// Create a feed-forward block from its three projections.
    pub fn new(w1: Tensor, w2: Tensor, w3: Tensor) -> Result<Self> {
        let (hidden_dim, dim) = w1.dims2()?;
        if w3.dims() != [hidden_dim, dim] || w2.dims() != [dim, hidden_dim] {
            return Err(EmberError::ShapeMismatch(format!(
                "feed-forward projections disagree: w1 {:?}, w2 {:?}, w3 {:?}",
                w1.dims(),
                w2.dims(),
                w3.dims()
            )));
        }

        Ok(Self {
            w1,
            w2,
            w3,
            dim,
            hidden_dim,
        })
    }

    /// Load `{prefix}.w1.weight`, `{prefix}.w2.weight` and `{prefix}.w3.weight`.
    pub fn load(loader: &mut ParamLoader<'_>, prefix: &str, args: &ModelArgs) -> Result<Self> {
        let dim = args.dim;
        let hidden_dim = args.ffn_hidden_dim();

        let w1 = loader.get(&format!("{prefix}.w1.weight"), &[hidden_dim, dim], WeightInit::normal())?;
        let w2 = loader.get(&format!("{prefix}.w2.weight"), &[dim, hidden_dim], WeightInit::normal())?;
        let w3 = loader.get(&format!("{prefix}.w3.weight"), &[hidden_dim, dim], WeightInit::normal())?;

        Self::new(w1, w2, w3)
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., dim]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = silu(&linear(x, &self.w1)?)?;
        let up = linear(x, &self.w3)?;
        linear(&(gate * up)?, &self.w2)
    }

    /// Get the model dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Get the inner dimension.
    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::loader::Checkpoint;
    use candle_core::{DType, Device};

    fn zeros(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn feed_forward_forward_shape() {
        let args = ModelArgs::tiny();
        let checkpoint = Checkpoint::empty();
        let mut loader = ParamLoader::new(&checkpoint, DType::F32, &Device::Cpu);
        let ffn = FeedForward::load(&mut loader, "layers.0.feed_forward", &args).unwrap();

        assert_eq!(ffn.dim(), 64);
        assert_eq!(ffn.hidden_dim(), args.ffn_hidden_dim());

        let x = Tensor::randn(0.0f32, 1.0, &[2, 5, 64], &Device::Cpu).unwrap();
        let out = ffn.forward(&x).unwrap();
        assert_eq!(out.dims(), &[2, 5, 64]);
    }

    #[test]
    fn feed_forward_zero_weights() {
        let ffn = FeedForward::new(zeros(&[8, 4]), zeros(&[4, 8]), zeros(&[8, 4])).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, &[1, 3, 4], &Device::Cpu).unwrap();
        let out: Vec<f32> = ffn.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(out.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn feed_forward_gating() {
        // dim 1, hidden 1: out = w2 * silu(w1 x) * w3 x
        let w1 = Tensor::new(&[[1.0f32]], &Device::Cpu).unwrap();
        let w2 = Tensor::new(&[[2.0f32]], &Device::Cpu).unwrap();
        let w3 = Tensor::new(&[[3.0f32]], &Device::Cpu).unwrap();
        let ffn = FeedForward::new(w1, w2, w3).unwrap();

        let x = Tensor::new(&[[1.0f32]], &Device::Cpu).unwrap();
        let out: Vec<Vec<f32>> = ffn.forward(&x).unwrap().to_vec2().unwrap();

        let silu_one = 1.0f32 / (1.0 + (-1.0f32).exp());
        let expected = 2.0 * silu_one * 3.0;
        assert!((out[0][0] - expected).abs() < 1e-5);
    }

    #[test]
    fn feed_forward_rejects_mismatched_weights() {
        let result = FeedForward::new(zeros(&[8, 4]), zeros(&[4, 6]), zeros(&[8, 4]));
        assert!(matches!(result, Err(EmberError::ShapeMismatch(_))));
    }
}
