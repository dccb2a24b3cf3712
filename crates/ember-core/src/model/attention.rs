//! Multi-head causal self-attention with grouped KV heads.
//!
//! Queries use `n_heads` heads; keys and values use `n_kv_heads` heads which
//! are repeated `n_heads / n_kv_heads` times before the score computation.

use super::config::ModelArgs;
use super::kv_cache::LayerCache;
use super::loader::{ParamLoader, WeightInit};
use super::ops::{linear, softmax_f32};
use super::rope::RotarySlice;
use crate::error::{EmberError, Result};
use candle_core::Tensor;

/// Self-attention module for transformer blocks.
#[derive(Debug, Clone)]
pub struct Attention {
    /// Query projection: [n_heads * head_dim, dim]
    wq: Tensor,
    /// Key projection: [n_kv_heads * head_dim, dim]
    wk: Tensor,
    /// Value projection: [n_kv_heads * head_dim, dim]
    wv: Tensor,
    /// Output projection: [dim, n_heads * head_dim]
    wo: Tensor,
    /// Number of query heads.
    n_heads: usize,
    /// Number of key-value heads.
    n_kv_heads: usize,
    /// Head dimension.
    head_dim: usize,
}

impl Attention {
    /// Create attention with provided weights.
    pub fn new(
        wq: Tensor,
        wk: Tensor,
        wv: Tensor,
        wo: Tensor,
        n_heads: usize,
        n_kv_heads: usize,
    ) -> Result<Self> {
        if n_heads == 0 || n_kv_heads == 0 || n_heads % n_kv_heads != 0 {
            return Err(EmberError::Config(format!(
                "n_heads ({n_heads}) must be a positive multiple of n_kv_heads ({n_kv_heads})"
            )));
        }

        let (q_out, dim) = wq.dims2()?;
        if q_out % n_heads != 0 {
            return Err(EmberError::ShapeMismatch(format!(
                "wq rows ({q_out}) not divisible by {n_heads} heads"
            )));
        }
        let head_dim = q_out / n_heads;
        let kv_out = n_kv_heads * head_dim;

        if wk.dims() != [kv_out, dim] || wv.dims() != [kv_out, dim] || wo.dims() != [dim, q_out] {
            return Err(EmberError::ShapeMismatch(format!(
                "attention projections disagree: wq {:?}, wk {:?}, wv {:?}, wo {:?}",
                wq.dims(),
                wk.dims(),
                wv.dims(),
                wo.dims()
            )));
        }

        Ok(Self {
            wq,
            wk,
            wv,
            wo,
            n_heads,
            n_kv_heads,
            head_dim,
        })
    }

    /// Load `{prefix}.wq.weight` through `{prefix}.wo.weight`.
    pub fn load(loader: &mut ParamLoader<'_>, prefix: &str, args: &ModelArgs) -> Result<Self> {
        let dim = args.dim;
        let q_out = args.n_heads * args.head_dim();
        let kv_out = args.n_kv_heads() * args.head_dim();

        let wq = loader.get(&format!("{prefix}.wq.weight"), &[q_out, dim], WeightInit::normal())?;
        let wk = loader.get(&format!("{prefix}.wk.weight"), &[kv_out, dim], WeightInit::normal())?;
        let wv = loader.get(&format!("{prefix}.wv.weight"), &[kv_out, dim], WeightInit::normal())?;
        let wo = loader.get(&format!("{prefix}.wo.weight"), &[dim, q_out], WeightInit::normal())?;

        Self::new(wq, wk, wv, wo, args.n_heads, args.n_kv_heads())
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Normalized hidden states [batch, seq_len, dim]
    /// * `rotary` - Rotation angles for the absolute positions of `x`
    /// * `mask` - Additive mask [seq_len, kv_len], `None` for a single query
    /// * `cache` - Layer cache; when given, the new keys and values are
    ///   appended and attention covers the whole cached history
    ///
    /// # Returns
    ///
    /// Attention output [batch, seq_len, dim]
    pub fn forward(
        &self,
        x: &Tensor,
        rotary: &RotarySlice,
        mask: Option<&Tensor>,
        cache: Option<&mut LayerCache>,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;

        let q = linear(x, &self.wq)?.reshape((batch, seq_len, self.n_heads, self.head_dim))?;
        let k = linear(x, &self.wk)?.reshape((batch, seq_len, self.n_kv_heads, self.head_dim))?;
        let v = linear(x, &self.wv)?.reshape((batch, seq_len, self.n_kv_heads, self.head_dim))?;

        let q = rotary.apply(&q)?;
        let k = rotary.apply(&k)?;

        // [batch, heads, seq_len, head_dim]
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;

        let (k, v) = match cache {
            Some(cache) => cache.append(&k, &v)?,
            None => (k, v),
        };

        let n_rep = self.n_heads / self.n_kv_heads;
        let k = repeat_kv(&k, n_rep)?;
        let v = repeat_kv(&v, n_rep)?;

        // Q @ K^T / sqrt(d): [batch, heads, seq_len, kv_len]
        let scores = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };
        let probs = softmax_f32(&scores)?;

        let out = probs.matmul(&v)?;
        let out = out
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.n_heads * self.head_dim))?;

        linear(&out, &self.wo)
    }

    /// Get the number of heads.
    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    /// Get the number of KV heads.
    pub fn n_kv_heads(&self) -> usize {
        self.n_kv_heads
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}

/// Repeat KV heads: [batch, kv_heads, seq, hd] -> [batch, kv_heads * n_rep, seq, hd].
///
/// Each KV head is repeated in place, so query head `h` reads KV head
/// `h / n_rep`.
pub fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }

    let (batch, n_kv_heads, seq_len, head_dim) = x.dims4()?;

    // [batch, kv_heads, 1, seq, hd] -> [batch, kv_heads, n_rep, seq, hd]
    let x = x
        .unsqueeze(2)?
        .expand(&[batch, n_kv_heads, n_rep, seq_len, head_dim])?;
    Ok(x.reshape((batch, n_kv_heads * n_rep, seq_len, head_dim))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::loader::Checkpoint;
    use crate::model::ops::causal_mask;
    use crate::model::rope::{RotaryEmbedding, ROPE_THETA};
    use candle_core::{DType, Device, IndexOp};

    fn tiny_gqa() -> ModelArgs {
        ModelArgs {
            n_kv_heads: Some(2),
            ..ModelArgs::tiny()
        }
    }

    fn build(args: &ModelArgs) -> Attention {
        let checkpoint = Checkpoint::empty();
        let mut loader = ParamLoader::new(&checkpoint, DType::F32, &Device::Cpu);
        Attention::load(&mut loader, "layers.0.attention", args).unwrap()
    }

    fn rope(args: &ModelArgs) -> RotaryEmbedding {
        RotaryEmbedding::new(args.head_dim(), args.max_seq_len * 2, ROPE_THETA, &Device::Cpu)
            .unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn attention_creation() {
        let attn = build(&tiny_gqa());
        assert_eq!(attn.n_heads(), 4);
        assert_eq!(attn.n_kv_heads(), 2);
        assert_eq!(attn.head_dim(), 16);
    }

    #[test]
    fn attention_forward_shape() {
        let args = tiny_gqa();
        let attn = build(&args);
        let rope = rope(&args);

        let x = Tensor::randn(0.0f32, 1.0, &[2, 7, 64], &Device::Cpu).unwrap();
        let mask = causal_mask(7, 0, DType::F32, &Device::Cpu).unwrap();
        let out = attn
            .forward(&x, &rope.slice(0, 7).unwrap(), Some(&mask), None)
            .unwrap();

        assert_eq!(out.dims(), &[2, 7, 64]);
    }

    #[test]
    fn attention_is_causal() {
        let args = ModelArgs::tiny();
        let attn = build(&args);
        let rope = rope(&args);
        let rotary = rope.slice(0, 6).unwrap();
        let mask = causal_mask(6, 0, DType::F32, &Device::Cpu).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, &[1, 6, 64], &Device::Cpu).unwrap();
        let tail = Tensor::randn(0.0f32, 1.0, &[1, 1, 64], &Device::Cpu).unwrap();
        let perturbed = Tensor::cat(&[x.narrow(1, 0, 5).unwrap(), tail], 1).unwrap();

        let a = attn.forward(&x, &rotary, Some(&mask), None).unwrap();
        let b = attn.forward(&perturbed, &rotary, Some(&mask), None).unwrap();

        // Earlier positions never see the last one
        let a_prefix = a.narrow(1, 0, 5).unwrap();
        let b_prefix = b.narrow(1, 0, 5).unwrap();
        assert!(max_abs_diff(&a_prefix, &b_prefix) < 1e-6);
    }

    #[test]
    fn attention_cache_matches_full_pass() {
        let args = tiny_gqa();
        let attn = build(&args);
        let rope = rope(&args);

        let x = Tensor::randn(0.0f32, 1.0, &[1, 5, 64], &Device::Cpu).unwrap();
        let mask = causal_mask(5, 0, DType::F32, &Device::Cpu).unwrap();
        let full = attn
            .forward(&x, &rope.slice(0, 5).unwrap(), Some(&mask), None)
            .unwrap();

        let mut cache = LayerCache::new(args.max_seq_len);
        let prefix = x.narrow(1, 0, 4).unwrap();
        let prefix_mask = causal_mask(4, 0, DType::F32, &Device::Cpu).unwrap();
        attn.forward(
            &prefix,
            &rope.slice(0, 4).unwrap(),
            Some(&prefix_mask),
            Some(&mut cache),
        )
        .unwrap();

        let step = x.narrow(1, 4, 1).unwrap();
        let incremental = attn
            .forward(&step, &rope.slice(4, 1).unwrap(), None, Some(&mut cache))
            .unwrap();

        assert_eq!(cache.seq_len(), 5);
        let last = full.i((.., 4..5, ..)).unwrap();
        assert!(max_abs_diff(&last, &incremental) < 1e-5);
    }

    #[test]
    fn repeat_kv_layout() {
        let x = Tensor::arange(0f32, 4.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 2, 2, 1))
            .unwrap();
        let repeated = repeat_kv(&x, 2).unwrap();
        assert_eq!(repeated.dims(), &[1, 4, 2, 1]);

        let vals: Vec<f32> = repeated.flatten_all().unwrap().to_vec1().unwrap();
        // Heads [h0, h0, h1, h1]
        assert_eq!(vals, vec![0.0, 1.0, 0.0, 1.0, 2.0, 3.0, 2.0, 3.0]);
    }

    #[test]
    fn attention_rejects_bad_head_split() {
        let w = Tensor::zeros(&[64, 64], DType::F32, &Device::Cpu).unwrap();
        let result = Attention::new(w.clone(), w.clone(), w.clone(), w, 4, 3);
        assert!(matches!(result, Err(EmberError::Config(_))));
    }

    #[test]
    fn attention_rejects_mismatched_projection() {
        let wq = Tensor::zeros(&[64, 64], DType::F32, &Device::Cpu).unwrap();
        let wk = Tensor::zeros(&[48, 64], DType::F32, &Device::Cpu).unwrap();
        let result = Attention::new(wq.clone(), wk, wq.clone(), wq, 4, 2);
        assert!(matches!(result, Err(EmberError::ShapeMismatch(_))));
    }
}
