//! Decoder-only transformer.

use super::block::TransformerBlock;
use super::config::ModelArgs;
use super::kv_cache::KvCache;
use super::loader::{Checkpoint, ParamLoader, WeightInit};
use super::ops::{causal_mask, linear};
use super::rmsnorm::RmsNorm;
use super::rope::{RotaryEmbedding, ROPE_THETA};
use crate::error::{EmberError, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Embedding;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A model that maps token ids to next-token logits.
///
/// The generation loop is written against this trait so it can drive any
/// decoder with the same calling convention.
pub trait CausalLm {
    /// Logits for every position of `tokens`.
    ///
    /// # Arguments
    ///
    /// * `tokens` - Token ids [batch, seq_len] (u32)
    /// * `start_pos` - Absolute position of the first column
    /// * `cache` - Optional KV cache holding exactly `start_pos` positions
    ///
    /// # Returns
    ///
    /// f32 logits [batch, seq_len, vocab_size]
    fn forward(&self, tokens: &Tensor, start_pos: usize, cache: Option<&mut KvCache>)
        -> Result<Tensor>;

    /// Model configuration.
    fn args(&self) -> &ModelArgs;

    /// Compute device.
    fn device(&self) -> &Device;

    /// A cache sized for this model.
    fn new_cache(&self) -> KvCache {
        let args = self.args();
        KvCache::new(args.n_layers, args.max_seq_len)
    }
}

/// A LLaMA-style transformer for inference.
pub struct Transformer {
    /// Model configuration.
    args: ModelArgs,
    /// Token embedding table [vocab_size, dim].
    tok_embeddings: Embedding,
    /// Decoder blocks.
    layers: Vec<TransformerBlock>,
    /// Final norm.
    norm: RmsNorm,
    /// Output projection [vocab_size, dim].
    output: Tensor,
    /// Rotary table shared by all blocks.
    rope: RotaryEmbedding,
    /// Device for computation.
    device: Device,
    /// Working dtype.
    dtype: DType,
    /// Parameters the checkpoint did not provide.
    missing_weights: Vec<String>,
}

impl Transformer {
    /// Build the model from a checkpoint.
    ///
    /// Loading is non-strict: parameters absent from the checkpoint keep
    /// their initialized defaults and are reported by
    /// [`missing_weights`](Self::missing_weights).
    ///
    /// # Arguments
    ///
    /// * `args` - Model configuration (validated here)
    /// * `checkpoint` - Source tensors
    /// * `dtype` - Working dtype for weights and activations
    /// * `device` - Compute device
    pub fn load(args: ModelArgs, checkpoint: &Checkpoint, dtype: DType, device: &Device) -> Result<Self> {
        args.validate()?;
        let started = Instant::now();

        let mut loader = ParamLoader::new(checkpoint, dtype, device);

        let embeddings = loader.get(
            "tok_embeddings.weight",
            &[args.vocab_size, args.dim],
            WeightInit::normal(),
        )?;
        let tok_embeddings = Embedding::new(embeddings, args.dim);

        let layers = (0..args.n_layers)
            .map(|idx| TransformerBlock::load(&mut loader, idx, &args))
            .collect::<Result<Vec<_>>>()?;

        let norm = RmsNorm::new(
            loader.get("norm.weight", &[args.dim], WeightInit::Ones)?,
            args.norm_eps,
        )?;
        let output = loader.get("output.weight", &[args.vocab_size, args.dim], WeightInit::normal())?;

        let rope = RotaryEmbedding::new(args.head_dim(), args.max_seq_len * 2, ROPE_THETA, device)?;

        let report = loader.finish();
        if !checkpoint.is_empty() && !report.missing.is_empty() {
            warn!(
                count = report.missing.len(),
                names = ?report.missing,
                "checkpoint is missing parameters; using initialized defaults"
            );
        }
        if !report.unexpected.is_empty() {
            debug!(names = ?report.unexpected, "ignoring unexpected checkpoint tensors");
        }
        info!(
            layers = args.n_layers,
            dim = args.dim,
            vocab = args.vocab_size,
            dtype = ?dtype,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model loaded"
        );

        Ok(Self {
            args,
            tok_embeddings,
            layers,
            norm,
            output,
            rope,
            device: device.clone(),
            dtype,
            missing_weights: report.missing,
        })
    }

    /// Build the model with freshly initialized weights.
    pub fn random(args: ModelArgs, dtype: DType, device: &Device) -> Result<Self> {
        Self::load(args, &Checkpoint::empty(), dtype, device)
    }

    /// Forward pass.
    ///
    /// Without a cache, attention covers only the columns of `tokens`, which
    /// sit at absolute positions `start_pos..start_pos + seq_len`. With a
    /// cache, the cache must hold exactly `start_pos` positions and attention
    /// covers the whole history.
    pub fn forward(&self, tokens: &Tensor, start_pos: usize, mut cache: Option<&mut KvCache>) -> Result<Tensor> {
        let (batch, seq_len) = tokens.dims2()?;
        if seq_len == 0 {
            return Err(EmberError::InvalidRequest("empty token sequence".to_string()));
        }
        if batch > self.args.max_batch_size {
            return Err(EmberError::InvalidRequest(format!(
                "batch of {} exceeds max_batch_size {}",
                batch, self.args.max_batch_size
            )));
        }

        let past = match cache.as_deref() {
            Some(cache) => {
                if cache.num_layers() != self.layers.len() {
                    return Err(EmberError::InvalidRequest(format!(
                        "cache has {} layers but the model has {}",
                        cache.num_layers(),
                        self.layers.len()
                    )));
                }
                if cache.seq_len() != start_pos {
                    return Err(EmberError::InvalidRequest(format!(
                        "cache holds {} positions but start_pos is {}",
                        cache.seq_len(),
                        start_pos
                    )));
                }
                start_pos
            }
            None => 0,
        };

        let mut h = self.tok_embeddings.forward(tokens)?;
        let rotary = self.rope.slice(start_pos, seq_len)?;
        let mask = if seq_len > 1 {
            Some(causal_mask(seq_len, past, self.dtype, &self.device)?)
        } else {
            None
        };

        for layer in &self.layers {
            let layer_cache = match cache.as_deref_mut() {
                Some(cache) => Some(cache.layer_mut(layer.layer_idx())?),
                None => None,
            };
            h = layer.forward(&h, &rotary, mask.as_ref(), layer_cache)?;
        }

        let h = self.norm.forward(&h)?;
        let logits = linear(&h, &self.output)?;
        Ok(logits.to_dtype(DType::F32)?)
    }

    /// Get model configuration.
    pub fn args(&self) -> &ModelArgs {
        &self.args
    }

    /// Get device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Get the working dtype.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Get the number of blocks.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Parameter names the checkpoint did not provide.
    pub fn missing_weights(&self) -> &[String] {
        &self.missing_weights
    }
}

impl CausalLm for Transformer {
    fn forward(&self, tokens: &Tensor, start_pos: usize, cache: Option<&mut KvCache>) -> Result<Tensor> {
        Transformer::forward(self, tokens, start_pos, cache)
    }

    fn args(&self) -> &ModelArgs {
        &self.args
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transformer")
            .field("args", &self.args)
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .field("missing_weights", &self.missing_weights.len())
            .finish()
    }
}
