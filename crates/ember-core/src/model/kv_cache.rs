//! KV cache for incremental decoding.
//!
//! Stores rotated keys and values per layer so a decode step only projects the
//! newest tokens. The history is bounded by the model's `max_seq_len`.

use crate::error::{EmberError, Result};
use candle_core::Tensor;

/// KV cache for a single layer.
#[derive(Debug, Clone)]
pub struct LayerCache {
    /// Cached keys: [batch, num_kv_heads, seq_len, head_dim]
    key: Option<Tensor>,
    /// Cached values: [batch, num_kv_heads, seq_len, head_dim]
    value: Option<Tensor>,
    /// Maximum number of positions this cache may hold.
    capacity: usize,
}

impl LayerCache {
    /// Create a new empty layer cache.
    pub fn new(capacity: usize) -> Self {
        Self {
            key: None,
            value: None,
            capacity,
        }
    }

    /// Get the current sequence length in cache.
    pub fn seq_len(&self) -> usize {
        self.key.as_ref().map(|k| k.dims()[2]).unwrap_or(0)
    }

    /// Append new KV to cache and return concatenated KV.
    ///
    /// Returns (key, value) tensors that include all cached + new tokens.
    pub fn append(&mut self, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor)> {
        let new_len = self.seq_len() + key.dims()[2];
        if new_len > self.capacity {
            return Err(EmberError::ShapeMismatch(format!(
                "kv cache holds at most {} positions, got {}",
                self.capacity, new_len
            )));
        }

        let (new_key, new_value) =
            if let (Some(cached_k), Some(cached_v)) = (&self.key, &self.value) {
                // Concatenate along sequence dimension (dim 2)
                let k = Tensor::cat(&[cached_k, key], 2)?;
                let v = Tensor::cat(&[cached_v, value], 2)?;
                (k, v)
            } else {
                (key.clone(), value.clone())
            };

        self.key = Some(new_key.clone());
        self.value = Some(new_value.clone());

        Ok((new_key, new_value))
    }
}

/// Full KV cache for all layers.
#[derive(Debug)]
pub struct KvCache {
    /// Per-layer caches.
    layers: Vec<LayerCache>,
}

impl KvCache {
    /// Create a new KV cache for the given number of layers.
    pub fn new(num_layers: usize, capacity: usize) -> Self {
        let layers = (0..num_layers).map(|_| LayerCache::new(capacity)).collect();
        Self { layers }
    }

    /// Get mutable reference to layer cache.
    pub fn layer_mut(&mut self, layer_idx: usize) -> Result<&mut LayerCache> {
        let num_layers = self.layers.len();
        self.layers.get_mut(layer_idx).ok_or_else(|| {
            EmberError::ShapeMismatch(format!(
                "layer {layer_idx} out of range for cache with {num_layers} layers"
            ))
        })
    }

    /// Get the current sequence length (from first layer).
    pub fn seq_len(&self) -> usize {
        self.layers.first().map(|l| l.seq_len()).unwrap_or(0)
    }

    /// Get number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}
