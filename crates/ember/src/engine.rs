//! High-level inference engine.
//!
//! Wires a tokenizer, a checkpoint and the model configuration into a
//! [`Transformer`], and exposes text-in, text-out greedy generation.

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use ember_core::generation::{GenerationConfig, Generator};
use ember_core::model::{Checkpoint, ModelArgs, Tokenizer, Transformer};
use ember_core::EmberError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// File name of a single-shard PyTorch checkpoint inside a model directory.
pub const CONSOLIDATED_CHECKPOINT: &str = "consolidated.00.pth";

/// File name of the model configuration inside a model directory.
pub const PARAMS_FILE: &str = "params.json";

/// Configuration for the inference engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Checkpoint file or model directory; `None` uses random weights.
    pub checkpoint: Option<PathBuf>,
    /// Path to tokenizer.json.
    pub tokenizer: PathBuf,
    /// Path to the model configuration JSON.
    pub params: Option<PathBuf>,
    /// Maximum sequence length override.
    pub max_seq_len: Option<usize>,
    /// Maximum batch size override.
    pub max_batch_size: Option<usize>,
    /// Cap on generated tokens per prompt; `None` uses the model's
    /// `max_gen_len`.
    pub max_gen_len: Option<usize>,
    /// Keep keys/values between decoding steps.
    pub use_kv_cache: bool,
    /// Working dtype.
    pub dtype: DType,
    /// Compute device.
    pub device: Device,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint: None,
            tokenizer: PathBuf::from("tokenizer.json"),
            params: None,
            max_seq_len: None,
            max_batch_size: None,
            max_gen_len: None,
            use_kv_cache: false,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }
}

/// Builder for creating an Engine.
pub struct EngineBuilder {
    config: EngineConfig,
    model_args: Option<ModelArgs>,
}

impl EngineBuilder {
    /// Create a new engine builder.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            model_args: None,
        }
    }

    /// Set checkpoint file or model directory.
    pub fn checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.checkpoint = Some(path.into());
        self
    }

    /// Set tokenizer path.
    pub fn tokenizer(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tokenizer = path.into();
        self
    }

    /// Set model configuration file.
    pub fn params(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.params = Some(path.into());
        self
    }

    /// Set model configuration directly.
    pub fn model_args(mut self, args: ModelArgs) -> Self {
        self.model_args = Some(args);
        self
    }

    /// Set maximum sequence length.
    pub fn max_seq_len(mut self, len: usize) -> Self {
        self.config.max_seq_len = Some(len);
        self
    }

    /// Set maximum batch size.
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.config.max_batch_size = Some(size);
        self
    }

    /// Set the generated-token cap.
    pub fn max_gen_len(mut self, len: usize) -> Self {
        self.config.max_gen_len = Some(len);
        self
    }

    /// Enable or disable the KV cache.
    pub fn kv_cache(mut self, enabled: bool) -> Self {
        self.config.use_kv_cache = enabled;
        self
    }

    /// Set working dtype.
    pub fn dtype(mut self, dtype: DType) -> Self {
        self.config.dtype = dtype;
        self
    }

    /// Set compute device.
    pub fn device(mut self, device: Device) -> Self {
        self.config.device = device;
        self
    }

    /// Build the engine.
    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        if config.dtype == DType::BF16 && config.device.is_cpu() {
            return Err(EmberError::Config(
                "bf16 is not supported on the CPU device; use f16 or f32".to_string(),
            )
            .into());
        }

        let tokenizer = Tokenizer::from_file(&config.tokenizer)
            .with_context(|| format!("loading tokenizer {}", config.tokenizer.display()))?;

        let mut args = match self.model_args {
            Some(args) => args,
            None => resolve_args(&config)?,
        };
        if let Some(len) = config.max_seq_len {
            args.max_seq_len = len;
        }
        if let Some(size) = config.max_batch_size {
            args.max_batch_size = size;
        }
        args.vocab_size = tokenizer.vocab_size();

        let checkpoint = match &config.checkpoint {
            Some(path) => load_checkpoint(path)?,
            None => {
                warn!("no checkpoint given; using random weights");
                Checkpoint::empty()
            }
        };

        let model = Transformer::load(args, &checkpoint, config.dtype, &config.device)
            .context("building transformer")?;
        info!(
            missing = model.missing_weights().len(),
            vocab = tokenizer.vocab_size(),
            "engine ready"
        );

        Ok(Engine {
            config,
            tokenizer,
            model,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Model configuration from an explicit file, `params.json` next to the
/// checkpoint, or defaults.
fn resolve_args(config: &EngineConfig) -> Result<ModelArgs> {
    let path = config.params.clone().or_else(|| {
        config
            .checkpoint
            .as_ref()
            .filter(|p| p.is_dir())
            .map(|dir| dir.join(PARAMS_FILE))
            .filter(|p| p.is_file())
    });

    match path {
        Some(path) => ModelArgs::from_file(&path)
            .with_context(|| format!("loading model config {}", path.display())),
        None => Ok(ModelArgs::default()),
    }
}

/// Load a checkpoint file, or a directory holding either
/// `consolidated.00.pth` or SafeTensors shards.
fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let checkpoint = if path.is_dir() {
        let consolidated = path.join(CONSOLIDATED_CHECKPOINT);
        if consolidated.is_file() {
            Checkpoint::from_file(&consolidated)
        } else {
            Checkpoint::from_dir(path)
        }
    } else {
        Checkpoint::from_file(path)
    };
    let checkpoint = checkpoint.with_context(|| format!("loading checkpoint {}", path.display()))?;
    info!(tensors = checkpoint.len(), path = %path.display(), "checkpoint read");
    Ok(checkpoint)
}

/// High-level inference engine.
pub struct Engine {
    config: EngineConfig,
    tokenizer: Tokenizer,
    model: Transformer,
    cancel: Arc<AtomicBool>,
}

impl Engine {
    /// Create a new engine builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Get engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get model reference.
    pub fn model(&self) -> &Transformer {
        &self.model
    }

    /// Get tokenizer reference.
    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Flag that aborts a running [`generate`](Self::generate) when set.
    ///
    /// The flag stays set until cleared by the caller.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Generate continuations for a batch of prompts.
    ///
    /// Each prompt is encoded with a leading BOS token.
    pub fn generate<S: AsRef<str>>(&self, prompts: &[S]) -> Result<Vec<Completion>> {
        let encoded = prompts
            .iter()
            .map(|p| self.tokenizer.encode(p.as_ref(), true, false))
            .collect::<ember_core::Result<Vec<_>>>()
            .context("encoding prompts")?;

        let generated = Generator::new(&self.model, self.generation_config())
            .with_cancellation(self.cancel.clone())
            .generate(&encoded)
            .context("generating")?;

        encoded
            .iter()
            .zip(generated)
            .map(|(prompt, tokens)| {
                let text = self.tokenizer.decode(&tokens).context("decoding output")?;
                Ok(Completion {
                    text,
                    num_prompt_tokens: prompt.len(),
                    tokens,
                })
            })
            .collect()
    }

    /// Decoding parameters used by [`generate`](Self::generate).
    ///
    /// The cap is the builder's `max_gen_len`, else the model's.
    pub fn generation_config(&self) -> GenerationConfig {
        let max_gen_len = self
            .config
            .max_gen_len
            .unwrap_or(self.model.args().max_gen_len);
        GenerationConfig::new(self.tokenizer.eos_id(), self.tokenizer.pad_id())
            .with_max_gen_len(max_gen_len)
            .with_kv_cache(self.config.use_kv_cache)
    }

    /// Clear a previously raised cancellation.
    pub fn reset_cancel(&self) {
        self.cancel.store(false, Ordering::Relaxed);
    }
}

/// Result of text generation for one prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Generated text.
    pub text: String,
    /// Generated token IDs.
    pub tokens: Vec<u32>,
    /// Number of prompt tokens, including BOS.
    pub num_prompt_tokens: usize,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("model", &self.model)
            .field("tokenizer", &self.tokenizer)
            .finish()
    }
}
