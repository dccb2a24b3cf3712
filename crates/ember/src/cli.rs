//! Command-line driver.

use crate::engine::Engine;
use anyhow::{Context, Result};
use candle_core::{DType, Device};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::info;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "ember", about = "Greedy text generation with LLaMA-style checkpoints")]
pub struct Cli {
    /// Checkpoint file or model directory; random weights when omitted.
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// Path to tokenizer.json.
    #[arg(long)]
    pub tokenizer: PathBuf,

    /// Model configuration JSON; defaults to params.json in the model directory.
    #[arg(long)]
    pub params: Option<PathBuf>,

    /// Override the configured maximum sequence length.
    #[arg(long)]
    pub max_seq_len: Option<usize>,

    /// Override the configured maximum batch size.
    #[arg(long)]
    pub max_batch_size: Option<usize>,

    /// Generated-token cap; defaults to max_gen_len from the model configuration.
    #[arg(long)]
    pub max_gen_len: Option<usize>,

    /// Decode incrementally with a KV cache.
    #[arg(long, default_value_t = false)]
    pub kv_cache: bool,

    /// Compute device.
    #[arg(long, value_enum, default_value = "cpu")]
    pub device: DeviceArg,

    /// Working dtype for weights and activations.
    #[arg(long, value_enum, default_value = "f32")]
    pub dtype: DTypeArg,

    /// Prompts to continue, one generation row each.
    #[arg(required = true)]
    pub prompts: Vec<String>,
}

/// Device selection.
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum DeviceArg {
    /// Host CPU.
    Cpu,
    /// First CUDA device (requires the `cuda` feature).
    Cuda,
}

impl DeviceArg {
    fn into_device(self) -> Result<Device> {
        match self {
            DeviceArg::Cpu => Ok(Device::Cpu),
            DeviceArg::Cuda => Device::new_cuda(0).context("opening CUDA device 0"),
        }
    }
}

/// Working dtype selection.
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum DTypeArg {
    /// 32-bit float.
    F32,
    /// IEEE half precision.
    F16,
    /// bfloat16 (CUDA only).
    Bf16,
}

impl From<DTypeArg> for DType {
    fn from(value: DTypeArg) -> DType {
        match value {
            DTypeArg::F32 => DType::F32,
            DTypeArg::F16 => DType::F16,
            DTypeArg::Bf16 => DType::BF16,
        }
    }
}

/// Initialize logging, build the engine and print one completion per prompt.
pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let mut builder = Engine::builder()
        .tokenizer(cli.tokenizer)
        .kv_cache(cli.kv_cache)
        .dtype(cli.dtype.into())
        .device(cli.device.into_device()?);
    if let Some(path) = cli.checkpoint {
        builder = builder.checkpoint(path);
    }
    if let Some(path) = cli.params {
        builder = builder.params(path);
    }
    if let Some(len) = cli.max_seq_len {
        builder = builder.max_seq_len(len);
    }
    if let Some(size) = cli.max_batch_size {
        builder = builder.max_batch_size(size);
    }
    if let Some(len) = cli.max_gen_len {
        builder = builder.max_gen_len(len);
    }

    let engine = builder.build()?;
    info!(prompts = cli.prompts.len(), "running generation");

    let completions = engine.generate(cli.prompts.as_slice())?;
    for (prompt, completion) in cli.prompts.iter().zip(&completions) {
        println!("{}{}", prompt, completion.text);
        println!("==================================");
    }

    Ok(())
}
