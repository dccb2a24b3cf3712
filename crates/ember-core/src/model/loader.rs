//! Checkpoint loading.
//!
//! A [`Checkpoint`] is a name -> tensor map read from SafeTensors files or a
//! PyTorch `.pth` pickle. Layers pull their parameters through a
//! [`ParamLoader`], which resolves names non-strictly: a tensor missing from
//! the checkpoint keeps its initialized default, while a tensor that is present
//! with the wrong shape is an error.
//!
//! # Example
//!
//! ```ignore
//! use ember_core::model::{Checkpoint, ParamLoader, WeightInit};
//!
//! let checkpoint = Checkpoint::from_file(Path::new("consolidated.00.pth"))?;
//! let mut loader = ParamLoader::new(&checkpoint, DType::F16, &device);
//! let norm = loader.get("norm.weight", &[4096], WeightInit::Ones)?;
//! ```

use crate::error::{EmberError, Result};
use candle_core::safetensors::Load;
use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Standard deviation used for matrices the checkpoint does not provide.
pub const DEFAULT_INIT_STD: f64 = 0.02;

/// Serialized weights indexed by name, held on the CPU.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    tensors: HashMap<String, Tensor>,
}

impl Checkpoint {
    /// A checkpoint with no tensors; every parameter takes its default.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wrap tensors that are already in memory.
    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    /// Load all `.safetensors` files in a directory.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut safetensor_files: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "safetensors") {
                safetensor_files.push(path);
            }
        }

        // Sort for deterministic loading order
        safetensor_files.sort();

        if safetensor_files.is_empty() {
            return Err(EmberError::Model(format!(
                "no .safetensors files found in {}",
                dir.display()
            )));
        }

        let mut tensors = HashMap::new();
        for path in &safetensor_files {
            tensors.extend(Self::load_safetensors_file(path)?);
        }

        Ok(Self { tensors })
    }

    /// Load a single checkpoint file.
    ///
    /// `.safetensors` files are read directly; `.pth` / `.pt` / `.bin` files
    /// are read as PyTorch pickles.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(EmberError::Model(format!(
                "checkpoint not found: {}",
                path.display()
            )));
        }

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let tensors = match extension {
            "safetensors" => Self::load_safetensors_file(path)?,
            "pth" | "pt" | "bin" => Self::load_pickle_file(path)?,
            other => {
                return Err(EmberError::Model(format!(
                    "unsupported checkpoint extension {:?} for {}",
                    other,
                    path.display()
                )));
            }
        };

        Ok(Self { tensors })
    }

    /// Load tensors from a single safetensors file.
    fn load_safetensors_file(path: &Path) -> Result<HashMap<String, Tensor>> {
        let data = fs::read(path)?;
        let safetensors = SafeTensors::deserialize(&data).map_err(|e| {
            EmberError::Model(format!("failed to deserialize {}: {}", path.display(), e))
        })?;

        let mut tensors = HashMap::new();
        for (name, view) in safetensors.tensors() {
            let tensor = view.load(&Device::Cpu)?;
            tensors.insert(name, tensor);
        }

        Ok(tensors)
    }

    /// Load tensors from a PyTorch pickle.
    fn load_pickle_file(path: &Path) -> Result<HashMap<String, Tensor>> {
        let tensors = candle_core::pickle::read_all(path).map_err(|e| {
            EmberError::Model(format!("failed to read {}: {}", path.display(), e))
        })?;
        Ok(tensors.into_iter().collect())
    }

    /// Get a tensor by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Check if a tensor exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Get all tensor names.
    pub fn tensor_names(&self) -> Vec<&str> {
        self.tensors.keys().map(|s| s.as_str()).collect()
    }

    /// Get the number of loaded tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Check if no tensors are loaded.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// Initial value for a parameter the checkpoint does not provide.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WeightInit {
    /// All ones (norm scales).
    Ones,
    /// Gaussian with zero mean.
    Normal {
        /// Standard deviation.
        std: f64,
    },
}

impl WeightInit {
    /// Gaussian init with [`DEFAULT_INIT_STD`].
    pub fn normal() -> Self {
        Self::Normal {
            std: DEFAULT_INIT_STD,
        }
    }
}

/// Outcome of a non-strict load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Parameters that kept their initialized default.
    pub missing: Vec<String>,
    /// Checkpoint tensors no parameter asked for.
    pub unexpected: Vec<String>,
}

/// Resolves named parameters against a checkpoint.
///
/// Every tensor handed out is cast to the working dtype and placed on the
/// compute device.
#[derive(Debug)]
pub struct ParamLoader<'a> {
    checkpoint: &'a Checkpoint,
    dtype: DType,
    device: Device,
    missing: Vec<String>,
    used: HashSet<String>,
}

impl<'a> ParamLoader<'a> {
    /// Create a loader targeting `dtype` on `device`.
    pub fn new(checkpoint: &'a Checkpoint, dtype: DType, device: &Device) -> Self {
        Self {
            checkpoint,
            dtype,
            device: device.clone(),
            missing: Vec::new(),
            used: HashSet::new(),
        }
    }

    /// Fetch `name` with the expected `shape`, or initialize it.
    pub fn get(&mut self, name: &str, shape: &[usize], init: WeightInit) -> Result<Tensor> {
        match self.checkpoint.get(name) {
            Some(tensor) => {
                if tensor.dims() != shape {
                    return Err(EmberError::ShapeMismatch(format!(
                        "{}: expected {:?}, got {:?}",
                        name,
                        shape,
                        tensor.dims()
                    )));
                }
                self.used.insert(name.to_string());
                Ok(tensor.to_dtype(self.dtype)?.to_device(&self.device)?)
            }
            None => {
                self.missing.push(name.to_string());
                self.init(shape, init)
            }
        }
    }

    fn init(&self, shape: &[usize], init: WeightInit) -> Result<Tensor> {
        let tensor = match init {
            WeightInit::Ones => Tensor::ones(shape, self.dtype, &self.device)?,
            WeightInit::Normal { std } => {
                Tensor::randn(0.0f32, std as f32, shape, &self.device)?.to_dtype(self.dtype)?
            }
        };
        Ok(tensor)
    }

    /// Working dtype.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Compute device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Summarize which names were missing or left unused.
    pub fn finish(self) -> LoadReport {
        let mut unexpected: Vec<String> = self
            .checkpoint
            .tensor_names()
            .into_iter()
            .filter(|name| !self.used.contains(*name))
            .map(str::to_string)
            .collect();
        unexpected.sort();

        LoadReport {
            missing: self.missing,
            unexpected,
        }
    }
}
