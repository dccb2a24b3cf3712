//! Greedy batched generation.
//!
//! Prompts of different lengths share one token buffer. Decoding starts at the
//! shortest prompt; rows whose prompt is longer keep their prompt tokens until
//! the loop moves past them. Each step picks the highest-scoring token of the
//! last position, and a row that emits the end-of-sequence token after its
//! prompt is finished for good.

use super::buffer::TokenBuffer;
use crate::error::{EmberError, Result};
use crate::model::ops::{argmax_last, last_position};
use crate::model::CausalLm;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Parameters for a generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationConfig {
    /// Cap on generated tokens per row; `None` means `max_seq_len - 1`.
    ///
    /// `Some(0)` is a real cap of zero and generates nothing. Caps beyond the
    /// room left by `max_seq_len` are clamped to it.
    pub max_gen_len: Option<usize>,
    /// End-of-sequence token.
    pub eos_id: u32,
    /// Token used to fill unwritten buffer positions.
    pub pad_id: u32,
    /// Feed only unseen columns and keep keys/values between steps.
    pub use_kv_cache: bool,
}

impl GenerationConfig {
    /// Create a config with the given special tokens.
    pub fn new(eos_id: u32, pad_id: u32) -> Self {
        Self {
            max_gen_len: None,
            eos_id,
            pad_id,
            use_kv_cache: false,
        }
    }

    /// Set the generated-token cap.
    pub fn with_max_gen_len(mut self, max_gen_len: usize) -> Self {
        self.max_gen_len = Some(max_gen_len);
        self
    }

    /// Enable or disable the KV cache.
    pub fn with_kv_cache(mut self, use_kv_cache: bool) -> Self {
        self.use_kv_cache = use_kv_cache;
        self
    }
}

/// Per-row progress through the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    /// The loop has not yet passed the end of the prompt.
    InPrompt,
    /// Producing tokens.
    Generating,
    /// Emitted end-of-sequence; never leaves this state.
    Finished,
}

impl SequenceState {
    /// State after writing one column.
    ///
    /// # Arguments
    ///
    /// * `in_prompt` - The column lies inside this row's prompt
    /// * `is_eos` - The model's token for this column is end-of-sequence
    pub fn step(self, in_prompt: bool, is_eos: bool) -> Self {
        match self {
            SequenceState::Finished => SequenceState::Finished,
            _ if in_prompt => SequenceState::InPrompt,
            _ if is_eos => SequenceState::Finished,
            _ => SequenceState::Generating,
        }
    }

    /// Check if the row is done.
    pub fn is_finished(self) -> bool {
        self == SequenceState::Finished
    }
}

/// Greedy decoder over a [`CausalLm`].
pub struct Generator<'a, M: CausalLm> {
    model: &'a M,
    config: GenerationConfig,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a, M: CausalLm> Generator<'a, M> {
    /// Create a generator borrowing `model`.
    pub fn new(model: &'a M, config: GenerationConfig) -> Self {
        Self {
            model,
            config,
            cancel: None,
        }
    }

    /// Stop with [`EmberError::Cancelled`] once `flag` is set.
    ///
    /// The flag is checked before every decoding step.
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Get the generation config.
    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Generate continuations for a batch of prompts.
    ///
    /// # Returns
    ///
    /// One vector per prompt holding at most `max_gen_len` generated tokens,
    /// cut before the first end-of-sequence token. Prompt tokens are not
    /// included.
    pub fn generate(&self, prompts: &[Vec<u32>]) -> Result<Vec<Vec<u32>>> {
        self.validate(prompts)?;
        let started = Instant::now();

        let args = self.model.args();
        let device = self.model.device();
        let max_gen_len = self
            .config
            .max_gen_len
            .unwrap_or(args.max_seq_len.saturating_sub(1));
        let max_prompt_len = prompts.iter().map(Vec::len).max().unwrap_or(0);
        let total_len = args.max_seq_len.min(max_gen_len.saturating_add(max_prompt_len));

        let mut buffer = TokenBuffer::new(prompts, total_len, self.config.pad_id)?;
        let mut states = vec![SequenceState::InPrompt; prompts.len()];
        let mut cache = self.config.use_kv_cache.then(|| self.model.new_cache());

        debug!(
            batch = prompts.len(),
            min_prompt_len = buffer.min_prompt_len(),
            total_len,
            kv_cache = self.config.use_kv_cache,
            "starting generation"
        );

        let mut prev_pos = 0;
        let mut steps = 0usize;
        for cur_pos in buffer.min_prompt_len()..total_len {
            if self.is_cancelled() {
                info!(cur_pos, "generation cancelled");
                return Err(EmberError::Cancelled);
            }

            let logits = match cache.as_mut() {
                Some(cache) => {
                    let input = buffer.columns(prev_pos, cur_pos, device)?;
                    self.model.forward(&input, prev_pos, Some(cache))?
                }
                None => {
                    let input = buffer.columns(0, cur_pos, device)?;
                    self.model.forward(&input, 0, None)?
                }
            };
            let next_tokens = argmax_last(&last_position(&logits)?)?;

            for (row, state) in states.iter_mut().enumerate() {
                let in_prompt = buffer.in_prompt(row, cur_pos);
                if !in_prompt {
                    buffer.set(row, cur_pos, next_tokens[row]);
                }
                *state = state.step(in_prompt, next_tokens[row] == self.config.eos_id);
            }

            prev_pos = cur_pos;
            steps += 1;

            if states.iter().all(|s| s.is_finished()) {
                debug!(cur_pos, "all rows finished");
                break;
            }
        }

        let outputs: Vec<Vec<u32>> = (0..buffer.batch_size())
            .map(|row| {
                let start = buffer.prompt_len(row);
                let end = start.saturating_add(max_gen_len).min(total_len);
                let generated = &buffer.row(row)[start..end];
                match generated.iter().position(|&t| t == self.config.eos_id) {
                    Some(eos) => generated[..eos].to_vec(),
                    None => generated.to_vec(),
                }
            })
            .collect();

        info!(
            batch = prompts.len(),
            steps,
            generated = outputs.iter().map(Vec::len).sum::<usize>(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generation finished"
        );

        Ok(outputs)
    }

    fn validate(&self, prompts: &[Vec<u32>]) -> Result<()> {
        let args = self.model.args();

        if prompts.is_empty() {
            return Err(EmberError::InvalidRequest("no prompts given".to_string()));
        }
        if prompts.len() > args.max_batch_size {
            return Err(EmberError::InvalidRequest(format!(
                "batch of {} exceeds max_batch_size {}",
                prompts.len(),
                args.max_batch_size
            )));
        }
        for (row, prompt) in prompts.iter().enumerate() {
            if prompt.is_empty() {
                return Err(EmberError::InvalidRequest(format!("prompt {row} is empty")));
            }
            if prompt.len() > args.max_seq_len {
                return Err(EmberError::InvalidRequest(format!(
                    "prompt {} has {} tokens, max_seq_len is {}",
                    row,
                    prompt.len(),
                    args.max_seq_len
                )));
            }
        }

        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::model::{KvCache, ModelArgs};
    use candle_core::{Device, Tensor};
    use proptest::prelude::*;

    const EOS: u32 = 2;

    /// Next token is a fixed function of the current token.
    struct TableLm {
        args: ModelArgs,
        device: Device,
        table: Vec<u32>,
    }

    impl CausalLm for TableLm {
        fn forward(
            &self,
            tokens: &Tensor,
            _start_pos: usize,
            _cache: Option<&mut KvCache>,
        ) -> Result<Tensor> {
            let rows: Vec<Vec<u32>> = tokens.to_vec2()?;
            let (batch, seq_len) = tokens.dims2()?;
            let vocab = self.args.vocab_size;

            let mut logits = vec![0.0f32; batch * seq_len * vocab];
            for (b, row) in rows.iter().enumerate() {
                for (j, &tok) in row.iter().enumerate() {
                    let target = self.table[tok as usize] as usize;
                    logits[(b * seq_len + j) * vocab + target] = 1.0;
                }
            }
            Ok(Tensor::from_vec(logits, (batch, seq_len, vocab), &self.device)?)
        }

        fn args(&self) -> &ModelArgs {
            &self.args
        }

        fn device(&self) -> &Device {
            &self.device
        }
    }

    proptest! {
        /// Invariant: outputs respect the cap and never contain eos.
        #[test]
        fn invariant_output_bounded_and_eos_free(
            table in prop::collection::vec(0u32..96, 96),
            prompts in prop::collection::vec(prop::collection::vec(0u32..96, 1..8), 1..4),
            max_gen in 0usize..12,
            use_cache in any::<bool>(),
        ) {
            let model = TableLm {
                args: ModelArgs::tiny(),
                device: Device::Cpu,
                table,
            };
            let config = GenerationConfig::new(EOS, 0)
                .with_max_gen_len(max_gen)
                .with_kv_cache(use_cache);

            let out = Generator::new(&model, config).generate(&prompts).unwrap();

            prop_assert_eq!(out.len(), prompts.len());
            for row in &out {
                prop_assert!(row.len() <= max_gen);
                prop_assert!(!row.contains(&EOS));
            }
        }
    }
}
