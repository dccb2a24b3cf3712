//! Batch token buffer.
//!
//! A `[batch, total_len]` grid of token ids. Each row starts with its prompt
//! and is padded to `total_len`; the generation loop fills one column per
//! step.

use crate::error::{EmberError, Result};
use candle_core::{Device, Tensor};

/// Token ids for a batch of rows, stored row-major.
#[derive(Debug, Clone)]
pub struct TokenBuffer {
    /// Row-major ids [batch * total_len].
    data: Vec<u32>,
    /// Number of rows.
    batch_size: usize,
    /// Number of columns.
    total_len: usize,
    /// Prompt length per row.
    prompt_lens: Vec<usize>,
}

impl TokenBuffer {
    /// Create a buffer of `total_len` columns filled with `pad_id`, with each
    /// prompt copied into its row prefix.
    pub fn new(prompts: &[Vec<u32>], total_len: usize, pad_id: u32) -> Result<Self> {
        let batch_size = prompts.len();
        let mut data = vec![pad_id; batch_size * total_len];

        for (row, prompt) in prompts.iter().enumerate() {
            if prompt.len() > total_len {
                return Err(EmberError::InvalidRequest(format!(
                    "prompt {} has {} tokens but the buffer holds {}",
                    row,
                    prompt.len(),
                    total_len
                )));
            }
            let start = row * total_len;
            data[start..start + prompt.len()].copy_from_slice(prompt);
        }

        Ok(Self {
            data,
            batch_size,
            total_len,
            prompt_lens: prompts.iter().map(Vec::len).collect(),
        })
    }

    /// Columns `start..end` of every row as a u32 tensor [batch, end - start].
    pub fn columns(&self, start: usize, end: usize, device: &Device) -> Result<Tensor> {
        if start >= end || end > self.total_len {
            return Err(EmberError::InvalidRequest(format!(
                "column range {}..{} invalid for buffer of {}",
                start, end, self.total_len
            )));
        }

        let width = end - start;
        let mut ids = Vec::with_capacity(self.batch_size * width);
        for row in 0..self.batch_size {
            ids.extend_from_slice(&self.row(row)[start..end]);
        }
        Ok(Tensor::from_vec(ids, (self.batch_size, width), device)?)
    }

    /// Token at `(row, pos)`.
    pub fn get(&self, row: usize, pos: usize) -> u32 {
        self.data[row * self.total_len + pos]
    }

    /// Overwrite the token at `(row, pos)`.
    pub fn set(&mut self, row: usize, pos: usize, token: u32) {
        self.data[row * self.total_len + pos] = token;
    }

    /// Full row.
    pub fn row(&self, row: usize) -> &[u32] {
        let start = row * self.total_len;
        &self.data[start..start + self.total_len]
    }

    /// Whether `pos` is still inside the prompt of `row`.
    pub fn in_prompt(&self, row: usize, pos: usize) -> bool {
        pos < self.prompt_lens[row]
    }

    /// Prompt length of `row`.
    pub fn prompt_len(&self, row: usize) -> usize {
        self.prompt_lens[row]
    }

    /// Shortest prompt in the batch.
    pub fn min_prompt_len(&self) -> usize {
        self.prompt_lens.iter().copied().min().unwrap_or(0)
    }

    /// Number of rows.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of columns.
    pub fn total_len(&self) -> usize {
        self.total_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_pads_rows() {
        let buffer = TokenBuffer::new(&[vec![1, 2, 3], vec![1, 2]], 5, 0).unwrap();

        assert_eq!(buffer.row(0), &[1, 2, 3, 0, 0]);
        assert_eq!(buffer.row(1), &[1, 2, 0, 0, 0]);
        assert_eq!(buffer.min_prompt_len(), 2);
        assert_eq!(buffer.batch_size(), 2);
        assert_eq!(buffer.total_len(), 5);
    }

    #[test]
    fn buffer_in_prompt_by_length() {
        // A prompt token equal to the pad id still counts as prompt
        let buffer = TokenBuffer::new(&[vec![1, 0, 4]], 6, 0).unwrap();

        assert!(buffer.in_prompt(0, 1));
        assert!(buffer.in_prompt(0, 2));
        assert!(!buffer.in_prompt(0, 3));
        assert_eq!(buffer.prompt_len(0), 3);
    }

    #[test]
    fn buffer_set_and_get() {
        let mut buffer = TokenBuffer::new(&[vec![7]], 3, 0).unwrap();
        buffer.set(0, 1, 42);
        assert_eq!(buffer.get(0, 1), 42);
        assert_eq!(buffer.row(0), &[7, 42, 0]);
    }

    #[test]
    fn buffer_columns_tensor() {
        let buffer = TokenBuffer::new(&[vec![1, 2, 3], vec![4, 5, 6]], 4, 0).unwrap();
        let cols = buffer.columns(1, 3, &Device::Cpu).unwrap();

        assert_eq!(cols.dims(), &[2, 2]);
        let vals: Vec<Vec<u32>> = cols.to_vec2().unwrap();
        assert_eq!(vals, vec![vec![2, 3], vec![5, 6]]);
    }

    #[test]
    fn buffer_rejects_bad_range() {
        let buffer = TokenBuffer::new(&[vec![1]], 4, 0).unwrap();
        assert!(buffer.columns(2, 2, &Device::Cpu).is_err());
        assert!(buffer.columns(0, 5, &Device::Cpu).is_err());
    }

    #[test]
    fn buffer_rejects_long_prompt() {
        let result = TokenBuffer::new(&[vec![1, 2, 3]], 2, 0);
        assert!(matches!(result, Err(EmberError::InvalidRequest(_))));
    }
}
