//! Tokenizer integration for text-to-token and token-to-text conversion.
//!
//! Wraps the HuggingFace tokenizers library. The vocabulary must define `<s>`
//! and `</s>`; the pad id falls back to `<unk>` and then to 0 when `<pad>` is
//! absent.

use crate::error::{EmberError, Result};
use std::path::Path;
use tokenizers::Tokenizer as HfTokenizer;

/// Tokenizer for encoding text to tokens and decoding tokens to text.
#[derive(Clone)]
pub struct Tokenizer {
    /// Underlying HuggingFace tokenizer.
    inner: HfTokenizer,
    /// BOS token ID.
    bos_id: u32,
    /// EOS token ID.
    eos_id: u32,
    /// PAD token ID.
    pad_id: u32,
}

impl Tokenizer {
    /// Load a tokenizer from a tokenizer.json file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let inner = HfTokenizer::from_file(path).map_err(|e| {
            EmberError::Tokenizer(format!("failed to load {}: {}", path.display(), e))
        })?;
        Self::from_inner(inner)
    }

    /// Load a tokenizer from a model directory.
    ///
    /// Looks for tokenizer.json in the directory.
    pub fn from_dir<P: AsRef<Path>>(model_dir: P) -> Result<Self> {
        let tokenizer_path = model_dir.as_ref().join("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(EmberError::Tokenizer(format!(
                "tokenizer.json not found in {}",
                model_dir.as_ref().display()
            )));
        }
        Self::from_file(tokenizer_path)
    }

    fn from_inner(inner: HfTokenizer) -> Result<Self> {
        let bos_id = inner
            .token_to_id("<s>")
            .ok_or_else(|| EmberError::Tokenizer("vocabulary has no <s> token".to_string()))?;
        let eos_id = inner
            .token_to_id("</s>")
            .ok_or_else(|| EmberError::Tokenizer("vocabulary has no </s> token".to_string()))?;
        let pad_id = inner
            .token_to_id("<pad>")
            .or_else(|| inner.token_to_id("<unk>"))
            .unwrap_or(0);

        Ok(Self {
            inner,
            bos_id,
            eos_id,
            pad_id,
        })
    }

    /// Encode text to token IDs.
    ///
    /// # Arguments
    ///
    /// * `text` - Text to encode
    /// * `bos` - Whether to prepend the BOS token
    /// * `eos` - Whether to append the EOS token
    pub fn encode(&self, text: &str, bos: bool, eos: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| EmberError::Tokenizer(format!("failed to encode text: {}", e)))?;

        let mut ids = Vec::with_capacity(encoding.len() + 2);
        if bos {
            ids.push(self.bos_id);
        }
        ids.extend_from_slice(encoding.get_ids());
        if eos {
            ids.push(self.eos_id);
        }

        Ok(ids)
    }

    /// Decode token IDs to text, dropping special tokens.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| EmberError::Tokenizer(format!("failed to decode tokens: {}", e)))
    }

    /// Get vocabulary size.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Get BOS token ID.
    pub fn bos_id(&self) -> u32 {
        self.bos_id
    }

    /// Get EOS token ID.
    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    /// Get PAD token ID.
    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("bos_id", &self.bos_id)
            .field("eos_id", &self.eos_id)
            .field("pad_id", &self.pad_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    /// Word-level tokenizer.json over a handful of words.
    fn word_level_json(vocab: &[&str]) -> String {
        let entries: Vec<String> = vocab
            .iter()
            .enumerate()
            .map(|(id, tok)| format!("\"{tok}\": {id}"))
            .collect();
        format!(
            r#"{{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": {{ "type": "Whitespace" }},
  "post_processor": null,
  "decoder": null,
  "model": {{
    "type": "WordLevel",
    "vocab": {{ {} }},
    "unk_token": "<unk>"
  }}
}}"#,
            entries.join(", ")
        )
    }

    fn write_tokenizer(name: &str, vocab: &[&str]) -> PathBuf {
        let dir = std::env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tokenizer.json");
        fs::write(&path, word_level_json(vocab)).unwrap();
        path
    }

    #[test]
    fn tokenizer_special_ids() {
        let path = write_tokenizer("ember_tok_special", &["<unk>", "<s>", "</s>", "hello"]);
        let tokenizer = Tokenizer::from_file(&path).unwrap();

        assert_eq!(tokenizer.bos_id(), 1);
        assert_eq!(tokenizer.eos_id(), 2);
        // No <pad>: falls back to <unk>
        assert_eq!(tokenizer.pad_id(), 0);
        assert_eq!(tokenizer.vocab_size(), 4);
    }

    #[test]
    fn tokenizer_prefers_pad_token() {
        let path = write_tokenizer("ember_tok_pad", &["<unk>", "<s>", "</s>", "<pad>"]);
        let tokenizer = Tokenizer::from_file(&path).unwrap();
        assert_eq!(tokenizer.pad_id(), 3);
    }

    #[test]
    fn tokenizer_encode_bos_eos() {
        let path = write_tokenizer(
            "ember_tok_encode",
            &["<unk>", "<s>", "</s>", "hello", "world"],
        );
        let tokenizer = Tokenizer::from_dir(path.parent().unwrap()).unwrap();

        assert_eq!(tokenizer.encode("hello world", false, false).unwrap(), vec![3, 4]);
        assert_eq!(tokenizer.encode("hello world", true, false).unwrap(), vec![1, 3, 4]);
        assert_eq!(tokenizer.encode("hello", true, true).unwrap(), vec![1, 3, 2]);
        // Out-of-vocabulary words map to <unk>
        assert_eq!(tokenizer.encode("goodbye", false, false).unwrap(), vec![0]);
    }

    #[test]
    fn tokenizer_decode() {
        let path = write_tokenizer(
            "ember_tok_decode",
            &["<unk>", "<s>", "</s>", "hello", "world"],
        );
        let tokenizer = Tokenizer::from_file(&path).unwrap();

        let decoded = tokenizer.decode(&[3, 4]).unwrap();
        assert!(decoded.contains("hello"));
        assert!(decoded.contains("world"));
    }

    #[test]
    fn tokenizer_requires_bos_and_eos() {
        let path = write_tokenizer("ember_tok_nobos", &["<unk>", "hello"]);
        let result = Tokenizer::from_file(&path);
        assert!(matches!(result, Err(EmberError::Tokenizer(_))));
    }

    #[test]
    fn tokenizer_missing_file() {
        let result = Tokenizer::from_dir("/nonexistent/model");
        assert!(matches!(result, Err(EmberError::Tokenizer(_))));
    }
}
