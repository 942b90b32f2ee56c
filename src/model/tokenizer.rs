//! Byte-level tokenizer shared by the built-in models.
//!
//! Token ids are ASCII code points. Id 0 (NUL never appears in text) doubles
//! as beginning-of-sequence, end-of-sequence and padding; bytes outside ASCII
//! are encoded as `?`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const VOCAB_SIZE: usize = 128;
pub const EOS_TOKEN_ID: u32 = 0;

const UNKNOWN_BYTE: u8 = b'?';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokenizer {
    pub vocab_size: usize,
    pub eos_token_id: u32,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self {
            vocab_size: VOCAB_SIZE,
            eos_token_id: EOS_TOKEN_ID,
        }
    }
}

impl Tokenizer {
    pub fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes()
            .map(|b| {
                if b == 0 || usize::from(b) >= self.vocab_size {
                    u32::from(UNKNOWN_BYTE)
                } else {
                    u32::from(b)
                }
            })
            .collect()
    }

    /// Decode ids, dropping special tokens.
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter(|&&id| id != self.eos_token_id)
            .filter_map(|&id| u8::try_from(id).ok())
            .map(char::from)
            .collect()
    }

    /// Encode a completion and terminate it with EOS.
    pub fn encode_completion(&self, text: &str) -> Vec<u32> {
        let mut ids = self.encode(text);
        ids.push(self.eos_token_id);
        ids
    }

    pub fn save_pretrained(&self, dir: &Path) -> Result<()> {
        let path = dir.join("tokenizer_config.json");
        std::fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

/// Keep the last `max` ids (prompts lose their beginning).
pub fn truncate_left(ids: &mut Vec<u32>, max: Option<usize>) {
    if let Some(max) = max {
        if ids.len() > max {
            ids.drain(..ids.len() - max);
        }
    }
}

/// Keep the first `max` ids (completions lose their end).
pub fn truncate_right(ids: &mut Vec<u32>, max: Option<usize>) {
    if let Some(max) = max {
        ids.truncate(max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_ascii() {
        let tok = Tokenizer::default();
        let ids = tok.encode("Flat is better");
        assert_eq!(ids.len(), 14);
        assert_eq!(tok.decode(&ids), "Flat is better");
    }

    #[test]
    fn test_non_ascii_becomes_placeholder() {
        let tok = Tokenizer::default();
        let ids = tok.encode("é");
        assert!(ids.iter().all(|&id| id == u32::from(b'?')));
        assert!(!ids.contains(&EOS_TOKEN_ID));
    }

    #[test]
    fn test_completion_ends_with_eos() {
        let tok = Tokenizer::default();
        let ids = tok.encode_completion("ok");
        assert_eq!(ids.last(), Some(&EOS_TOKEN_ID));
        assert_eq!(tok.decode(&ids), "ok");
    }

    #[test]
    fn test_truncation_directions() {
        let mut prompt = vec![1, 2, 3, 4];
        truncate_left(&mut prompt, Some(2));
        assert_eq!(prompt, vec![3, 4]);

        let mut completion = vec![1, 2, 3, 4];
        truncate_right(&mut completion, Some(3));
        assert_eq!(completion, vec![1, 2, 3]);

        let mut untouched = vec![1, 2];
        truncate_left(&mut untouched, None);
        assert_eq!(untouched, vec![1, 2]);
    }
}
