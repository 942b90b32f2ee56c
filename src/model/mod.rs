//! Model seams and the built-in tiny backend.
//!
//! Trainers only talk to [`CausalLm`] and [`RewardModel`]:
//! - [`tiny::TinyLm`] -- bigram causal LM, fully trainable.
//! - [`lora::PeftModel`] -- low-rank adapter over a frozen `TinyLm`.
//! - [`reward::TinyRewardModel`] -- sequence scorer for GRPO.

pub mod lora;
pub mod reward;
pub mod tiny;
pub mod tokenizer;

use std::path::Path;

use anyhow::Result;
use rand::rngs::StdRng;

pub use lora::{LoraConfig, PeftModel};
pub use reward::TinyRewardModel;
pub use tiny::{TinyLm, TinyLmConfig};
pub use tokenizer::Tokenizer;

/// Per-token scores of a completion given a prompt.
#[derive(Debug, Clone, Default)]
pub struct Forward {
    /// `log p(completion[t] | context)` for every completion token.
    pub log_probs: Vec<f64>,
    /// Whether the most likely token at each position was the actual one.
    pub greedy: Vec<bool>,
}

impl Forward {
    pub fn sum(&self) -> f64 {
        self.log_probs.iter().sum()
    }

    pub fn len(&self) -> usize {
        self.log_probs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log_probs.is_empty()
    }

    pub fn greedy_hits(&self) -> usize {
        self.greedy.iter().filter(|hit| **hit).count()
    }
}

/// A trainable autoregressive language model.
pub trait CausalLm {
    fn tokenizer(&self) -> Tokenizer;

    /// Score `completion` after `prompt`. Completion ids should already carry
    /// their EOS when it is part of the target.
    fn forward(&self, prompt: &[u32], completion: &[u32]) -> Forward;

    /// Add `sum_t coefs[t] * d log p_t / d theta` into `grads`, which is laid
    /// out like [`CausalLm::parameters`].
    fn backward(&self, prompt: &[u32], completion: &[u32], coefs: &[f64], grads: &mut [f32]);

    /// Sample up to `max_new_tokens`, stopping after EOS.
    fn generate(&self, prompt: &[u32], max_new_tokens: usize, temperature: f64, rng: &mut StdRng) -> Vec<u32>;

    /// Trainable parameters.
    fn parameters(&self) -> &[f32];

    fn parameters_mut(&mut self) -> &mut [f32];

    fn save_pretrained(&self, dir: &Path) -> Result<()>;
}

/// Scores whole sequences; higher is better.
pub trait RewardModel {
    fn tokenizer(&self) -> Tokenizer;

    fn score(&self, ids: &[u32]) -> f64;
}
