//! Tiny sequence-classification reward model.
//!
//! The score of a sequence is a bias plus the mean of a learned per-token
//! weight, which is enough to rank sampled completions deterministically.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::tokenizer::Tokenizer;
use super::RewardModel;

pub const ARCHITECTURE: &str = "TinyBagOfTokensForSequenceClassification";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardModelConfig {
    pub architectures: Vec<String>,
    pub vocab_size: usize,
    pub num_labels: usize,
    #[serde(default)]
    pub name_or_path: String,
}

impl Default for RewardModelConfig {
    fn default() -> Self {
        Self {
            architectures: vec![ARCHITECTURE.to_string()],
            vocab_size: Tokenizer::default().vocab_size,
            num_labels: 1,
            name_or_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Head {
    token_weights: Vec<f32>,
    bias: f32,
}

#[derive(Debug, Clone)]
pub struct TinyRewardModel {
    config: RewardModelConfig,
    head: Head,
}

impl TinyRewardModel {
    pub fn new(config: RewardModelConfig, rng: &mut StdRng) -> Self {
        let token_weights = (0..config.vocab_size).map(|_| rng.gen_range(-1.0..=1.0)).collect();
        Self {
            config,
            head: Head {
                token_weights,
                bias: 0.0,
            },
        }
    }

    pub fn from_pretrained(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.json");
        let config: RewardModelConfig = serde_json::from_str(
            &std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?,
        )
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
        if !config.architectures.iter().any(|a| a == ARCHITECTURE) {
            bail!("{} does not describe a reward model", config_path.display());
        }
        let head_path = dir.join("model.json");
        let head: Head = serde_json::from_str(
            &std::fs::read_to_string(&head_path)
                .with_context(|| format!("failed to read {}", head_path.display()))?,
        )
        .with_context(|| format!("failed to parse {}", head_path.display()))?;
        if head.token_weights.len() != config.vocab_size {
            bail!("{} does not match the configured vocabulary", head_path.display());
        }
        Ok(Self { config, head })
    }

    pub fn save_pretrained(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join("config.json"), serde_json::to_string_pretty(&self.config)?)?;
        std::fs::write(dir.join("model.json"), serde_json::to_string(&self.head)?)?;
        Ok(())
    }
}

impl RewardModel for TinyRewardModel {
    fn tokenizer(&self) -> Tokenizer {
        Tokenizer {
            vocab_size: self.config.vocab_size,
            ..Tokenizer::default()
        }
    }

    fn score(&self, ids: &[u32]) -> f64 {
        let (sum, n) = ids
            .iter()
            .filter_map(|&id| self.head.token_weights.get(id as usize))
            .fold((0.0f64, 0usize), |(s, n), &w| (s + w as f64, n + 1));
        let mean = if n > 0 { sum / n as f64 } else { 0.0 };
        self.head.bias as f64 + mean
    }
}
