//! Tiny bigram causal language model.
//!
//! The whole model is one `vocab x vocab` logits table: row `prev` holds the
//! next-token logits after token `prev`. It is small enough to train on a CPU
//! in milliseconds and still exposes everything the trainers need (per-token
//! log-probabilities, gradients, sampling).

use std::path::Path;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::tokenizer::Tokenizer;
use super::{CausalLm, Forward};

pub const ARCHITECTURE: &str = "TinyBigramForCausalLM";

/// Contents of `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TinyLmConfig {
    pub architectures: Vec<String>,
    pub model_type: String,
    pub vocab_size: usize,
    pub eos_token_id: u32,
    pub initializer_range: f64,
    /// Identifier the weights were first initialised from.
    #[serde(default)]
    pub name_or_path: String,
}

impl Default for TinyLmConfig {
    fn default() -> Self {
        let tokenizer = Tokenizer::default();
        Self {
            architectures: vec![ARCHITECTURE.to_string()],
            model_type: "tiny_bigram".to_string(),
            vocab_size: tokenizer.vocab_size,
            eos_token_id: tokenizer.eos_token_id,
            initializer_range: 0.02,
            name_or_path: String::new(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Weights {
    weights: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct TinyLm {
    config: TinyLmConfig,
    weights: Vec<f32>,
}

impl TinyLm {
    /// Randomly initialise with a zero-mean uniform distribution whose
    /// standard deviation is `initializer_range`.
    pub fn new(config: TinyLmConfig, rng: &mut StdRng) -> Self {
        let bound = (config.initializer_range * 3f64.sqrt()) as f32;
        let n = config.vocab_size * config.vocab_size;
        let weights = (0..n).map(|_| rng.gen_range(-bound..=bound)).collect();
        Self { config, weights }
    }

    pub fn from_pretrained(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.json");
        let config: TinyLmConfig = serde_json::from_str(
            &std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?,
        )
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
        if !config.architectures.iter().any(|a| a == ARCHITECTURE) {
            bail!(
                "{} describes {:?}, not a {ARCHITECTURE}",
                config_path.display(),
                config.architectures
            );
        }

        let weights_path = dir.join("model.json");
        let Weights { weights } = serde_json::from_str(
            &std::fs::read_to_string(&weights_path)
                .with_context(|| format!("failed to read {}", weights_path.display()))?,
        )
        .with_context(|| format!("failed to parse {}", weights_path.display()))?;
        if weights.len() != config.vocab_size * config.vocab_size {
            bail!(
                "{} holds {} weights, expected {}",
                weights_path.display(),
                weights.len(),
                config.vocab_size * config.vocab_size
            );
        }
        Ok(Self { config, weights })
    }

    pub fn config(&self) -> &TinyLmConfig {
        &self.config
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    pub(crate) fn row(&self, prev: u32) -> &[f32] {
        let v = self.config.vocab_size;
        let start = prev as usize * v;
        &self.weights[start..start + v]
    }

    pub(crate) fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }
}

impl CausalLm for TinyLm {
    fn tokenizer(&self) -> Tokenizer {
        Tokenizer {
            vocab_size: self.config.vocab_size,
            eos_token_id: self.config.eos_token_id,
        }
    }

    fn forward(&self, prompt: &[u32], completion: &[u32]) -> Forward {
        let mut row = vec![0.0; self.vocab_size()];
        score(self.config.eos_token_id, |prev, out| out.copy_from_slice(self.row(prev)), &mut row, prompt, completion)
    }

    fn backward(&self, prompt: &[u32], completion: &[u32], coefs: &[f64], grads: &mut [f32]) {
        let v = self.vocab_size();
        let mut row = vec![0.0; v];
        backprop(
            self.config.eos_token_id,
            |prev, out| out.copy_from_slice(self.row(prev)),
            |prev, g| {
                let start = prev as usize * v;
                for (dst, src) in grads[start..start + v].iter_mut().zip(g) {
                    *dst += *src;
                }
            },
            &mut row,
            prompt,
            completion,
            coefs,
        );
    }

    fn generate(&self, prompt: &[u32], max_new_tokens: usize, temperature: f64, rng: &mut StdRng) -> Vec<u32> {
        let mut row = vec![0.0; self.vocab_size()];
        sample(
            self.config.eos_token_id,
            |prev, out| out.copy_from_slice(self.row(prev)),
            &mut row,
            prompt,
            max_new_tokens,
            temperature,
            rng,
        )
    }

    fn parameters(&self) -> &[f32] {
        &self.weights
    }

    fn parameters_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }

    fn save_pretrained(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        std::fs::write(dir.join("config.json"), serde_json::to_string_pretty(&self.config)?)?;
        let weights = Weights {
            weights: self.weights.clone(),
        };
        std::fs::write(dir.join("model.json"), serde_json::to_string(&weights)?)?;
        self.tokenizer().save_pretrained(dir)
    }
}

// ---------------------------------------------------------------------------
// Bigram math shared with the adapter wrapper
// ---------------------------------------------------------------------------

/// Numerically stable in-place softmax; returns the log-normaliser.
pub(crate) fn softmax_in_place(row: &mut [f32]) -> f64 {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let mut sum = 0.0f64;
    for x in row.iter_mut() {
        let e = ((*x as f64) - max).exp();
        sum += e;
        *x = e as f32;
    }
    for x in row.iter_mut() {
        *x = (*x as f64 / sum) as f32;
    }
    max + sum.ln()
}

fn argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &x)| if x > best.1 { (i, x) } else { best })
        .0
}

/// Context token preceding completion position `t`.
fn prev_token(bos: u32, prompt: &[u32], completion: &[u32], t: usize) -> u32 {
    if t > 0 {
        completion[t - 1]
    } else {
        prompt.last().copied().unwrap_or(bos)
    }
}

pub(crate) fn score<F>(bos: u32, fill_row: F, row: &mut [f32], prompt: &[u32], completion: &[u32]) -> Forward
where
    F: Fn(u32, &mut [f32]),
{
    let mut log_probs = Vec::with_capacity(completion.len());
    let mut greedy = Vec::with_capacity(completion.len());
    for (t, &next) in completion.iter().enumerate() {
        fill_row(prev_token(bos, prompt, completion, t), row);
        greedy.push(argmax(row) == next as usize);
        let logit = row[next as usize] as f64;
        let log_z = softmax_in_place(row);
        log_probs.push(logit - log_z);
    }
    Forward { log_probs, greedy }
}

/// Accumulate `sum_t coefs[t] * d log p_t / d logits` row by row.
///
/// `apply(prev, g)` receives the gradient with respect to the logits row used
/// at each position.
pub(crate) fn backprop<F, G>(
    bos: u32,
    fill_row: F,
    mut apply: G,
    row: &mut [f32],
    prompt: &[u32],
    completion: &[u32],
    coefs: &[f64],
) where
    F: Fn(u32, &mut [f32]),
    G: FnMut(u32, &[f32]),
{
    let mut grad = vec![0.0f32; row.len()];
    for (t, (&next, &coef)) in completion.iter().zip(coefs).enumerate() {
        if coef == 0.0 {
            continue;
        }
        let prev = prev_token(bos, prompt, completion, t);
        fill_row(prev, row);
        softmax_in_place(row);
        // d log softmax(z)[next] / dz = onehot(next) - softmax(z)
        for (g, p) in grad.iter_mut().zip(row.iter()) {
            *g = (-coef * *p as f64) as f32;
        }
        grad[next as usize] += coef as f32;
        apply(prev, &grad);
    }
}

pub(crate) fn sample<F>(
    eos: u32,
    fill_row: F,
    row: &mut [f32],
    prompt: &[u32],
    max_new_tokens: usize,
    temperature: f64,
    rng: &mut StdRng,
) -> Vec<u32>
where
    F: Fn(u32, &mut [f32]),
{
    let mut out = Vec::with_capacity(max_new_tokens);
    let mut prev = prompt.last().copied().unwrap_or(eos);
    for _ in 0..max_new_tokens {
        fill_row(prev, row);
        let inv_t = (1.0 / temperature) as f32;
        for x in row.iter_mut() {
            *x *= inv_t;
        }
        softmax_in_place(row);
        let draw: f32 = rng.gen();
        let mut acc = 0.0;
        let mut next = row.len() - 1;
        for (i, p) in row.iter().enumerate() {
            acc += p;
            if draw < acc {
                next = i;
                break;
            }
        }
        let next = next as u32;
        out.push(next);
        if next == eos {
            break;
        }
        prev = next;
    }
    out
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::model::tokenizer::EOS_TOKEN_ID;

    fn model(seed: u64) -> TinyLm {
        TinyLm::new(TinyLmConfig::default(), &mut StdRng::seed_from_u64(seed))
    }

    #[test]
    fn test_init_is_deterministic() {
        assert_eq!(model(7).parameters(), model(7).parameters());
        assert_ne!(model(7).parameters(), model(8).parameters());
    }

    #[test]
    fn test_log_probs_are_normalised() {
        let m = model(0);
        let fwd = m.forward(&[], &[b'a' as u32]);
        assert_eq!(fwd.log_probs.len(), 1);
        // Near-uniform init over 128 tokens.
        assert!((fwd.log_probs[0] + (128f64).ln()).abs() < 0.1);
        let total: f64 = (0..128u32)
            .map(|tok| m.forward(&[5], &[tok]).log_probs[0].exp())
            .sum();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_gradient_step_increases_likelihood() {
        let mut m = model(1);
        let prompt = m.tokenizer().encode("Flat is");
        let completion = m.tokenizer().encode_completion(" better");
        let before = m.forward(&prompt, &completion).sum();

        let mut grads = vec![0.0; m.parameters().len()];
        let coefs = vec![1.0; completion.len()];
        m.backward(&prompt, &completion, &coefs, &mut grads);
        for (w, g) in m.parameters_mut().iter_mut().zip(&grads) {
            *w += 0.5 * g;
        }
        let after = m.forward(&prompt, &completion).sum();
        assert!(after > before, "{after} <= {before}");
    }

    #[test]
    fn test_generate_respects_budget() {
        let m = model(2);
        let mut rng = StdRng::seed_from_u64(3);
        let out = m.generate(&[b'a' as u32], 5, 1.0, &mut rng);
        assert!(!out.is_empty() && out.len() <= 5);
        if out.len() < 5 {
            assert_eq!(out.last(), Some(&EOS_TOKEN_ID));
        }
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let m = model(4);
        m.save_pretrained(dir.path()).unwrap();
        assert!(dir.path().join("tokenizer_config.json").exists());
        let reloaded = TinyLm::from_pretrained(dir.path()).unwrap();
        assert_eq!(reloaded.parameters(), m.parameters());
        assert_eq!(reloaded.config(), m.config());
    }
}
