//! Low-rank adapter around [`TinyLm`].
//!
//! The effective logits table is `W + (alpha / r) * A B` with `A: vocab x r`
//! and `B: r x vocab`. Only `A` and `B` are trainable; `B` starts at zero so a
//! fresh adapter reproduces the base model exactly, and the base model itself
//! serves as the frozen reference.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::tiny::{backprop, sample, score, TinyLm};
use super::tokenizer::Tokenizer;
use super::{CausalLm, Forward};

/// Contents of `adapter_config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub peft_type: String,
    pub r: usize,
    pub lora_alpha: f64,
    pub lora_dropout: f64,
    pub base_model_name_or_path: String,
    pub target_modules: Vec<String>,
}

impl LoraConfig {
    pub fn new(r: usize, lora_alpha: f64, lora_dropout: f64, base_model_name_or_path: &str) -> Self {
        Self {
            peft_type: "LORA".to_string(),
            r,
            lora_alpha,
            lora_dropout,
            base_model_name_or_path: base_model_name_or_path.to_string(),
            target_modules: vec!["bigram".to_string()],
        }
    }

    fn scaling(&self) -> f32 {
        (self.lora_alpha / self.r as f64) as f32
    }
}

#[derive(Serialize, Deserialize)]
struct AdapterWeights {
    lora_a: Vec<f32>,
    lora_b: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct PeftModel {
    base: TinyLm,
    config: LoraConfig,
    /// `A` (vocab x r) followed by `B` (r x vocab).
    params: Vec<f32>,
}

impl PeftModel {
    pub fn new(base: TinyLm, config: LoraConfig, rng: &mut StdRng) -> Self {
        let v = base.vocab_size();
        let bound = 1.0 / (v as f32).sqrt();
        let mut params: Vec<f32> = (0..v * config.r).map(|_| rng.gen_range(-bound..=bound)).collect();
        params.resize(2 * v * config.r, 0.0);
        Self {
            base,
            config,
            params,
        }
    }

    pub fn from_pretrained(base: TinyLm, dir: &Path) -> Result<Self> {
        let config: LoraConfig = read_json(&dir.join("adapter_config.json"))?;
        let AdapterWeights { lora_a, lora_b } = read_json(&dir.join("adapter_model.json"))?;
        let expected = base.vocab_size() * config.r;
        if lora_a.len() != expected || lora_b.len() != expected {
            bail!(
                "adapter in {} does not match a rank-{} adapter over a {}-token vocabulary",
                dir.display(),
                config.r,
                base.vocab_size()
            );
        }
        let mut params = lora_a;
        params.extend(lora_b);
        Ok(Self {
            base,
            config,
            params,
        })
    }

    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    /// The wrapped model with the adapter disabled.
    pub fn base(&self) -> &TinyLm {
        &self.base
    }

    /// Fold the adapter into the base weights.
    pub fn merge_and_unload(self) -> TinyLm {
        let v = self.base.vocab_size();
        let mut merged = self.base.clone();
        let mut row = vec![0.0; v];
        for prev in 0..v as u32 {
            self.fill_row(prev, &mut row);
            let start = prev as usize * v;
            merged.weights_mut()[start..start + v].copy_from_slice(&row);
        }
        merged
    }

    fn split(&self) -> (&[f32], &[f32]) {
        self.params.split_at(self.base.vocab_size() * self.config.r)
    }

    fn fill_row(&self, prev: u32, out: &mut [f32]) {
        let v = self.base.vocab_size();
        let r = self.config.r;
        let s = self.config.scaling();
        let (a, b) = self.split();
        out.copy_from_slice(self.base.row(prev));
        let a_row = &a[prev as usize * r..(prev as usize + 1) * r];
        for (k, &a_k) in a_row.iter().enumerate() {
            if a_k == 0.0 {
                continue;
            }
            let b_row = &b[k * v..(k + 1) * v];
            for (o, &b_kj) in out.iter_mut().zip(b_row) {
                *o += s * a_k * b_kj;
            }
        }
    }
}

impl CausalLm for PeftModel {
    fn tokenizer(&self) -> Tokenizer {
        self.base.tokenizer()
    }

    fn forward(&self, prompt: &[u32], completion: &[u32]) -> Forward {
        let mut row = vec![0.0; self.base.vocab_size()];
        score(self.base.config().eos_token_id, |p, out| self.fill_row(p, out), &mut row, prompt, completion)
    }

    fn backward(&self, prompt: &[u32], completion: &[u32], coefs: &[f64], grads: &mut [f32]) {
        let v = self.base.vocab_size();
        let r = self.config.r;
        let s = self.config.scaling();
        let (a, b) = self.split();
        let (grad_a, grad_b) = grads.split_at_mut(v * r);
        let mut row = vec![0.0; v];
        backprop(
            self.base.config().eos_token_id,
            |p, out| self.fill_row(p, out),
            |prev, g| {
                let p = prev as usize;
                for k in 0..r {
                    let b_row = &b[k * v..(k + 1) * v];
                    let dot: f32 = g.iter().zip(b_row).map(|(x, y)| x * y).sum();
                    grad_a[p * r + k] += s * dot;
                    let a_pk = a[p * r + k];
                    for (dst, &g_j) in grad_b[k * v..(k + 1) * v].iter_mut().zip(g) {
                        *dst += s * a_pk * g_j;
                    }
                }
            },
            &mut row,
            prompt,
            completion,
            coefs,
        );
    }

    fn generate(&self, prompt: &[u32], max_new_tokens: usize, temperature: f64, rng: &mut StdRng) -> Vec<u32> {
        let mut row = vec![0.0; self.base.vocab_size()];
        sample(
            self.base.config().eos_token_id,
            |p, out| self.fill_row(p, out),
            &mut row,
            prompt,
            max_new_tokens,
            temperature,
            rng,
        )
    }

    fn parameters(&self) -> &[f32] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    fn save_pretrained(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        std::fs::write(
            dir.join("adapter_config.json"),
            serde_json::to_string_pretty(&self.config)?,
        )?;
        let (a, b) = self.split();
        let weights = AdapterWeights {
            lora_a: a.to_vec(),
            lora_b: b.to_vec(),
        };
        std::fs::write(dir.join("adapter_model.json"), serde_json::to_string(&weights)?)?;
        self.tokenizer().save_pretrained(dir)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::model::tiny::TinyLmConfig;

    fn base() -> TinyLm {
        TinyLm::new(TinyLmConfig::default(), &mut StdRng::seed_from_u64(11))
    }

    fn adapter(r: usize) -> PeftModel {
        PeftModel::new(base(), LoraConfig::new(r, 8.0, 0.0, "base"), &mut StdRng::seed_from_u64(12))
    }

    #[test]
    fn test_fresh_adapter_matches_base() {
        let peft = adapter(4);
        let prompt = [b'a' as u32, b'b' as u32];
        let completion = [b'c' as u32, 0];
        let lhs = peft.forward(&prompt, &completion).log_probs;
        let rhs = peft.base().forward(&prompt, &completion).log_probs;
        for (x, y) in lhs.iter().zip(&rhs) {
            assert!((x - y).abs() < 1e-9);
        }
        assert_eq!(peft.parameters().len(), 2 * 128 * 4);
    }

    #[test]
    fn test_only_adapter_moves() {
        let mut peft = adapter(2);
        let prompt = peft.tokenizer().encode("Now is");
        let completion = peft.tokenizer().encode_completion(" better");
        let before = peft.forward(&prompt, &completion).sum();

        let mut grads = vec![0.0; peft.parameters().len()];
        peft.backward(&prompt, &completion, &vec![1.0; completion.len()], &mut grads);
        // B starts at zero so only B receives gradient on the first step.
        let (grad_a, grad_b) = grads.split_at(128 * 2);
        assert!(grad_a.iter().all(|g| *g == 0.0));
        assert!(grad_b.iter().any(|g| *g != 0.0));

        for (w, g) in peft.parameters_mut().iter_mut().zip(&grads) {
            *w += 0.1 * g;
        }
        let after = peft.forward(&prompt, &completion).sum();
        assert!(after > before);
        let base_after = peft.base().forward(&prompt, &completion).sum();
        assert!((base_after - before).abs() < 1e-9);
    }

    #[test]
    fn test_merge_preserves_outputs() {
        let mut peft = adapter(2);
        for w in peft.parameters_mut().iter_mut() {
            *w += 0.01;
        }
        let prompt = [b'x' as u32];
        let completion = [b'y' as u32, 0];
        let expected = peft.forward(&prompt, &completion).sum();
        let merged = peft.merge_and_unload();
        assert!((merged.forward(&prompt, &completion).sum() - expected).abs() < 1e-4);
    }

    #[test]
    fn test_save_and_reload_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let peft = adapter(3);
        peft.save_pretrained(dir.path()).unwrap();
        let reloaded = PeftModel::from_pretrained(base(), dir.path()).unwrap();
        assert_eq!(reloaded.parameters(), peft.parameters());
        assert_eq!(reloaded.config(), peft.config());
    }
}
