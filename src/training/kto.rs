//! Kahneman-Tversky optimisation on unpaired, labelled completions.
//!
//! With `a = log pi(y|x) - log ref(y|x)` and a batch-level KL baseline `z`:
//!
//!   desirable:   w_d * (1 - sigmoid(beta * (a - z)))
//!   undesirable: w_u * (1 - sigmoid(beta * (z - a)))
//!
//! `z` is estimated from mismatched prompt/completion pairs inside the batch,
//! clamped at zero and treated as a constant.

use anyhow::Result;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{KtoConfig, KtoLossType};
use crate::data::format::to_unpaired;
use crate::data::Example;
use crate::model::tokenizer::{truncate_left, truncate_right};
use crate::model::{CausalLm, TinyLm, Tokenizer};
use crate::report::Metrics;

use super::dpo::sigmoid;
use super::trainer::{LossOutput, Objective};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnpairedRecord {
    pub prompt: Vec<u32>,
    pub completion: Vec<u32>,
    /// `true` for desirable completions.
    pub label: bool,
}

/// Value and derivative with respect to `a` of one unpaired loss term.
pub fn unpaired_loss(
    loss_type: KtoLossType,
    beta: f64,
    label: bool,
    weight: f64,
    a: f64,
    kl: f64,
) -> (f64, f64) {
    let dsig = |x: f64| sigmoid(x) * sigmoid(-x);
    match (loss_type, label) {
        (KtoLossType::Kto, true) => {
            let x = beta * (a - kl);
            (weight * (1.0 - sigmoid(x)), -weight * beta * dsig(x))
        }
        (KtoLossType::Kto, false) => {
            let x = beta * (kl - a);
            (weight * (1.0 - sigmoid(x)), weight * beta * dsig(x))
        }
        (KtoLossType::ApoZeroUnpaired, true) => {
            let x = beta * a;
            (weight * (1.0 - sigmoid(x)), -weight * beta * dsig(x))
        }
        (KtoLossType::ApoZeroUnpaired, false) => {
            let x = beta * a;
            (weight * sigmoid(x), weight * beta * dsig(x))
        }
    }
}

pub struct KtoObjective {
    config: KtoConfig,
    reference: Option<TinyLm>,
}

impl KtoObjective {
    pub fn new(config: KtoConfig, reference: Option<TinyLm>) -> Self {
        Self { config, reference }
    }

    fn reference_logps(&self, prompt: &[u32], completion: &[u32]) -> f64 {
        self.reference
            .as_ref()
            .map_or(0.0, |r| r.forward(prompt, completion).sum())
    }

    /// KL baseline from each prompt paired with its neighbour's completion.
    /// A lone record has no mismatched pair, so its baseline is 0.
    fn kl_baseline(&self, model: &dyn CausalLm, batch: &[&UnpairedRecord]) -> f64 {
        if self.config.loss_type != KtoLossType::Kto || batch.len() < 2 {
            return 0.0;
        }
        let n = batch.len();
        let total: f64 = (0..n)
            .map(|i| {
                let prompt = &batch[i].prompt;
                let completion = &batch[(i + n - 1) % n].completion;
                model.forward(prompt, completion).sum() - self.reference_logps(prompt, completion)
            })
            .sum();
        (total / n as f64).max(0.0)
    }
}

impl Objective for KtoObjective {
    type Record = UnpairedRecord;

    fn name(&self) -> &'static str {
        "kto"
    }

    fn prepare(&self, tokenizer: &Tokenizer, rows: &[Example]) -> Result<Vec<UnpairedRecord>> {
        let unpaired = to_unpaired(rows)?;
        let desirable = unpaired.iter().filter(|e| e.label).count();
        let undesirable = unpaired.len() - desirable;
        info!(desirable, undesirable, "Prepared unpaired examples");

        if desirable > 0 && undesirable > 0 {
            let ratio = (self.config.desirable_weight * desirable as f64)
                / (self.config.undesirable_weight * undesirable as f64);
            if !(1.0..=4.0 / 3.0).contains(&ratio) {
                warn!(
                    ratio = format!("{ratio:.3}"),
                    desirable_weight = self.config.desirable_weight,
                    undesirable_weight = self.config.undesirable_weight,
                    "Weighted desirable:undesirable ratio is outside [1, 4/3]; consider adjusting the class weights"
                );
            }
        }

        Ok(unpaired
            .into_iter()
            .map(|example| {
                let mut prompt = tokenizer.encode(&example.prompt);
                truncate_left(&mut prompt, self.config.max_prompt_length);
                let mut completion = tokenizer.encode_completion(&example.completion);
                truncate_right(&mut completion, self.config.max_completion_length);
                let budget = self
                    .config
                    .max_length
                    .map(|max| max.saturating_sub(prompt.len()).max(1));
                truncate_right(&mut completion, budget);
                UnpairedRecord {
                    prompt,
                    completion,
                    label: example.label,
                }
            })
            .collect())
    }

    fn compute_loss(
        &mut self,
        model: &dyn CausalLm,
        batch: &[&UnpairedRecord],
        mut grads: Option<&mut [f32]>,
        _rng: &mut StdRng,
    ) -> Result<LossOutput> {
        let n = batch.len().max(1) as f64;
        let beta = self.config.beta;
        let kl = self.kl_baseline(model, batch);

        let mut total = 0.0;
        // (reward sum, logp sum, count) per class.
        let mut chosen = (0.0, 0.0, 0usize);
        let mut rejected = (0.0, 0.0, 0usize);

        for record in batch {
            let policy = model.forward(&record.prompt, &record.completion).sum();
            let a = policy - self.reference_logps(&record.prompt, &record.completion);
            let weight = if record.label {
                self.config.desirable_weight
            } else {
                self.config.undesirable_weight
            };
            let (loss, d_a) = unpaired_loss(self.config.loss_type, beta, record.label, weight, a, kl);
            total += loss;

            if let Some(grads) = grads.as_deref_mut() {
                let coefs = vec![d_a / n; record.completion.len()];
                model.backward(&record.prompt, &record.completion, &coefs, grads);
            }

            let class = if record.label { &mut chosen } else { &mut rejected };
            class.0 += beta * a;
            class.1 += policy;
            class.2 += 1;
        }

        let mut metrics = Metrics::new();
        metrics.insert("kl".into(), kl);
        if chosen.2 > 0 {
            metrics.insert("rewards/chosen".into(), chosen.0 / chosen.2 as f64);
            metrics.insert("logps/chosen".into(), chosen.1 / chosen.2 as f64);
        }
        if rejected.2 > 0 {
            metrics.insert("rewards/rejected".into(), rejected.0 / rejected.2 as f64);
            metrics.insert("logps/rejected".into(), rejected.1 / rejected.2 as f64);
        }
        if chosen.2 > 0 && rejected.2 > 0 {
            metrics.insert(
                "rewards/margins".into(),
                chosen.0 / chosen.2 as f64 - rejected.0 / rejected.2 as f64,
            );
        }
        debug!(loss = total / n, kl, "KTO batch");

        Ok(LossOutput {
            loss: total / n,
            metrics,
        })
    }
}
