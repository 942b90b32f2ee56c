//! Direct preference optimisation.
//!
//! For a pair `(prompt, chosen, rejected)` with policy log-probabilities
//! `pi` and reference log-probabilities `ref`:
//!
//!   a = log pi(chosen) - log ref(chosen)
//!   b = log pi(rejected) - log ref(rejected)
//!
//! Each loss type is a function of `(a, b)`; several loss types are combined
//! as a weighted sum. The derivatives with respect to `a` and `b` are pushed
//! back into every completion token.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{DpoConfig, DpoLossType};
use crate::data::format::to_preference;
use crate::data::Example;
use crate::model::tokenizer::{truncate_left, truncate_right};
use crate::model::{CausalLm, TinyLm, Tokenizer};
use crate::report::Metrics;

use super::trainer::{LossOutput, Objective};

// ---------------------------------------------------------------------------
// Scalar helpers
// ---------------------------------------------------------------------------

pub(crate) fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// `log(sigmoid(x))` without overflow for large `|x|`.
pub(crate) fn log_sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}

/// Running mean of every reward seen so far (`bco_pair` baseline).
#[derive(Debug, Clone, Default)]
pub struct RunningMean {
    pub mean: f64,
    pub count: usize,
}

impl RunningMean {
    pub fn update(&mut self, values: &[f64]) {
        if values.is_empty() {
            return;
        }
        let batch_mean = values.iter().sum::<f64>() / values.len() as f64;
        let total = self.count + values.len();
        self.mean += (batch_mean - self.mean) * values.len() as f64 / total as f64;
        self.count = total;
    }
}

/// Value and partial derivatives of one loss type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairLoss {
    pub loss: f64,
    pub d_chosen: f64,
    pub d_rejected: f64,
}

/// Evaluate `loss_type` at chosen/rejected log-ratios `a` and `b`. `delta` is
/// the reward baseline used by `bco_pair`.
pub fn preference_loss(
    loss_type: DpoLossType,
    beta: f64,
    label_smoothing: f64,
    a: f64,
    b: f64,
    delta: f64,
) -> PairLoss {
    let eps = label_smoothing;
    let l = a - b;
    let dsig = |x: f64| sigmoid(x) * sigmoid(-x);
    // Losses that only depend on l = a - b.
    let of_margin = |loss: f64, dl: f64| PairLoss {
        loss,
        d_chosen: dl,
        d_rejected: -dl,
    };

    match loss_type {
        DpoLossType::Sigmoid => of_margin(
            -log_sigmoid(beta * l) * (1.0 - eps) - log_sigmoid(-beta * l) * eps,
            -beta * (1.0 - eps) * sigmoid(-beta * l) + beta * eps * sigmoid(beta * l),
        ),
        DpoLossType::Robust => of_margin(
            (-log_sigmoid(beta * l) * (1.0 - eps) + log_sigmoid(-beta * l) * eps) / (1.0 - 2.0 * eps),
            (-beta * (1.0 - eps) * sigmoid(-beta * l) - beta * eps * sigmoid(beta * l)) / (1.0 - 2.0 * eps),
        ),
        DpoLossType::Hinge => {
            let slack = 1.0 - beta * l;
            if slack > 0.0 {
                of_margin(slack, -beta)
            } else {
                of_margin(0.0, 0.0)
            }
        }
        DpoLossType::Ipo => {
            let gap = l - 1.0 / (2.0 * beta);
            of_margin(gap * gap, 2.0 * gap)
        }
        DpoLossType::BcoPair => {
            let x = beta * a - delta;
            let y = beta * b - delta;
            PairLoss {
                loss: -log_sigmoid(x) - log_sigmoid(-y),
                d_chosen: beta * (sigmoid(x) - 1.0),
                d_rejected: beta * sigmoid(y),
            }
        }
        DpoLossType::SppoHard => {
            let ca = a - 1.0 / (2.0 * beta);
            let cb = b + 1.0 / (2.0 * beta);
            PairLoss {
                loss: ca * ca + cb * cb,
                d_chosen: 2.0 * ca,
                d_rejected: 2.0 * cb,
            }
        }
        DpoLossType::NcaPair => PairLoss {
            loss: -log_sigmoid(beta * a) - 0.5 * log_sigmoid(-beta * a) - 0.5 * log_sigmoid(-beta * b),
            d_chosen: -beta * sigmoid(-beta * a) + 0.5 * beta * sigmoid(beta * a),
            d_rejected: 0.5 * beta * sigmoid(beta * b),
        },
        DpoLossType::ApoZero => PairLoss {
            loss: 1.0 - sigmoid(beta * a) + sigmoid(beta * b),
            d_chosen: -beta * dsig(beta * a),
            d_rejected: beta * dsig(beta * b),
        },
        DpoLossType::ApoDown => PairLoss {
            loss: sigmoid(beta * a) + 1.0 - sigmoid(beta * l),
            d_chosen: beta * dsig(beta * a) - beta * dsig(beta * l),
            d_rejected: beta * dsig(beta * l),
        },
    }
}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceRecord {
    pub prompt: Vec<u32>,
    pub chosen: Vec<u32>,
    pub rejected: Vec<u32>,
}

/// Tokenize a prompt and its completions, then apply the length limits:
/// prompts lose their beginning, completions their end.
pub(crate) fn tokenize_completion_pair(
    tokenizer: &Tokenizer,
    prompt: &str,
    completions: [&str; 2],
    max_prompt_length: Option<usize>,
    max_completion_length: Option<usize>,
    max_length: Option<usize>,
) -> (Vec<u32>, [Vec<u32>; 2]) {
    let mut prompt_ids = tokenizer.encode(prompt);
    truncate_left(&mut prompt_ids, max_prompt_length);
    let budget = max_length.map(|max| max.saturating_sub(prompt_ids.len()).max(1));
    let completions = completions.map(|text| {
        let mut ids = tokenizer.encode_completion(text);
        truncate_right(&mut ids, max_completion_length);
        truncate_right(&mut ids, budget);
        ids
    });
    (prompt_ids, completions)
}

// ---------------------------------------------------------------------------
// Objective
// ---------------------------------------------------------------------------

pub struct DpoObjective {
    config: DpoConfig,
    /// Frozen reference policy; `None` when `reference_free`.
    reference: Option<TinyLm>,
    running: RunningMean,
}

impl DpoObjective {
    pub fn new(config: DpoConfig, reference: Option<TinyLm>) -> Self {
        let reference = if config.reference_free { None } else { reference };
        Self {
            config,
            reference,
            running: RunningMean::default(),
        }
    }

    fn reference_logps(&self, prompt: &[u32], completion: &[u32]) -> f64 {
        self.reference
            .as_ref()
            .map_or(0.0, |r| r.forward(prompt, completion).sum())
    }
}

impl Objective for DpoObjective {
    type Record = PreferenceRecord;

    fn name(&self) -> &'static str {
        "dpo"
    }

    fn prepare(&self, tokenizer: &Tokenizer, rows: &[Example]) -> Result<Vec<PreferenceRecord>> {
        rows.iter()
            .enumerate()
            .map(|(i, row)| {
                let pair = to_preference(row).with_context(|| format!("row {i}"))?;
                let (prompt, [chosen, rejected]) = tokenize_completion_pair(
                    tokenizer,
                    &pair.prompt,
                    [&pair.chosen, &pair.rejected],
                    self.config.max_prompt_length,
                    self.config.max_completion_length,
                    self.config.max_length,
                );
                Ok(PreferenceRecord {
                    prompt,
                    chosen,
                    rejected,
                })
            })
            .collect()
    }

    fn compute_loss(
        &mut self,
        model: &dyn CausalLm,
        batch: &[&PreferenceRecord],
        mut grads: Option<&mut [f32]>,
        _rng: &mut StdRng,
    ) -> Result<LossOutput> {
        let n = batch.len().max(1) as f64;
        let beta = self.config.beta;

        struct Scored {
            policy_chosen: f64,
            policy_rejected: f64,
            a: f64,
            b: f64,
            len_chosen: f64,
            len_rejected: f64,
        }

        let scored: Vec<Scored> = batch
            .iter()
            .map(|r| {
                let policy_chosen = model.forward(&r.prompt, &r.chosen).sum();
                let policy_rejected = model.forward(&r.prompt, &r.rejected).sum();
                Scored {
                    policy_chosen,
                    policy_rejected,
                    a: policy_chosen - self.reference_logps(&r.prompt, &r.chosen),
                    b: policy_rejected - self.reference_logps(&r.prompt, &r.rejected),
                    len_chosen: r.chosen.len().max(1) as f64,
                    len_rejected: r.rejected.len().max(1) as f64,
                }
            })
            .collect();

        if grads.is_some() && self.config.loss_type.contains(&DpoLossType::BcoPair) {
            let rewards: Vec<f64> = scored
                .iter()
                .flat_map(|s| [beta * s.a, beta * s.b])
                .collect();
            self.running.update(&rewards);
        }
        let delta = self.running.mean;

        let mut total = 0.0;
        let mut metrics = Metrics::new();
        let mut sums = [0.0f64; 6];
        for (record, s) in batch.iter().zip(&scored) {
            let mut d_chosen = 0.0;
            let mut d_rejected = 0.0;
            for (&loss_type, &weight) in self.config.loss_type.iter().zip(&self.config.loss_weights) {
                // IPO compares length-normalised log-ratios.
                let (sc, sr) = if loss_type == DpoLossType::Ipo {
                    (1.0 / s.len_chosen, 1.0 / s.len_rejected)
                } else {
                    (1.0, 1.0)
                };
                let out = preference_loss(
                    loss_type,
                    beta,
                    self.config.label_smoothing,
                    s.a * sc,
                    s.b * sr,
                    delta,
                );
                total += weight * out.loss;
                d_chosen += weight * out.d_chosen * sc;
                d_rejected += weight * out.d_rejected * sr;
            }

            if let Some(grads) = grads.as_deref_mut() {
                let coefs = vec![d_chosen / n; record.chosen.len()];
                model.backward(&record.prompt, &record.chosen, &coefs, grads);
                let coefs = vec![d_rejected / n; record.rejected.len()];
                model.backward(&record.prompt, &record.rejected, &coefs, grads);
            }

            let chosen_reward = beta * s.a;
            let rejected_reward = beta * s.b;
            sums[0] += chosen_reward;
            sums[1] += rejected_reward;
            sums[2] += f64::from(u8::from(chosen_reward > rejected_reward));
            sums[3] += chosen_reward - rejected_reward;
            sums[4] += s.policy_chosen;
            sums[5] += s.policy_rejected;
        }

        for (key, sum) in [
            "rewards/chosen",
            "rewards/rejected",
            "rewards/accuracies",
            "rewards/margins",
            "logps/chosen",
            "logps/rejected",
        ]
        .into_iter()
        .zip(sums)
        {
            metrics.insert(key.into(), sum / n);
        }
        debug!(loss = total / n, margin = metrics["rewards/margins"], "DPO batch");

        Ok(LossOutput {
            loss: total / n,
            metrics,
        })
    }
}
