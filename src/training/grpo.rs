//! Group Relative Policy Optimization (GRPO).
//!
//! For each prompt, G completions are sampled from the current policy and
//! scored. With per-token ratio rho_t = pi_theta / pi_old:
//!
//!   J(theta) = sum_t w_i * min(rho_t * A_i, clip(rho_t, 1-eps, 1+eps_high) * A_i)
//!              - beta * sum_t w_i * KL_t(pi_theta || pi_ref)
//!
//! where:
//!   - A_i = (R_i - mean(R)) / std(R) within the prompt's group
//!   - KL_t = exp(ref_t - logp_t) - (ref_t - logp_t) - 1   (k3 estimator)
//!   - w_i normalises tokens according to the loss type:
//!       grpo    1 / (|o_i| * N)
//!       bnpo    1 / sum_j |o_j|
//!       dr_grpo 1 / (N * max_completion_length)

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{GrpoConfig, GrpoLossType, TrainingConfig};
use crate::data::Example;
use crate::model::tokenizer::truncate_left;
use crate::model::{CausalLm, RewardModel, TinyLm, Tokenizer};
use crate::report::Metrics;

use super::advantage::{clip_ratio, compute_grouped_advantages, compute_importance_ratio, mean_std};
use super::rewards;
use super::trainer::{BatchLayout, LossOutput, Objective};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A prompt to sample completions for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRecord {
    pub text: String,
    pub prompt: Vec<u32>,
}

/// One sampled completion with everything needed for a GRPO update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpoSample {
    pub prompt: Vec<u32>,
    pub completion: Vec<u32>,
    pub reward: f64,
    /// Group-relative advantage A_i.
    pub advantage: f64,
    /// log pi_theta per completion token.
    pub log_probs: Vec<f64>,
    /// log pi_old per completion token (the sampling policy).
    pub old_log_probs: Vec<f64>,
    /// log pi_ref per completion token; `None` when beta = 0.
    pub ref_log_probs: Option<Vec<f64>>,
}

/// The result of one GRPO loss evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpoStepResult {
    /// The normalised clipped surrogate loss (negated objective).
    pub policy_loss: f64,
    /// Normalised k3 KL divergence from the reference policy.
    pub kl_divergence: f64,
    /// policy_loss + beta * kl_divergence.
    pub total_loss: f64,
    /// Mean importance sampling ratio over all tokens.
    pub mean_ratio: f64,
    /// Fraction of token ratios that were clipped.
    pub clip_fraction: f64,
    /// d total_loss / d log p for every completion token of every sample.
    pub coefs: Vec<Vec<f64>>,
}

// ---------------------------------------------------------------------------
// Objective
// ---------------------------------------------------------------------------

pub struct GrpoObjective {
    config: GrpoConfig,
    reference: Option<TinyLm>,
    reward_model: Option<Box<dyn RewardModel>>,
}

impl GrpoObjective {
    pub fn new(
        config: GrpoConfig,
        reference: Option<TinyLm>,
        reward_model: Option<Box<dyn RewardModel>>,
    ) -> Self {
        if config.beta > 0.0 && reference.is_none() {
            warn!(beta = config.beta, "No reference model given; the KL penalty is disabled");
        }
        Self {
            config,
            reference,
            reward_model,
        }
    }

    /// Compute the GRPO loss over a set of samples whose advantages are
    /// already filled in.
    ///
    /// # Errors
    ///
    /// Returns an error if `samples` is empty.
    pub fn compute_grpo_loss(&self, samples: &[GrpoSample]) -> Result<GrpoStepResult> {
        if samples.is_empty() {
            bail!("Cannot compute GRPO loss for an empty batch");
        }

        let n = samples.len() as f64;
        let total_tokens = samples.iter().map(|s| s.log_probs.len()).sum::<usize>().max(1) as f64;
        let beta = self.config.beta;

        let mut policy_loss = 0.0;
        let mut kl_divergence = 0.0;
        let mut ratio_sum = 0.0;
        let mut num_tokens = 0usize;
        let mut num_clipped = 0usize;
        let mut coefs = Vec::with_capacity(samples.len());

        for sample in samples {
            let weight = match self.config.loss_type {
                GrpoLossType::Grpo => 1.0 / (sample.log_probs.len().max(1) as f64 * n),
                GrpoLossType::Bnpo => 1.0 / total_tokens,
                GrpoLossType::DrGrpo => 1.0 / (n * self.config.max_completion_length as f64),
            };
            let advantage = sample.advantage;
            let mut sample_coefs = Vec::with_capacity(sample.log_probs.len());

            for (t, (&logp, &old)) in sample.log_probs.iter().zip(&sample.old_log_probs).enumerate() {
                let ratio = compute_importance_ratio(logp, old);
                let clipped = clip_ratio(ratio, self.config.epsilon, self.config.epsilon_high);
                if (clipped - ratio).abs() > 1e-10 {
                    num_clipped += 1;
                }
                ratio_sum += ratio;
                num_tokens += 1;

                // PPO-clip: take the pessimistic bound; the clipped branch is
                // constant in theta.
                let unclipped = ratio * advantage;
                let objective = unclipped.min(clipped * advantage);
                let d_objective = if unclipped <= clipped * advantage {
                    ratio * advantage
                } else {
                    0.0
                };
                policy_loss -= weight * objective;
                let mut coef = -d_objective;

                if beta > 0.0 {
                    if let Some(ref_lp) = sample.ref_log_probs.as_ref().and_then(|r| r.get(t)) {
                        let x = ref_lp - logp;
                        kl_divergence += weight * (x.exp() - x - 1.0);
                        coef += beta * (1.0 - x.exp());
                    }
                }
                sample_coefs.push(weight * coef);
            }
            coefs.push(sample_coefs);
        }

        let mean_ratio = ratio_sum / num_tokens.max(1) as f64;
        let clip_fraction = num_clipped as f64 / num_tokens.max(1) as f64;
        let total_loss = policy_loss + beta * kl_divergence;

        debug!(
            policy_loss,
            kl = kl_divergence,
            total_loss,
            mean_ratio,
            clip_fraction,
            "GRPO loss computed for {} samples",
            samples.len()
        );

        Ok(GrpoStepResult {
            policy_loss,
            kl_divergence,
            total_loss,
            mean_ratio,
            clip_fraction,
            coefs,
        })
    }

    /// Sample `num_generations` completions per prompt and score them.
    fn rollout(
        &self,
        model: &dyn CausalLm,
        batch: &[&PromptRecord],
        rng: &mut StdRng,
        func_sums: &mut [f64],
    ) -> Vec<GrpoSample> {
        let tokenizer = model.tokenizer();
        let mut samples = Vec::with_capacity(batch.len() * self.config.num_generations);
        for record in batch {
            for _ in 0..self.config.num_generations {
                let completion = model.generate(
                    &record.prompt,
                    self.config.max_completion_length,
                    self.config.temperature,
                    rng,
                );
                let text = tokenizer.decode(&completion);
                let mut reward = 0.0;
                if let Some(reward_model) = &self.reward_model {
                    let ids = reward_model
                        .tokenizer()
                        .encode(&format!("{}{}", record.text, text));
                    reward += reward_model.score(&ids);
                }
                for (sum, &func) in func_sums.iter_mut().zip(&self.config.reward_funcs) {
                    let r = rewards::score(func, &text, completion.len(), self.config.max_completion_length);
                    *sum += r;
                    reward += r;
                }
                samples.push(GrpoSample {
                    prompt: record.prompt.clone(),
                    completion,
                    reward,
                    advantage: 0.0,
                    log_probs: Vec::new(),
                    old_log_probs: Vec::new(),
                    ref_log_probs: None,
                });
            }
        }
        samples
    }
}

impl Objective for GrpoObjective {
    type Record = PromptRecord;

    fn name(&self) -> &'static str {
        "grpo"
    }

    fn prepare(&self, tokenizer: &Tokenizer, rows: &[Example]) -> Result<Vec<PromptRecord>> {
        rows.iter()
            .enumerate()
            .map(|(i, row)| {
                let text = row
                    .prompt
                    .clone()
                    .with_context(|| format!("row {i}: GRPO datasets need a `prompt` column"))?;
                let mut prompt = tokenizer.encode(&text);
                truncate_left(&mut prompt, self.config.max_prompt_length);
                Ok(PromptRecord { text, prompt })
            })
            .collect()
    }

    /// Micro-batches hold whole prompt groups. When the per-device batch is
    /// not a multiple of the group size, every step is a single micro-batch
    /// of `prompts_per_step` prompts.
    fn batch_layout(&self, args: &TrainingConfig) -> BatchLayout {
        let g = self.config.num_generations;
        if args.per_device_train_batch_size % g == 0 {
            BatchLayout {
                micro_batch_size: args.per_device_train_batch_size / g,
                accumulation_steps: args.gradient_accumulation_steps,
            }
        } else {
            BatchLayout {
                micro_batch_size: self.config.prompts_per_step(args).max(1),
                accumulation_steps: 1,
            }
        }
    }

    fn eval_batch_size(&self, args: &TrainingConfig) -> usize {
        (args.per_device_eval_batch_size / self.config.num_generations).max(1)
    }

    fn compute_loss(
        &mut self,
        model: &dyn CausalLm,
        batch: &[&PromptRecord],
        grads: Option<&mut [f32]>,
        rng: &mut StdRng,
    ) -> Result<LossOutput> {
        let g = self.config.num_generations;
        let mut func_sums = vec![0.0; self.config.reward_funcs.len()];
        let mut samples = self.rollout(model, batch, rng, &mut func_sums);

        let rewards: Vec<f64> = samples.iter().map(|s| s.reward).collect();
        let advantages = compute_grouped_advantages(&rewards, g, self.config.scale_rewards);
        let use_reference = self.config.beta > 0.0;
        for (sample, advantage) in samples.iter_mut().zip(advantages) {
            sample.advantage = advantage;
            sample.log_probs = model.forward(&sample.prompt, &sample.completion).log_probs;
            // One optimizer update per generation round: the sampling policy
            // is the current one.
            sample.old_log_probs = sample.log_probs.clone();
            if use_reference {
                sample.ref_log_probs = self
                    .reference
                    .as_ref()
                    .map(|r| r.forward(&sample.prompt, &sample.completion).log_probs);
            }
        }

        let result = self.compute_grpo_loss(&samples)?;
        if let Some(grads) = grads {
            for (sample, coefs) in samples.iter().zip(&result.coefs) {
                model.backward(&sample.prompt, &sample.completion, coefs, grads);
            }
        }

        let m = samples.len() as f64;
        let eos = model.tokenizer().eos_token_id;
        let group_std = rewards.chunks(g).map(|group| mean_std(group).1).sum::<f64>()
            / rewards.chunks(g).len().max(1) as f64;

        let mut metrics = Metrics::new();
        metrics.insert("reward".into(), rewards.iter().sum::<f64>() / m);
        metrics.insert("reward_std".into(), group_std);
        for (&func, sum) in self.config.reward_funcs.iter().zip(&func_sums) {
            metrics.insert(format!("rewards/{}/mean", rewards::reward_name(func)), sum / m);
        }
        metrics.insert(
            "completions/mean_length".into(),
            samples.iter().map(|s| s.completion.len()).sum::<usize>() as f64 / m,
        );
        metrics.insert(
            "completions/clipped_ratio".into(),
            samples
                .iter()
                .filter(|s| s.completion.last() != Some(&eos))
                .count() as f64
                / m,
        );
        metrics.insert("clip_ratio".into(), result.clip_fraction);
        if use_reference {
            metrics.insert("kl".into(), result.kl_divergence);
        }

        Ok(LossOutput {
            loss: result.total_loss,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::config::{GrpoArguments, RewardFunc};
    use crate::model::reward::RewardModelConfig;
    use crate::model::{TinyLmConfig, TinyRewardModel};

    fn config(f: impl FnOnce(&mut GrpoArguments)) -> GrpoConfig {
        let mut args = GrpoArguments {
            reward_funcs: Some(vec![RewardFunc::SoftOverlongPunishment]),
            num_generations: Some(4),
            max_completion_length: Some(8),
            ..Default::default()
        };
        f(&mut args);
        GrpoConfig::resolve(&args, &TrainingConfig::default()).unwrap()
    }

    fn make_sample(advantage: f64, current_lp: f64, old_lp: f64, ref_lp: f64) -> GrpoSample {
        GrpoSample {
            prompt: vec![65],
            completion: vec![66, 67],
            reward: 0.0,
            advantage,
            log_probs: vec![current_lp; 2],
            old_log_probs: vec![old_lp; 2],
            ref_log_probs: Some(vec![ref_lp; 2]),
        }
    }

    // ------------------------------------------------------------------
    // compute_grpo_loss
    // ------------------------------------------------------------------

    #[test]
    fn test_grpo_loss_basic() {
        let objective = GrpoObjective::new(config(|a| a.loss_type = Some(GrpoLossType::Grpo)), None, None);

        // ratio = 1 and advantages sum to zero.
        let group = vec![
            make_sample(-1.0, -2.0, -2.0, -2.0),
            make_sample(1.0, -2.0, -2.0, -2.0),
            make_sample(-1.0, -2.0, -2.0, -2.0),
            make_sample(1.0, -2.0, -2.0, -2.0),
        ];
        let result = objective.compute_grpo_loss(&group).unwrap();
        assert!(result.policy_loss.abs() < 1e-9);
        assert!(result.total_loss.abs() < 1e-9);
        assert!((result.mean_ratio - 1.0).abs() < 1e-9);
        assert!(result.clip_fraction.abs() < 1e-9);
        // d loss / d logp = -A * w with w = 1 / (2 tokens * 4 samples)
        assert!((result.coefs[1][0] + 1.0 / 8.0).abs() < 1e-12);
        assert!((result.coefs[0][1] - 1.0 / 8.0).abs() < 1e-12);
    }

    #[test]
    fn test_grpo_loss_with_kl() {
        let objective = GrpoObjective::new(config(|a| a.beta = Some(0.1)), None, None);
        let group = vec![make_sample(0.0, -1.5, -1.5, -2.0), make_sample(0.0, -1.5, -1.5, -2.0)];
        let result = objective.compute_grpo_loss(&group).unwrap();

        // k3 with ref - logp = -0.5, averaged over tokens (bnpo).
        let expected = (-0.5f64).exp() + 0.5 - 1.0;
        assert!((result.kl_divergence - expected).abs() < 1e-9);
        assert!(result.total_loss > result.policy_loss);
        // KL pulls logp back towards the reference.
        assert!(result.coefs[0][0] > 0.0);
    }

    #[test]
    fn test_grpo_loss_clipping() {
        let objective = GrpoObjective::new(config(|_| {}), None, None);
        // ratio = exp(2) is far outside [0.8, 1.2]
        let group = vec![make_sample(1.0, -1.0, -3.0, -2.0), make_sample(-1.0, -1.0, -3.0, -2.0)];
        let result = objective.compute_grpo_loss(&group).unwrap();
        assert!((result.clip_fraction - 1.0).abs() < 1e-9);
        // Positive advantage: clipped branch is the minimum, no gradient.
        assert_eq!(result.coefs[0][0], 0.0);
        // Negative advantage: unclipped branch is the minimum.
        assert!(result.coefs[1][0] > 0.0);
    }

    #[test]
    fn test_dr_grpo_normalises_by_budget() {
        let objective = GrpoObjective::new(config(|a| a.loss_type = Some(GrpoLossType::DrGrpo)), None, None);
        let group = vec![make_sample(1.0, -2.0, -2.0, -2.0), make_sample(-1.0, -2.0, -2.0, -2.0)];
        let result = objective.compute_grpo_loss(&group).unwrap();
        // w = 1 / (2 samples * 8 max tokens)
        assert!((result.coefs[0][0] + 1.0 / 16.0).abs() < 1e-12);
    }

    #[test]
    fn test_grpo_loss_empty_batch() {
        let objective = GrpoObjective::new(config(|_| {}), None, None);
        assert!(objective.compute_grpo_loss(&[]).is_err());
    }

    // ------------------------------------------------------------------
    // Objective
    // ------------------------------------------------------------------

    #[test]
    fn test_batch_layout_keeps_groups_whole() {
        let objective = GrpoObjective::new(config(|_| {}), None, None);
        let args = TrainingConfig::default();
        assert_eq!(
            objective.batch_layout(&args),
            BatchLayout {
                micro_batch_size: 2,
                accumulation_steps: 1
            }
        );
        let args = TrainingConfig {
            per_device_train_batch_size: 2,
            gradient_accumulation_steps: 2,
            ..TrainingConfig::default()
        };
        assert_eq!(objective.batch_layout(&args).micro_batch_size, 1);
        assert_eq!(objective.batch_layout(&args).accumulation_steps, 1);
    }

    #[test]
    fn test_prompt_column_required() {
        let objective = GrpoObjective::new(config(|_| {}), None, None);
        let row = Example {
            text: Some("no prompt".into()),
            ..Default::default()
        };
        assert!(objective.prepare(&Tokenizer::default(), &[row]).is_err());
    }

    #[test]
    fn test_rollout_scores_and_produces_gradients() {
        let model = TinyLm::new(TinyLmConfig::default(), &mut StdRng::seed_from_u64(9));
        let reward_model = TinyRewardModel::new(RewardModelConfig::default(), &mut StdRng::seed_from_u64(10));
        let mut objective = GrpoObjective::new(
            config(|a| a.beta = Some(0.04)),
            Some(model.clone()),
            Some(Box::new(reward_model)),
        );
        let records = objective
            .prepare(&model.tokenizer(), &[Example { prompt: Some("Errors should".into()), ..Default::default() }])
            .unwrap();
        let batch: Vec<_> = records.iter().collect();

        let mut grads = vec![0.0; model.parameters().len()];
        let out = objective
            .compute_loss(&model, &batch, Some(grads.as_mut_slice()), &mut StdRng::seed_from_u64(0))
            .unwrap();
        assert!(out.loss.is_finite());
        assert!(out.metrics["completions/mean_length"] <= 8.0);
        assert!(out.metrics.contains_key("rewards/soft_overlong_punishment/mean"));
        assert!(out.metrics["kl"].abs() < 1e-9);
        assert!(grads.iter().any(|g| *g != 0.0));
    }
}
