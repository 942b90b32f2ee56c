//! Supervised fine-tuning.
//!
//! Token-level cross-entropy averaged over the trained tokens of a batch:
//!
//!   L = -1/|T| * sum_{t in T} log p(x_t | x_<t)
//!
//! where T holds every token, or only completion tokens when
//! `completion_only_loss` applies to a prompt-completion dataset.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::SftConfig;
use crate::data::format::to_prompt_completion;
use crate::data::{DatasetFormat, Example};
use crate::model::tokenizer::truncate_right;
use crate::model::{CausalLm, Tokenizer};
use crate::report::Metrics;

use super::trainer::{LossOutput, Objective};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One tokenized training sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftRecord {
    pub input_ids: Vec<u32>,
    /// `true` where the token contributes to the loss.
    pub loss_mask: Vec<bool>,
}

impl SftRecord {
    pub fn num_trained_tokens(&self) -> usize {
        self.loss_mask.iter().filter(|m| **m).count()
    }
}

// ---------------------------------------------------------------------------
// Objective
// ---------------------------------------------------------------------------

pub struct SftObjective {
    config: SftConfig,
}

impl SftObjective {
    pub fn new(config: SftConfig) -> Self {
        Self { config }
    }

    fn tokenize(&self, tokenizer: &Tokenizer, rows: &[Example]) -> Result<Vec<SftRecord>> {
        let has_prompts = rows
            .first()
            .is_some_and(|r| r.format() == Some(DatasetFormat::PromptCompletion));
        let completion_only = self.config.completion_only_loss.unwrap_or(has_prompts);

        rows.iter()
            .enumerate()
            .map(|(i, row)| {
                let pair = to_prompt_completion(row, &self.config.dataset_text_field)
                    .with_context(|| format!("row {i}"))?;
                let prompt = tokenizer.encode(&pair.prompt);
                let completion = tokenizer.encode_completion(&pair.completion);
                let mut loss_mask = vec![!completion_only; prompt.len()];
                loss_mask.resize(prompt.len() + completion.len(), true);
                let mut input_ids = prompt;
                input_ids.extend(completion);
                Ok(SftRecord {
                    input_ids,
                    loss_mask,
                })
            })
            .collect()
    }
}

/// Concatenate records and cut the stream into `block_size` pieces. The last
/// block may be shorter.
pub fn pack_records(records: &[SftRecord], block_size: usize) -> Vec<SftRecord> {
    if block_size == 0 {
        return Vec::new();
    }
    let input_ids: Vec<u32> = records.iter().flat_map(|r| r.input_ids.iter().copied()).collect();
    let loss_mask: Vec<bool> = records.iter().flat_map(|r| r.loss_mask.iter().copied()).collect();
    input_ids
        .chunks(block_size)
        .zip(loss_mask.chunks(block_size))
        .map(|(ids, mask)| SftRecord {
            input_ids: ids.to_vec(),
            loss_mask: mask.to_vec(),
        })
        .collect()
}

impl Objective for SftObjective {
    type Record = SftRecord;

    fn name(&self) -> &'static str {
        "sft"
    }

    fn prepare(&self, tokenizer: &Tokenizer, rows: &[Example]) -> Result<Vec<SftRecord>> {
        let mut records = self.tokenize(tokenizer, rows)?;
        if self.config.packing {
            let block_size = self.config.max_length.unwrap_or(usize::MAX);
            let before = records.len();
            records = pack_records(&records, block_size);
            info!(examples = before, blocks = records.len(), block_size, "Packed dataset");
        } else {
            for record in &mut records {
                truncate_right(&mut record.input_ids, self.config.max_length);
                truncate_right_mask(&mut record.loss_mask, self.config.max_length);
            }
        }
        records.retain(|r| r.num_trained_tokens() > 0);
        debug!(records = records.len(), "Tokenized SFT dataset");
        Ok(records)
    }

    fn compute_loss(
        &mut self,
        model: &dyn CausalLm,
        batch: &[&SftRecord],
        mut grads: Option<&mut [f32]>,
        _rng: &mut StdRng,
    ) -> Result<LossOutput> {
        let trained: usize = batch.iter().map(|r| r.num_trained_tokens()).sum();
        let denom = trained.max(1) as f64;
        let mut nll = 0.0;
        let mut hits = 0usize;

        for record in batch {
            let fwd = model.forward(&[], &record.input_ids);
            for ((logp, hit), mask) in fwd.log_probs.iter().zip(&fwd.greedy).zip(&record.loss_mask) {
                if *mask {
                    nll -= logp;
                    hits += usize::from(*hit);
                }
            }
            if let Some(grads) = grads.as_deref_mut() {
                let coefs: Vec<f64> = record
                    .loss_mask
                    .iter()
                    .map(|&m| if m { -1.0 / denom } else { 0.0 })
                    .collect();
                model.backward(&[], &record.input_ids, &coefs, grads);
            }
        }

        let mut metrics = Metrics::new();
        metrics.insert("mean_token_accuracy".into(), hits as f64 / denom);
        metrics.insert(
            "num_tokens".into(),
            batch.iter().map(|r| r.input_ids.len()).sum::<usize>() as f64,
        );
        Ok(LossOutput {
            loss: nll / denom,
            metrics,
        })
    }
}

fn truncate_right_mask(mask: &mut Vec<bool>, max: Option<usize>) {
    if let Some(max) = max {
        mask.truncate(max);
    }
}
