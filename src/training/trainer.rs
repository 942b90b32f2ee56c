//! Generic optimisation loop shared by every objective.
//!
//! The [`Trainer`] owns the policy, the optimizer state and the bookkeeping
//! (logging, evaluation, checkpoints); an [`Objective`] turns dataset rows
//! into records and computes a loss with its gradient for a micro-batch.
//!
//! ```text
//! for each epoch:
//!     shuffle records (seeded)
//!     for each group of `gradient_accumulation_steps` micro-batches:
//!         grads = mean over micro-batches of d loss / d theta
//!         clip grads to max_grad_norm
//!         AdamW step at the scheduled learning rate
//!         log / evaluate / checkpoint on their cadence
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{IntervalStrategy, TrainingConfig};
use crate::data::Example;
use crate::model::{CausalLm, Tokenizer};
use crate::report::{Metrics, Reporter};

use super::optim::{clip_grad_norm, AdamW};
use super::scheduler::LrScheduler;

pub const TRAINER_STATE_NAME: &str = "trainer_state.json";
pub const TRAINING_ARGS_NAME: &str = "training_args.yaml";
const CHECKPOINT_PREFIX: &str = "checkpoint-";

// ---------------------------------------------------------------------------
// Objective seam
// ---------------------------------------------------------------------------

/// Loss of one micro-batch plus any objective-specific metrics.
#[derive(Debug, Clone, Default)]
pub struct LossOutput {
    pub loss: f64,
    pub metrics: Metrics,
}

/// How records are grouped into optimizer steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLayout {
    /// Records per forward/backward pass.
    pub micro_batch_size: usize,
    /// Micro-batches per optimizer step.
    pub accumulation_steps: usize,
}

pub trait Objective {
    type Record;

    fn name(&self) -> &'static str;

    /// Tokenize and convert dataset rows into training records.
    fn prepare(&self, tokenizer: &Tokenizer, rows: &[Example]) -> Result<Vec<Self::Record>>;

    fn batch_layout(&self, args: &TrainingConfig) -> BatchLayout {
        BatchLayout {
            micro_batch_size: args.per_device_train_batch_size,
            accumulation_steps: args.gradient_accumulation_steps,
        }
    }

    fn eval_batch_size(&self, args: &TrainingConfig) -> usize {
        args.per_device_eval_batch_size
    }

    /// Loss of `batch`. When `grads` is given, `d loss / d theta` is added to
    /// it in the layout of [`CausalLm::parameters`].
    fn compute_loss(
        &mut self,
        model: &dyn CausalLm,
        batch: &[&Self::Record],
        grads: Option<&mut [f32]>,
        rng: &mut StdRng,
    ) -> Result<LossOutput>;
}

// ---------------------------------------------------------------------------
// Persistent state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: f64,
    #[serde(flatten)]
    pub metrics: Metrics,
}

/// Contents of `trainer_state.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: f64,
    pub max_steps: usize,
    pub num_train_epochs: usize,
    pub logging_steps: usize,
    pub eval_steps: usize,
    pub save_steps: usize,
    pub train_batch_size: usize,
    pub log_history: Vec<LogEntry>,
}

/// Summary returned by [`Trainer::train`].
#[derive(Debug, Clone)]
pub struct TrainOutput {
    pub global_step: usize,
    pub training_loss: f64,
    pub metrics: Metrics,
}

/// Running means of named metrics.
#[derive(Debug, Default)]
struct MetricAccumulator {
    sums: BTreeMap<String, (f64, usize)>,
}

impl MetricAccumulator {
    fn add(&mut self, metrics: &Metrics) {
        for (key, value) in metrics {
            let entry = self.sums.entry(key.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }

    fn take_means(&mut self) -> Metrics {
        std::mem::take(&mut self.sums)
            .into_iter()
            .map(|(key, (sum, n))| (key, sum / n as f64))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

pub struct Trainer<M: CausalLm, O: Objective> {
    args: TrainingConfig,
    model: M,
    objective: O,
    train_dataset: Vec<O::Record>,
    eval_dataset: Option<Vec<O::Record>>,
    reporters: Vec<Box<dyn Reporter>>,
    run_record: Option<String>,
    rng: StdRng,
    state: TrainerState,
}

impl<M: CausalLm, O: Objective> Trainer<M, O> {
    /// Prepare the datasets and set up a trainer. `eval_rows` is required
    /// when `eval_strategy` is not `no`.
    pub fn new(
        model: M,
        objective: O,
        args: TrainingConfig,
        train_rows: &[Example],
        eval_rows: Option<&[Example]>,
    ) -> Result<Self> {
        let tokenizer = model.tokenizer();
        let train_dataset = objective
            .prepare(&tokenizer, train_rows)
            .context("failed to prepare the training split")?;
        if train_dataset.is_empty() {
            bail!("the training split produced no training examples");
        }
        let eval_dataset = match eval_rows {
            Some(rows) => Some(
                objective
                    .prepare(&tokenizer, rows)
                    .context("failed to prepare the evaluation split")?,
            ),
            None if args.eval_strategy != IntervalStrategy::No => {
                bail!("eval_strategy is `{:?}` but no evaluation split was provided", args.eval_strategy)
            }
            None => None,
        };

        debug!(
            objective = objective.name(),
            train = train_dataset.len(),
            eval = eval_dataset.as_ref().map_or(0, Vec::len),
            "Prepared datasets"
        );

        Ok(Self {
            rng: StdRng::seed_from_u64(args.seed),
            state: TrainerState {
                logging_steps: args.logging_steps,
                eval_steps: args.eval_steps,
                save_steps: args.save_steps,
                train_batch_size: args.per_device_train_batch_size,
                ..TrainerState::default()
            },
            args,
            model,
            objective,
            train_dataset,
            eval_dataset,
            reporters: Vec::new(),
            run_record: None,
        })
    }

    pub fn with_reporters(mut self, reporters: Vec<Box<dyn Reporter>>) -> Self {
        self.reporters = reporters;
        self
    }

    /// Configuration written as `training_args.yaml` with every save.
    pub fn with_run_record<T: Serialize>(mut self, record: &T) -> Result<Self> {
        self.run_record = Some(serde_yaml::to_string(record).context("failed to serialize the run configuration")?);
        Ok(self)
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn train(&mut self) -> Result<TrainOutput> {
        let layout = self.objective.batch_layout(&self.args);
        if layout.micro_batch_size == 0 || layout.accumulation_steps == 0 {
            bail!("batch layout {layout:?} must be non-zero");
        }
        let n = self.train_dataset.len();
        let micro_per_epoch = n.div_ceil(layout.micro_batch_size);
        let steps_per_epoch = micro_per_epoch.div_ceil(layout.accumulation_steps);
        let max_steps = match self.args.max_steps {
            Some(steps) => steps,
            None => ((self.args.num_train_epochs * steps_per_epoch as f64).ceil() as usize).max(1),
        };
        let scheduler = LrScheduler::from_config(&self.args, max_steps);
        let mut optimizer = AdamW::new(self.model.parameters().len(), &self.args);
        let mut grads = vec![0.0f32; self.model.parameters().len()];

        self.state.max_steps = max_steps;
        self.state.num_train_epochs = max_steps.div_ceil(steps_per_epoch);

        info!(
            objective = self.objective.name(),
            num_examples = n,
            num_epochs = self.state.num_train_epochs,
            micro_batch_size = layout.micro_batch_size,
            gradient_accumulation_steps = layout.accumulation_steps,
            total_optimization_steps = max_steps,
            warmup_steps = scheduler.warmup_steps(),
            num_trainable_parameters = grads.len(),
            "Starting training"
        );

        let start = Instant::now();
        let mut window_loss = 0.0;
        let mut window_steps = 0usize;
        let mut window_metrics = MetricAccumulator::default();
        let mut total_loss = 0.0;
        let mut epoch = 0usize;

        'epochs: loop {
            let mut order: Vec<usize> = (0..n).collect();
            order.shuffle(&mut self.rng);
            let micro_batches: Vec<&[usize]> = order.chunks(layout.micro_batch_size).collect();
            let steps_this_epoch = micro_batches.len().div_ceil(layout.accumulation_steps);

            for (i, step_batches) in micro_batches.chunks(layout.accumulation_steps).enumerate() {
                grads.fill(0.0);
                let mut step_loss = 0.0;
                for indices in step_batches {
                    let batch: Vec<&O::Record> = indices.iter().map(|&idx| &self.train_dataset[idx]).collect();
                    let out = self.objective.compute_loss(
                        &self.model,
                        &batch,
                        Some(grads.as_mut_slice()),
                        &mut self.rng,
                    )?;
                    step_loss += out.loss;
                    window_metrics.add(&out.metrics);
                }
                let scale = 1.0 / step_batches.len() as f32;
                for g in grads.iter_mut() {
                    *g *= scale;
                }
                step_loss /= step_batches.len() as f64;
                if !step_loss.is_finite() {
                    warn!(step = self.state.global_step + 1, "Non-finite loss");
                }

                let grad_norm = clip_grad_norm(&mut grads, self.args.max_grad_norm);
                let lr = scheduler.lr_at(self.state.global_step);
                optimizer.step(self.model.parameters_mut(), &grads, lr);

                self.state.global_step += 1;
                self.state.epoch = epoch as f64 + (i + 1) as f64 / steps_this_epoch as f64;
                total_loss += step_loss;
                window_loss += step_loss;
                window_steps += 1;

                debug!(step = self.state.global_step, loss = step_loss, grad_norm, lr, "Optimizer step");

                let step = self.state.global_step;
                if step % self.args.logging_steps == 0 {
                    let mut metrics = window_metrics.take_means();
                    metrics.insert("loss".into(), window_loss / window_steps as f64);
                    metrics.insert("grad_norm".into(), grad_norm);
                    metrics.insert("learning_rate".into(), lr);
                    self.log(metrics)?;
                    window_loss = 0.0;
                    window_steps = 0;
                }

                let epoch_end = i + 1 == steps_this_epoch;
                if self.due(self.args.eval_strategy, self.args.eval_steps, epoch_end) {
                    self.evaluate()?;
                }
                if self.due(self.args.save_strategy, self.args.save_steps, epoch_end) {
                    self.save_checkpoint()?;
                }

                if step >= max_steps {
                    break 'epochs;
                }
            }
            epoch += 1;
        }

        let runtime = start.elapsed().as_secs_f64();
        let training_loss = total_loss / self.state.global_step as f64;
        let mut metrics = Metrics::new();
        metrics.insert("train_runtime".into(), runtime);
        metrics.insert("train_samples_per_second".into(), (self.state.global_step * layout.micro_batch_size * layout.accumulation_steps) as f64 / runtime.max(1e-9));
        metrics.insert("train_steps_per_second".into(), self.state.global_step as f64 / runtime.max(1e-9));
        metrics.insert("train_loss".into(), training_loss);
        self.log(metrics.clone())?;
        for reporter in &mut self.reporters {
            reporter.finish()?;
        }

        info!(
            global_step = self.state.global_step,
            training_loss,
            runtime_secs = format!("{runtime:.2}"),
            "Training complete"
        );

        Ok(TrainOutput {
            global_step: self.state.global_step,
            training_loss,
            metrics,
        })
    }

    /// Loss and metrics over the evaluation split, prefixed with `eval_`.
    pub fn evaluate(&mut self) -> Result<Metrics> {
        let Some(eval_dataset) = &self.eval_dataset else {
            bail!("no evaluation dataset");
        };
        let batch_size = self.objective.eval_batch_size(&self.args).max(1);
        let mut loss = 0.0;
        let mut batches = 0usize;
        let mut accumulated = MetricAccumulator::default();
        for chunk in eval_dataset.chunks(batch_size) {
            let batch: Vec<&O::Record> = chunk.iter().collect();
            let out = self
                .objective
                .compute_loss(&self.model, &batch, None, &mut self.rng)?;
            loss += out.loss;
            batches += 1;
            accumulated.add(&out.metrics);
        }

        let mut metrics: Metrics = accumulated
            .take_means()
            .into_iter()
            .map(|(key, value)| (format!("eval_{key}"), value))
            .collect();
        metrics.insert("eval_loss".into(), if batches > 0 { loss / batches as f64 } else { f64::NAN });
        info!(step = self.state.global_step, eval_loss = metrics["eval_loss"], "Evaluation complete");
        self.log(metrics.clone())?;
        Ok(metrics)
    }

    /// Write the model, `trainer_state.json` and `training_args.yaml` into
    /// `output_dir`.
    pub fn save_model(&self) -> Result<()> {
        self.save_to(&self.args.output_dir)?;
        info!(path = %self.args.output_dir.display(), "Model saved");
        Ok(())
    }

    fn save_to(&self, dir: &Path) -> Result<()> {
        self.model
            .save_pretrained(dir)
            .with_context(|| format!("failed to save model to {}", dir.display()))?;
        let state_path = dir.join(TRAINER_STATE_NAME);
        std::fs::write(&state_path, serde_json::to_string_pretty(&self.state)?)
            .with_context(|| format!("failed to write {}", state_path.display()))?;
        if let Some(record) = &self.run_record {
            let args_path = dir.join(TRAINING_ARGS_NAME);
            std::fs::write(&args_path, record)
                .with_context(|| format!("failed to write {}", args_path.display()))?;
        }
        Ok(())
    }

    fn save_checkpoint(&mut self) -> Result<()> {
        let dir = self
            .args
            .output_dir
            .join(format!("{CHECKPOINT_PREFIX}{}", self.state.global_step));
        self.save_to(&dir)?;
        info!(path = %dir.display(), "Checkpoint saved");
        if let Some(limit) = self.args.save_total_limit {
            rotate_checkpoints(&self.args.output_dir, limit)?;
        }
        Ok(())
    }

    fn due(&self, strategy: IntervalStrategy, every: usize, epoch_end: bool) -> bool {
        match strategy {
            IntervalStrategy::No => false,
            IntervalStrategy::Steps => self.state.global_step % every == 0,
            IntervalStrategy::Epoch => epoch_end,
        }
    }

    fn log(&mut self, metrics: Metrics) -> Result<()> {
        let step = self.state.global_step;
        let epoch = self.state.epoch;
        for reporter in &mut self.reporters {
            reporter
                .log(step, epoch, &metrics)
                .with_context(|| format!("reporter `{}` failed", reporter.name()))?;
        }
        self.state.log_history.push(LogEntry { step, epoch, metrics });
        Ok(())
    }
}

/// Checkpoint directories under `output_dir`, oldest first.
pub fn list_checkpoints(output_dir: &Path) -> Result<Vec<(usize, PathBuf)>> {
    let mut checkpoints = Vec::new();
    if !output_dir.exists() {
        return Ok(checkpoints);
    }
    for entry in std::fs::read_dir(output_dir)
        .with_context(|| format!("failed to list {}", output_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let Some(step) = name
            .to_str()
            .and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX))
            .and_then(|s| s.parse::<usize>().ok())
        else {
            continue;
        };
        if entry.path().is_dir() {
            checkpoints.push((step, entry.path()));
        }
    }
    checkpoints.sort();
    Ok(checkpoints)
}

fn rotate_checkpoints(output_dir: &Path, limit: usize) -> Result<()> {
    let checkpoints = list_checkpoints(output_dir)?;
    let excess = checkpoints.len().saturating_sub(limit);
    for (step, path) in checkpoints.into_iter().take(excess) {
        debug!(step, path = %path.display(), "Deleting old checkpoint");
        std::fs::remove_dir_all(&path)
            .with_context(|| format!("failed to delete {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TinyLm, TinyLmConfig};

    /// Maximise the likelihood of one fixed token after BOS.
    struct TargetToken {
        token: u32,
    }

    impl Objective for TargetToken {
        type Record = ();

        fn name(&self) -> &'static str {
            "target"
        }

        fn prepare(&self, _tokenizer: &Tokenizer, rows: &[Example]) -> Result<Vec<()>> {
            Ok(vec![(); rows.len()])
        }

        fn compute_loss(
            &mut self,
            model: &dyn CausalLm,
            batch: &[&()],
            grads: Option<&mut [f32]>,
            _rng: &mut StdRng,
        ) -> Result<LossOutput> {
            let fwd = model.forward(&[], &[self.token]);
            if let Some(grads) = grads {
                let coef = -1.0 / batch.len() as f64;
                for _ in batch {
                    model.backward(&[], &[self.token], &[coef], grads);
                }
            }
            let mut metrics = Metrics::new();
            metrics.insert("prob".into(), fwd.log_probs[0].exp());
            Ok(LossOutput {
                loss: -fwd.log_probs[0],
                metrics,
            })
        }
    }

    fn rows(n: usize) -> Vec<Example> {
        vec![Example::default(); n]
    }

    fn args(dir: &Path) -> TrainingConfig {
        TrainingConfig {
            output_dir: dir.to_path_buf(),
            learning_rate: 0.1,
            num_train_epochs: 2.0,
            per_device_train_batch_size: 2,
            logging_steps: 1,
            report_to: Vec::new(),
            ..TrainingConfig::default()
        }
    }

    fn model() -> TinyLm {
        TinyLm::new(TinyLmConfig::default(), &mut StdRng::seed_from_u64(0))
    }

    #[test]
    fn test_loss_decreases_and_steps_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(model(), TargetToken { token: 65 }, args(dir.path()), &rows(5), None).unwrap();
        let out = trainer.train().unwrap();
        // 3 micro-batches per epoch, 2 epochs.
        assert_eq!(out.global_step, 6);
        let history = &trainer.state().log_history;
        let first = history.first().unwrap().metrics["loss"];
        let last_loss = history
            .iter()
            .rev()
            .find_map(|e| e.metrics.get("loss"))
            .copied()
            .unwrap();
        assert!(last_loss < first);
        assert!(history.last().unwrap().metrics.contains_key("train_loss"));
        assert!((trainer.state().epoch - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_max_steps_overrides_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig {
            max_steps: Some(7),
            gradient_accumulation_steps: 2,
            ..args(dir.path())
        };
        let mut trainer = Trainer::new(model(), TargetToken { token: 66 }, config, &rows(4), None).unwrap();
        assert_eq!(trainer.train().unwrap().global_step, 7);
    }

    #[test]
    fn test_checkpoints_rotate_and_final_save() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig {
            save_strategy: IntervalStrategy::Steps,
            save_steps: 1,
            save_total_limit: Some(2),
            ..args(dir.path())
        };
        let mut trainer = Trainer::new(model(), TargetToken { token: 67 }, config, &rows(4), None)
            .unwrap()
            .with_run_record(&BTreeMap::from([("seed", 42)]))
            .unwrap();
        trainer.train().unwrap();
        trainer.save_model().unwrap();

        let steps: Vec<usize> = list_checkpoints(dir.path()).unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(steps, vec![3, 4]);
        assert!(dir.path().join("checkpoint-4").join(TRAINER_STATE_NAME).exists());
        assert!(dir.path().join("config.json").exists());
        let record = std::fs::read_to_string(dir.path().join(TRAINING_ARGS_NAME)).unwrap();
        assert!(record.contains("seed: 42"));
        let state: TrainerState =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(TRAINER_STATE_NAME)).unwrap()).unwrap();
        assert_eq!(state.global_step, 4);
    }

    #[test]
    fn test_evaluation_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig {
            eval_strategy: IntervalStrategy::Epoch,
            ..args(dir.path())
        };
        let eval = rows(3);
        let mut trainer = Trainer::new(model(), TargetToken { token: 68 }, config, &rows(2), Some(eval.as_slice())).unwrap();
        trainer.train().unwrap();
        let evals: Vec<_> = trainer
            .state()
            .log_history
            .iter()
            .filter(|e| e.metrics.contains_key("eval_loss"))
            .collect();
        assert_eq!(evals.len(), 2);
        assert!(evals[0].metrics.contains_key("eval_prob"));
    }

    #[test]
    fn test_eval_strategy_requires_eval_rows() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig {
            eval_strategy: IntervalStrategy::Steps,
            ..args(dir.path())
        };
        assert!(Trainer::new(model(), TargetToken { token: 69 }, config, &rows(2), None).is_err());
    }

    #[test]
    fn test_empty_training_split_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Trainer::new(model(), TargetToken { token: 70 }, args(dir.path()), &[], None).is_err());
    }
}
