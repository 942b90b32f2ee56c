//! Subcommand handlers: resolve configs, load collaborators, train, save.

use std::io::Write;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{
    CommonArgs, ConfigError, DpoCommand, DpoConfig, GrpoCommand, GrpoConfig, IntervalStrategy, KtoCommand,
    KtoConfig, ModelConfig, RunConfig, ScriptConfig, SftCommand, SftConfig, TorchDtype, TrainingArguments,
    TrainingConfig,
};
use crate::data::Example;
use crate::hub::{DatasetHub, ModelHub};
use crate::model::{CausalLm, LoraConfig, PeftModel, TinyLm};
use crate::report::build_reporters;
use crate::training::{DpoObjective, GrpoObjective, KtoObjective, Objective, SftObjective, TrainOutput, Trainer};

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

pub(super) fn sft<H: ModelHub + DatasetHub>(cmd: &SftCommand, hub: &H, out: &mut dyn Write) -> Result<()> {
    let run = resolve_common(&cmd.common, SftConfig::DEFAULT_LEARNING_RATE, |_| SftConfig::resolve(&cmd.sft))?;
    run_training(hub, &run, out, |_| Ok(SftObjective::new(run.algorithm.clone())))
}

pub(super) fn dpo<H: ModelHub + DatasetHub>(cmd: &DpoCommand, hub: &H, out: &mut dyn Write) -> Result<()> {
    let run = resolve_common(&cmd.common, DpoConfig::DEFAULT_LEARNING_RATE, |_| DpoConfig::resolve(&cmd.dpo))?;
    run_training(hub, &run, out, |base| {
        let reference = (!run.algorithm.reference_free).then(|| base.clone());
        Ok(DpoObjective::new(run.algorithm.clone(), reference))
    })
}

pub(super) fn kto<H: ModelHub + DatasetHub>(cmd: &KtoCommand, hub: &H, out: &mut dyn Write) -> Result<()> {
    let run = resolve_common(&cmd.common, KtoConfig::DEFAULT_LEARNING_RATE, |training| {
        KtoConfig::resolve(&cmd.kto, training)
    })?;
    run_training(hub, &run, out, |base| Ok(KtoObjective::new(run.algorithm.clone(), Some(base.clone()))))
}

pub(super) fn grpo<H: ModelHub + DatasetHub>(cmd: &GrpoCommand, hub: &H, out: &mut dyn Write) -> Result<()> {
    let run = resolve_common(&cmd.common, GrpoConfig::DEFAULT_LEARNING_RATE, |training| {
        GrpoConfig::resolve(&cmd.grpo, training)
    })?;
    run_training(hub, &run, out, |base| {
        let reward_model = run
            .algorithm
            .reward_model_name_or_path
            .as_deref()
            .map(|name| hub.load_reward_model(name, "main"))
            .transpose()?;
        let reference = (run.algorithm.beta > 0.0).then(|| base.clone());
        Ok(GrpoObjective::new(run.algorithm.clone(), reference, reward_model))
    })
}

// ---------------------------------------------------------------------------
// Shared pipeline
// ---------------------------------------------------------------------------

/// Resolve the shared groups, then the algorithm group against the resolved
/// training options.
fn resolve_common<A, F>(common: &CommonArgs, default_lr: f64, algorithm: F) -> Result<RunConfig<A>>
where
    F: FnOnce(&TrainingConfig) -> Result<A, ConfigError>,
{
    let training = resolve_training(&common.training, default_lr)?;
    Ok(RunConfig {
        script: ScriptConfig::resolve(&common.script)?,
        model: ModelConfig::resolve(&common.model)?,
        algorithm: algorithm(&training)?,
        training,
    })
}

fn resolve_training(args: &TrainingArguments, learning_rate: f64) -> Result<TrainingConfig> {
    let defaults = TrainingConfig {
        learning_rate,
        ..TrainingConfig::default()
    };
    Ok(TrainingConfig::resolve(args, defaults)?)
}

/// Load the model and dataset, build the objective from the freshly loaded
/// base weights, train and save into `output_dir`.
fn run_training<H, A, O, F>(hub: &H, run: &RunConfig<A>, out: &mut dyn Write, make_objective: F) -> Result<()>
where
    H: ModelHub + DatasetHub,
    A: Serialize,
    O: Objective,
    F: FnOnce(&TinyLm) -> Result<O>,
{
    let model_config = &run.model;
    if model_config.torch_dtype != TorchDtype::Auto {
        debug!(torch_dtype = ?model_config.torch_dtype, "Built-in models always compute in float32");
    }
    if model_config.trust_remote_code {
        debug!("trust_remote_code has no effect on built-in models");
    }

    let base = hub
        .load_causal_lm(&model_config.model_name_or_path, &model_config.model_revision)
        .with_context(|| format!("failed to load model `{}`", model_config.model_name_or_path))?;
    let objective = make_objective(&base)?;

    let script = &run.script;
    let dataset = hub
        .load_dataset(&script.dataset_name, script.dataset_config.as_deref())
        .with_context(|| format!("failed to load dataset `{}`", script.dataset_name))?;
    let train_rows = dataset.split(&script.dataset_train_split)?;
    let eval_rows = if run.training.eval_strategy == IntervalStrategy::No {
        None
    } else {
        Some(dataset.split(&script.dataset_test_split)?)
    };

    let output = if model_config.use_peft {
        let lora = LoraConfig::new(
            model_config.lora_r,
            model_config.lora_alpha,
            model_config.lora_dropout,
            &model_config.model_name_or_path,
        );
        if model_config.lora_dropout > 0.0 {
            debug!(lora_dropout = model_config.lora_dropout, "Adapter dropout is recorded but not applied");
        }
        let mut rng = StdRng::seed_from_u64(run.training.seed);
        let model = PeftModel::new(base, lora, &mut rng);
        fit(model, objective, run, train_rows, eval_rows)?
    } else {
        fit(base, objective, run, train_rows, eval_rows)?
    };

    writeln!(
        out,
        "Training finished after {} steps (train_loss {:.4}); model saved to {}",
        output.global_step,
        output.training_loss,
        run.training.output_dir.display()
    )?;
    Ok(())
}

fn fit<M, O, A>(
    model: M,
    objective: O,
    run: &RunConfig<A>,
    train_rows: &[Example],
    eval_rows: Option<&[Example]>,
) -> Result<TrainOutput>
where
    M: CausalLm,
    O: Objective,
    A: Serialize,
{
    let training = &run.training;
    let reporters = build_reporters(&training.report_to, &training.output_dir, &training.run_name)?;
    info!(
        objective = objective.name(),
        model = %run.model.model_name_or_path,
        dataset = %run.script.dataset_name,
        output_dir = %training.output_dir.display(),
        reporters = reporters.len(),
        "Setting up trainer"
    );

    let mut trainer = Trainer::new(model, objective, training.clone(), train_rows, eval_rows)?
        .with_reporters(reporters)
        .with_run_record(run)?;
    let output = trainer.train()?;
    trainer.save_model()?;
    Ok(output)
}
