//! Resolved, fully-defaulted run configuration.
//!
//! The flag/file surface lives in [`super::args`] where every field is
//! optional. The structs here are what the trainers consume: each one is
//! built by layering the merged arguments over its `Default` and is then
//! validated.

use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use super::args::{
    DpoArguments, GrpoArguments, KtoArguments, ModelArguments, ScriptArguments, SftArguments,
    TrainingArguments,
};
use super::error::ConfigError;

// ---------------------------------------------------------------------------
// Enumerated options
// ---------------------------------------------------------------------------

/// Learning-rate schedule applied over the optimizer steps of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerType {
    Linear,
    Cosine,
    #[value(name = "cosine_with_restarts")]
    CosineWithRestarts,
    Polynomial,
    Constant,
    #[value(name = "constant_with_warmup")]
    ConstantWithWarmup,
    #[value(name = "inverse_sqrt")]
    InverseSqrt,
}

/// When to evaluate or checkpoint during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum IntervalStrategy {
    No,
    Steps,
    Epoch,
}

/// Requested parameter precision. The built-in models compute in `f32`
/// whatever is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TorchDtype {
    Auto,
    Float32,
    Float16,
    Bfloat16,
}

/// Destination for training metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ReportTo {
    /// Disable reporting entirely.
    None,
    /// Every sink compiled into this build.
    All,
    /// Append one JSON object per logging step to `<output_dir>/metrics.jsonl`.
    Jsonl,
    /// Emit metrics as structured `tracing` events.
    Tracing,
}

impl ReportTo {
    /// Concrete sinks available in this build, in the order `all` expands to.
    pub const AVAILABLE: [ReportTo; 2] = [ReportTo::Jsonl, ReportTo::Tracing];

    pub fn as_str(self) -> &'static str {
        match self {
            ReportTo::None => "none",
            ReportTo::All => "all",
            ReportTo::Jsonl => "jsonl",
            ReportTo::Tracing => "tracing",
        }
    }
}

/// Preference loss variants for DPO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DpoLossType {
    Sigmoid,
    Hinge,
    Ipo,
    Robust,
    #[value(name = "bco_pair")]
    BcoPair,
    #[value(name = "sppo_hard")]
    SppoHard,
    #[value(name = "nca_pair")]
    NcaPair,
    #[value(name = "apo_zero")]
    ApoZero,
    #[value(name = "apo_down")]
    ApoDown,
}

/// Loss variants for KTO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum KtoLossType {
    Kto,
    #[value(name = "apo_zero_unpaired")]
    ApoZeroUnpaired,
}

/// Token normalisation of the GRPO surrogate loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum GrpoLossType {
    /// Mean over each sequence's tokens, then mean over sequences.
    Grpo,
    /// Sum over every token of the batch divided by the token count.
    Bnpo,
    /// Sum divided by `sequences * max_completion_length`.
    #[value(name = "dr_grpo")]
    DrGrpo,
}

/// Built-in reward functions selectable with `--reward_funcs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RewardFunc {
    #[value(name = "think_format_reward")]
    ThinkFormatReward,
    #[value(name = "soft_overlong_punishment")]
    SoftOverlongPunishment,
}

// ---------------------------------------------------------------------------
// Shared groups
// ---------------------------------------------------------------------------

/// Which dataset to train on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    pub dataset_name: String,
    pub dataset_config: Option<String>,
    pub dataset_train_split: String,
    pub dataset_test_split: String,
}

impl ScriptConfig {
    pub fn resolve(args: &ScriptArguments) -> Result<Self, ConfigError> {
        let dataset_name = args
            .dataset_name
            .clone()
            .ok_or(ConfigError::Missing("dataset_name"))?;
        Ok(Self {
            dataset_name,
            dataset_config: args.dataset_config.clone(),
            dataset_train_split: args
                .dataset_train_split
                .clone()
                .unwrap_or_else(|| "train".into()),
            dataset_test_split: args
                .dataset_test_split
                .clone()
                .unwrap_or_else(|| "test".into()),
        })
    }
}

/// Which model to fine-tune and whether to wrap it in a LoRA adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_name_or_path: String,
    pub model_revision: String,
    pub trust_remote_code: bool,
    pub torch_dtype: TorchDtype,
    pub use_peft: bool,
    pub lora_r: usize,
    pub lora_alpha: f64,
    pub lora_dropout: f64,
}

impl ModelConfig {
    pub fn resolve(args: &ModelArguments) -> Result<Self, ConfigError> {
        let model_name_or_path = args
            .model_name_or_path
            .clone()
            .ok_or(ConfigError::Missing("model_name_or_path"))?;
        let config = Self {
            model_name_or_path,
            model_revision: args.model_revision.clone().unwrap_or_else(|| "main".into()),
            trust_remote_code: args.trust_remote_code.unwrap_or(false),
            torch_dtype: args.torch_dtype.unwrap_or(TorchDtype::Auto),
            use_peft: args.use_peft.unwrap_or(false),
            lora_r: args.lora_r.unwrap_or(16),
            lora_alpha: args.lora_alpha.unwrap_or(32.0),
            lora_dropout: args.lora_dropout.unwrap_or(0.05),
        };
        if config.use_peft && config.lora_r == 0 {
            return Err(ConfigError::invalid("lora_r", "must be at least 1"));
        }
        if !(0.0..1.0).contains(&config.lora_dropout) {
            return Err(ConfigError::invalid("lora_dropout", "must be in [0, 1)"));
        }
        Ok(config)
    }
}

/// Optimisation, scheduling, logging and checkpointing options shared by
/// every trainer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub output_dir: PathBuf,
    pub learning_rate: f64,
    pub num_train_epochs: f64,
    /// Overrides `num_train_epochs` when set.
    pub max_steps: Option<usize>,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub lr_scheduler_type: SchedulerType,
    pub warmup_ratio: f64,
    pub warmup_steps: usize,
    pub weight_decay: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
    pub max_grad_norm: f64,
    pub logging_steps: usize,
    pub eval_strategy: IntervalStrategy,
    pub eval_steps: usize,
    pub save_strategy: IntervalStrategy,
    pub save_steps: usize,
    pub save_total_limit: Option<usize>,
    pub seed: u64,
    /// Concrete sinks, with `all` already expanded and `none` mapped to empty.
    pub report_to: Vec<ReportTo>,
    pub run_name: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::new(),
            learning_rate: 5e-5,
            num_train_epochs: 3.0,
            max_steps: None,
            per_device_train_batch_size: 8,
            per_device_eval_batch_size: 8,
            gradient_accumulation_steps: 1,
            lr_scheduler_type: SchedulerType::Linear,
            warmup_ratio: 0.0,
            warmup_steps: 0,
            weight_decay: 0.0,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
            max_grad_norm: 1.0,
            logging_steps: 10,
            eval_strategy: IntervalStrategy::No,
            eval_steps: 10,
            save_strategy: IntervalStrategy::No,
            save_steps: 500,
            save_total_limit: None,
            seed: 42,
            report_to: ReportTo::AVAILABLE.to_vec(),
            run_name: String::new(),
        }
    }
}

impl TrainingConfig {
    /// Layer `args` over `defaults` and validate the result.
    pub fn resolve(args: &TrainingArguments, defaults: TrainingConfig) -> Result<Self, ConfigError> {
        let output_dir = args
            .output_dir
            .clone()
            .ok_or(ConfigError::Missing("output_dir"))?;
        let logging_steps = args.logging_steps.unwrap_or(defaults.logging_steps);
        let config = Self {
            run_name: args
                .run_name
                .clone()
                .unwrap_or_else(|| output_dir.display().to_string()),
            output_dir,
            learning_rate: args.learning_rate.unwrap_or(defaults.learning_rate),
            num_train_epochs: args.num_train_epochs.unwrap_or(defaults.num_train_epochs),
            max_steps: match args.max_steps {
                Some(steps) if steps > 0 => Some(steps as usize),
                Some(_) => None,
                None => defaults.max_steps,
            },
            per_device_train_batch_size: args
                .per_device_train_batch_size
                .unwrap_or(defaults.per_device_train_batch_size),
            per_device_eval_batch_size: args
                .per_device_eval_batch_size
                .unwrap_or(defaults.per_device_eval_batch_size),
            gradient_accumulation_steps: args
                .gradient_accumulation_steps
                .unwrap_or(defaults.gradient_accumulation_steps),
            lr_scheduler_type: args.lr_scheduler_type.unwrap_or(defaults.lr_scheduler_type),
            warmup_ratio: args.warmup_ratio.unwrap_or(defaults.warmup_ratio),
            warmup_steps: args.warmup_steps.unwrap_or(defaults.warmup_steps),
            weight_decay: args.weight_decay.unwrap_or(defaults.weight_decay),
            adam_beta1: args.adam_beta1.unwrap_or(defaults.adam_beta1),
            adam_beta2: args.adam_beta2.unwrap_or(defaults.adam_beta2),
            adam_epsilon: args.adam_epsilon.unwrap_or(defaults.adam_epsilon),
            max_grad_norm: args.max_grad_norm.unwrap_or(defaults.max_grad_norm),
            logging_steps,
            eval_strategy: args.eval_strategy.unwrap_or(defaults.eval_strategy),
            // Evaluation follows the logging cadence unless told otherwise.
            eval_steps: args.eval_steps.unwrap_or(logging_steps),
            save_strategy: args.save_strategy.unwrap_or(defaults.save_strategy),
            save_steps: args.save_steps.unwrap_or(defaults.save_steps),
            save_total_limit: args.save_total_limit.or(defaults.save_total_limit),
            seed: args.seed.unwrap_or(defaults.seed),
            report_to: match &args.report_to {
                Some(sinks) => expand_report_to(sinks)?,
                None => defaults.report_to,
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.learning_rate < 0.0 {
            return Err(ConfigError::invalid("learning_rate", "must be non-negative"));
        }
        if self.max_steps.is_none() && self.num_train_epochs <= 0.0 {
            return Err(ConfigError::invalid(
                "num_train_epochs",
                "must be positive when max_steps is not set",
            ));
        }
        for (field, value) in [
            ("per_device_train_batch_size", self.per_device_train_batch_size),
            ("per_device_eval_batch_size", self.per_device_eval_batch_size),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("logging_steps", self.logging_steps),
            ("eval_steps", self.eval_steps),
            ("save_steps", self.save_steps),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be at least 1"));
            }
        }
        if !(0.0..=1.0).contains(&self.warmup_ratio) {
            return Err(ConfigError::invalid("warmup_ratio", "must be in [0, 1]"));
        }
        if !(0.0..1.0).contains(&self.adam_beta1) || !(0.0..1.0).contains(&self.adam_beta2) {
            return Err(ConfigError::invalid("adam_beta1", "betas must be in [0, 1)"));
        }
        Ok(())
    }

    /// Number of examples consumed per optimizer step.
    pub fn effective_batch_size(&self) -> usize {
        self.per_device_train_batch_size * self.gradient_accumulation_steps
    }
}

fn expand_report_to(sinks: &[ReportTo]) -> Result<Vec<ReportTo>, ConfigError> {
    if sinks.contains(&ReportTo::None) {
        if sinks.len() > 1 {
            return Err(ConfigError::invalid(
                "report_to",
                "`none` cannot be combined with other integrations",
            ));
        }
        return Ok(Vec::new());
    }
    let mut expanded = Vec::new();
    for sink in sinks {
        let concrete: &[ReportTo] = match sink {
            ReportTo::All => &ReportTo::AVAILABLE,
            other => std::slice::from_ref(other),
        };
        for s in concrete {
            if !expanded.contains(s) {
                expanded.push(*s);
            }
        }
    }
    Ok(expanded)
}

// ---------------------------------------------------------------------------
// Algorithm groups
// ---------------------------------------------------------------------------

/// Supervised fine-tuning options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftConfig {
    pub max_length: Option<usize>,
    pub packing: bool,
    pub dataset_text_field: String,
    /// `None` means: completion-only when the dataset has a prompt/completion
    /// split, full-sequence loss otherwise.
    pub completion_only_loss: Option<bool>,
}

impl SftConfig {
    pub const DEFAULT_LEARNING_RATE: f64 = 2e-5;

    pub fn resolve(args: &SftArguments) -> Result<Self, ConfigError> {
        let config = Self {
            max_length: args.max_length.or(Some(1024)),
            packing: args.packing.unwrap_or(false),
            dataset_text_field: args
                .dataset_text_field
                .clone()
                .unwrap_or_else(|| "text".into()),
            completion_only_loss: args.completion_only_loss,
        };
        if config.packing && config.max_length.is_none() {
            return Err(ConfigError::invalid("max_length", "packing requires a max_length"));
        }
        if config.max_length == Some(0) {
            return Err(ConfigError::invalid("max_length", "must be at least 1"));
        }
        Ok(config)
    }
}

/// Direct preference optimisation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpoConfig {
    pub beta: f64,
    pub loss_type: Vec<DpoLossType>,
    /// One weight per entry of `loss_type`, paired positionally.
    pub loss_weights: Vec<f64>,
    pub label_smoothing: f64,
    pub max_prompt_length: Option<usize>,
    pub max_completion_length: Option<usize>,
    pub max_length: Option<usize>,
    pub reference_free: bool,
}

impl DpoConfig {
    pub const DEFAULT_LEARNING_RATE: f64 = 1e-6;

    pub fn resolve(args: &DpoArguments) -> Result<Self, ConfigError> {
        let loss_type = match &args.loss_type {
            Some(types) if !types.is_empty() => types.clone(),
            _ => vec![DpoLossType::Sigmoid],
        };
        let loss_weights = match &args.loss_weights {
            Some(weights) => {
                if weights.len() != loss_type.len() {
                    return Err(ConfigError::invalid(
                        "loss_weights",
                        format!(
                            "got {} weights for {} loss types; the lists are paired positionally and must have the same length",
                            weights.len(),
                            loss_type.len()
                        ),
                    ));
                }
                weights.clone()
            }
            None => vec![1.0; loss_type.len()],
        };
        let config = Self {
            beta: args.beta.unwrap_or(0.1),
            loss_type,
            loss_weights,
            label_smoothing: args.label_smoothing.unwrap_or(0.0),
            max_prompt_length: args.max_prompt_length.or(Some(512)),
            max_completion_length: args.max_completion_length,
            max_length: args.max_length.or(Some(1024)),
            reference_free: args.reference_free.unwrap_or(false),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.beta <= 0.0 {
            return Err(ConfigError::invalid("beta", "must be positive"));
        }
        if !(0.0..0.5).contains(&self.label_smoothing) {
            return Err(ConfigError::invalid("label_smoothing", "must be in [0, 0.5)"));
        }
        if self.label_smoothing > 0.0
            && self
                .loss_type
                .iter()
                .any(|t| !matches!(t, DpoLossType::Sigmoid | DpoLossType::Robust))
        {
            return Err(ConfigError::invalid(
                "label_smoothing",
                "only supported by the `sigmoid` and `robust` losses",
            ));
        }
        if self.loss_weights.iter().any(|w| !w.is_finite()) {
            return Err(ConfigError::invalid("loss_weights", "weights must be finite"));
        }
        Ok(())
    }
}

/// Kahneman-Tversky optimisation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KtoConfig {
    pub beta: f64,
    pub loss_type: KtoLossType,
    pub desirable_weight: f64,
    pub undesirable_weight: f64,
    pub max_prompt_length: Option<usize>,
    pub max_completion_length: Option<usize>,
    pub max_length: Option<usize>,
}

impl KtoConfig {
    pub const DEFAULT_LEARNING_RATE: f64 = 1e-6;

    pub fn resolve(args: &KtoArguments, training: &TrainingConfig) -> Result<Self, ConfigError> {
        let config = Self {
            beta: args.beta.unwrap_or(0.1),
            loss_type: args.loss_type.unwrap_or(KtoLossType::Kto),
            desirable_weight: args.desirable_weight.unwrap_or(1.0),
            undesirable_weight: args.undesirable_weight.unwrap_or(1.0),
            max_prompt_length: args.max_prompt_length.or(Some(512)),
            max_completion_length: args.max_completion_length,
            max_length: args.max_length.or(Some(1024)),
        };
        if config.beta <= 0.0 {
            return Err(ConfigError::invalid("beta", "must be positive"));
        }
        if config.desirable_weight < 0.0 || config.undesirable_weight < 0.0 {
            return Err(ConfigError::invalid(
                "desirable_weight",
                "class weights must be non-negative",
            ));
        }
        // The KL baseline is estimated from mismatched pairs inside a batch.
        if config.loss_type == KtoLossType::Kto && training.per_device_train_batch_size < 2 {
            return Err(ConfigError::invalid(
                "per_device_train_batch_size",
                "the `kto` loss needs at least 2 examples per batch to estimate the KL term",
            ));
        }
        Ok(config)
    }
}

/// Group relative policy optimisation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpoConfig {
    pub reward_model_name_or_path: Option<String>,
    pub reward_funcs: Vec<RewardFunc>,
    pub num_generations: usize,
    pub max_prompt_length: Option<usize>,
    pub max_completion_length: usize,
    pub temperature: f64,
    pub beta: f64,
    pub epsilon: f64,
    pub epsilon_high: f64,
    pub loss_type: GrpoLossType,
    pub scale_rewards: bool,
}

impl GrpoConfig {
    pub const DEFAULT_LEARNING_RATE: f64 = 1e-6;

    pub fn resolve(args: &GrpoArguments, training: &TrainingConfig) -> Result<Self, ConfigError> {
        let epsilon = args.epsilon.unwrap_or(0.2);
        let config = Self {
            reward_model_name_or_path: args.reward_model_name_or_path.clone(),
            reward_funcs: args.reward_funcs.clone().unwrap_or_default(),
            num_generations: args.num_generations.unwrap_or(8),
            max_prompt_length: args.max_prompt_length.or(Some(512)),
            max_completion_length: args.max_completion_length.unwrap_or(256),
            temperature: args.temperature.unwrap_or(1.0),
            beta: args.beta.unwrap_or(0.0),
            epsilon,
            epsilon_high: args.epsilon_high.unwrap_or(epsilon),
            loss_type: args.loss_type.unwrap_or(GrpoLossType::Bnpo),
            scale_rewards: args.scale_rewards.unwrap_or(true),
        };
        config.validate(training)?;
        Ok(config)
    }

    fn validate(&self, training: &TrainingConfig) -> Result<(), ConfigError> {
        if self.num_generations < 2 {
            return Err(ConfigError::invalid(
                "num_generations",
                "group-relative advantages need at least 2 generations per prompt",
            ));
        }
        let effective = training.effective_batch_size();
        if effective % self.num_generations != 0 {
            return Err(ConfigError::invalid(
                "num_generations",
                format!(
                    "the effective batch size ({effective}) must be evenly divisible by the number of generations per prompt ({})",
                    self.num_generations
                ),
            ));
        }
        if self.max_completion_length == 0 {
            return Err(ConfigError::invalid("max_completion_length", "must be at least 1"));
        }
        if self.temperature <= 0.0 {
            return Err(ConfigError::invalid("temperature", "must be positive"));
        }
        if self.beta < 0.0 {
            return Err(ConfigError::invalid("beta", "must be non-negative"));
        }
        if self.epsilon < 0.0 || self.epsilon_high < 0.0 {
            return Err(ConfigError::invalid("epsilon", "clip bounds must be non-negative"));
        }
        if self.reward_model_name_or_path.is_none() && self.reward_funcs.is_empty() {
            return Err(ConfigError::invalid(
                "reward_model_name_or_path",
                "provide a reward model or at least one reward function",
            ));
        }
        Ok(())
    }

    /// Distinct prompts consumed per optimizer step.
    pub fn prompts_per_step(&self, training: &TrainingConfig) -> usize {
        training.effective_batch_size() / self.num_generations
    }
}

// ---------------------------------------------------------------------------
// Whole-run record
// ---------------------------------------------------------------------------

/// Everything a trainer needs, written next to the model as
/// `training_args.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig<A> {
    #[serde(flatten)]
    pub script: ScriptConfig,
    #[serde(flatten)]
    pub model: ModelConfig,
    #[serde(flatten)]
    pub training: TrainingConfig,
    #[serde(flatten)]
    pub algorithm: A,
}
