//! Flag surface shared by the command line and the YAML config file.
//!
//! Every field is optional so that an absent flag can be told apart from one
//! set to its default value; [`super::file::merge_sources`] layers the command
//! line over the file and [`super::types`] fills in the rest. Flag names are
//! snake_case and double as the config file keys.

use std::path::PathBuf;

use clap::Args;
use serde::{Deserialize, Serialize};

use super::types::{
    DpoLossType, GrpoLossType, IntervalStrategy, KtoLossType, ReportTo, RewardFunc, SchedulerType,
    TorchDtype,
};

/// Dataset selection.
#[derive(Debug, Clone, Default, Args, Serialize, Deserialize)]
pub struct ScriptArguments {
    /// Dataset identifier or local path.
    #[arg(long = "dataset_name")]
    pub dataset_name: Option<String>,

    /// Dataset configuration (subset) name.
    #[arg(long = "dataset_config")]
    pub dataset_config: Option<String>,

    /// Split used for training [default: train].
    #[arg(long = "dataset_train_split")]
    pub dataset_train_split: Option<String>,

    /// Split used for evaluation [default: test].
    #[arg(long = "dataset_test_split")]
    pub dataset_test_split: Option<String>,
}

/// Model selection and adapter options.
#[derive(Debug, Clone, Default, Args, Serialize, Deserialize)]
pub struct ModelArguments {
    /// Model identifier or path of a locally saved model.
    #[arg(long = "model_name_or_path")]
    pub model_name_or_path: Option<String>,

    /// Model revision [default: main].
    #[arg(long = "model_revision")]
    pub model_revision: Option<String>,

    /// Accepted for compatibility; built-in models never run remote code.
    #[arg(long = "trust_remote_code", num_args = 0..=1, default_missing_value = "true")]
    pub trust_remote_code: Option<bool>,

    /// Parameter dtype [default: auto].
    #[arg(long = "torch_dtype", value_enum)]
    pub torch_dtype: Option<TorchDtype>,

    /// Train a low-rank adapter instead of the full model.
    #[arg(long = "use_peft", num_args = 0..=1, default_missing_value = "true")]
    pub use_peft: Option<bool>,

    /// Adapter rank [default: 16].
    #[arg(long = "lora_r")]
    pub lora_r: Option<usize>,

    /// Adapter scaling numerator [default: 32].
    #[arg(long = "lora_alpha")]
    pub lora_alpha: Option<f64>,

    /// Adapter dropout, recorded in the adapter config [default: 0.05].
    #[arg(long = "lora_dropout")]
    pub lora_dropout: Option<f64>,
}

/// Optimisation, logging and checkpointing.
#[derive(Debug, Clone, Default, Args, Serialize, Deserialize)]
pub struct TrainingArguments {
    /// Directory the trained model and run artifacts are written to.
    #[arg(long = "output_dir")]
    pub output_dir: Option<PathBuf>,

    #[arg(long = "learning_rate")]
    pub learning_rate: Option<f64>,

    /// Number of passes over the training split [default: 3].
    #[arg(long = "num_train_epochs")]
    pub num_train_epochs: Option<f64>,

    /// Total optimizer steps; overrides `num_train_epochs` when positive.
    #[arg(long = "max_steps", allow_negative_numbers = true)]
    pub max_steps: Option<i64>,

    #[arg(long = "per_device_train_batch_size")]
    pub per_device_train_batch_size: Option<usize>,

    #[arg(long = "per_device_eval_batch_size")]
    pub per_device_eval_batch_size: Option<usize>,

    #[arg(long = "gradient_accumulation_steps")]
    pub gradient_accumulation_steps: Option<usize>,

    #[arg(long = "lr_scheduler_type", value_enum)]
    pub lr_scheduler_type: Option<SchedulerType>,

    #[arg(long = "warmup_ratio")]
    pub warmup_ratio: Option<f64>,

    /// Warmup length in steps; takes precedence over `warmup_ratio`.
    #[arg(long = "warmup_steps")]
    pub warmup_steps: Option<usize>,

    #[arg(long = "weight_decay")]
    pub weight_decay: Option<f64>,

    #[arg(long = "adam_beta1")]
    pub adam_beta1: Option<f64>,

    #[arg(long = "adam_beta2")]
    pub adam_beta2: Option<f64>,

    #[arg(long = "adam_epsilon")]
    pub adam_epsilon: Option<f64>,

    /// Clip gradients to this global norm; 0 disables clipping.
    #[arg(long = "max_grad_norm")]
    pub max_grad_norm: Option<f64>,

    #[arg(long = "logging_steps")]
    pub logging_steps: Option<usize>,

    #[arg(long = "eval_strategy", value_enum)]
    pub eval_strategy: Option<IntervalStrategy>,

    #[arg(long = "eval_steps")]
    pub eval_steps: Option<usize>,

    #[arg(long = "save_strategy", value_enum)]
    pub save_strategy: Option<IntervalStrategy>,

    #[arg(long = "save_steps")]
    pub save_steps: Option<usize>,

    /// Keep at most this many `checkpoint-*` directories.
    #[arg(long = "save_total_limit")]
    pub save_total_limit: Option<usize>,

    #[arg(long = "seed")]
    pub seed: Option<u64>,

    /// Reporting sinks; `none` disables reporting [default: all].
    #[arg(long = "report_to", value_enum, num_args = 1..)]
    pub report_to: Option<Vec<ReportTo>>,

    #[arg(long = "run_name")]
    pub run_name: Option<String>,
}

/// Flags every training subcommand accepts.
#[derive(Debug, Clone, Default, Args, Serialize, Deserialize)]
pub struct CommonArgs {
    /// YAML file whose keys supply defaults for any flag not given here.
    #[arg(long = "config")]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    #[serde(flatten)]
    pub script: ScriptArguments,

    #[command(flatten)]
    #[serde(flatten)]
    pub model: ModelArguments,

    #[command(flatten)]
    #[serde(flatten)]
    pub training: TrainingArguments,
}

// ---------------------------------------------------------------------------
// Algorithm-specific flags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Args, Serialize, Deserialize)]
pub struct SftArguments {
    /// Truncate (or pack) sequences to this many tokens [default: 1024].
    #[arg(long = "max_length")]
    pub max_length: Option<usize>,

    /// Concatenate examples into fixed-length blocks.
    #[arg(long = "packing", num_args = 0..=1, default_missing_value = "true")]
    pub packing: Option<bool>,

    /// Column holding the text of language-modeling datasets [default: text].
    #[arg(long = "dataset_text_field")]
    pub dataset_text_field: Option<String>,

    /// Only train on completion tokens of prompt-completion datasets.
    #[arg(long = "completion_only_loss", num_args = 0..=1, default_missing_value = "true")]
    pub completion_only_loss: Option<bool>,
}

#[derive(Debug, Clone, Default, Args, Serialize, Deserialize)]
pub struct DpoArguments {
    /// Deviation from the reference model [default: 0.1].
    #[arg(long = "beta")]
    pub beta: Option<f64>,

    /// One or more preference losses [default: sigmoid].
    #[arg(long = "loss_type", value_enum, num_args = 1..)]
    pub loss_type: Option<Vec<DpoLossType>>,

    /// Weight of each loss in `loss_type`, paired positionally.
    #[arg(long = "loss_weights", num_args = 1..)]
    pub loss_weights: Option<Vec<f64>>,

    #[arg(long = "label_smoothing")]
    pub label_smoothing: Option<f64>,

    #[arg(long = "max_prompt_length")]
    pub max_prompt_length: Option<usize>,

    #[arg(long = "max_completion_length")]
    pub max_completion_length: Option<usize>,

    #[arg(long = "max_length")]
    pub max_length: Option<usize>,

    /// Use an implicit uniform reference model.
    #[arg(long = "reference_free", num_args = 0..=1, default_missing_value = "true")]
    pub reference_free: Option<bool>,
}

#[derive(Debug, Clone, Default, Args, Serialize, Deserialize)]
pub struct KtoArguments {
    #[arg(long = "beta")]
    pub beta: Option<f64>,

    #[arg(long = "loss_type", value_enum)]
    pub loss_type: Option<KtoLossType>,

    #[arg(long = "desirable_weight")]
    pub desirable_weight: Option<f64>,

    #[arg(long = "undesirable_weight")]
    pub undesirable_weight: Option<f64>,

    #[arg(long = "max_prompt_length")]
    pub max_prompt_length: Option<usize>,

    #[arg(long = "max_completion_length")]
    pub max_completion_length: Option<usize>,

    #[arg(long = "max_length")]
    pub max_length: Option<usize>,
}

#[derive(Debug, Clone, Default, Args, Serialize, Deserialize)]
pub struct GrpoArguments {
    /// Sequence-classification model scoring the completions.
    #[arg(long = "reward_model_name_or_path")]
    pub reward_model_name_or_path: Option<String>,

    /// Built-in reward functions, summed with the reward model score.
    #[arg(long = "reward_funcs", value_enum, num_args = 1..)]
    pub reward_funcs: Option<Vec<RewardFunc>>,

    /// Completions sampled per prompt [default: 8].
    #[arg(long = "num_generations")]
    pub num_generations: Option<usize>,

    #[arg(long = "max_prompt_length")]
    pub max_prompt_length: Option<usize>,

    /// Generation budget in tokens [default: 256].
    #[arg(long = "max_completion_length")]
    pub max_completion_length: Option<usize>,

    #[arg(long = "temperature")]
    pub temperature: Option<f64>,

    /// KL coefficient; 0 skips loading a reference model [default: 0].
    #[arg(long = "beta")]
    pub beta: Option<f64>,

    #[arg(long = "epsilon")]
    pub epsilon: Option<f64>,

    #[arg(long = "epsilon_high")]
    pub epsilon_high: Option<f64>,

    #[arg(long = "loss_type", value_enum)]
    pub loss_type: Option<GrpoLossType>,

    /// Divide group-centred rewards by their standard deviation.
    #[arg(long = "scale_rewards", num_args = 0..=1, default_missing_value = "true")]
    pub scale_rewards: Option<bool>,
}

// ---------------------------------------------------------------------------
// Per-subcommand bundles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Args, Serialize, Deserialize)]
pub struct SftCommand {
    #[command(flatten)]
    #[serde(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    #[serde(flatten)]
    pub sft: SftArguments,
}

#[derive(Debug, Clone, Default, Args, Serialize, Deserialize)]
pub struct DpoCommand {
    #[command(flatten)]
    #[serde(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    #[serde(flatten)]
    pub dpo: DpoArguments,
}

#[derive(Debug, Clone, Default, Args, Serialize, Deserialize)]
pub struct KtoCommand {
    #[command(flatten)]
    #[serde(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    #[serde(flatten)]
    pub kto: KtoArguments,
}

#[derive(Debug, Clone, Default, Args, Serialize, Deserialize)]
pub struct GrpoCommand {
    #[command(flatten)]
    #[serde(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    #[serde(flatten)]
    pub grpo: GrpoArguments,
}
