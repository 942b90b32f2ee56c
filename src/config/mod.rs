//! Run configuration: the flag/file surface, YAML merging and the resolved
//! configs handed to the trainers.
//!
//! Precedence, lowest to highest: built-in defaults, `--config` file, flags.

pub mod args;
pub mod error;
pub mod file;
pub mod types;

pub use args::{
    CommonArgs, DpoArguments, DpoCommand, GrpoArguments, GrpoCommand, KtoArguments, KtoCommand,
    ModelArguments, ScriptArguments, SftArguments, SftCommand, TrainingArguments,
};
pub use error::ConfigError;
pub use file::{merge_sources, ConfigFile, FlagSpec};
pub use types::{
    DpoConfig, DpoLossType, GrpoConfig, GrpoLossType, IntervalStrategy, KtoConfig, KtoLossType,
    ModelConfig, ReportTo, RewardFunc, RunConfig, SchedulerType, ScriptConfig, SftConfig,
    TorchDtype, TrainingConfig,
};
