//! Post-training objectives and the loop that drives them.
//!
//! [`trainer::Trainer`] owns batching, optimisation, logging and
//! checkpointing; each algorithm plugs in as an [`trainer::Objective`]:
//! SFT, DPO, KTO and GRPO.

pub mod advantage;
pub mod dpo;
pub mod grpo;
pub mod kto;
pub mod optim;
pub mod rewards;
pub mod scheduler;
pub mod sft;
pub mod trainer;

pub use advantage::{
    clip_ratio, compute_group_advantages, compute_grouped_advantages, compute_importance_ratio, mean_std,
};
pub use dpo::{preference_loss, DpoObjective, PairLoss, PreferenceRecord};
pub use grpo::{GrpoObjective, GrpoSample, GrpoStepResult, PromptRecord};
pub use kto::{unpaired_loss, KtoObjective, UnpairedRecord};
pub use optim::{clip_grad_norm, AdamW};
pub use scheduler::LrScheduler;
pub use sft::{SftObjective, SftRecord};
pub use trainer::{BatchLayout, LossOutput, Objective, TrainOutput, Trainer, TrainerState};
