//! TRL: post-training for language models from the command line.
//!
//! The `trl` binary dispatches to supervised fine-tuning, DPO, GRPO and KTO
//! trainers. Configuration comes from built-in defaults, an optional YAML
//! file and command-line flags, in increasing order of precedence.

pub mod cli;
pub mod config;
pub mod data;
pub mod hub;
pub mod model;
pub mod report;
pub mod training;
