//! `trl` command-line dispatcher.
//!
//! Provides one subcommand per post-training method plus a diagnostic:
//!
//! - `dpo`  -- Direct preference optimisation on chosen/rejected pairs
//! - `grpo` -- Group relative policy optimisation with sampled completions
//! - `kto`  -- Kahneman-Tversky optimisation on labelled completions
//! - `sft`  -- Supervised fine-tuning
//! - `env`  -- Print environment information for bug reports
//!
//! Flags can also come from a YAML file given with `--config`; flags on the
//! command line always win.

mod commands;
mod env;

use std::ffi::OsString;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{merge_sources, ConfigFile, DpoCommand, FlagSpec, GrpoCommand, KtoCommand, SftCommand};
use crate::hub::{DatasetHub, LocalHub, ModelHub};

pub use env::print_env;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// TRL: post-train language models with SFT, DPO, GRPO and KTO.
#[derive(Debug, Parser)]
#[command(name = "trl", version, about, arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Direct preference optimisation on chosen/rejected pairs.
    Dpo(DpoCommand),

    /// Group relative policy optimisation with sampled completions.
    Grpo(GrpoCommand),

    /// Kahneman-Tversky optimisation on desirable/undesirable completions.
    Kto(KtoCommand),

    /// Supervised fine-tuning.
    Sft(SftCommand),

    /// Print environment information to include in bug reports.
    Env,
}

// ---------------------------------------------------------------------------
// Entrypoints
// ---------------------------------------------------------------------------

/// Parse `args` (program name first) and run the selected subcommand against
/// the local filesystem and built-in fixtures.
pub fn run<I, T>(args: I, out: &mut dyn Write) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    run_with(args, out, &LocalHub)
}

/// Like [`run`], resolving models and datasets through `hub`.
///
/// `--help` and `--version` are written to `out` and succeed; any other
/// parse failure is returned as a [`clap::Error`] inside the `anyhow::Error`.
pub fn run_with<I, T, H>(args: I, out: &mut dyn Write, hub: &H) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    H: ModelHub + DatasetHub,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            write!(out, "{}", err.render())?;
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    match cli.command {
        Command::Dpo(cmd) => {
            let cmd = with_config_file(&cmd, cmd.common.config.as_deref(), "dpo")?;
            commands::dpo(&cmd, hub, out)
        }
        Command::Grpo(cmd) => {
            let cmd = with_config_file(&cmd, cmd.common.config.as_deref(), "grpo")?;
            commands::grpo(&cmd, hub, out)
        }
        Command::Kto(cmd) => {
            let cmd = with_config_file(&cmd, cmd.common.config.as_deref(), "kto")?;
            commands::kto(&cmd, hub, out)
        }
        Command::Sft(cmd) => {
            let cmd = with_config_file(&cmd, cmd.common.config.as_deref(), "sft")?;
            commands::sft(&cmd, hub, out)
        }
        Command::Env => print_env(out),
    }
}

// ---------------------------------------------------------------------------
// Config file handling
// ---------------------------------------------------------------------------

/// Layer the parsed flags over `--config`, exporting the file's `env`
/// section into the process environment.
fn with_config_file<T>(cli: &T, config: Option<&Path>, subcommand: &str) -> Result<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    let Some(path) = config else {
        return Ok(cli.clone());
    };
    let file = ConfigFile::load(path)?;
    let flags = flag_specs(subcommand)?;
    let merged = merge_sources(cli, &file, &flags)?;

    for (name, value) in &file.env {
        debug!(name, "Setting environment variable from config file");
        std::env::set_var(name, value);
    }
    info!(path = %path.display(), keys = file.values.len(), "Applied config file");
    Ok(merged)
}

/// Every long flag of `subcommand` a config file may set.
fn flag_specs(subcommand: &str) -> Result<Vec<FlagSpec>> {
    let command = Cli::command();
    let sub = command
        .find_subcommand(subcommand)
        .with_context(|| format!("unknown subcommand `{subcommand}`"))?;
    Ok(sub
        .get_arguments()
        .filter_map(|arg| {
            let name = arg.get_long()?;
            if matches!(name, "config" | "help" | "version") {
                return None;
            }
            Some(FlagSpec {
                name: name.to_string(),
                multiple: arg.get_num_args().is_some_and(|range| range.max_values() > 1),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flag_specs_mark_list_flags() {
        let flags = flag_specs("dpo").unwrap();
        let find = |name: &str| flags.iter().find(|f| f.name == name).unwrap();
        assert!(find("loss_type").multiple);
        assert!(find("loss_weights").multiple);
        assert!(find("report_to").multiple);
        assert!(!find("beta").multiple);
        assert!(!find("use_peft").multiple);
        assert!(flags.iter().all(|f| f.name != "config"));
    }

    #[test]
    fn test_flag_specs_are_per_subcommand() {
        let sft = flag_specs("sft").unwrap();
        assert!(sft.iter().any(|f| f.name == "packing"));
        assert!(sft.iter().all(|f| f.name != "num_generations"));
        assert!(flag_specs("nope").is_err());
    }

    #[test]
    fn test_help_and_version_succeed() {
        let mut out = Vec::new();
        run(["trl", "--help"], &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("sft"));

        let mut out = Vec::new();
        run(["trl", "--version"], &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_usage_errors_keep_their_kind() {
        let err = run(["trl", "train"], &mut Vec::new()).unwrap_err();
        let clap_err = err.downcast_ref::<clap::Error>().unwrap();
        assert_eq!(clap_err.kind(), ErrorKind::InvalidSubcommand);
    }
}
