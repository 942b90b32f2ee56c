//! YAML config files and their merge beneath command-line flags.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use tracing::debug;

use super::error::ConfigError;

/// Reserved top-level key holding environment variables to export.
const ENV_KEY: &str = "env";

/// A flag the selected subcommand accepts, as seen by the merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagSpec {
    pub name: String,
    /// Accepts several values (`--loss_type sigmoid hinge`).
    pub multiple: bool,
}

/// A parsed `--config` file.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub path: PathBuf,
    /// Flag values keyed by flag name.
    pub values: Mapping,
    /// Contents of the `env` section.
    pub env: BTreeMap<String, String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &text)
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        let document: Value = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let mut values = match document {
            Value::Mapping(mapping) => mapping,
            Value::Null => Mapping::new(),
            _ => {
                return Err(ConfigError::NotAMapping {
                    path: path.to_path_buf(),
                })
            }
        };

        let env = match values.remove(ENV_KEY) {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Mapping(vars)) => env_vars(vars)?,
            Some(_) => return Err(ConfigError::invalid("env", "must be a mapping of variable names to values")),
        };

        debug!(path = %path.display(), keys = values.len(), env = env.len(), "Loaded config file");
        Ok(Self {
            path: path.to_path_buf(),
            values,
            env,
        })
    }
}

fn env_vars(vars: Mapping) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut env = BTreeMap::new();
    for (key, value) in vars {
        let Value::String(name) = key else {
            return Err(ConfigError::invalid("env", "variable names must be strings"));
        };
        let value = match value {
            Value::String(s) => s,
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            _ => {
                return Err(ConfigError::invalid(
                    "env",
                    format!("value of `{name}` must be a scalar"),
                ))
            }
        };
        env.insert(name, value);
    }
    Ok(env)
}

/// Merge the command line over a config file.
///
/// `cli` is the parsed subcommand with absent flags left as `None`; only the
/// flags present on the command line override file values. Every file key must
/// name one of `flags`, and a scalar given for a multi-valued flag becomes a
/// one-element list.
pub fn merge_sources<T>(cli: &T, file: &ConfigFile, flags: &[FlagSpec]) -> Result<T, ConfigError>
where
    T: Serialize + DeserializeOwned,
{
    let mut merged = Mapping::new();
    let mut unknown = Vec::new();

    for (key, value) in &file.values {
        let spec = key
            .as_str()
            .and_then(|name| flags.iter().find(|f| f.name == name));
        match spec {
            Some(spec) => {
                let value = match value {
                    Value::Sequence(_) | Value::Null => value.clone(),
                    scalar if spec.multiple => Value::Sequence(vec![scalar.clone()]),
                    scalar => scalar.clone(),
                };
                merged.insert(key.clone(), value);
            }
            None => unknown.push(match key {
                Value::String(s) => s.clone(),
                other => format!("{other:?}"),
            }),
        }
    }

    if !unknown.is_empty() {
        return Err(ConfigError::UnknownKeys {
            path: file.path.clone(),
            keys: unknown.join(", "),
        });
    }

    if let Value::Mapping(explicit) = serde_yaml::to_value(cli).map_err(ConfigError::Merge)? {
        for (key, value) in explicit {
            if !value.is_null() {
                merged.insert(key, value);
            }
        }
    }

    serde_yaml::from_value(Value::Mapping(merged)).map_err(ConfigError::Merge)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::args::{DpoCommand, SftCommand};
    use crate::config::types::{DpoLossType, SchedulerType};

    fn flags(names: &[(&str, bool)]) -> Vec<FlagSpec> {
        names
            .iter()
            .map(|(name, multiple)| FlagSpec {
                name: name.to_string(),
                multiple: *multiple,
            })
            .collect()
    }

    fn parse(text: &str) -> ConfigFile {
        ConfigFile::parse(Path::new("config.yaml"), text).unwrap()
    }

    #[test]
    fn test_file_fills_absent_flags() {
        let file = parse("output_dir: from-file\nlr_scheduler_type: cosine_with_restarts\n");
        let cli = SftCommand::default();
        let merged = merge_sources(
            &cli,
            &file,
            &flags(&[("output_dir", false), ("lr_scheduler_type", false)]),
        )
        .unwrap();
        assert_eq!(merged.common.training.output_dir, Some(PathBuf::from("from-file")));
        assert_eq!(
            merged.common.training.lr_scheduler_type,
            Some(SchedulerType::CosineWithRestarts)
        );
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = parse("output_dir: from-file\nlearning_rate: 0.5\n");
        let mut cli = SftCommand::default();
        cli.common.training.output_dir = Some("from-cli".into());
        let merged = merge_sources(
            &cli,
            &file,
            &flags(&[("output_dir", false), ("learning_rate", false)]),
        )
        .unwrap();
        assert_eq!(merged.common.training.output_dir, Some(PathBuf::from("from-cli")));
        assert_eq!(merged.common.training.learning_rate, Some(0.5));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let file = parse("output_dir: out\nnot_a_flag: 1\n");
        let err = merge_sources(&SftCommand::default(), &file, &flags(&[("output_dir", false)]))
            .unwrap_err();
        match err {
            ConfigError::UnknownKeys { keys, .. } => assert_eq!(keys, "not_a_flag"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_scalar_promoted_for_multi_valued_flag() {
        let file = parse("loss_type: bco_pair\nloss_weights: [0.5]\n");
        let merged = merge_sources(
            &DpoCommand::default(),
            &file,
            &flags(&[("loss_type", true), ("loss_weights", true)]),
        )
        .unwrap();
        assert_eq!(merged.dpo.loss_type, Some(vec![DpoLossType::BcoPair]));
        assert_eq!(merged.dpo.loss_weights, Some(vec![0.5]));
    }

    #[test]
    fn test_integer_accepted_for_float_flag() {
        let file = parse("learning_rate: 1\n");
        let merged = merge_sources(&SftCommand::default(), &file, &flags(&[("learning_rate", false)]))
            .unwrap();
        assert_eq!(merged.common.training.learning_rate, Some(1.0));
    }

    #[test]
    fn test_env_section_extracted() {
        let file = parse("env:\n  WANDB_MODE: offline\n  RETRIES: 3\noutput_dir: out\n");
        assert_eq!(file.env.get("WANDB_MODE").map(String::as_str), Some("offline"));
        assert_eq!(file.env.get("RETRIES").map(String::as_str), Some("3"));
        assert!(!file.values.contains_key("env"));
    }

    #[test]
    fn test_non_mapping_document_rejected() {
        let err = ConfigFile::parse(Path::new("c.yaml"), "- a\n- b\n").unwrap_err();
        assert!(matches!(err, ConfigError::NotAMapping { .. }));
    }

    #[test]
    fn test_load_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "dataset_name: trl-internal-testing/zen").unwrap();
        let loaded = ConfigFile::load(file.path()).unwrap();
        assert_eq!(loaded.values.len(), 1);

        let missing = ConfigFile::load(Path::new("/definitely/not/here.yaml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
