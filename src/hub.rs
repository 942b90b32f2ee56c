//! Model and dataset resolution.
//!
//! The trainers never open files or pick fixtures themselves; they ask a
//! [`ModelHub`] for weights and a [`DatasetHub`] for rows. [`LocalHub`] is the
//! implementation the CLI uses:
//!
//! - directories written by `save_pretrained` (full models and adapters),
//! - `trl-internal-testing/tiny-*` identifiers, initialised deterministically
//!   from the identifier and revision,
//! - local `.jsonl`/`.json` datasets and the built-in `zen` dataset.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::data::{fixtures, loader, DatasetDict};
use crate::model::reward::RewardModelConfig;
use crate::model::{LoraConfig, PeftModel, RewardModel, TinyLm, TinyLmConfig, TinyRewardModel};

const TEST_MODEL_PREFIX: &str = "trl-internal-testing/tiny-";

pub trait ModelHub {
    /// Load a causal LM. Saved adapters come back merged into their base.
    fn load_causal_lm(&self, name_or_path: &str, revision: &str) -> Result<TinyLm>;

    fn load_reward_model(&self, name_or_path: &str, revision: &str) -> Result<Box<dyn RewardModel>>;
}

pub trait DatasetHub {
    fn load_dataset(&self, name: &str, config: Option<&str>) -> Result<DatasetDict>;
}

/// Resolves everything from the local filesystem and built-in fixtures.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalHub;

impl ModelHub for LocalHub {
    fn load_causal_lm(&self, name_or_path: &str, revision: &str) -> Result<TinyLm> {
        let path = Path::new(name_or_path);
        if path.is_dir() {
            if path.join("adapter_config.json").exists() {
                let adapter: LoraConfig = serde_json::from_str(
                    &std::fs::read_to_string(path.join("adapter_config.json"))
                        .with_context(|| format!("failed to read adapter config in {name_or_path}"))?,
                )?;
                debug!(adapter = name_or_path, base = %adapter.base_model_name_or_path, "Loading adapter base model");
                let base = self.load_causal_lm(&adapter.base_model_name_or_path, revision)?;
                return Ok(PeftModel::from_pretrained(base, path)?.merge_and_unload());
            }
            return TinyLm::from_pretrained(path)
                .with_context(|| format!("failed to load model from {name_or_path}"));
        }

        if is_test_model(name_or_path, "ForCausalLM") {
            info!(model = name_or_path, revision, "Initialising built-in test model");
            let config = TinyLmConfig {
                name_or_path: name_or_path.to_string(),
                ..TinyLmConfig::default()
            };
            let mut rng = StdRng::seed_from_u64(seed_for(name_or_path, revision));
            return Ok(TinyLm::new(config, &mut rng));
        }

        bail!("cannot resolve model `{name_or_path}`: not a saved model directory or a built-in test model")
    }

    fn load_reward_model(&self, name_or_path: &str, revision: &str) -> Result<Box<dyn RewardModel>> {
        let path = Path::new(name_or_path);
        if path.is_dir() {
            let model = TinyRewardModel::from_pretrained(path)
                .with_context(|| format!("failed to load reward model from {name_or_path}"))?;
            return Ok(Box::new(model));
        }

        if is_test_model(name_or_path, "ForSequenceClassification") {
            info!(model = name_or_path, revision, "Initialising built-in test reward model");
            let config = RewardModelConfig {
                name_or_path: name_or_path.to_string(),
                ..RewardModelConfig::default()
            };
            let mut rng = StdRng::seed_from_u64(seed_for(name_or_path, revision));
            return Ok(Box::new(TinyRewardModel::new(config, &mut rng)));
        }

        bail!("cannot resolve reward model `{name_or_path}`: not a saved model directory or a built-in test model")
    }
}

impl DatasetHub for LocalHub {
    fn load_dataset(&self, name: &str, config: Option<&str>) -> Result<DatasetDict> {
        let path = Path::new(name);
        if path.exists() {
            return loader::load_local(path, config);
        }
        if fixtures::is_fixture(name) {
            return fixtures::zen(config);
        }
        bail!("cannot resolve dataset `{name}`: not a local path or a built-in test dataset")
    }
}

fn is_test_model(name: &str, head: &str) -> bool {
    name.starts_with(TEST_MODEL_PREFIX) && name.contains(head)
}

/// FNV-1a over `name@revision`, stable across platforms and toolchains.
fn seed_for(name: &str, revision: &str) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in name.bytes().chain(std::iter::once(b'@')).chain(revision.bytes()) {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}
