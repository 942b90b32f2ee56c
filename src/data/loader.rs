//! Local JSON-lines datasets.
//!
//! A dataset path is either a single `.jsonl`/`.json` file (loaded as the
//! `train` split) or a directory whose `*.jsonl` files are splits named by
//! their stem. With a configuration name, `<dir>/<config>/` is searched first.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::debug;

use super::{DatasetDict, Example};

pub fn load_local(path: &Path, config: Option<&str>) -> Result<DatasetDict> {
    let mut dict = DatasetDict::default();

    if path.is_file() {
        dict.splits.insert("train".into(), read_rows(path)?);
        return Ok(dict);
    }

    let base = match config {
        Some(config) if path.join(config).is_dir() => path.join(config),
        _ => path.to_path_buf(),
    };

    let entries = std::fs::read_dir(&base)
        .with_context(|| format!("failed to list dataset directory {}", base.display()))?;
    for entry in entries {
        let file = entry?.path();
        if file.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let Some(split) = file.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        dict.splits.insert(split.to_string(), read_rows(&file)?);
    }

    if dict.splits.is_empty() {
        bail!("no `.jsonl` splits found in {}", base.display());
    }
    debug!(path = %base.display(), splits = dict.splits.len(), "Loaded local dataset");
    Ok(dict)
}

fn read_rows(path: &Path) -> Result<Vec<Example>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read dataset file {}", path.display()))?;

    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        return serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {} as a JSON array of rows", path.display()));
    }

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: malformed row", path.display(), i + 1))
        })
        .collect()
}
