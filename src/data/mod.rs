//! Dataset rows, splits and the conversions between dataset formats.
//!
//! Rows use the column names of the standard preference/SFT layouts
//! (`text`, `prompt`, `completion`, `chosen`, `rejected`, `label`); any other
//! column is kept in [`Example::extra`] so a custom `dataset_text_field` can
//! still be read.

pub mod fixtures;
pub mod format;
pub mod loader;

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

pub use format::{
    detect_format, DatasetFormat, PreferencePair, PromptCompletion, UnpairedExample,
};

/// A single dataset row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Example {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Example {
    /// Read a string column by name, falling back to [`Example::extra`].
    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "text" => self.text.as_deref(),
            "prompt" => self.prompt.as_deref(),
            "completion" => self.completion.as_deref(),
            "chosen" => self.chosen.as_deref(),
            "rejected" => self.rejected.as_deref(),
            other => self.extra.get(other).and_then(|v| v.as_str()),
        }
    }
}

/// Named splits of one dataset configuration.
#[derive(Debug, Clone, Default)]
pub struct DatasetDict {
    pub splits: BTreeMap<String, Vec<Example>>,
}

impl DatasetDict {
    pub fn split(&self, name: &str) -> Result<&[Example]> {
        self.splits.get(name).map(Vec::as_slice).ok_or_else(|| {
            anyhow!(
                "split `{name}` not found; available splits: {}",
                self.splits.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })
    }

    pub fn has_split(&self, name: &str) -> bool {
        self.splits.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_reads_extra_columns() {
        let row: Example =
            serde_json::from_str(r#"{"content": "hello", "prompt": "p"}"#).unwrap();
        assert_eq!(row.field("content"), Some("hello"));
        assert_eq!(row.field("prompt"), Some("p"));
        assert_eq!(row.field("text"), None);
    }

    #[test]
    fn test_missing_split_lists_available() {
        let mut dict = DatasetDict::default();
        dict.splits.insert("train".into(), Vec::new());
        let err = dict.split("test").unwrap_err().to_string();
        assert!(err.contains("train"));
        assert!(dict.has_split("train"));
    }
}
