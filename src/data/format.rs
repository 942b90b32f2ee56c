//! Dataset format detection and conversion.

use anyhow::{bail, Context, Result};

use super::Example;

/// The layout of a dataset, detected from its first row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    /// `text`
    LanguageModeling,
    /// `prompt`
    PromptOnly,
    /// `prompt`, `completion`
    PromptCompletion,
    /// `prompt`, `chosen`, `rejected`
    Preference,
    /// `chosen`, `rejected` sharing a common prefix
    ImplicitPromptPreference,
    /// `prompt`, `completion`, `label`
    UnpairedPreference,
}

impl Example {
    pub fn format(&self) -> Option<DatasetFormat> {
        let has = |v: &Option<String>| v.is_some();
        if has(&self.chosen) && has(&self.rejected) {
            return Some(if has(&self.prompt) {
                DatasetFormat::Preference
            } else {
                DatasetFormat::ImplicitPromptPreference
            });
        }
        if has(&self.prompt) && has(&self.completion) {
            return Some(if self.label.is_some() {
                DatasetFormat::UnpairedPreference
            } else {
                DatasetFormat::PromptCompletion
            });
        }
        if has(&self.prompt) {
            return Some(DatasetFormat::PromptOnly);
        }
        if has(&self.text) {
            return Some(DatasetFormat::LanguageModeling);
        }
        None
    }
}

/// Detect the format of `rows` from the first row.
pub fn detect_format(rows: &[Example]) -> Result<DatasetFormat> {
    let Some(first) = rows.first() else {
        bail!("dataset split is empty");
    };
    first
        .format()
        .context("could not detect the dataset format: expected `text`, `prompt`, `prompt`/`completion`, `chosen`/`rejected` or `prompt`/`completion`/`label` columns")
}

/// An explicit-prompt preference pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PreferencePair {
    pub prompt: String,
    pub chosen: String,
    pub rejected: String,
}

/// A prompt with one completion.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptCompletion {
    pub prompt: String,
    pub completion: String,
}

/// A completion labelled desirable (`true`) or undesirable (`false`).
#[derive(Debug, Clone, PartialEq)]
pub struct UnpairedExample {
    pub prompt: String,
    pub completion: String,
    pub label: bool,
}

/// Split the shared prefix off an implicit-prompt pair.
///
/// The prompt ends before the first differing character; a trailing space is
/// handed back to the completions.
pub fn extract_prompt(chosen: &str, rejected: &str) -> PreferencePair {
    let mut split = 0;
    let mut prev = None;
    for ((idx, a), b) in chosen.char_indices().zip(rejected.chars()) {
        if a != b {
            break;
        }
        split = idx + a.len_utf8();
        prev = Some(a);
    }
    if prev == Some(' ') && split < chosen.len().min(rejected.len()) {
        split -= 1;
    }
    PreferencePair {
        prompt: chosen[..split].to_string(),
        chosen: chosen[split..].to_string(),
        rejected: rejected[split..].to_string(),
    }
}

/// Convert a preference row (explicit or implicit prompt) into a pair.
pub fn to_preference(example: &Example) -> Result<PreferencePair> {
    match (example.format(), &example.chosen, &example.rejected) {
        (Some(DatasetFormat::Preference), Some(chosen), Some(rejected)) => Ok(PreferencePair {
            prompt: example.prompt.clone().unwrap_or_default(),
            chosen: chosen.clone(),
            rejected: rejected.clone(),
        }),
        (Some(DatasetFormat::ImplicitPromptPreference), Some(chosen), Some(rejected)) => {
            Ok(extract_prompt(chosen, rejected))
        }
        (format, _, _) => bail!("expected a preference row, found {format:?}"),
    }
}

/// Convert rows into labelled completions.
///
/// Preference pairs contribute one desirable and one undesirable row each.
pub fn to_unpaired(rows: &[Example]) -> Result<Vec<UnpairedExample>> {
    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        match row.format() {
            Some(DatasetFormat::UnpairedPreference) => out.push(UnpairedExample {
                prompt: row.prompt.clone().unwrap_or_default(),
                completion: row.completion.clone().unwrap_or_default(),
                label: row.label.unwrap_or(false),
            }),
            Some(DatasetFormat::Preference | DatasetFormat::ImplicitPromptPreference) => {
                let pair = to_preference(row).with_context(|| format!("row {i}"))?;
                out.push(UnpairedExample {
                    prompt: pair.prompt.clone(),
                    completion: pair.chosen,
                    label: true,
                });
                out.push(UnpairedExample {
                    prompt: pair.prompt,
                    completion: pair.rejected,
                    label: false,
                });
            }
            other => bail!("row {i}: expected an unpaired or paired preference row, found {other:?}"),
        }
    }
    Ok(out)
}

/// Prompt and completion for supervised fine-tuning.
///
/// Language-modeling rows have an empty prompt; `text_field` names the text
/// column.
pub fn to_prompt_completion(example: &Example, text_field: &str) -> Result<PromptCompletion> {
    if let (Some(prompt), Some(completion)) = (&example.prompt, &example.completion) {
        return Ok(PromptCompletion {
            prompt: prompt.clone(),
            completion: completion.clone(),
        });
    }
    match example.field(text_field) {
        Some(text) => Ok(PromptCompletion {
            prompt: String::new(),
            completion: text.to_string(),
        }),
        None => bail!("row has neither `prompt`/`completion` nor a `{text_field}` column"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(f: impl FnOnce(&mut Example)) -> Example {
        let mut e = Example::default();
        f(&mut e);
        e
    }

    #[test]
    fn test_format_detection() {
        let lm = row(|e| e.text = Some("t".into()));
        let po = row(|e| e.prompt = Some("p".into()));
        let pc = row(|e| {
            e.prompt = Some("p".into());
            e.completion = Some("c".into());
        });
        let unpaired = row(|e| {
            e.prompt = Some("p".into());
            e.completion = Some("c".into());
            e.label = Some(true);
        });
        let implicit = row(|e| {
            e.chosen = Some("a".into());
            e.rejected = Some("b".into());
        });
        assert_eq!(lm.format(), Some(DatasetFormat::LanguageModeling));
        assert_eq!(po.format(), Some(DatasetFormat::PromptOnly));
        assert_eq!(pc.format(), Some(DatasetFormat::PromptCompletion));
        assert_eq!(unpaired.format(), Some(DatasetFormat::UnpairedPreference));
        assert_eq!(implicit.format(), Some(DatasetFormat::ImplicitPromptPreference));
        assert_eq!(Example::default().format(), None);
        assert!(detect_format(&[]).is_err());
    }

    #[test]
    fn test_extract_prompt_keeps_space_in_completion() {
        let pair = extract_prompt("The sky is blue.", "The sky is green.");
        assert_eq!(pair.prompt, "The sky is");
        assert_eq!(pair.chosen, " blue.");
        assert_eq!(pair.rejected, " green.");
    }

    #[test]
    fn test_extract_prompt_no_common_prefix() {
        let pair = extract_prompt("abc", "xyz");
        assert_eq!(pair.prompt, "");
        assert_eq!(pair.chosen, "abc");
    }

    #[test]
    fn test_preference_unpairs_into_two_rows() {
        let rows = vec![row(|e| {
            e.prompt = Some("p".into());
            e.chosen = Some("good".into());
            e.rejected = Some("bad".into());
        })];
        let unpaired = to_unpaired(&rows).unwrap();
        assert_eq!(unpaired.len(), 2);
        assert!(unpaired[0].label);
        assert_eq!(unpaired[1].completion, "bad");
        assert!(!unpaired[1].label);
    }

    #[test]
    fn test_prompt_only_rows_cannot_unpair() {
        let rows = vec![row(|e| e.prompt = Some("p".into()))];
        assert!(to_unpaired(&rows).is_err());
    }

    #[test]
    fn test_prompt_completion_from_text_field() {
        let mut e = Example::default();
        e.extra.insert("content".into(), serde_json::json!("hello"));
        let pc = to_prompt_completion(&e, "content").unwrap();
        assert!(pc.prompt.is_empty());
        assert_eq!(pc.completion, "hello");
        assert!(to_prompt_completion(&e, "text").is_err());
    }
}
