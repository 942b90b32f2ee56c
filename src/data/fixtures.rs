//! Built-in test datasets.
//!
//! `trl-internal-testing/zen` is the Zen of Python cut into prompt/completion
//! halves and laid out in each of the standard formats, so every trainer can
//! run without network access.

use anyhow::{bail, Result};

use super::{DatasetDict, Example};

pub const ZEN_DATASET: &str = "trl-internal-testing/zen";

pub const ZEN_CONFIGS: [&str; 6] = [
    "standard_language_modeling",
    "standard_prompt_only",
    "standard_prompt_completion",
    "standard_preference",
    "standard_implicit_prompt_preference",
    "standard_unpaired_preference",
];

/// Rows past this index go to the `test` split.
const TRAIN_ROWS: usize = 17;

const ZEN: [(&str, &str); 19] = [
    ("Beautiful is better than", " ugly."),
    ("Explicit is better than", " implicit."),
    ("Simple is better than", " complex."),
    ("Complex is better than", " complicated."),
    ("Flat is better than", " nested."),
    ("Sparse is better than", " dense."),
    ("Readability", " counts."),
    ("Special cases aren't special enough", " to break the rules."),
    ("Although practicality", " beats purity."),
    ("Errors should never", " pass silently."),
    ("Unless", " explicitly silenced."),
    ("In the face of ambiguity,", " refuse the temptation to guess."),
    ("There should be one-- and preferably only one --", "obvious way to do it."),
    ("Although that way may not be obvious at first", " unless you're Dutch."),
    ("Now is", " better than never."),
    ("Although never is often", " better than *right* now."),
    ("If the implementation is hard to explain,", " it's a bad idea."),
    ("If the implementation is easy to explain,", " it may be a good idea."),
    ("Namespaces are one honking great idea --", " let's do more of those!"),
];

pub fn is_fixture(name: &str) -> bool {
    name == ZEN_DATASET
}

/// Build one configuration of the zen dataset.
pub fn zen(config: Option<&str>) -> Result<DatasetDict> {
    let Some(config) = config else {
        bail!(
            "`{ZEN_DATASET}` has several configurations; pick one with --dataset_config: {}",
            ZEN_CONFIGS.join(", ")
        );
    };

    let n = ZEN.len();
    let mut rows = Vec::with_capacity(n);
    for (i, (prompt, completion)) in ZEN.iter().enumerate() {
        // A completion from a different aphorism serves as the rejected answer.
        let other = ZEN[(i + 1) % n].1;
        let mut row = Example::default();
        match config {
            "standard_language_modeling" => row.text = Some(format!("{prompt}{completion}")),
            "standard_prompt_only" => row.prompt = Some(prompt.to_string()),
            "standard_prompt_completion" => {
                row.prompt = Some(prompt.to_string());
                row.completion = Some(completion.to_string());
            }
            "standard_preference" => {
                row.prompt = Some(prompt.to_string());
                row.chosen = Some(completion.to_string());
                row.rejected = Some(other.to_string());
            }
            "standard_implicit_prompt_preference" => {
                row.chosen = Some(format!("{prompt}{completion}"));
                row.rejected = Some(format!("{prompt}{other}"));
            }
            "standard_unpaired_preference" => {
                let desirable = i % 2 == 0;
                row.prompt = Some(prompt.to_string());
                row.completion = Some(if desirable { completion } else { other }.to_string());
                row.label = Some(desirable);
            }
            unknown => bail!(
                "unknown configuration `{unknown}` for `{ZEN_DATASET}`; available: {}",
                ZEN_CONFIGS.join(", ")
            ),
        }
        rows.push(row);
    }

    let test = rows.split_off(TRAIN_ROWS);
    let mut dict = DatasetDict::default();
    dict.splits.insert("train".into(), rows);
    dict.splits.insert("test".into(), test);
    Ok(dict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DatasetFormat;

    #[test]
    fn test_every_config_has_expected_format() {
        let expected = [
            DatasetFormat::LanguageModeling,
            DatasetFormat::PromptOnly,
            DatasetFormat::PromptCompletion,
            DatasetFormat::Preference,
            DatasetFormat::ImplicitPromptPreference,
            DatasetFormat::UnpairedPreference,
        ];
        for (config, format) in ZEN_CONFIGS.iter().zip(expected) {
            let dict = zen(Some(config)).unwrap();
            let train = dict.split("train").unwrap();
            assert_eq!(train.len(), 17, "{config}");
            assert_eq!(dict.split("test").unwrap().len(), 2, "{config}");
            assert_eq!(train[0].format(), Some(format), "{config}");
        }
    }

    #[test]
    fn test_unknown_config_rejected() {
        assert!(zen(Some("standard_stepwise")).is_err());
        assert!(zen(None).is_err());
    }

    #[test]
    fn test_unpaired_labels_alternate() {
        let dict = zen(Some("standard_unpaired_preference")).unwrap();
        let labels: Vec<bool> = dict.split("train").unwrap().iter().filter_map(|r| r.label).collect();
        assert!(labels[0]);
        assert!(!labels[1]);
        assert!(labels.iter().any(|l| !l));
    }
}
