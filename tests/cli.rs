//! End-to-end runs of the `trl` dispatcher against the built-in fixtures.

use std::path::Path;

use trl::cli::run;
use trl::config::ConfigError;

const POLICY: &str = "trl-internal-testing/tiny-Qwen2ForCausalLM-2.5";
const REWARD: &str = "trl-internal-testing/tiny-Qwen2ForSequenceClassification-2.5";
const DATASET: &str = "trl-internal-testing/zen";

fn run_command(command: &str) -> anyhow::Result<String> {
    let mut out = Vec::new();
    run(command.split_whitespace(), &mut out)?;
    Ok(String::from_utf8(out).expect("utf-8 output"))
}

fn assert_trained(dir: &Path) {
    assert!(dir.join("config.json").exists(), "no model in {}", dir.display());
    assert!(dir.join("trainer_state.json").exists());
    assert!(dir.join("training_args.yaml").exists());
}

fn training_args(dir: &Path) -> serde_yaml::Value {
    let text = std::fs::read_to_string(dir.join("training_args.yaml")).unwrap();
    serde_yaml::from_str(&text).unwrap()
}

#[test]
fn test_dpo() {
    let tmp = tempfile::tempdir().unwrap();
    let out = run_command(&format!(
        "trl dpo --output_dir {} --model_name_or_path {POLICY} --dataset_name {DATASET} --dataset_config standard_preference --max_steps 3 --report_to none",
        tmp.path().display()
    ))
    .unwrap();
    assert!(out.contains("Training finished after 3 steps"));
    assert_trained(tmp.path());
}

#[test]
fn test_dpo_multiple_loss_types() {
    let tmp = tempfile::tempdir().unwrap();
    run_command(&format!(
        "trl dpo --output_dir {} --model_name_or_path {POLICY} --dataset_name {DATASET} --dataset_config standard_preference --loss_type sigmoid bco_pair --loss_weights 1.0 0.5 --max_steps 2 --report_to none",
        tmp.path().display()
    ))
    .unwrap();
    let args = training_args(tmp.path());
    assert_eq!(args["loss_type"][1].as_str(), Some("bco_pair"));
    assert_eq!(args["loss_weights"][1].as_f64(), Some(0.5));
}

#[test]
fn test_dpo_mismatched_loss_weights_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let err = run_command(&format!(
        "trl dpo --output_dir {} --model_name_or_path {POLICY} --dataset_name {DATASET} --dataset_config standard_preference --loss_type sigmoid bco_pair --loss_weights 1.0 --report_to none",
        tmp.path().display()
    ))
    .unwrap_err();
    assert!(err.downcast_ref::<ConfigError>().is_some(), "{err:#}");
    assert!(!tmp.path().join("config.json").exists());
}

fn listing(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    entries.sort();
    entries
}

#[test]
fn test_env() {
    let cwd = std::env::current_dir().unwrap();
    let before = listing(&cwd);
    let out = run_command("trl env").unwrap();
    assert!(out.contains("TRL version: "));
    assert_eq!(listing(&cwd), before, "`trl env` must not write files");
}

#[test]
fn test_grpo() {
    let tmp = tempfile::tempdir().unwrap();
    run_command(&format!(
        "trl grpo --output_dir {} --model_name_or_path {POLICY} --reward_model_name_or_path {REWARD} --dataset_name {DATASET} --dataset_config standard_prompt_only --num_generations 4 --max_completion_length 32 --max_steps 2 --logging_steps 1 --report_to none",
        tmp.path().display()
    ))
    .unwrap();
    assert_trained(tmp.path());
    let state = std::fs::read_to_string(tmp.path().join("trainer_state.json")).unwrap();
    assert!(state.contains("\"reward\""));
}

#[test]
fn test_grpo_with_reward_funcs_and_peft() {
    let tmp = tempfile::tempdir().unwrap();
    run_command(&format!(
        "trl grpo --output_dir {} --model_name_or_path {POLICY} --dataset_name {DATASET} --dataset_config standard_prompt_only --reward_funcs think_format_reward soft_overlong_punishment --num_generations 2 --per_device_train_batch_size 4 --max_completion_length 8 --beta 0.04 --use_peft --lora_r 4 --max_steps 2 --report_to jsonl",
        tmp.path().display()
    ))
    .unwrap();
    assert!(tmp.path().join("adapter_config.json").exists());
    assert!(tmp.path().join("metrics.jsonl").exists());
}

#[test]
fn test_kto() {
    let tmp = tempfile::tempdir().unwrap();
    run_command(&format!(
        "trl kto --output_dir {} --model_name_or_path {POLICY} --dataset_name {DATASET} --dataset_config standard_unpaired_preference --max_steps 2 --report_to none",
        tmp.path().display()
    ))
    .unwrap();
    assert_trained(tmp.path());
}

#[test]
fn test_sft() {
    let tmp = tempfile::tempdir().unwrap();
    run_command(&format!(
        "trl sft --output_dir {} --model_name_or_path {POLICY} --dataset_name {DATASET} --dataset_config standard_language_modeling --report_to none",
        tmp.path().display()
    ))
    .unwrap();
    assert_trained(tmp.path());
    assert_eq!(training_args(tmp.path())["learning_rate"].as_f64(), Some(2e-5));
}

#[test]
fn test_sft_with_evaluation_and_checkpoints() {
    let tmp = tempfile::tempdir().unwrap();
    run_command(&format!(
        "trl sft --output_dir {} --model_name_or_path {POLICY} --dataset_name {DATASET} --dataset_config standard_prompt_completion --per_device_train_batch_size 2 --max_steps 4 --logging_steps 1 --eval_strategy steps --eval_steps 2 --save_strategy steps --save_steps 2 --save_total_limit 1 --report_to none",
        tmp.path().display()
    ))
    .unwrap();
    let state = std::fs::read_to_string(tmp.path().join("trainer_state.json")).unwrap();
    assert!(state.contains("eval_loss"));
    assert!(tmp.path().join("checkpoint-4").exists());
    assert!(!tmp.path().join("checkpoint-2").exists());
}

#[test]
fn test_evaluation_requires_test_split() {
    let tmp = tempfile::tempdir().unwrap();
    let err = run_command(&format!(
        "trl sft --output_dir {} --model_name_or_path {POLICY} --dataset_name {DATASET} --dataset_config standard_language_modeling --eval_strategy steps --dataset_test_split nope --report_to none",
        tmp.path().display()
    ))
    .unwrap_err();
    assert!(format!("{err:#}").contains("nope"), "{err:#}");
    assert!(!tmp.path().join("config.json").exists());
}

#[test]
fn test_sft_config_file() {
    let tmp = tempfile::tempdir().unwrap();
    let output_dir = tmp.path().join("output");
    let config_path = tmp.path().join("config.yaml");
    std::fs::write(
        &config_path,
        format!(
            "model_name_or_path: {POLICY}\n\
             dataset_name: {DATASET}\n\
             dataset_config: standard_language_modeling\n\
             report_to: none\n\
             output_dir: {}\n\
             lr_scheduler_type: cosine_with_restarts\n\
             learning_rate: 0.001\n\
             max_steps: 2\n\
             env:\n  TRL_CLI_TEST_MARKER: from-config\n",
            output_dir.display()
        ),
    )
    .unwrap();

    run_command(&format!(
        "trl sft --config {} --learning_rate 0.0002",
        config_path.display()
    ))
    .unwrap();

    assert!(output_dir.is_dir());
    let args = training_args(&output_dir);
    assert_eq!(args["learning_rate"].as_f64(), Some(2e-4));
    assert_eq!(args["lr_scheduler_type"].as_str(), Some("cosine_with_restarts"));
    assert_eq!(std::env::var("TRL_CLI_TEST_MARKER").as_deref(), Ok("from-config"));
}

#[test]
fn test_config_file_rejects_unknown_keys() {
    let tmp = tempfile::tempdir().unwrap();
    let config_path = tmp.path().join("config.yaml");
    std::fs::write(&config_path, "num_generations: 4\n").unwrap();

    let err = run_command(&format!(
        "trl sft --config {} --output_dir {} --model_name_or_path {POLICY} --dataset_name {DATASET}",
        config_path.display(),
        tmp.path().join("out").display()
    ))
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::UnknownKeys { .. })
    ));
}

#[test]
fn test_missing_required_flag() {
    let tmp = tempfile::tempdir().unwrap();
    let err = run_command(&format!(
        "trl sft --output_dir {} --dataset_name {DATASET}",
        tmp.path().display()
    ))
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::Missing("model_name_or_path"))
    ));
}

#[test]
fn test_unknown_subcommand() {
    let err = run_command("trl train").unwrap_err();
    assert!(err.downcast_ref::<clap::Error>().is_some());
}

#[test]
fn test_missing_subcommand() {
    let err = run_command("trl").unwrap_err();
    assert!(err.downcast_ref::<clap::Error>().is_some());
}
