use std::io::Write;

use chartflow_core::config::AppConfig;
use chartflow_core::error::ChartflowError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
lookahead_depth = 3
focus_instruction = "Answer only the current step."

[model]
provider = "groq"
model_id = "llama-3.1-70b"
api_key = "gsk-test-key"
base_url = "https://api.groq.com/openai/v1/chat/completions"
max_tokens = 2048

[model.retry]
max_retries = 2
initial_backoff_ms = 250
max_backoff_ms = 4000
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.lookahead_depth, 3);
    assert_eq!(config.engine.focus_instruction, "Answer only the current step.");
    assert_eq!(config.model.provider, "groq");
    assert_eq!(config.model.model_id, "llama-3.1-70b");
    assert_eq!(config.model.api_key, Some("gsk-test-key".to_string()));
    assert_eq!(config.model.max_tokens, 2048);

    let retry = config.model.retry.expect("retry present");
    assert_eq!(retry.max_retries, 2);
    assert_eq!(retry.initial_backoff_ms, 250);
    assert_eq!(retry.max_backoff_ms, 4000);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("CHARTFLOW_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[model]
model_id = "test-model"
api_key = "${CHARTFLOW_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("CHARTFLOW_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[model]
model_id = "llama3.2"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.lookahead_depth, 6);
    assert!(!config.engine.focus_instruction.is_empty());
    assert_eq!(config.model.provider, "openai");
    assert_eq!(config.model.max_tokens, 4096);
    assert!(config.model.api_key.is_none());
    assert!(config.model.base_url.is_none());
    assert!(config.model.retry.is_none());
}

#[test]
fn test_missing_file_reports_path() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/chartflow.toml")).unwrap_err();
    assert!(matches!(err, ChartflowError::ConfigNotFound(ref p) if p.contains("chartflow.toml")));
}

#[test]
fn test_invalid_toml_is_config_error() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[model\nmodel_id = ").expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, ChartflowError::Config(_)));
}

#[test]
fn test_redacted_config_serializes_without_secret() {
    let toml_content = r#"
[model]
model_id = "gpt-4o-mini"
api_key = "sk-very-secret"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    let shown = toml::to_string_pretty(&config.redacted()).expect("serialize");

    assert!(!shown.contains("sk-very-secret"));
    assert!(shown.contains("lookahead_depth = 6"));
}
