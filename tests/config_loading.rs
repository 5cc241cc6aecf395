use std::io::Write;

use skillflow_core::config::{AppConfig, CheckpointBackendKind};
use skillflow_core::error::SkillflowError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_concurrent_skills = 4
max_retry_rounds = 1
enable_human_review = false
enable_streaming = true
default_vendor = "gemini"
default_model = "flash"

[retry]
initial_backoff_ms = 250
max_backoff_ms = 4000
jitter = 0.1

[checkpoint]
backend = "sqlite"
path = "/tmp/skillflow-test/checkpoints.db"

[schemas]
dir = "/srv/skillflow/schemas"

[inference]
endpoint = "http://localhost:8700/v1/skills"
api_key = "sk-test-key"
request_timeout_secs = 45

[log]
filter = "skillflow=debug"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrent_skills, 4);
    assert_eq!(config.engine.max_retry_rounds, 1);
    assert!(!config.engine.enable_human_review);
    assert_eq!(config.engine.default_vendor.as_deref(), Some("gemini"));
    assert_eq!(config.engine.default_model.as_deref(), Some("flash"));

    assert_eq!(config.retry.initial_backoff_ms, 250);
    assert_eq!(config.retry.max_backoff_ms, 4000);
    assert!((config.retry.jitter - 0.1).abs() < f64::EPSILON);

    assert_eq!(config.checkpoint.backend, CheckpointBackendKind::Sqlite);
    assert_eq!(
        config.checkpoint_path().to_str(),
        Some("/tmp/skillflow-test/checkpoints.db")
    );
    assert_eq!(config.schema_dir().to_str(), Some("/srv/skillflow/schemas"));

    let inference = config.inference.expect("inference section");
    assert_eq!(inference.endpoint, "http://localhost:8700/v1/skills");
    assert_eq!(inference.api_key, Some("sk-test-key".to_string()));
    assert_eq!(inference.request_timeout_secs, 45);

    assert_eq!(config.log.filter, "skillflow=debug");
}

#[test]
fn test_load_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\nmax_retry_rounds = 3\n").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.engine.max_retry_rounds, 3);
    assert_eq!(config.engine.max_concurrent_skills, 10);
    assert!(config.engine.enable_human_review);
    assert!(config.engine.enable_streaming);
    assert_eq!(config.retry.initial_backoff_ms, 1000);
    assert_eq!(config.retry.max_backoff_ms, 30000);
    assert_eq!(config.checkpoint.backend, CheckpointBackendKind::Sqlite);
    assert_eq!(config.schemas.dir, "./skills");
    assert!(config.inference.is_none());
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("SKILLFLOW_TEST_GATEWAY_KEY", "sk-from-env");
    let toml_content = r#"
[inference]
endpoint = "http://gateway.internal/v1/skills"
api_key = "${SKILLFLOW_TEST_GATEWAY_KEY}"
"#;
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    let inference = config.inference.expect("inference section");
    assert_eq!(inference.api_key.as_deref(), Some("sk-from-env"));
    assert_eq!(inference.request_timeout_secs, 120);
    std::env::remove_var("SKILLFLOW_TEST_GATEWAY_KEY");
}

#[test]
fn test_memory_backend_config() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[checkpoint]\nbackend = \"memory\"\n")
        .expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.checkpoint.backend, CheckpointBackendKind::Memory);
}

#[test]
fn test_invalid_settings_are_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[retry]\njitter = 1.5\n").expect("write toml");
    assert!(matches!(
        AppConfig::load(tmp.path()),
        Err(SkillflowError::Config(_))
    ));

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\nmax_concurrent_skills = \"many\"\n")
        .expect("write toml");
    assert!(matches!(
        AppConfig::load(tmp.path()),
        Err(SkillflowError::Config(_))
    ));
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let result = AppConfig::load(&dir.path().join("skillflow.toml"));
    assert!(matches!(result, Err(SkillflowError::ConfigNotFound(_))));
}
