use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SkillflowError};

/// Top-level skillflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub schemas: SchemaSourceConfig,
    #[serde(default)]
    pub inference: Option<InferenceConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

/// Engine-wide execution settings, handed to the engine constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cap on simultaneous inference calls across all executions.
    #[serde(default = "default_max_concurrent_skills")]
    pub max_concurrent_skills: usize,
    /// Router-driven retry rounds allowed per execution.
    #[serde(default = "default_max_retry_rounds")]
    pub max_retry_rounds: u32,
    /// Pause for human review on blocking validation failures
    /// (schemas may override).
    #[serde(default = "default_true")]
    pub enable_human_review: bool,
    /// Publish progress events on the event bus.
    #[serde(default = "default_true")]
    pub enable_streaming: bool,
    /// Broadcast channel capacity for progress events.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default)]
    pub default_vendor: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_skills: default_max_concurrent_skills(),
            max_retry_rounds: default_max_retry_rounds(),
            enable_human_review: true,
            enable_streaming: true,
            event_buffer: default_event_buffer(),
            default_vendor: None,
            default_model: None,
        }
    }
}

fn default_max_concurrent_skills() -> usize { 10 }
fn default_max_retry_rounds() -> u32 { 2 }
fn default_event_buffer() -> usize { 256 }
fn default_true() -> bool { true }

/// Backoff between attempts of the same skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Relative jitter; 0.2 spreads each delay over 0.8x to 1.2x.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            jitter: default_jitter(),
        }
    }
}

fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }
fn default_jitter() -> f64 { 0.2 }

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackendKind {
    Memory,
    #[default]
    Sqlite,
}

/// Checkpoint persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub backend: CheckpointBackendKind,
    /// SQLite database path. Default: ./data/checkpoints.db
    #[serde(default = "default_checkpoint_path")]
    pub path: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackendKind::default(),
            path: default_checkpoint_path(),
        }
    }
}

fn default_checkpoint_path() -> String { "./data/checkpoints.db".to_string() }

/// Where schema definitions are read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSourceConfig {
    /// Directory containing `<schema_id>/schema.json`. Default: ./skills
    #[serde(default = "default_schema_dir")]
    pub dir: String,
}

impl Default for SchemaSourceConfig {
    fn default() -> Self {
        Self {
            dir: default_schema_dir(),
        }
    }
}

fn default_schema_dir() -> String { "./skills".to_string() }

/// HTTP inference endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Transport-level timeout; the engine's per-skill deadline still applies.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 { 120 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// tracing EnvFilter directive used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String { "skillflow=info,warn".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SkillflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| SkillflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_concurrent_skills == 0 {
            return Err(SkillflowError::Config(
                "engine.max_concurrent_skills must be at least 1".into(),
            ));
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(SkillflowError::Config(
                "retry.max_backoff_ms must not be below retry.initial_backoff_ms".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(SkillflowError::Config("retry.jitter must be in [0, 1)".into()));
        }
        Ok(())
    }

    pub fn schema_dir(&self) -> PathBuf {
        expand_home(&self.schemas.dir)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        expand_home(&self.checkpoint.path)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_SKILLFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_SKILLFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_SKILLFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_SKILLFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_SKILLFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_concurrent_skills, 10);
        assert_eq!(config.engine.max_retry_rounds, 2);
        assert!(config.engine.enable_human_review);
        assert_eq!(config.retry.initial_backoff_ms, 1000);
        assert_eq!(config.checkpoint.backend, CheckpointBackendKind::Sqlite);
        assert!(config.inference.is_none());
        assert_eq!(config.log.filter, "skillflow=info,warn");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config: AppConfig = toml::from_str("[engine]\nmax_concurrent_skills = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(SkillflowError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let config: AppConfig =
            toml::from_str("[retry]\ninitial_backoff_ms = 500\nmax_backoff_ms = 100\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_memory_backend_parses() {
        let config: AppConfig = toml::from_str("[checkpoint]\nbackend = \"memory\"\n").unwrap();
        assert_eq!(config.checkpoint.backend, CheckpointBackendKind::Memory);
        assert_eq!(config.checkpoint.path, "./data/checkpoints.db");
    }
}
