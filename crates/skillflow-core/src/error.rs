use thiserror::Error;

#[derive(Debug, Error)]
pub enum SkillflowError {
    // Schema / plan errors
    #[error("Schema '{schema_id}' is invalid: {}", violations.join("; "))]
    SchemaInvalid {
        schema_id: String,
        violations: Vec<String>,
    },

    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    #[error("Plan version mismatch for schema '{schema_id}': checkpoint uses {expected}, source serves {actual}")]
    PlanVersionMismatch {
        schema_id: String,
        expected: String,
        actual: String,
    },

    // Skill errors
    #[error("Skill failed (retryable): {skill}: {message}")]
    SkillRetryable { skill: String, message: String },

    #[error("Skill failed (fatal): {skill}: {message}")]
    SkillFatal { skill: String, message: String },

    // Validation errors
    #[error("Blocking validation failure: {}", rules.join(", "))]
    ValidationBlocking { rules: Vec<String> },

    // Execution lifecycle errors
    #[error("Execution cancelled")]
    Cancelled,

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution {0} is held by another writer")]
    ExecutionBusy(String),

    #[error("Execution {execution_id} already reached terminal status {status}")]
    AlreadyTerminal { execution_id: String, status: String },

    #[error("Execution task failed: {0}")]
    Task(String),

    // Storage errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    // Inference transport errors
    #[error("Inference client error: {0}")]
    Inference(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SkillflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_invalid_lists_every_violation() {
        let err = SkillflowError::SchemaInvalid {
            schema_id: "invoice".into(),
            violations: vec!["duplicate skill id 'a'".into(), "skill 'b': group must be >= 1".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("duplicate skill id 'a'"));
        assert!(msg.contains("group must be >= 1"));
    }
}
