use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::state::GraphState;
use crate::types::{ErrorKind, ExecutionId, SchemaDefinition, TokenUsage};

/// One skill invocation handed to an inference client.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub skill_id: String,
    pub prompt: String,
    pub document: Arc<str>,
    /// Output keys the skill is expected to produce.
    pub schema_hints: Vec<String>,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub temperature: f32,
    /// Deadline the engine enforces for this attempt.
    pub timeout: Duration,
}

/// Structured output of a successful skill invocation.
#[derive(Debug, Clone, Default)]
pub struct SkillOutput {
    pub data: Map<String, Value>,
    pub usage: TokenUsage,
    pub vendor: Option<String>,
    pub model: Option<String>,
}

impl SkillOutput {
    pub fn new(data: Map<String, Value>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }
}

/// Failure class reported by an inference client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    Retryable,
    Fatal,
}

impl From<ClientErrorKind> for ErrorKind {
    fn from(kind: ClientErrorKind) -> Self {
        match kind {
            ClientErrorKind::Retryable => ErrorKind::Retryable,
            ClientErrorKind::Fatal => ErrorKind::Fatal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub kind: ClientErrorKind,
    pub message: String,
}

impl ClassifiedError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ClientErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ClientErrorKind::Fatal,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Executes one skill call against a model vendor.
pub trait InferenceClient: Send + Sync + 'static {
    fn invoke(
        &self,
        request: InferenceRequest,
    ) -> BoxFuture<'_, std::result::Result<SkillOutput, ClassifiedError>>;
}

/// Read-only supplier of schema definitions.
pub trait SchemaSource: Send + Sync + 'static {
    fn load(&self, schema_id: &str) -> BoxFuture<'_, Result<SchemaDefinition>>;
}

/// Key-value persistence for checkpoints.
pub trait CheckpointBackend: Send + Sync + 'static {
    /// Store the snapshot, replacing any previous one for the same id.
    fn put(&self, state: &GraphState) -> Result<()>;

    /// Fetch the latest snapshot, if any.
    fn get(&self, execution_id: &ExecutionId) -> Result<Option<GraphState>>;

    /// Remove a snapshot. Reserved for external retention policies.
    fn delete(&self, execution_id: &ExecutionId) -> Result<bool>;
}
