use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::*;

/// Lifecycle status of a workflow execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStatus {
    Running,
    AwaitingRetry,
    AwaitingHumanReview,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::AwaitingRetry => "awaiting-retry",
            Self::AwaitingHumanReview => "awaiting-human-review",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The mutable record of one workflow execution.
///
/// Checkpointed as a whole; every field round-trips through JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphState {
    pub execution_id: ExecutionId,
    pub document: String,
    pub schema_id: String,
    pub plan_version: String,
    /// Count of groups fully processed. Never decreases.
    pub next_group_index: usize,
    /// Append-only audit trail of every skill outcome.
    pub skill_results: Vec<SkillResult>,
    pub merged_result: Map<String, Value>,
    pub validation_result: Option<ValidationResult>,
    pub status: WorkflowStatus,
    pub progress_events: Vec<ProgressEvent>,
    pub token_usage_total: TokenUsage,
    /// Router-driven retry rounds performed so far.
    #[serde(default)]
    pub retry_rounds: u32,
    /// Every reviewer correction applied so far, later ones winning.
    #[serde(default)]
    pub corrections: Map<String, Value>,
    #[serde(default)]
    pub human_feedback: Option<HumanFeedback>,
    /// Reason recorded when the execution failed.
    #[serde(default)]
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl GraphState {
    pub fn new(
        execution_id: ExecutionId,
        document: impl Into<String>,
        schema_id: impl Into<String>,
        plan_version: impl Into<String>,
    ) -> Self {
        Self {
            execution_id,
            document: document.into(),
            schema_id: schema_id.into(),
            plan_version: plan_version.into(),
            next_group_index: 0,
            skill_results: vec![],
            merged_result: Map::new(),
            validation_result: None,
            status: WorkflowStatus::Running,
            progress_events: vec![],
            token_usage_total: TokenUsage::default(),
            retry_rounds: 0,
            corrections: Map::new(),
            human_feedback: None,
            failure: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Append results and fold their token usage into the running total.
    pub fn record_results(&mut self, results: Vec<SkillResult>) {
        for result in &results {
            self.token_usage_total.add(&result.token_usage);
        }
        self.skill_results.extend(results);
    }

    /// Latest recorded result per skill id.
    pub fn latest_results(&self) -> HashMap<&str, &SkillResult> {
        let mut latest = HashMap::new();
        for result in &self.skill_results {
            latest.insert(result.skill_id.as_str(), result);
        }
        latest
    }

    /// Sequence number for the next progress event.
    pub fn next_event_seq(&self) -> u64 {
        self.progress_events.last().map_or(0, |e| e.seq + 1)
    }

    /// Mark the execution terminal.
    pub fn finish(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

/// Overall outcome reported to callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionOutcome {
    /// Every skill succeeded and the execution completed.
    Completed,
    /// Completed, but some skill results are failures.
    Partial,
    Failed,
    /// Not terminal yet (running, awaiting retry or review).
    Pending,
}

/// Caller-facing digest of a [`GraphState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: ExecutionId,
    pub schema_id: String,
    pub plan_version: String,
    pub status: WorkflowStatus,
    pub outcome: ExecutionOutcome,
    pub data: Map<String, Value>,
    pub validation: Option<ValidationResult>,
    pub token_usage: TokenUsage,
    pub token_usage_by_skill: BTreeMap<String, TokenUsage>,
    pub vendors_used: BTreeSet<String>,
    pub models_used: BTreeSet<String>,
    pub elapsed_ms: Option<i64>,
    pub error: Option<String>,
}

impl ExecutionSummary {
    pub fn from_state(state: &GraphState) -> Self {
        let latest = state.latest_results();
        let any_failed = latest.values().any(|r| !r.is_success());

        let outcome = match state.status {
            WorkflowStatus::Completed if any_failed => ExecutionOutcome::Partial,
            WorkflowStatus::Completed => ExecutionOutcome::Completed,
            WorkflowStatus::Failed => ExecutionOutcome::Failed,
            _ => ExecutionOutcome::Pending,
        };

        let mut token_usage_by_skill: BTreeMap<String, TokenUsage> = BTreeMap::new();
        for result in &state.skill_results {
            token_usage_by_skill
                .entry(result.skill_id.clone())
                .or_default()
                .add(&result.token_usage);
        }

        let vendors_used = state
            .skill_results
            .iter()
            .filter_map(|r| r.vendor_used.clone())
            .collect();
        let models_used = state
            .skill_results
            .iter()
            .filter_map(|r| r.model_used.clone())
            .collect();

        let mut errors: Vec<String> = state
            .skill_results
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {}", r.skill_id, e.message)))
            .collect();
        if let Some(ref failure) = state.failure {
            errors.insert(0, failure.clone());
        }

        Self {
            execution_id: state.execution_id.clone(),
            schema_id: state.schema_id.clone(),
            plan_version: state.plan_version.clone(),
            status: state.status,
            outcome,
            data: state.merged_result.clone(),
            validation: state.validation_result.clone(),
            token_usage: state.token_usage_total,
            token_usage_by_skill,
            vendors_used,
            models_used,
            elapsed_ms: state
                .completed_at
                .map(|done| (done - state.started_at).num_milliseconds()),
            error: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
        }
    }
}
