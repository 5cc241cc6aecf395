use serde::Serialize;

use skillflow_core::config::EngineConfig;
use skillflow_core::state::{GraphState, WorkflowStatus};

use crate::plan::ExecutionPlan;

/// Next transition for an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum Route {
    /// Run the group at `next_group_index`.
    ContinueNextGroup,
    /// Every group is done and validation has not run yet.
    Validate,
    CompleteSuccess,
    PauseForHumanReview,
    /// Re-run these skills of the last group.
    RetryFailedSkills { skill_ids: Vec<String> },
    CompleteWithErrors,
    Fatal,
}

/// Decide the next transition. Pure: reads the snapshot, changes nothing.
pub fn route(state: &GraphState, plan: &ExecutionPlan, config: &EngineConfig) -> Route {
    if state.status == WorkflowStatus::Failed {
        return Route::Fatal;
    }

    if state.next_group_index < plan.len() {
        return Route::ContinueNextGroup;
    }

    let Some(validation) = state.validation_result.as_ref() else {
        return Route::Validate;
    };

    if !validation.has_blocking_failure {
        return Route::CompleteSuccess;
    }

    if plan.human_review_enabled(config.enable_human_review) {
        return Route::PauseForHumanReview;
    }

    if state.retry_rounds < config.max_retry_rounds {
        let skill_ids = retryable_in_last_group(state, plan);
        if !skill_ids.is_empty() {
            return Route::RetryFailedSkills { skill_ids };
        }
    }

    Route::CompleteWithErrors
}

/// Skills of the last group whose latest result is a retryable failure,
/// in declared order.
pub fn retryable_in_last_group(state: &GraphState, plan: &ExecutionPlan) -> Vec<String> {
    let Some(last) = plan.last_group() else {
        return vec![];
    };
    let latest = state.latest_results();
    last.skills
        .iter()
        .filter(|skill| {
            latest
                .get(skill.id.as_str())
                .is_some_and(|r| r.is_retryable_failure())
        })
        .map(|skill| skill.id.clone())
        .collect()
}
