use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::stream::{BoxStream, StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use skillflow_core::config::{EngineConfig, RetryConfig};
use skillflow_core::error::{Result, SkillflowError};
use skillflow_core::event::EventBus;
use skillflow_core::state::{ExecutionSummary, GraphState, WorkflowStatus};
use skillflow_core::traits::{InferenceClient, SchemaSource};
use skillflow_core::types::{
    ExecutionId, HumanFeedback, ProgressEvent, ProgressEventType, SkillDescriptor,
};

use crate::checkpoint::{CheckpointStore, ExecutionLease};
use crate::executor::{GroupExecutor, GroupOutcome};
use crate::merge;
use crate::plan::ExecutionPlan;
use crate::progress::{node, ProgressEmitter};
use crate::router::{self, Route};
use crate::source::PlanCache;
use crate::validator;

struct ActiveRun {
    /// Distinguishes successive runs of the same execution.
    run_no: u64,
    cancel: CancellationToken,
    /// Tripped once the run has written its last checkpoint.
    finished: CancellationToken,
}

/// Runs workflow executions: plan lookup, group scheduling, merge,
/// validation and routing, with a checkpoint after every transition.
pub struct WorkflowEngine {
    config: EngineConfig,
    executor: GroupExecutor,
    plans: PlanCache,
    checkpoints: Arc<CheckpointStore>,
    bus: Arc<EventBus>,
    emitter: ProgressEmitter,
    active: Mutex<HashMap<String, ActiveRun>>,
    /// Runs begun with `start` that have not finished or been awaited.
    detached: Mutex<HashMap<String, JoinHandle<Result<GraphState>>>>,
    next_run_no: AtomicU64,
}

impl WorkflowEngine {
    pub fn new(
        config: EngineConfig,
        retry: RetryConfig,
        client: Arc<dyn InferenceClient>,
        source: Arc<dyn SchemaSource>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Self {
        let bus = Arc::new(EventBus::new(config.event_buffer));
        Self::with_event_bus(config, retry, client, source, checkpoints, bus)
    }

    /// Build an engine that publishes on an existing bus.
    pub fn with_event_bus(
        config: EngineConfig,
        retry: RetryConfig,
        client: Arc<dyn InferenceClient>,
        source: Arc<dyn SchemaSource>,
        checkpoints: Arc<CheckpointStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            executor: GroupExecutor::new(client, &config, retry),
            plans: PlanCache::new(source),
            checkpoints,
            emitter: ProgressEmitter::new(Arc::clone(&bus), config.enable_streaming),
            bus,
            config,
            active: Mutex::new(HashMap::new()),
            detached: Mutex::new(HashMap::new()),
            next_run_no: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Compile (or fetch the cached) plan for the schema's current version.
    pub async fn plan(&self, schema_id: &str) -> Result<Arc<ExecutionPlan>> {
        self.plans.current(schema_id).await
    }

    /// Begin an execution in the background and return its id.
    pub async fn start(
        self: &Arc<Self>,
        document: impl Into<String>,
        schema_id: &str,
    ) -> Result<ExecutionId> {
        let (lease, plan, state) = self.prepare(document.into(), schema_id).await?;
        let execution_id = state.execution_id.clone();
        let (run_no, cancel) = self.register(&execution_id);

        let engine = Arc::clone(self);
        let key = execution_id.0.clone();
        // Held until the handle is stored so the task cannot deregister first.
        let mut detached = lock(&self.detached);
        let handle = tokio::spawn(async move {
            let result = engine.drive(&lease, &plan, state, &cancel).await;
            engine.end_run(lease, run_no, &result);
            lock(&engine.detached).remove(&key);
            result
        });
        detached.insert(execution_id.0.clone(), handle);
        drop(detached);
        Ok(execution_id)
    }

    /// Run an execution to its end (terminal or paused) and return the state.
    pub async fn execute(&self, document: impl Into<String>, schema_id: &str) -> Result<GraphState> {
        let (lease, plan, state) = self.prepare(document.into(), schema_id).await?;
        let (run_no, cancel) = self.register(&state.execution_id);
        let result = self.drive(&lease, &plan, state, &cancel).await;
        self.end_run(lease, run_no, &result);
        result
    }

    /// Continue a paused or interrupted execution.
    ///
    /// Feedback is applied only when the execution awaits human review.
    pub async fn resume(
        &self,
        execution_id: &ExecutionId,
        feedback: Option<HumanFeedback>,
    ) -> Result<GraphState> {
        let lease = self.checkpoints.acquire(execution_id)?;
        let state = self.checkpoints.load(execution_id)?;
        if state.is_terminal() {
            return Err(SkillflowError::AlreadyTerminal {
                execution_id: execution_id.0.clone(),
                status: state.status.to_string(),
            });
        }
        let plan = self
            .plans
            .for_version(&state.schema_id, &state.plan_version)
            .await?;

        let (run_no, cancel) = self.register(execution_id);
        let result = self
            .continue_from(&lease, &plan, state, feedback, &cancel)
            .await;
        self.end_run(lease, run_no, &result);
        result
    }

    /// Trip the cancellation token of an in-flight run.
    pub fn cancel(&self, execution_id: &ExecutionId) -> bool {
        match lock(&self.active).get(execution_id.as_str()) {
            Some(run) => {
                info!(execution_id = %execution_id, "Cancellation requested");
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, execution_id: &ExecutionId) -> bool {
        lock(&self.active).contains_key(execution_id.as_str())
    }

    /// Last persisted state.
    pub fn status(&self, execution_id: &ExecutionId) -> Result<GraphState> {
        self.checkpoints.load(execution_id)
    }

    pub fn summary(&self, execution_id: &ExecutionId) -> Result<ExecutionSummary> {
        Ok(ExecutionSummary::from_state(&self.status(execution_id)?))
    }

    /// Await a run begun with [`start`](Self::start). Runs that already
    /// finished, and anything else, return the last persisted state.
    pub async fn wait(&self, execution_id: &ExecutionId) -> Result<GraphState> {
        let handle = lock(&self.detached).remove(execution_id.as_str());
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| SkillflowError::Task(e.to_string()))?,
            None => self.status(execution_id),
        }
    }

    /// Persisted events followed by live ones, ending after the current
    /// run's next terminal or pause event.
    pub fn stream_events(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<BoxStream<'static, ProgressEvent>> {
        // Subscribe before reading the checkpoint so nothing falls in between.
        let mut live = self.bus.subscribe();
        let finished = lock(&self.active)
            .get(execution_id.as_str())
            .map(|run| run.finished.clone());
        let state = self.checkpoints.load(execution_id)?;

        let (tx, rx) = mpsc::channel(64);
        let checkpoints = Arc::clone(&self.checkpoints);
        let execution_id = execution_id.clone();

        tokio::spawn(async move {
            let mut next_seq = 0;
            if !forward(&tx, state.progress_events, &mut next_seq, false).await {
                return;
            }

            let Some(finished) = finished else {
                return;
            };

            loop {
                tokio::select! {
                    msg = live.recv() => match msg {
                        Ok((id, event)) if id == execution_id => {
                            if event.seq < next_seq {
                                continue;
                            }
                            if event.seq > next_seq {
                                // Missed events: fill in from the latest checkpoint.
                                let Ok(state) = checkpoints.load(&execution_id) else {
                                    return;
                                };
                                if !forward(&tx, state.progress_events, &mut next_seq, true).await {
                                    return;
                                }
                                if event.seq != next_seq {
                                    // Not persisted yet; the final replay sends it.
                                    continue;
                                }
                            }
                            if !forward(&tx, vec![event], &mut next_seq, true).await {
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(execution_id = %execution_id, skipped, "Event stream lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = finished.cancelled() => break,
                }
            }

            // The run is over; its final checkpoint holds anything not yet sent.
            if let Ok(state) = checkpoints.load(&execution_id) {
                forward(&tx, state.progress_events, &mut next_seq, true).await;
            }
        });

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }

    async fn prepare(
        &self,
        document: String,
        schema_id: &str,
    ) -> Result<(ExecutionLease, Arc<ExecutionPlan>, GraphState)> {
        let plan = self.plans.current(schema_id).await?;
        let execution_id = ExecutionId::new();
        let lease = self.checkpoints.acquire(&execution_id)?;

        let mut state = GraphState::new(execution_id, document, &plan.schema_id, &plan.version);
        self.emitter.emit(
            &mut state,
            ProgressEventType::ExecutionStarted,
            node::INITIALIZE,
            json!({
                "schema_id": plan.schema_id,
                "plan_version": plan.version,
                "groups": plan.len(),
                "skills": plan.skill_count(),
            }),
        );
        self.checkpoints.save(&lease, &state)?;

        info!(
            execution_id = %state.execution_id,
            schema_id = %plan.schema_id,
            plan_version = %plan.version,
            groups = plan.len(),
            "Execution started"
        );
        Ok((lease, plan, state))
    }

    fn register(&self, execution_id: &ExecutionId) -> (u64, CancellationToken) {
        let run_no = self.next_run_no.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        lock(&self.active).insert(
            execution_id.0.clone(),
            ActiveRun {
                run_no,
                cancel: cancel.clone(),
                finished: CancellationToken::new(),
            },
        );
        (run_no, cancel)
    }

    /// Deregister the run, then release its lease. The order matters: once
    /// the lease is free a resume may register the same execution again.
    fn end_run(&self, lease: ExecutionLease, run_no: u64, result: &Result<GraphState>) {
        let execution_id = lease.execution_id().clone();
        if let Err(e) = result {
            error!(execution_id = %execution_id, error = %e, "Execution aborted");
        }
        if let Entry::Occupied(entry) = lock(&self.active).entry(execution_id.0.clone()) {
            if entry.get().run_no == run_no {
                entry.remove().finished.cancel();
            }
        }
        drop(lease);
    }

    async fn continue_from(
        &self,
        lease: &ExecutionLease,
        plan: &ExecutionPlan,
        mut state: GraphState,
        feedback: Option<HumanFeedback>,
        cancel: &CancellationToken,
    ) -> Result<GraphState> {
        let from = state.status;
        match from {
            WorkflowStatus::AwaitingHumanReview => {
                let feedback = feedback.unwrap_or_default();
                merge::overlay(&mut state.merged_result, &feedback.corrections);
                merge::overlay(&mut state.corrections, &feedback.corrections);
                let payload = json!({
                    "from": from.to_string(),
                    "corrected_fields": feedback.corrections.keys().collect::<Vec<_>>(),
                    "reviewer": feedback.reviewer,
                });
                state.human_feedback = Some(feedback);
                // Re-validate against the corrected result.
                state.validation_result = None;
                state.status = WorkflowStatus::Running;
                self.emitter.emit(
                    &mut state,
                    ProgressEventType::ExecutionResumed,
                    node::HUMAN_REVIEW,
                    payload,
                );
                self.checkpoint(lease, &mut state)?;
            }
            WorkflowStatus::AwaitingRetry => {
                state.status = WorkflowStatus::Running;
                let payload = json!({ "from": from.to_string(), "retry_round": state.retry_rounds });
                self.emitter.emit(
                    &mut state,
                    ProgressEventType::ExecutionResumed,
                    node::ROUTER,
                    payload,
                );
                let skill_ids = router::retryable_in_last_group(&state, plan);
                self.execute_retry(lease, plan, &mut state, &skill_ids, cancel)
                    .await?;
            }
            WorkflowStatus::Running => {
                if feedback.is_some_and(|f| !f.corrections.is_empty()) {
                    warn!(
                        execution_id = %state.execution_id,
                        "Ignoring corrections for an execution that is not awaiting review"
                    );
                }
                let payload =
                    json!({ "from": from.to_string(), "next_group_index": state.next_group_index });
                self.emitter.emit(
                    &mut state,
                    ProgressEventType::ExecutionResumed,
                    node::ROUTER,
                    payload,
                );
            }
            WorkflowStatus::Completed | WorkflowStatus::Failed => {
                return Err(SkillflowError::AlreadyTerminal {
                    execution_id: state.execution_id.0.clone(),
                    status: from.to_string(),
                });
            }
        }

        info!(execution_id = %state.execution_id, from = %from, "Execution resumed");
        self.drive(lease, plan, state, cancel).await
    }

    /// Apply routes until the execution is terminal or paused.
    async fn drive(
        &self,
        lease: &ExecutionLease,
        plan: &ExecutionPlan,
        mut state: GraphState,
        cancel: &CancellationToken,
    ) -> Result<GraphState> {
        loop {
            // Finalized (completed_at set) states are done; a bare Failed
            // status still needs the Fatal route to record it.
            if state.is_terminal() && state.completed_at.is_some() {
                return Ok(state);
            }
            if cancel.is_cancelled() {
                self.mark_cancelled(lease, &mut state, None)?;
                return Ok(state);
            }

            let next = router::route(&state, plan, &self.config);
            debug!(execution_id = %state.execution_id, route = ?next, "Routing");

            match next {
                Route::ContinueNextGroup => {
                    self.execute_next_group(lease, plan, &mut state, cancel)
                        .await?;
                }
                Route::Validate => self.run_validation(plan, &mut state),
                Route::CompleteSuccess | Route::CompleteWithErrors => {
                    let with_errors = next == Route::CompleteWithErrors;
                    state.finish(WorkflowStatus::Completed);
                    let summary = ExecutionSummary::from_state(&state);
                    let payload = json!({
                        "outcome": summary.outcome,
                        "with_errors": with_errors,
                        "quality_score": summary.validation.as_ref().map(|v| v.quality_score),
                        "elapsed_ms": summary.elapsed_ms,
                        "total_tokens": summary.token_usage.total_tokens,
                    });
                    self.emitter.emit(
                        &mut state,
                        ProgressEventType::ExecutionCompleted,
                        node::FINALIZE,
                        payload,
                    );
                    self.checkpoints.save(lease, &state)?;
                    info!(
                        execution_id = %state.execution_id,
                        outcome = ?summary.outcome,
                        with_errors,
                        "Execution completed"
                    );
                    return Ok(state);
                }
                Route::PauseForHumanReview => {
                    state.status = WorkflowStatus::AwaitingHumanReview;
                    let (blocking, score) = state
                        .validation_result
                        .as_ref()
                        .map(|v| (v.blocking_rule_ids(), v.quality_score))
                        .unwrap_or_default();
                    self.emitter.emit(
                        &mut state,
                        ProgressEventType::HumanReviewRequested,
                        node::HUMAN_REVIEW,
                        json!({ "blocking_rules": blocking, "quality_score": score }),
                    );
                    self.checkpoints.save(lease, &state)?;
                    info!(
                        execution_id = %state.execution_id,
                        blocking_rules = ?blocking,
                        "Paused for human review"
                    );
                    return Ok(state);
                }
                Route::RetryFailedSkills { skill_ids } => {
                    state.status = WorkflowStatus::AwaitingRetry;
                    state.retry_rounds += 1;
                    let payload = json!({ "round": state.retry_rounds, "skills": skill_ids });
                    self.emitter.emit(
                        &mut state,
                        ProgressEventType::RetryScheduled,
                        node::ROUTER,
                        payload,
                    );
                    self.checkpoint(lease, &mut state)?;
                    info!(
                        execution_id = %state.execution_id,
                        round = state.retry_rounds,
                        skills = ?skill_ids,
                        "Retrying failed skills"
                    );
                    state.status = WorkflowStatus::Running;
                    self.execute_retry(lease, plan, &mut state, &skill_ids, cancel)
                        .await?;
                }
                Route::Fatal => {
                    state.finish(WorkflowStatus::Failed);
                    let payload = json!({ "reason": state.failure });
                    self.emitter.emit(
                        &mut state,
                        ProgressEventType::ExecutionFailed,
                        node::FINALIZE,
                        payload,
                    );
                    self.checkpoints.save(lease, &state)?;
                    error!(
                        execution_id = %state.execution_id,
                        reason = state.failure.as_deref().unwrap_or("unknown"),
                        "Execution failed"
                    );
                    return Ok(state);
                }
            }
        }
    }

    async fn execute_next_group(
        &self,
        lease: &ExecutionLease,
        plan: &ExecutionPlan,
        state: &mut GraphState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let index = state.next_group_index;
        let group = plan.group(index).ok_or_else(|| {
            SkillflowError::Checkpoint(format!(
                "group index {} is outside the plan ({} groups)",
                index,
                plan.len()
            ))
        })?;
        let skills: Vec<&SkillDescriptor> = group.skills.iter().collect();

        self.emitter.emit(
            state,
            ProgressEventType::GroupStarted,
            node::EXECUTE_GROUP,
            json!({
                "group": group.number,
                "index": index,
                "skills": skills.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            }),
        );
        info!(
            execution_id = %state.execution_id,
            group = group.number,
            skills = skills.len(),
            "Executing group"
        );

        let document: Arc<str> = Arc::from(state.document.as_str());
        let outcome = self
            .executor
            .run_group(group.number, &skills, document, 0, cancel)
            .await;
        self.apply_group(lease, plan, state, outcome, false)
    }

    async fn execute_retry(
        &self,
        lease: &ExecutionLease,
        plan: &ExecutionPlan,
        state: &mut GraphState,
        skill_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let group = plan.last_group().ok_or_else(|| {
            SkillflowError::Checkpoint("plan has no groups to retry".to_string())
        })?;
        let skills: Vec<&SkillDescriptor> = group
            .skills
            .iter()
            .filter(|s| skill_ids.contains(&s.id))
            .collect();

        let payload = json!({
            "group": group.number,
            "retry_round": state.retry_rounds,
            "skills": skill_ids,
        });
        self.emitter.emit(
            state,
            ProgressEventType::GroupStarted,
            node::EXECUTE_GROUP,
            payload,
        );

        let document: Arc<str> = Arc::from(state.document.as_str());
        let outcome = self
            .executor
            .run_group(group.number, &skills, document, state.retry_rounds, cancel)
            .await;
        self.apply_group(lease, plan, state, outcome, true)
    }

    /// Record a group's results, then merge and checkpoint, or mark the
    /// execution failed or cancelled.
    fn apply_group(
        &self,
        lease: &ExecutionLease,
        plan: &ExecutionPlan,
        state: &mut GraphState,
        outcome: GroupOutcome,
        is_retry: bool,
    ) -> Result<()> {
        let succeeded = outcome.succeeded();
        let failed = outcome.failed();
        let GroupOutcome {
            group,
            results,
            critical_failure,
            cancelled,
        } = outcome;

        for result in results.iter().filter(|r| !r.is_success()) {
            warn!(
                execution_id = %state.execution_id,
                skill_id = %result.skill_id,
                group,
                attempts = result.attempts,
                error = result.error.as_ref().map(|e| e.message.as_str()).unwrap_or(""),
                "Skill failed"
            );
        }

        let first_new = state.skill_results.len();
        // Every result is kept for audit, whether or not it is merged.
        state.record_results(results);

        if cancelled {
            return self.mark_cancelled(lease, state, Some(group));
        }

        if let Some(skill_id) = critical_failure {
            let message = state.skill_results[first_new..]
                .iter()
                .find(|r| r.skill_id == skill_id)
                .and_then(|r| r.error.as_ref())
                .map(|e| e.message.clone())
                .unwrap_or_default();
            state.failure = Some(format!("critical skill '{}' failed: {}", skill_id, message));
            state.status = WorkflowStatus::Failed;
            self.emitter.emit(
                state,
                ProgressEventType::GroupFailed,
                node::EXECUTE_GROUP,
                json!({ "group": group, "skill_id": skill_id, "error": message }),
            );
            return Ok(());
        }

        if is_retry {
            state.merged_result = merge::recompute(
                plan,
                state.next_group_index,
                &state.skill_results,
                &state.corrections,
            );
            state.validation_result = None;
        } else {
            let merged = {
                let new_results: Vec<_> = state.skill_results[first_new..].iter().collect();
                merge::merge(&state.merged_result, &new_results, plan.merge_strategy)
            };
            state.merged_result = merged;
            state.next_group_index += 1;
        }

        let completed = json!({
            "group": group,
            "succeeded": succeeded,
            "failed": failed,
            "retry_round": if is_retry { state.retry_rounds } else { 0 },
        });
        self.emitter.emit(
            state,
            ProgressEventType::GroupCompleted,
            node::EXECUTE_GROUP,
            completed,
        );
        let merged = json!({
            "strategy": plan.merge_strategy.to_string(),
            "keys": state.merged_result.len(),
            "recomputed": is_retry,
        });
        self.emitter.emit(state, ProgressEventType::MergeApplied, node::MERGE, merged);
        info!(
            execution_id = %state.execution_id,
            group,
            succeeded,
            failed,
            "Group completed"
        );
        self.checkpoint(lease, state)
    }

    fn run_validation(&self, plan: &ExecutionPlan, state: &mut GraphState) {
        let result = validator::validate(&plan.validation_rules, &state.merged_result);
        let payload = json!({
            "passed": !result.has_blocking_failure,
            "quality_score": result.quality_score,
            "verdict": result.verdict,
            "blocking_rules": result.blocking_rule_ids(),
        });
        info!(
            execution_id = %state.execution_id,
            quality_score = result.quality_score,
            blocking = result.has_blocking_failure,
            "Validation completed"
        );
        state.validation_result = Some(result);
        self.emitter.emit(
            state,
            ProgressEventType::ValidationCompleted,
            node::VALIDATE,
            payload,
        );
    }

    fn mark_cancelled(
        &self,
        lease: &ExecutionLease,
        state: &mut GraphState,
        group: Option<u32>,
    ) -> Result<()> {
        state.failure = Some("cancelled".to_string());
        state.finish(WorkflowStatus::Failed);
        let payload = json!({ "group": group, "next_group_index": state.next_group_index });
        self.emitter.emit(
            state,
            ProgressEventType::ExecutionCancelled,
            node::FINALIZE,
            payload,
        );
        self.checkpoints.save(lease, state)?;
        warn!(execution_id = %state.execution_id, ?group, "Execution cancelled");
        Ok(())
    }

    /// Record a checkpoint event and persist the state.
    fn checkpoint(&self, lease: &ExecutionLease, state: &mut GraphState) -> Result<()> {
        let payload = json!({
            "next_group_index": state.next_group_index,
            "status": state.status.to_string(),
        });
        self.emitter.emit(
            state,
            ProgressEventType::CheckpointSaved,
            node::CHECKPOINT,
            payload,
        );
        self.checkpoints.save(lease, state)
    }
}

/// Send events from `next_seq` on, in order. Returns false once the
/// receiver is gone or, with `stop_at_end`, a run-ending event was sent.
async fn forward(
    tx: &mpsc::Sender<ProgressEvent>,
    events: Vec<ProgressEvent>,
    next_seq: &mut u64,
    stop_at_end: bool,
) -> bool {
    for event in events {
        if event.seq != *next_seq {
            continue;
        }
        *next_seq += 1;
        let ends = stop_at_end && event.event_type.ends_run();
        if tx.send(event).await.is_err() || ends {
            return false;
        }
    }
    true
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use skillflow_core::types::SchemaDefinition;
    use skillflow_test_utils::{fast_retry_config, test_engine_config, ScriptedInferenceClient};

    use super::*;
    use crate::source::StaticSchemaSource;

    fn test_engine(
        client: ScriptedInferenceClient,
        schema: SchemaDefinition,
    ) -> (Arc<WorkflowEngine>, Arc<CheckpointStore>) {
        let store = Arc::new(CheckpointStore::in_memory());
        let engine = WorkflowEngine::new(
            test_engine_config(),
            fast_retry_config(),
            Arc::new(client),
            Arc::new(StaticSchemaSource::new().with_schema(schema)),
            Arc::clone(&store),
        );
        (Arc::new(engine), store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_runs_are_released_without_wait() {
        let schema = SchemaDefinition::new("doc", "1").with_skill(SkillDescriptor::new("a"));
        let client = ScriptedInferenceClient::new().respond_after(
            "a",
            Duration::from_millis(10),
            json!({"a": 1}),
        );
        let (engine, _) = test_engine(client, schema);

        let mut ids = Vec::new();
        for _ in 0..8 {
            ids.push(engine.start("text", "doc").await.unwrap());
        }
        assert_eq!(lock(&engine.detached).len(), 8);

        // Poll the way a caller without `wait` would.
        loop {
            let done = ids
                .iter()
                .all(|id| engine.status(id).unwrap().is_terminal() && !engine.is_running(id));
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(lock(&engine.detached).is_empty());
        assert!(lock(&engine.active).is_empty());
        // A finished run is still observable through `wait`.
        let state = engine.wait(&ids[0]).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_end_run_leaves_a_newer_run_registered() {
        let schema = SchemaDefinition::new("doc", "1").with_skill(SkillDescriptor::new("a"));
        let (engine, store) = test_engine(ScriptedInferenceClient::new(), schema);
        let id = ExecutionId::from_str("exec-rerun");

        let lease = store.acquire(&id).unwrap();
        let (first, _) = engine.register(&id);
        // A resume that registered before the first run finished cleaning up.
        let (second, second_cancel) = engine.register(&id);
        assert_ne!(first, second);

        let state = GraphState::new(id.clone(), "text", "doc", "1");
        engine.end_run(lease, first, &Ok(state));

        assert!(!store.is_leased(&id));
        assert!(engine.is_running(&id));
        assert!(engine.cancel(&id));
        assert!(second_cancel.is_cancelled());

        let lease = store.acquire(&id).unwrap();
        let state = GraphState::new(id.clone(), "text", "doc", "1");
        engine.end_run(lease, second, &Ok(state));
        assert!(!engine.is_running(&id));
    }
}
