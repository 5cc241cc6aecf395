use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use skillflow_core::config::{EngineConfig, RetryConfig};
use skillflow_core::traits::{InferenceClient, InferenceRequest, SkillOutput};
use skillflow_core::types::{ErrorKind, SkillDescriptor, SkillError, SkillResult};

use crate::retry::calculate_backoff;

/// Results of running one group (or the retried subset of one).
#[derive(Debug, Clone)]
pub struct GroupOutcome {
    pub group: u32,
    /// One result per skill, in declared order.
    pub results: Vec<SkillResult>,
    /// First critical skill (declared order) that ended failed.
    pub critical_failure: Option<String>,
    pub cancelled: bool,
}

impl GroupOutcome {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

enum Attempt {
    Done(SkillOutput),
    Failed(SkillError),
    Cancelled,
}

/// Runs the skills of one group concurrently against the inference client.
///
/// The semaphore is shared by every execution of an engine and caps
/// simultaneous inference calls process-wide.
pub struct GroupExecutor {
    client: Arc<dyn InferenceClient>,
    limiter: Arc<Semaphore>,
    retry: RetryConfig,
    default_vendor: Option<String>,
    default_model: Option<String>,
}

impl GroupExecutor {
    pub fn new(client: Arc<dyn InferenceClient>, config: &EngineConfig, retry: RetryConfig) -> Self {
        Self {
            client,
            limiter: Arc::new(Semaphore::new(config.max_concurrent_skills.max(1))),
            retry,
            default_vendor: config.default_vendor.clone(),
            default_model: config.default_model.clone(),
        }
    }

    /// Run `skills` concurrently and wait for every one of them to reach
    /// a terminal state. A failed critical skill does not abort its peers.
    pub async fn run_group(
        &self,
        group: u32,
        skills: &[&SkillDescriptor],
        document: Arc<str>,
        retry_round: u32,
        cancel: &CancellationToken,
    ) -> GroupOutcome {
        let futs: Vec<_> = skills
            .iter()
            .map(|skill| self.run_skill(skill, group, Arc::clone(&document), retry_round, cancel))
            .collect();
        // join_all keeps input order, so results come back in declared order.
        let results = futures::future::join_all(futs).await;

        let critical_failure = skills
            .iter()
            .zip(results.iter())
            .find(|(skill, result)| skill.critical && !result.is_success())
            .map(|(skill, _)| skill.id.clone());
        if let Some(ref skill_id) = critical_failure {
            error!(group, skill_id = %skill_id, "Critical skill failed");
        }

        let cancelled = cancel.is_cancelled()
            || results
                .iter()
                .any(|r| r.error_kind() == Some(ErrorKind::Cancelled));

        GroupOutcome {
            group,
            results,
            critical_failure,
            cancelled,
        }
    }

    /// Attempt one skill up to `max_retries + 1` times.
    pub async fn run_skill(
        &self,
        skill: &SkillDescriptor,
        group: u32,
        document: Arc<str>,
        retry_round: u32,
        cancel: &CancellationToken,
    ) -> SkillResult {
        let started = Instant::now();
        let vendor = skill
            .effective_vendor(self.default_vendor.as_deref())
            .map(str::to_string);
        let model = skill
            .effective_model(self.default_model.as_deref())
            .map(str::to_string);
        let timeout = Duration::from_millis(skill.timeout_ms);
        let max_attempts = skill.max_attempts();

        let mut attempts = 0;
        let mut last_error = None;

        while attempts < max_attempts {
            let attempt = attempts;
            attempts += 1;

            let request = InferenceRequest {
                skill_id: skill.id.clone(),
                prompt: skill.prompt.clone(),
                document: Arc::clone(&document),
                schema_hints: skill.required_fields.clone(),
                vendor: vendor.clone(),
                model: model.clone(),
                temperature: skill.temperature,
                timeout,
            };

            debug!(skill_id = %skill.id, group, attempt = attempts, "Invoking skill");
            match self.attempt(request, timeout, cancel).await {
                Attempt::Done(output) => {
                    let mut result = SkillResult::succeeded(
                        skill.id.clone(),
                        group,
                        output.data,
                        attempts,
                        output.usage,
                    );
                    result.vendor_used = output.vendor.or(vendor);
                    result.model_used = output.model.or(model);
                    return finish(result, started, retry_round);
                }
                Attempt::Cancelled => {
                    let result = SkillResult::failed(
                        skill.id.clone(),
                        group,
                        SkillError {
                            kind: ErrorKind::Cancelled,
                            message: "cancelled".to_string(),
                        },
                        attempts,
                    );
                    return finish(with_route(result, vendor, model), started, retry_round);
                }
                Attempt::Failed(err) => {
                    if !err.kind.is_retryable() {
                        warn!(skill_id = %skill.id, group, error = %err.message, "Skill failed (fatal)");
                        let result = SkillResult::failed(skill.id.clone(), group, err, attempts);
                        return finish(with_route(result, vendor, model), started, retry_round);
                    }

                    if attempts < max_attempts {
                        let backoff = calculate_backoff(attempt, &self.retry);
                        warn!(
                            skill_id = %skill.id,
                            attempt = attempts,
                            max_attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %err.message,
                            "Retrying skill"
                        );
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                let result = SkillResult::failed(
                                    skill.id.clone(),
                                    group,
                                    SkillError {
                                        kind: ErrorKind::Cancelled,
                                        message: "cancelled during backoff".to_string(),
                                    },
                                    attempts,
                                );
                                return finish(with_route(result, vendor, model), started, retry_round);
                            }
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                    last_error = Some(err);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| SkillError {
            kind: ErrorKind::Fatal,
            message: "no attempt was made".to_string(),
        });
        warn!(
            skill_id = %skill.id,
            group,
            attempts,
            error = %err.message,
            "Skill exhausted its retries"
        );
        let result = SkillResult::failed(skill.id.clone(), group, err, attempts);
        finish(with_route(result, vendor, model), started, retry_round)
    }

    /// One attempt under the concurrency limit, the hard deadline and the
    /// cancellation token.
    async fn attempt(
        &self,
        request: InferenceRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Attempt {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Attempt::Cancelled,
            permit = Arc::clone(&self.limiter).acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            return Attempt::Failed(SkillError {
                kind: ErrorKind::Fatal,
                message: "concurrency limiter closed".to_string(),
            });
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Attempt::Cancelled,
            outcome = tokio::time::timeout(timeout, self.client.invoke(request)) => match outcome {
                Ok(Ok(output)) => Attempt::Done(output),
                Ok(Err(e)) => Attempt::Failed(SkillError {
                    kind: e.kind.into(),
                    message: e.message,
                }),
                Err(_) => Attempt::Failed(SkillError {
                    kind: ErrorKind::Timeout,
                    message: format!("timed out after {}ms", timeout.as_millis()),
                }),
            },
        }
    }
}

fn with_route(mut result: SkillResult, vendor: Option<String>, model: Option<String>) -> SkillResult {
    result.vendor_used = vendor;
    result.model_used = model;
    result
}

fn finish(mut result: SkillResult, started: Instant, retry_round: u32) -> SkillResult {
    result.elapsed_ms = started.elapsed().as_millis() as u64;
    result.retry_round = retry_round;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skillflow_core::types::{SkillStatus, TokenUsage};
    use skillflow_test_utils::{fast_retry_config, obj, ScriptedInferenceClient};

    fn executor(client: Arc<ScriptedInferenceClient>, limit: usize) -> GroupExecutor {
        let config = EngineConfig {
            max_concurrent_skills: limit,
            default_vendor: Some("acme".into()),
            ..EngineConfig::default()
        };
        GroupExecutor::new(client, &config, fast_retry_config())
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let client = Arc::new(
            ScriptedInferenceClient::new()
                .respond_with_usage("a", json!({"title": "A"}), TokenUsage::new(10, 2)),
        );
        let exec = executor(Arc::clone(&client), 4);
        let skill = SkillDescriptor::new("a");
        let result = exec
            .run_skill(&skill, 1, Arc::from("doc"), 0, &CancellationToken::new())
            .await;

        assert_eq!(result.status, SkillStatus::Succeeded);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.output, Some(obj(json!({"title": "A"}))));
        assert_eq!(result.token_usage.total_tokens, 12);
        assert_eq!(result.vendor_used.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn test_retryable_then_success() {
        let client = Arc::new(
            ScriptedInferenceClient::new()
                .fail_retryable("a", "429 rate limited")
                .respond("a", json!({"ok": true})),
        );
        let exec = executor(Arc::clone(&client), 4);
        let skill = SkillDescriptor::new("a").with_max_retries(2);
        let result = exec
            .run_skill(&skill, 1, Arc::from("doc"), 0, &CancellationToken::new())
            .await;

        assert!(result.is_success());
        assert_eq!(result.attempts, 2);
        assert_eq!(client.calls("a"), 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let client = Arc::new(ScriptedInferenceClient::new().fail_retryable("a", "503"));
        let exec = executor(Arc::clone(&client), 4);
        let skill = SkillDescriptor::new("a").with_max_retries(2);
        let result = exec
            .run_skill(&skill, 1, Arc::from("doc"), 0, &CancellationToken::new())
            .await;

        assert_eq!(result.status, SkillStatus::Failed);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.error_kind(), Some(ErrorKind::Retryable));
        assert_eq!(client.calls("a"), 3);
    }

    #[tokio::test]
    async fn test_fatal_consumes_no_more_attempts() {
        let client = Arc::new(ScriptedInferenceClient::new().fail_fatal("a", "401 unauthorized"));
        let exec = executor(Arc::clone(&client), 4);
        let skill = SkillDescriptor::new("a").with_max_retries(5);
        let result = exec
            .run_skill(&skill, 1, Arc::from("doc"), 0, &CancellationToken::new())
            .await;

        assert_eq!(result.attempts, 1);
        assert_eq!(result.error_kind(), Some(ErrorKind::Fatal));
        assert_eq!(client.calls("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable_and_hard() {
        let client = Arc::new(ScriptedInferenceClient::new().hang("slow"));
        let exec = executor(Arc::clone(&client), 4);
        let skill = SkillDescriptor::new("slow")
            .with_timeout_ms(50)
            .with_max_retries(1);
        let result = exec
            .run_skill(&skill, 1, Arc::from("doc"), 0, &CancellationToken::new())
            .await;

        assert_eq!(result.status, SkillStatus::TimedOut);
        assert_eq!(result.attempts, 2);
        assert!(result.is_retryable_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_results_in_declared_order() {
        let client = Arc::new(
            ScriptedInferenceClient::new()
                .respond_after("a", Duration::from_millis(300), json!({"v": "a"}))
                .respond_after("b", Duration::from_millis(10), json!({"v": "b"})),
        );
        let exec = executor(Arc::clone(&client), 4);
        let a = SkillDescriptor::new("a");
        let b = SkillDescriptor::new("b");
        let outcome = exec
            .run_group(1, &[&a, &b], Arc::from("doc"), 0, &CancellationToken::new())
            .await;

        let ids: Vec<&str> = outcome.results.iter().map(|r| r.skill_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(client.completion_order(), vec!["b".to_string(), "a".to_string()]);
        assert_eq!(outcome.succeeded(), 2);
        assert!(outcome.critical_failure.is_none());
    }

    #[tokio::test]
    async fn test_critical_failure_lets_peers_finish() {
        let client = Arc::new(
            ScriptedInferenceClient::new()
                .fail_fatal("crit", "bad config")
                .respond("peer", json!({"x": 1})),
        );
        let exec = executor(Arc::clone(&client), 4);
        let crit = SkillDescriptor::new("crit").critical();
        let peer = SkillDescriptor::new("peer");
        let outcome = exec
            .run_group(1, &[&crit, &peer], Arc::from("doc"), 0, &CancellationToken::new())
            .await;

        assert_eq!(outcome.critical_failure.as_deref(), Some("crit"));
        assert!(outcome.results[1].is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit() {
        let client = Arc::new(
            ScriptedInferenceClient::new()
                .respond_after("a", Duration::from_millis(100), json!({}))
                .respond_after("b", Duration::from_millis(100), json!({}))
                .respond_after("c", Duration::from_millis(100), json!({})),
        );
        let exec = executor(Arc::clone(&client), 1);
        let skills = [
            SkillDescriptor::new("a"),
            SkillDescriptor::new("b"),
            SkillDescriptor::new("c"),
        ];
        let refs: Vec<&SkillDescriptor> = skills.iter().collect();
        exec.run_group(1, &refs, Arc::from("doc"), 0, &CancellationToken::new())
            .await;

        assert_eq!(client.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_in_flight() {
        let client = Arc::new(
            ScriptedInferenceClient::new()
                .hang("a")
                .respond_after("b", Duration::from_secs(30), json!({})),
        );
        let exec = executor(Arc::clone(&client), 4);
        let a = SkillDescriptor::new("a").with_timeout_ms(600_000);
        let b = SkillDescriptor::new("b").with_timeout_ms(600_000);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = exec
            .run_group(1, &[&a, &b], Arc::from("doc"), 0, &cancel)
            .await;
        assert!(outcome.cancelled);
        assert!(outcome
            .results
            .iter()
            .all(|r| r.error_kind() == Some(ErrorKind::Cancelled)));
    }

    #[tokio::test]
    async fn test_retry_round_recorded() {
        let client = Arc::new(ScriptedInferenceClient::new().respond("a", json!({})));
        let exec = executor(Arc::clone(&client), 4);
        let result = exec
            .run_skill(&SkillDescriptor::new("a"), 2, Arc::from("doc"), 1, &CancellationToken::new())
            .await;
        assert_eq!(result.retry_round, 1);
        assert_eq!(result.group, 2);
    }
}
