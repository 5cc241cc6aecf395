//! Mocks and fixtures shared by skillflow tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use skillflow_core::config::{EngineConfig, RetryConfig};
use skillflow_core::traits::{ClassifiedError, InferenceClient, InferenceRequest, SkillOutput};
use skillflow_core::types::TokenUsage;

/// Convert a `json!` object literal into a map.
pub fn obj(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// Backoff settings that keep retry tests fast.
pub fn fast_retry_config() -> RetryConfig {
    RetryConfig {
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        jitter: 0.0,
    }
}

/// Engine settings for tests: human review off unless a test enables it.
pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        enable_human_review: false,
        ..EngineConfig::default()
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Output(Map<String, Value>, TokenUsage),
    Error(ClassifiedError),
    Hang,
}

#[derive(Debug, Clone)]
struct Step {
    delay: Option<Duration>,
    reply: Reply,
}

struct InFlight<'a> {
    current: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Inference client that replays scripted replies per skill id.
///
/// Replies are consumed in order; the last one repeats forever, so a
/// single `fail_retryable` makes every attempt fail.
#[derive(Default)]
pub struct ScriptedInferenceClient {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<HashMap<String, usize>>,
    log: Mutex<Vec<String>>,
    requests: Mutex<Vec<InferenceRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedInferenceClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, skill_id: &str, step: Step) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(skill_id.to_string())
            .or_default()
            .push_back(step);
        self
    }

    pub fn respond(self, skill_id: &str, output: Value) -> Self {
        self.respond_with_usage(skill_id, output, TokenUsage::default())
    }

    pub fn respond_with_usage(self, skill_id: &str, output: Value, usage: TokenUsage) -> Self {
        self.push(
            skill_id,
            Step {
                delay: None,
                reply: Reply::Output(obj(output), usage),
            },
        )
    }

    pub fn respond_after(self, skill_id: &str, delay: Duration, output: Value) -> Self {
        self.push(
            skill_id,
            Step {
                delay: Some(delay),
                reply: Reply::Output(obj(output), TokenUsage::default()),
            },
        )
    }

    pub fn fail_retryable(self, skill_id: &str, message: &str) -> Self {
        self.push(
            skill_id,
            Step {
                delay: None,
                reply: Reply::Error(ClassifiedError::retryable(message)),
            },
        )
    }

    pub fn fail_fatal(self, skill_id: &str, message: &str) -> Self {
        self.push(
            skill_id,
            Step {
                delay: None,
                reply: Reply::Error(ClassifiedError::fatal(message)),
            },
        )
    }

    /// Never reply; only a timeout or cancellation ends the attempt.
    pub fn hang(self, skill_id: &str) -> Self {
        self.push(
            skill_id,
            Step {
                delay: None,
                reply: Reply::Hang,
            },
        )
    }

    /// Append replies after construction, e.g. between a pause and a resume.
    pub fn script_output(&self, skill_id: &str, output: Value) {
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts.entry(skill_id.to_string()).or_default();
        // Drop a sticky tail so the new reply is used next.
        queue.clear();
        queue.push_back(Step {
            delay: None,
            reply: Reply::Output(obj(output), TokenUsage::default()),
        });
    }

    /// Invocations made for a skill.
    pub fn calls(&self, skill_id: &str) -> usize {
        self.calls.lock().unwrap().get(skill_id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    /// `start:<id>` / `end:<id>` entries in the order they happened.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Skill ids in the order their invocations returned.
    pub fn completion_order(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|entry| entry.strip_prefix("end:").map(str::to_string))
            .collect()
    }

    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Highest number of invocations observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self, skill_id: &str) -> Option<Step> {
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts.get_mut(skill_id)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl InferenceClient for ScriptedInferenceClient {
    fn invoke(
        &self,
        request: InferenceRequest,
    ) -> BoxFuture<'_, Result<SkillOutput, ClassifiedError>> {
        Box::pin(async move {
            let skill_id = request.skill_id.clone();
            *self.calls.lock().unwrap().entry(skill_id.clone()).or_default() += 1;
            self.requests.lock().unwrap().push(request);
            self.log.lock().unwrap().push(format!("start:{}", skill_id));

            let _guard = InFlight::enter(&self.in_flight, &self.max_in_flight);
            let Some(step) = self.next_step(&skill_id) else {
                return Err(ClassifiedError::fatal(format!("no script for skill '{}'", skill_id)));
            };

            if let Some(delay) = step.delay {
                tokio::time::sleep(delay).await;
            }

            let reply = match step.reply {
                Reply::Output(data, usage) => Ok(SkillOutput {
                    data,
                    usage,
                    vendor: None,
                    model: None,
                }),
                Reply::Error(e) => Err(e),
                Reply::Hang => {
                    futures::future::pending::<()>().await;
                    Err(ClassifiedError::fatal("unreachable"))
                }
            };
            self.log.lock().unwrap().push(format!("end:{}", skill_id));
            reply
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn request(skill_id: &str) -> InferenceRequest {
        InferenceRequest {
            skill_id: skill_id.to_string(),
            prompt: String::new(),
            document: Arc::from("doc"),
            schema_hints: vec![],
            vendor: None,
            model: None,
            temperature: 0.0,
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn last_reply_repeats() {
        let client = ScriptedInferenceClient::new()
            .fail_retryable("a", "429")
            .respond("a", json!({"ok": true}));

        assert!(client.invoke(request("a")).await.is_err());
        assert!(client.invoke(request("a")).await.is_ok());
        assert!(client.invoke(request("a")).await.is_ok());
        assert_eq!(client.calls("a"), 3);
    }

    #[tokio::test]
    async fn unscripted_skill_is_fatal() {
        let client = ScriptedInferenceClient::new();
        let err = client.invoke(request("ghost")).await.unwrap_err();
        assert!(err.message.contains("ghost"));
    }
}
