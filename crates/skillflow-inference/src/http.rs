use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use skillflow_core::config::InferenceConfig;
use skillflow_core::error::{Result, SkillflowError};
use skillflow_core::traits::{ClassifiedError, InferenceClient, InferenceRequest, SkillOutput};
use skillflow_core::types::TokenUsage;

use crate::cleaner;

/// Inference client that posts one vendor-neutral JSON request per skill
/// call to a gateway, which fans out to the actual model vendors.
pub struct HttpInferenceClient {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpInferenceClient {
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SkillflowError::Inference(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

// ── Wire types ───────────────────────────────────────────────────

#[derive(Serialize)]
struct WireRequest<'a> {
    skill_id: &'a str,
    prompt: &'a str,
    document: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    schema_hints: &'a Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vendor: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    temperature: f32,
    timeout_ms: u64,
}

#[derive(Deserialize, Debug, Default)]
struct WireResponse {
    /// Already-structured output.
    #[serde(default)]
    data: Option<Value>,
    /// Raw model text, parsed after cleanup.
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct WireUsage {
    #[serde(default, alias = "prompt_tokens")]
    input_tokens: u64,
    #[serde(default, alias = "completion_tokens")]
    output_tokens: u64,
}

/// Retry transient failures: request timeout, rate limit, server errors.
fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn classify_status(status: StatusCode, body: &str) -> ClassifiedError {
    let snippet: String = body.chars().take(200).collect();
    let message = format!("HTTP {}: {}", status.as_u16(), snippet.trim());
    if is_retryable_status(status) {
        ClassifiedError::retryable(message)
    } else {
        ClassifiedError::fatal(message)
    }
}

fn classify_transport(e: &reqwest::Error) -> ClassifiedError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        ClassifiedError::retryable(format!("request failed: {}", e))
    } else {
        ClassifiedError::fatal(format!("request failed: {}", e))
    }
}

/// Decode a successful response body into skill output.
fn parse_response(body: &str) -> std::result::Result<SkillOutput, ClassifiedError> {
    let wire: WireResponse = serde_json::from_str(body)
        .map_err(|e| ClassifiedError::fatal(format!("malformed response: {}", e)))?;

    let data: Map<String, Value> = match (wire.data, wire.text) {
        (Some(Value::Object(map)), _) => map,
        (Some(Value::String(text)), _) | (None, Some(text)) => {
            cleaner::parse_object(&text).map_err(ClassifiedError::fatal)?
        }
        (Some(other), _) => {
            return Err(ClassifiedError::fatal(format!(
                "response data must be an object, got {}",
                other
            )))
        }
        (None, None) => {
            return Err(ClassifiedError::fatal(
                "response carries neither data nor text",
            ))
        }
    };

    let usage = wire
        .usage
        .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens))
        .unwrap_or_default();

    Ok(SkillOutput {
        data,
        usage,
        vendor: wire.vendor,
        model: wire.model,
    })
}

impl InferenceClient for HttpInferenceClient {
    fn invoke(
        &self,
        request: InferenceRequest,
    ) -> BoxFuture<'_, std::result::Result<SkillOutput, ClassifiedError>> {
        Box::pin(async move {
            let body = WireRequest {
                skill_id: &request.skill_id,
                prompt: &request.prompt,
                document: &*request.document,
                schema_hints: &request.schema_hints,
                vendor: request.vendor.as_deref(),
                model: request.model.as_deref(),
                temperature: request.temperature,
                timeout_ms: request.timeout.as_millis() as u64,
            };

            let mut req = self.http.post(&self.endpoint).json(&body);
            if let Some(ref key) = self.api_key {
                req = req.bearer_auth(key);
            }

            debug!(skill_id = %request.skill_id, endpoint = %self.endpoint, "Posting inference request");
            let response = req.send().await.map_err(|e| classify_transport(&e))?;
            let status = response.status();
            let text = response.text().await.map_err(|e| classify_transport(&e))?;

            if !status.is_success() {
                let err = classify_status(status, &text);
                warn!(
                    skill_id = %request.skill_id,
                    status = status.as_u16(),
                    retryable = is_retryable_status(status),
                    "Inference request rejected"
                );
                return Err(err);
            }

            parse_response(&text)
        })
    }
}
