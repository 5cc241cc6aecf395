use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Opaque, unique identifier of one workflow execution.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a skill takes part in executions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SkillAvailability {
    #[default]
    Active,
    Disabled,
    Draft,
}

/// One skill as authored in a schema definition.
///
/// Numeric fields are signed so that out-of-range values survive
/// deserialization and are reported by the plan compiler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Prompt text sent with every invocation.
    #[serde(default)]
    pub prompt: String,
    /// Prompt file relative to the schema directory (resolved by directory sources).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_file: Option<String>,
    #[serde(default = "default_group")]
    pub group: i64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    /// Output keys this skill is expected to produce.
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: f32,
    /// A failed critical skill fails its whole group.
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub status: SkillAvailability,
}

fn default_group() -> i64 { 1 }
fn default_timeout_ms() -> u64 { 45_000 }
fn default_max_retries() -> i64 { 2 }

impl SkillDescriptor {
    /// Create an active skill in group 1 with default timeout and retries.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            prompt: String::new(),
            prompt_file: None,
            group: default_group(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            required_fields: vec![],
            vendor: None,
            model: None,
            temperature: 0.0,
            critical: false,
            status: SkillAvailability::Active,
        }
    }

    pub fn with_group(mut self, group: i64) -> Self {
        self.group = group;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_required_fields(mut self, fields: &[&str]) -> Self {
        self.required_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_status(mut self, status: SkillAvailability) -> Self {
        self.status = status;
        self
    }

    /// Number of attempts allowed by the retry budget (never less than one).
    pub fn max_attempts(&self) -> u32 {
        (self.max_retries.max(0) as u32).saturating_add(1)
    }

    /// Vendor override, falling back to the engine default.
    pub fn effective_vendor<'a>(&'a self, default: Option<&'a str>) -> Option<&'a str> {
        self.vendor.as_deref().or(default)
    }

    /// Model override, falling back to the engine default.
    pub fn effective_model<'a>(&'a self, default: Option<&'a str>) -> Option<&'a str> {
        self.model.as_deref().or(default)
    }
}

/// How successive skill outputs are combined into the merged result.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    MergeDeep,
    FirstWins,
    LastWins,
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MergeDeep => "merge_deep",
            Self::FirstWins => "first_wins",
            Self::LastWins => "last_wins",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    #[default]
    Error,
}

/// A post-merge validation rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationRule {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(flatten)]
    pub kind: RuleKind,
}

/// Rule kinds. Field names are dot paths into the merged result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    /// Fails if any listed field is absent or null.
    Required { fields: Vec<String> },
    /// Fails if the operands do not sum to `total` within `tolerance`.
    /// Operands prefixed with `-` are subtracted.
    SumCheck {
        operands: Vec<String>,
        total: String,
        #[serde(default)]
        tolerance: f64,
    },
    /// Fails if `field` lies outside `[min, max]`.
    RangeCheck {
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
}

impl ValidationRule {
    pub fn required(id: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            id: id.into(),
            name: None,
            severity: Severity::Error,
            kind: RuleKind::Required {
                fields: fields.iter().map(|f| f.to_string()).collect(),
            },
        }
    }

    pub fn sum_check(id: impl Into<String>, operands: &[&str], total: &str, tolerance: f64) -> Self {
        Self {
            id: id.into(),
            name: None,
            severity: Severity::Error,
            kind: RuleKind::SumCheck {
                operands: operands.iter().map(|f| f.to_string()).collect(),
                total: total.to_string(),
                tolerance,
            },
        }
    }

    pub fn range_check(id: impl Into<String>, field: &str, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            id: id.into(),
            name: None,
            severity: Severity::Error,
            kind: RuleKind::RangeCheck {
                field: field.to_string(),
                min,
                max,
            },
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// Complete, versioned definition of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaDefinition {
    pub schema_id: String,
    #[serde(default = "default_schema_version")]
    pub version: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub skills: Vec<SkillDescriptor>,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
    /// Per-schema override of the engine's human-review toggle.
    #[serde(default)]
    pub human_review: Option<bool>,
}

fn default_schema_version() -> String { "1".to_string() }

impl SchemaDefinition {
    pub fn new(schema_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            schema_id: schema_id.into(),
            version: version.into(),
            name: None,
            description: None,
            skills: vec![],
            merge_strategy: MergeStrategy::default(),
            validation_rules: vec![],
            human_review: None,
        }
    }

    pub fn with_skill(mut self, skill: SkillDescriptor) -> Self {
        self.skills.push(skill);
        self
    }

    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.validation_rules.push(rule);
        self
    }

    pub fn with_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    pub fn with_human_review(mut self, enabled: bool) -> Self {
        self.human_review = Some(enabled);
        self
    }
}

/// Token consumption of one or more inference calls.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Classification of a skill failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient vendor failure (rate limit, network).
    Retryable,
    /// Non-retryable failure (bad configuration, authentication).
    Fatal,
    /// Hard per-attempt deadline elapsed.
    Timeout,
    /// Aborted by an external cancellation signal.
    Cancelled,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable | Self::Timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SkillStatus {
    Succeeded,
    Failed,
    TimedOut,
}

/// Recorded outcome of one skill execution (all of its attempts).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillResult {
    pub skill_id: String,
    /// Group number the skill belongs to.
    pub group: u32,
    pub status: SkillStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SkillError>,
    pub attempts: u32,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default)]
    pub vendor_used: Option<String>,
    #[serde(default)]
    pub model_used: Option<String>,
    /// 0 for the first pass; n for the n-th router-driven retry round.
    #[serde(default)]
    pub retry_round: u32,
}

impl SkillResult {
    pub fn succeeded(
        skill_id: impl Into<String>,
        group: u32,
        output: Map<String, Value>,
        attempts: u32,
        token_usage: TokenUsage,
    ) -> Self {
        Self {
            skill_id: skill_id.into(),
            group,
            status: SkillStatus::Succeeded,
            output: Some(output),
            error: None,
            attempts,
            token_usage,
            elapsed_ms: 0,
            vendor_used: None,
            model_used: None,
            retry_round: 0,
        }
    }

    pub fn failed(skill_id: impl Into<String>, group: u32, error: SkillError, attempts: u32) -> Self {
        let status = match error.kind {
            ErrorKind::Timeout => SkillStatus::TimedOut,
            _ => SkillStatus::Failed,
        };
        Self {
            skill_id: skill_id.into(),
            group,
            status,
            output: None,
            error: Some(error),
            attempts,
            token_usage: TokenUsage::default(),
            elapsed_ms: 0,
            vendor_used: None,
            model_used: None,
            retry_round: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SkillStatus::Succeeded
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Failed with a kind that another round could plausibly fix.
    pub fn is_retryable_failure(&self) -> bool {
        !self.is_success() && self.error_kind().is_some_and(ErrorKind::is_retryable)
    }
}

/// Outcome of evaluating one validation rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationOutcome {
    pub rule_id: String,
    pub passed: bool,
    pub severity: Severity,
    pub message: String,
}

impl ValidationOutcome {
    pub fn is_blocking(&self) -> bool {
        !self.passed && self.severity == Severity::Error
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Review,
    Fail,
}

/// Ordered rule outcomes plus derived summary fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub outcomes: Vec<ValidationOutcome>,
    pub has_blocking_failure: bool,
    pub quality_score: u8,
    pub verdict: Verdict,
}

impl ValidationResult {
    pub fn from_outcomes(outcomes: Vec<ValidationOutcome>) -> Self {
        let errors = outcomes.iter().filter(|o| o.is_blocking()).count() as i64;
        let warnings = outcomes
            .iter()
            .filter(|o| !o.passed && o.severity == Severity::Warning)
            .count() as i64;
        let quality_score = (100 - errors * 15 - warnings * 5).clamp(0, 100) as u8;
        let verdict = if errors > 0 {
            Verdict::Fail
        } else if warnings > 0 {
            Verdict::Review
        } else {
            Verdict::Pass
        };
        Self {
            outcomes,
            has_blocking_failure: errors > 0,
            quality_score,
            verdict,
        }
    }

    /// Rule ids of failed error-severity outcomes.
    pub fn blocking_rule_ids(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.is_blocking())
            .map(|o| o.rule_id.clone())
            .collect()
    }
}

/// Input supplied by a human reviewer when resuming a paused execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HumanFeedback {
    /// Overlay applied onto the merged result; wins over prior values.
    #[serde(default)]
    pub corrections: Map<String, Value>,
    #[serde(default)]
    pub reviewer: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl HumanFeedback {
    pub fn with_corrections(corrections: Map<String, Value>) -> Self {
        Self {
            corrections,
            ..Self::default()
        }
    }
}

/// Kind of a progress event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    ExecutionStarted,
    GroupStarted,
    GroupCompleted,
    GroupFailed,
    MergeApplied,
    CheckpointSaved,
    ValidationCompleted,
    RetryScheduled,
    HumanReviewRequested,
    ExecutionResumed,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
}

impl ProgressEventType {
    /// Events after which the current run produces nothing further.
    pub fn ends_run(self) -> bool {
        matches!(
            self,
            Self::ExecutionCompleted
                | Self::ExecutionFailed
                | Self::ExecutionCancelled
                | Self::HumanReviewRequested
        )
    }
}

/// One entry of an execution's append-only progress log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    /// Position within the execution's log, starting at 0.
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: ProgressEventType,
    pub timestamp: DateTime<Utc>,
    pub node_name: String,
    #[serde(default)]
    pub payload: Value,
}
