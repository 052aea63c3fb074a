//! Workflow definition types.
//!
//! These are the serde types embedded in skill frontmatter. Duration
//! fields keep their literal form (`"30s"`, `"500ms"`) so documents
//! round-trip untouched; parsing happens at validation and execution time.

use std::{sync::OnceLock, time::Duration};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::WorkflowError;

/// Declared type of a workflow input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl InputType {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Number => value.is_number(),
            InputType::Boolean => value.is_boolean(),
            InputType::Object => value.is_object(),
            InputType::Array => value.is_array(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InputType::String => "string",
            InputType::Number => "number",
            InputType::Boolean => "boolean",
            InputType::Object => "object",
            InputType::Array => "array",
        }
    }
}

/// Declared workflow input.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InputSpec {
    #[serde(rename = "type", default)]
    pub input_type: InputType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<Value>>,
}

/// Per-step error policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnErrorPolicy {
    /// Halt the workflow (default).
    #[default]
    Fail,
    /// Mark the step failed and skip its transitive dependents.
    Skip,
    /// Store the failure as an errored step result and keep going.
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySpec {
    pub max_attempts: u32,
    /// Duration literal slept between attempts.
    pub backoff: String,
}

/// One node of the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default, deserialize_with = "scalar_or_list", skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub on_error: OnErrorPolicy,
    /// Duration literal bounding one tool call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            args: Map::new(),
            depends_on: Vec::new(),
            condition: None,
            on_error: OnErrorPolicy::default(),
            timeout: None,
            retry: None,
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_depends_on(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn timeout_duration(&self) -> Result<Option<Duration>, WorkflowError> {
        self.timeout.as_deref().map(parse_duration).transpose()
    }

    /// `(attempts, backoff)` with at least one attempt.
    pub fn retry_schedule(&self) -> Result<(u32, Duration), WorkflowError> {
        match &self.retry {
            Some(retry) => Ok((retry.max_attempts.max(1), parse_duration(&retry.backoff)?)),
            None => Ok((1, Duration::ZERO)),
        }
    }
}

/// `depends_on` accepts a single id or a list of ids.
fn scalar_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(id)) => vec![id],
        Some(OneOrMany::Many(ids)) => ids,
    })
}

/// Output assembly mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Merged,
    Last,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OutputSpec {
    #[serde(default)]
    pub format: OutputFormat,
    /// Restricts `merged` to the named steps; workflow order is kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,
    /// Template rendered against the final context; required for `custom`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Terminal status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Terminal status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    /// Every executed step succeeded.
    Completed,
    /// At least one step failed under a non-halting policy.
    Partial,
    /// A step halted the workflow.
    Failed,
}

/// Result of one executed step.
#[derive(Debug, Default)]
pub struct StepResult {
    pub text: String,
    pub is_error: bool,
    json: OnceLock<Option<Value>>,
}

impl StepResult {
    pub fn new(text: impl Into<String>, is_error: bool) -> Self {
        Self {
            text: text.into(),
            is_error,
            json: OnceLock::new(),
        }
    }

    /// The parsed form of `text`, when it is valid JSON. Parsed once on
    /// first access.
    pub fn json(&self) -> Option<&Value> {
        self.json
            .get_or_init(|| serde_json::from_str(self.text.trim()).ok())
            .as_ref()
    }
}

impl Clone for StepResult {
    fn clone(&self) -> Self {
        let json = OnceLock::new();
        if let Some(parsed) = self.json.get() {
            let _ = json.set(parsed.clone());
        }
        Self {
            text: self.text.clone(),
            is_error: self.is_error,
            json,
        }
    }
}

/// Parse a duration literal: integer plus `ms`/`s`/`m`/`h` suffix.
/// A bare integer means seconds.
pub fn parse_duration(literal: &str) -> Result<Duration, WorkflowError> {
    let trimmed = literal.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(digits_end);
    let amount: u64 = digits
        .parse()
        .map_err(|_| WorkflowError::InvalidDuration(literal.to_string()))?;
    match suffix.trim() {
        "ms" => Ok(Duration::from_millis(amount)),
        "" | "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 3600)),
        _ => Err(WorkflowError::InvalidDuration(literal.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_literals() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(15));
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn depends_on_accepts_scalar_and_list() {
        let scalar: WorkflowStep =
            serde_json::from_value(serde_json::json!({"id": "b", "tool": "t", "depends_on": "a"}))
                .unwrap();
        assert_eq!(scalar.depends_on, vec!["a"]);

        let list: WorkflowStep = serde_json::from_value(
            serde_json::json!({"id": "c", "tool": "t", "depends_on": ["a", "b"]}),
        )
        .unwrap();
        assert_eq!(list.depends_on, vec!["a", "b"]);

        let absent: WorkflowStep =
            serde_json::from_value(serde_json::json!({"id": "a", "tool": "t"})).unwrap();
        assert!(absent.depends_on.is_empty());
    }

    #[test]
    fn step_result_parses_json_lazily() {
        let result = StepResult::new(r#"{"count": 3}"#, false);
        assert_eq!(result.json().unwrap()["count"], 3);

        let plain = StepResult::new("not json", false);
        assert!(plain.json().is_none());
    }

    #[test]
    fn retry_schedule_enforces_one_attempt() {
        let mut step = WorkflowStep::new("a", "t");
        assert_eq!(step.retry_schedule().unwrap(), (1, Duration::ZERO));

        step.retry = Some(RetrySpec {
            max_attempts: 0,
            backoff: "1s".to_string(),
        });
        assert_eq!(step.retry_schedule().unwrap().0, 1);
    }

    #[test]
    fn input_type_checks_values() {
        assert!(InputType::String.accepts(&serde_json::json!("x")));
        assert!(InputType::Number.accepts(&serde_json::json!(42)));
        assert!(!InputType::Boolean.accepts(&serde_json::json!("true")));
        assert!(InputType::Array.accepts(&serde_json::json!([1, 2])));
    }
}
