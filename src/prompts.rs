//! Prompt provider and skill execution.
//!
//! Active skills are served as prompts; the executable ones double as
//! tools under the virtual `skill` server (`skill__«name»`), whose calls
//! route into the workflow executor. Workflow steps may themselves name
//! `skill__…` tools, re-entering the runner with the composition stack
//! extended.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use toolgrid_mcp::{
    acl::glob_match, catalog::compose_name, CallToolResult, McpError, McpResult, Tool, ToolCatalog,
};
use toolgrid_skills::{Skill, SkillRegistry};
use toolgrid_workflow::{
    ExecutionContext, ExecutorLimits, InputSpec, InvokeError, InvokeOutcome, ToolInvoker,
    WorkflowError, WorkflowExecutor, WorkflowRun, WorkflowStatus,
};
use tracing::{debug, info};

/// Virtual server name skills are exposed under.
pub const SKILL_SERVER: &str = "skill";

/// Prefixed form of the virtual server name.
pub const SKILL_TOOL_PREFIX: &str = "skill__";

pub struct SkillRunner {
    catalog: Arc<ToolCatalog>,
    skills: Arc<SkillRegistry>,
    executor: WorkflowExecutor,
}

impl SkillRunner {
    pub fn new(catalog: Arc<ToolCatalog>, skills: Arc<SkillRegistry>, limits: ExecutorLimits) -> Self {
        Self {
            catalog,
            skills,
            executor: WorkflowExecutor::new(limits),
        }
    }

    /// Executable active skills as prefixed tools.
    pub fn skill_tools(&self) -> Vec<Tool> {
        self.skills
            .active()
            .into_iter()
            .filter(Skill::is_executable)
            .map(|skill| Tool {
                name: compose_name(SKILL_SERVER, &skill.name),
                title: None,
                description: Some(skill.description.clone()),
                input_schema: input_schema(&skill),
            })
            .collect()
    }

    /// Active skills as MCP prompts.
    pub fn list_prompts(&self) -> Vec<Value> {
        self.skills
            .active()
            .into_iter()
            .map(|skill| {
                json!({
                    "name": skill.name,
                    "description": skill.description,
                    "arguments": [{
                        "name": "context",
                        "description": "Optional context appended to the skill body",
                        "required": false,
                    }],
                })
            })
            .collect()
    }

    /// Render one prompt. `None` when the skill is unknown or inactive.
    pub fn get_prompt(&self, name: &str, arguments: Option<&Map<String, Value>>) -> Option<Value> {
        let skill = self.skills.get(name).filter(Skill::is_active)?;
        let mut text = skill.body.clone();
        if let Some(context) = arguments
            .and_then(|args| args.get("context"))
            .and_then(Value::as_str)
            .filter(|context| !context.is_empty())
        {
            text = format!("{text}\n\nContext:\n{context}");
        }
        Some(json!({
            "description": skill.description,
            "messages": [{
                "role": "user",
                "content": {"type": "text", "text": text},
            }],
        }))
    }

    /// Execute a skill's workflow.
    ///
    /// `stack` holds the skill names already executing above this call.
    /// Workflow-level failures come back as tool results; only
    /// cancellation propagates as an error.
    pub async fn call_skill(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        stack: &[String],
        name: &str,
        args: Map<String, Value>,
    ) -> McpResult<CallToolResult> {
        let Some(skill) = self.skills.get(name).filter(Skill::is_active) else {
            return Ok(CallToolResult::error(format!("Unknown skill: {name}")));
        };
        if !skill.is_executable() {
            return Ok(CallToolResult::error(format!(
                "Skill '{name}' has no workflow and cannot be executed"
            )));
        }
        let inputs = match resolve_inputs(&skill, args) {
            Ok(inputs) => inputs,
            Err(message) => return Ok(CallToolResult::error(message)),
        };

        info!("Executing skill '{}' ({} step(s))", name, skill.workflow.len());
        let run = WorkflowRun {
            name: skill.name.clone(),
            steps: skill.workflow.clone(),
            inputs,
            output: skill.output.clone().unwrap_or_default(),
        };
        let ctx = ExecutionContext {
            cancel: cancel.clone(),
            call_stack: stack.to_vec(),
        };
        let invoker = RunInvoker {
            runner: Arc::clone(self),
            stack: {
                let mut stack = stack.to_vec();
                stack.push(skill.name.clone());
                stack
            },
            allowed_tools: skill.allowed_tools.clone(),
        };

        match self.executor.execute(&invoker, &run, &ctx).await {
            Ok(report) => {
                debug!("Skill '{}' finished: {:?}", name, report.status);
                Ok(CallToolResult {
                    content: vec![toolgrid_mcp::ToolContent::Text {
                        text: report.output,
                    }],
                    is_error: report.status == WorkflowStatus::Failed,
                })
            }
            Err(WorkflowError::Cancelled) => Err(McpError::Cancelled),
            Err(err) => Ok(CallToolResult::error(format!(
                "Workflow \"{name}\" failed: {err}"
            ))),
        }
    }
}

/// Per-run bridge from workflow steps back into the catalog (and back
/// into the runner for nested skills).
struct RunInvoker {
    runner: Arc<SkillRunner>,
    stack: Vec<String>,
    allowed_tools: Vec<String>,
}

#[async_trait]
impl ToolInvoker for RunInvoker {
    async fn invoke(
        &self,
        cancel: &CancellationToken,
        tool: &str,
        args: Map<String, Value>,
    ) -> Result<InvokeOutcome, InvokeError> {
        if let Some(nested) = tool.strip_prefix(SKILL_TOOL_PREFIX) {
            let result = self
                .runner
                .call_skill(cancel, &self.stack, nested, args)
                .await
                .map_err(|err| match err {
                    McpError::Cancelled => InvokeError::Cancelled,
                    other => InvokeError::Failed(other.to_string()),
                })?;
            return Ok(InvokeOutcome {
                text: result.joined_text(),
                is_error: result.is_error,
            });
        }

        if !self.allowed_tools.is_empty()
            && !self.allowed_tools.iter().any(|glob| glob_match(glob, tool))
        {
            return Err(InvokeError::Failed(format!(
                "tool '{tool}' is not in the skill's allowed-tools list"
            )));
        }

        match self.runner.catalog.call_tool(cancel, tool, args).await {
            Ok(result) => Ok(InvokeOutcome {
                text: result.joined_text(),
                is_error: result.is_error,
            }),
            Err(McpError::Cancelled) => Err(InvokeError::Cancelled),
            Err(err) => Err(InvokeError::Failed(err.to_string())),
        }
    }
}

/// JSON schema for a skill tool, derived from its declared inputs.
fn input_schema(skill: &Skill) -> Map<String, Value> {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for (name, spec) in &skill.inputs {
        properties.insert(name.clone(), property_schema(spec));
        if spec.required {
            required.push(Value::String(name.clone()));
        }
    }
    let mut schema = Map::new();
    schema.insert("type".to_string(), json!("object"));
    schema.insert("properties".to_string(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert("required".to_string(), Value::Array(required));
    }
    schema
}

fn property_schema(spec: &InputSpec) -> Value {
    let mut property = Map::new();
    property.insert("type".to_string(), json!(spec.input_type.as_str()));
    if let Some(description) = &spec.description {
        property.insert("description".to_string(), json!(description));
    }
    if let Some(choices) = &spec.choices {
        property.insert("enum".to_string(), Value::Array(choices.clone()));
    }
    if let Some(default) = &spec.default {
        property.insert("default".to_string(), default.clone());
    }
    Value::Object(property)
}

/// Apply defaults and validate provided arguments against declared inputs.
fn resolve_inputs(skill: &Skill, args: Map<String, Value>) -> Result<Map<String, Value>, String> {
    let mut inputs = args;
    for (name, spec) in &skill.inputs {
        match inputs.get(name) {
            Some(value) => {
                if !spec.input_type.accepts(value) {
                    return Err(format!(
                        "Input '{name}' expects {}, got {value}",
                        spec.input_type.as_str()
                    ));
                }
                if let Some(choices) = &spec.choices {
                    if !choices.contains(value) {
                        return Err(format!("Input '{name}' must be one of {choices:?}"));
                    }
                }
            }
            None => match &spec.default {
                Some(default) => {
                    inputs.insert(name.clone(), default.clone());
                }
                None if spec.required => {
                    return Err(format!("Missing required input '{name}'"));
                }
                None => {}
            },
        }
    }
    Ok(inputs)
}
