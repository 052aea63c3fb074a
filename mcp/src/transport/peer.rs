//! Peer-agent adapter.
//!
//! Exposes a peer agent's advertised skills as a virtual tool server. A
//! tool call starts a task on the peer; non-terminal task states are
//! polled until the task settles or the caller's deadline fires.
//!
//! State mapping: `completed` is a success, `failed` is a tool error, and
//! `cancelled`/`rejected` produce a non-error result carrying whatever
//! text the agent returned. Only text parts survive the adaptation.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ClientState, ToolClient};
use crate::{
    error::{McpError, McpResult},
    protocol::{CallToolResult, Tool, ToolContent},
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Deserialize)]
pub struct AgentCard {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub skills: Vec<AgentSkill>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSkill {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Submitted,
    Working,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Submitted | TaskState::Working)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub state: TaskState,
    #[serde(default)]
    pub message: Option<AgentMessage>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentMessage {
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagePart {
    Text { text: String },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Artifact {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

fn joined_text(parts: &[MessagePart]) -> String {
    parts
        .iter()
        .filter_map(|part| match part {
            MessagePart::Text { text } => Some(text.as_str()),
            MessagePart::Unsupported => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// One content item for the agent message and one per artifact; non-text
/// parts are dropped on the floor.
fn collect_content(snapshot: &TaskSnapshot) -> Vec<ToolContent> {
    let mut content = Vec::new();
    if let Some(message) = &snapshot.message {
        let text = joined_text(&message.parts);
        if !text.is_empty() {
            content.push(ToolContent::Text { text });
        }
    }
    for artifact in &snapshot.artifacts {
        let text = joined_text(&artifact.parts);
        if !text.is_empty() {
            content.push(ToolContent::Text { text });
        }
    }
    content
}

/// Map a terminal task snapshot to a tool result. Returns `None` while the
/// task is still running.
fn terminal_result(snapshot: &TaskSnapshot) -> Option<CallToolResult> {
    if !snapshot.state.is_terminal() {
        return None;
    }
    let mut content = collect_content(snapshot);
    let is_error = snapshot.state == TaskState::Failed;
    if content.is_empty() {
        let text = match snapshot.state {
            TaskState::Failed => format!("peer task {} failed", snapshot.id),
            TaskState::Cancelled => format!("peer task {} was cancelled", snapshot.id),
            TaskState::Rejected => format!("peer task {} was rejected", snapshot.id),
            _ => String::new(),
        };
        if !text.is_empty() {
            content.push(ToolContent::Text { text });
        }
    }
    Some(CallToolResult { content, is_error })
}

pub struct PeerAgentClient {
    name: String,
    base_url: String,
    http: reqwest::Client,
    poll_interval: Duration,
    request_timeout: Duration,
    state: Mutex<ClientState>,
    tools: RwLock<Vec<Tool>>,
}

impl PeerAgentClient {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        request_timeout: Duration,
    ) -> McpResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let base_url: String = base_url.into();
        Ok(Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout,
            state: Mutex::new(ClientState::Disconnected),
            tools: RwLock::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn fetch_card(&self) -> McpResult<AgentCard> {
        let url = format!("{}/.well-known/agent.json", self.base_url);
        let card = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<AgentCard>()
            .await?;
        Ok(card)
    }

    fn tools_from_card(card: &AgentCard) -> Vec<Tool> {
        card.skills
            .iter()
            .map(|skill| Tool {
                name: skill.id.clone(),
                title: skill.name.clone(),
                description: skill.description.clone(),
                input_schema: skill.input_schema.clone().unwrap_or_else(|| {
                    json!({"type": "object"}).as_object().cloned().unwrap_or_default()
                }),
            })
            .collect()
    }

    async fn submit_task(&self, skill: &str, args: Map<String, Value>) -> McpResult<TaskSnapshot> {
        let url = format!("{}/tasks", self.base_url);
        let body = json!({ "skill": skill, "input": args });
        let snapshot = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<TaskSnapshot>()
            .await?;
        Ok(snapshot)
    }

    async fn poll_task(&self, task_id: &str) -> McpResult<TaskSnapshot> {
        let url = format!("{}/tasks/{}", self.base_url, task_id);
        let snapshot = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<TaskSnapshot>()
            .await?;
        Ok(snapshot)
    }

    async fn run_task(
        &self,
        cancel: &CancellationToken,
        skill: &str,
        args: Map<String, Value>,
    ) -> McpResult<CallToolResult> {
        let mut snapshot = self.submit_task(skill, args).await?;
        loop {
            if let Some(result) = terminal_result(&snapshot) {
                return Ok(result);
            }
            debug!(
                "'{}': task {} still {:?}, polling",
                self.name, snapshot.id, snapshot.state
            );
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => return Err(McpError::Cancelled),
            }
            snapshot = self.poll_task(&snapshot.id).await?;
        }
    }
}

#[async_trait]
impl ToolClient for PeerAgentClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ClientState {
        *self.state.lock()
    }

    async fn initialize(&self, cancel: &CancellationToken) -> McpResult<()> {
        if self.state() == ClientState::Ready {
            return Ok(());
        }
        *self.state.lock() = ClientState::Connecting;
        let fetched = tokio::select! {
            card = self.fetch_card() => card,
            _ = cancel.cancelled() => Err(McpError::Cancelled),
        };
        match fetched {
            Ok(card) => {
                let tools = Self::tools_from_card(&card);
                info!(
                    "Peer agent '{}' ({}) advertises {} skill(s)",
                    self.name, card.name, tools.len()
                );
                *self.tools.write() = tools;
                *self.state.lock() = ClientState::Ready;
                Ok(())
            }
            Err(err) => {
                *self.state.lock() = ClientState::Disconnected;
                Err(err)
            }
        }
    }

    fn tools(&self) -> Vec<Tool> {
        self.tools.read().clone()
    }

    async fn refresh_tools(&self, cancel: &CancellationToken) -> McpResult<()> {
        let fetched = tokio::select! {
            card = self.fetch_card() => card?,
            _ = cancel.cancelled() => return Err(McpError::Cancelled),
        };
        *self.tools.write() = Self::tools_from_card(&fetched);
        Ok(())
    }

    async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        args: Map<String, Value>,
    ) -> McpResult<CallToolResult> {
        tokio::select! {
            result = self.run_task(cancel, name, args) => result,
            _ = tokio::time::sleep(self.request_timeout) => Err(McpError::Timeout(format!(
                "'{}': task '{}' did not settle within {:?}",
                self.name, name, self.request_timeout
            ))),
        }
    }

    async fn close(&self) {
        *self.state.lock() = ClientState::Closed;
    }
}
