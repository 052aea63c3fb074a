//! Shared fixtures for gateway integration tests.
#![allow(dead_code)]

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use toolgrid::{prompts::SkillRunner, sse::SessionManager, AppState};
use toolgrid_mcp::{
    AgentAcl, AgentSelector, CallToolResult, McpResult, Tool, ToolCatalog, ToolClient,
};
use toolgrid_mcp::transport::ClientState;
use toolgrid_skills::{Skill, SkillRegistry, SkillStore};
use toolgrid_workflow::ExecutorLimits;

type Handler = Box<dyn Fn(&str, &serde_json::Map<String, serde_json::Value>) -> CallToolResult + Send + Sync>;

/// Southbound stand-in: a fixed tool list plus a scripted call handler.
pub struct FakeClient {
    name: String,
    tools: Vec<Tool>,
    pub calls: Mutex<Vec<String>>,
    handler: Handler,
}

impl FakeClient {
    pub fn new(
        name: &str,
        tool_names: &[&str],
        handler: impl Fn(&str, &serde_json::Map<String, serde_json::Value>) -> CallToolResult
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            tools: tool_names.iter().map(|name| Tool::new(*name)).collect(),
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        })
    }

    /// A client whose every tool echoes its own name.
    pub fn echoing(name: &str, tool_names: &[&str]) -> Arc<Self> {
        let server = name.to_string();
        Self::new(name, tool_names, move |tool, _args| {
            CallToolResult::text(format!("{server}:{tool}"))
        })
    }
}

#[async_trait]
impl ToolClient for FakeClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ClientState {
        ClientState::Ready
    }

    async fn initialize(&self, _cancel: &CancellationToken) -> McpResult<()> {
        Ok(())
    }

    fn tools(&self) -> Vec<Tool> {
        self.tools.clone()
    }

    async fn refresh_tools(&self, _cancel: &CancellationToken) -> McpResult<()> {
        Ok(())
    }

    async fn call_tool(
        &self,
        _cancel: &CancellationToken,
        name: &str,
        args: serde_json::Map<String, serde_json::Value>,
    ) -> McpResult<CallToolResult> {
        self.calls.lock().push(name.to_string());
        Ok((self.handler)(name, &args))
    }

    async fn close(&self) {}
}

/// A fully wired gateway over fakes. Keeps the skills tempdir alive.
pub struct TestGateway {
    pub state: Arc<AppState>,
    _skills_dir: tempfile::TempDir,
}

impl TestGateway {
    pub fn builder() -> TestGatewayBuilder {
        TestGatewayBuilder::default()
    }
}

#[derive(Default)]
pub struct TestGatewayBuilder {
    clients: Vec<Arc<FakeClient>>,
    agents: HashMap<String, Vec<AgentSelector>>,
    skills: Vec<Skill>,
}

impl TestGatewayBuilder {
    pub fn client(mut self, client: Arc<FakeClient>) -> Self {
        self.clients.push(client);
        self
    }

    pub fn agent(mut self, name: &str, selectors: Vec<AgentSelector>) -> Self {
        self.agents.insert(name.to_string(), selectors);
        self
    }

    pub fn skill(mut self, skill: Skill) -> Self {
        self.skills.push(skill);
        self
    }

    pub fn build(self) -> TestGateway {
        let catalog = Arc::new(ToolCatalog::new());
        for client in self.clients {
            catalog.register(client as Arc<dyn ToolClient>).unwrap();
        }

        let skills_dir = tempfile::tempdir().unwrap();
        let skills = Arc::new(SkillRegistry::new(SkillStore::new(skills_dir.path())));
        for skill in self.skills {
            skills.save(skill).unwrap();
        }

        let runner = Arc::new(SkillRunner::new(
            Arc::clone(&catalog),
            Arc::clone(&skills),
            ExecutorLimits {
                max_parallel: 4,
                max_depth: 3,
                deadline: std::time::Duration::from_secs(30),
            },
        ));

        let state = Arc::new(AppState {
            catalog,
            acl: AgentAcl::new(self.agents),
            skills,
            runner,
            sessions: Arc::new(SessionManager::new(std::time::Duration::from_secs(300))),
            shutdown: CancellationToken::new(),
        });
        TestGateway {
            state,
            _skills_dir: skills_dir,
        }
    }
}

pub fn selector(server: &str, tools: &[&str]) -> AgentSelector {
    AgentSelector {
        server: server.to_string(),
        tools: tools.iter().map(|s| s.to_string()).collect(),
    }
}
