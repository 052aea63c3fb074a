//! Child-process transport.
//!
//! Spawns a tool server as a local child process and bridges JSON-RPC over
//! its stdin/stdout. stderr is forwarded to the gateway log at warning
//! level. The remote-shell and container transports reuse this client with
//! a different command line.

use std::{collections::HashMap, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{pipe::PipeCore, ClientState, ToolClient};
use crate::{
    error::{McpError, McpResult},
    protocol::{CallToolResult, Tool},
};

/// Command line for a pipe-style server process.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: HashMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_envs(mut self, envs: HashMap<String, String>) -> Self {
        self.envs = envs;
        self
    }
}

struct Inner {
    core: Arc<PipeCore>,
    child: Child,
    cancel: CancellationToken,
}

pub struct ProcessClient {
    name: String,
    spec: CommandSpec,
    request_timeout: Duration,
    state: Mutex<ClientState>,
    tools: RwLock<Vec<Tool>>,
    inner: tokio::sync::Mutex<Option<Inner>>,
}

impl ProcessClient {
    pub fn new(name: impl Into<String>, spec: CommandSpec, request_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            spec,
            request_timeout,
            state: Mutex::new(ClientState::Disconnected),
            tools: RwLock::new(Vec::new()),
            inner: tokio::sync::Mutex::new(None),
        }
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock() = state;
    }

    async fn connect(&self, cancel: &CancellationToken) -> McpResult<(Inner, Vec<Tool>)> {
        info!(
            "Spawning '{}' via {} {:?}",
            self.name, self.spec.program, self.spec.args
        );
        let mut child = Command::new(&self.spec.program)
            .args(&self.spec.args)
            .envs(&self.spec.envs)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                McpError::Transport(format!("spawn '{}': {}", self.spec.program, err))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("child stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::Transport("child stderr not captured".to_string()))?;

        let core = Arc::new(PipeCore::new(&self.name, stdin, self.request_timeout));
        let token = CancellationToken::new();
        core.spawn_reader(stdout, token.clone());
        spawn_stderr_logger(self.name.clone(), stderr, token.clone());

        let setup = async {
            core.handshake(cancel).await?;
            core.fetch_tools(cancel).await
        };
        match setup.await {
            Ok(tools) => {
                info!("Connected to '{}', {} tool(s)", self.name, tools.len());
                Ok((
                    Inner {
                        core,
                        child,
                        cancel: token,
                    },
                    tools,
                ))
            }
            Err(err) => {
                token.cancel();
                let _ = child.start_kill();
                Err(err)
            }
        }
    }

    async fn core(&self) -> McpResult<Arc<PipeCore>> {
        let inner = self.inner.lock().await;
        inner
            .as_ref()
            .map(|inner| Arc::clone(&inner.core))
            .ok_or_else(|| McpError::ConnectionLost(self.name.clone()))
    }
}

#[async_trait]
impl ToolClient for ProcessClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ClientState {
        *self.state.lock()
    }

    async fn initialize(&self, cancel: &CancellationToken) -> McpResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.is_some() && self.state() == ClientState::Ready {
            return Ok(());
        }
        // A failed first attempt may have left a half-dead child behind.
        if let Some(mut stale) = inner.take() {
            stale.cancel.cancel();
            let _ = stale.child.start_kill();
        }
        self.set_state(ClientState::Connecting);
        match self.connect(cancel).await {
            Ok((connected, tools)) => {
                *self.tools.write() = tools;
                *inner = Some(connected);
                self.set_state(ClientState::Ready);
                Ok(())
            }
            Err(err) => {
                self.set_state(ClientState::Disconnected);
                Err(err)
            }
        }
    }

    fn tools(&self) -> Vec<Tool> {
        self.tools.read().clone()
    }

    async fn refresh_tools(&self, cancel: &CancellationToken) -> McpResult<()> {
        let core = self.core().await?;
        let tools = core.fetch_tools(cancel).await?;
        *self.tools.write() = tools;
        Ok(())
    }

    async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        args: Map<String, Value>,
    ) -> McpResult<CallToolResult> {
        let core = self.core().await?;
        let result = core.call_tool(cancel, name, args).await;
        if matches!(result, Err(McpError::ConnectionLost(_))) {
            self.set_state(ClientState::Disconnected);
        }
        result
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut stale) = inner.take() {
            debug!("Closing '{}'", self.name);
            stale.cancel.cancel();
            let _ = stale.child.start_kill();
        }
        self.set_state(ClientState::Closed);
    }
}

fn spawn_stderr_logger(
    name: String,
    stderr: tokio::process::ChildStderr,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = lines.next_line() => match next {
                    Ok(Some(line)) => warn!("'{}' stderr: {}", name, line),
                    _ => break,
                },
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initialize_fails_cleanly_for_missing_program() {
        let client = ProcessClient::new(
            "ghost",
            CommandSpec::new("/nonexistent/toolgrid-test-binary"),
            Duration::from_secs(1),
        );
        let cancel = CancellationToken::new();

        let result = client.initialize(&cancel).await;
        assert!(matches!(result, Err(McpError::Transport(_))));
        assert_eq!(client.state(), ClientState::Disconnected);

        // Second attempt retries from the start and fails the same way.
        let result = client.initialize(&cancel).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let client = ProcessClient::new(
            "ghost",
            CommandSpec::new("/nonexistent/toolgrid-test-binary"),
            Duration::from_secs(1),
        );
        client.close().await;
        client.close().await;
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn call_without_connection_reports_connection_lost() {
        let client = ProcessClient::new(
            "ghost",
            CommandSpec::new("true"),
            Duration::from_secs(1),
        );
        let cancel = CancellationToken::new();
        let result = client.call_tool(&cancel, "anything", Map::new()).await;
        assert!(matches!(result, Err(McpError::ConnectionLost(_))));
    }
}
