//! HTTP POST transport.
//!
//! Each JSON-RPC round trip is a single POST carrying the request body;
//! request ids are local and disposable. The initial handshake retries
//! with exponential backoff since remote endpoints routinely win the race
//! against their own startup.

use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ClientState, ToolClient};
use crate::{
    error::{McpError, McpResult},
    protocol::{CallToolResult, JsonRpcRequest, JsonRpcResponse, RequestId, Tool, PROTOCOL_VERSION},
};

pub struct HttpClient {
    name: String,
    url: String,
    http: reqwest::Client,
    next_id: AtomicI64,
    state: Mutex<ClientState>,
    tools: RwLock<Vec<Tool>>,
}

impl HttpClient {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        token: Option<&str>,
        request_timeout: Duration,
    ) -> McpResult<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout);

        if let Some(token) = token {
            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {token}")
                    .parse()
                    .map_err(|err| McpError::Transport(format!("auth token: {err}")))?,
            );
            builder = builder.default_headers(headers);
        }

        Ok(Self {
            name: name.into(),
            url: url.into(),
            http: builder.build()?,
            next_id: AtomicI64::new(1),
            state: Mutex::new(ClientState::Disconnected),
            tools: RwLock::new(Vec::new()),
        })
    }

    async fn post(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: Value,
    ) -> McpResult<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(RequestId::Number(id), method, params);

        let round_trip = async {
            let response = self.http.post(&self.url).json(&request).send().await?;
            response.error_for_status()?.json::<JsonRpcResponse>().await
        };
        tokio::select! {
            response = round_trip => response.map_err(|err| {
                if err.is_timeout() {
                    McpError::Timeout(format!("'{}': {} at {}", self.name, method, self.url))
                } else {
                    McpError::Http(err)
                }
            }),
            _ = cancel.cancelled() => Err(McpError::Cancelled),
        }
    }

    async fn handshake(&self, cancel: &CancellationToken) -> McpResult<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "toolgrid",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let response = self.post(cancel, "initialize", params).await?;
        if let Some(err) = response.error {
            return Err(McpError::Handshake(format!(
                "'{}': {} ({})",
                self.name, err.message, err.code
            )));
        }
        // Fire-and-forget; some servers answer notifications with 202.
        let initialized = JsonRpcRequest::notification("notifications/initialized", json!({}));
        let _ = self.http.post(&self.url).json(&initialized).send().await;
        Ok(())
    }

    async fn fetch_tools(&self, cancel: &CancellationToken) -> McpResult<Vec<Tool>> {
        let response = self.post(cancel, "tools/list", json!({})).await?;
        if let Some(err) = response.error {
            return Err(McpError::Protocol(format!(
                "tools/list failed: {} ({})",
                err.message, err.code
            )));
        }
        let result = response
            .result
            .ok_or_else(|| McpError::Protocol("tools/list: missing result".to_string()))?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| McpError::Protocol("tools/list: missing tools field".to_string()))?;
        serde_json::from_value(tools)
            .map_err(|err| McpError::Protocol(format!("tools/list: invalid tool list: {err}")))
    }
}

#[async_trait]
impl ToolClient for HttpClient {
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

        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(10))
            .with_max_elapsed_time(Some(Duration::from_secs(30)))
            .build();

        let connected = backoff::future::retry(backoff, || async {
            match self.handshake(cancel).await {
                Ok(()) => Ok(()),
                Err(McpError::Cancelled) => Err(backoff::Error::permanent(McpError::Cancelled)),
                Err(err) => {
                    debug!("'{}': handshake retry after: {}", self.name, err);
                    Err(backoff::Error::transient(err))
                }
            }
        })
        .await;

        let fetched = match connected {
            Ok(()) => self.fetch_tools(cancel).await,
            Err(err) => Err(err),
        };
        match fetched {
            Ok(tools) => {
                info!("Connected to '{}' at {}, {} tool(s)", self.name, self.url, tools.len());
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
        let tools = self.fetch_tools(cancel).await?;
        *self.tools.write() = tools;
        Ok(())
    }

    async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        args: Map<String, Value>,
    ) -> McpResult<CallToolResult> {
        let params = json!({ "name": name, "arguments": args });
        let response = self.post(cancel, "tools/call", params).await?;
        if let Some(err) = response.error {
            return Err(McpError::Protocol(format!(
                "tools/call '{}' failed: {} ({})",
                name, err.message, err.code
            )));
        }
        let result = response
            .result
            .ok_or_else(|| McpError::Protocol("tools/call: missing result".to_string()))?;
        serde_json::from_value(result)
            .map_err(|err| McpError::Protocol(format!("tools/call: invalid result: {err}")))
    }

    async fn close(&self) {
        *self.state.lock() = ClientState::Closed;
    }
}
