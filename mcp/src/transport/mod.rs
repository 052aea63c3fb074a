//! Southbound transport clients.
//!
//! Every transport implements the same [`ToolClient`] contract. The
//! pipe-style transports (child process, remote shell, container attach)
//! share the framing and pending-request machinery in [`pipe`]; the HTTP
//! and peer-agent transports carry their own request bookkeeping.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    error::McpResult,
    protocol::{CallToolResult, Tool},
};

pub mod container;
pub mod http;
pub mod peer;
pub mod pipe;
pub mod process;
pub mod ssh;

pub use container::ContainerTarget;
pub use http::HttpClient;
pub use peer::PeerAgentClient;
pub use process::ProcessClient;
pub use ssh::SshTarget;

/// Lifecycle state of a southbound client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Ready,
    Reconnecting,
    Closed,
}

/// Contract every southbound client fulfils.
///
/// `initialize` is idempotent once the client is ready; after a failed
/// first attempt a second call retries from the start. `close` is
/// idempotent. `refresh_tools` keeps the cached list unchanged on failure.
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// Stable identifier, used as the catalog prefix.
    fn name(&self) -> &str;

    fn state(&self) -> ClientState;

    /// Perform the southbound handshake and fetch the initial tool list.
    async fn initialize(&self, cancel: &CancellationToken) -> McpResult<()>;

    /// Cached, unprefixed tool list.
    fn tools(&self) -> Vec<Tool>;

    /// Re-fetch the advertised tool list.
    async fn refresh_tools(&self, cancel: &CancellationToken) -> McpResult<()>;

    /// One JSON-RPC round trip with the unprefixed tool name.
    async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        args: Map<String, Value>,
    ) -> McpResult<CallToolResult>;

    /// Release resources.
    async fn close(&self);
}
