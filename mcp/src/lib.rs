//! Southbound half of the toolgrid gateway.
//!
//! ## Modules
//!
//! - [`protocol`]: JSON-RPC 2.0 frames and tool-result types
//! - [`transport`]: one client per southbound transport kind
//! - [`catalog`]: aggregated, prefixed tool index and call router
//! - [`acl`]: per-agent tool visibility and call filtering

pub mod acl;
pub mod catalog;
pub mod error;
pub mod protocol;
pub mod transport;

pub use acl::{AgentAcl, AgentSelector};
pub use catalog::ToolCatalog;
pub use error::{McpError, McpResult};
pub use protocol::{
    CallToolResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, Tool, ToolContent,
};
pub use transport::{ClientState, ToolClient};
