//! toolgrid: a protocol bridge and tool-aggregation gateway.
//!
//! Northbound it speaks JSON-RPC over `POST /mcp` and over SSE sessions
//! with a paired message channel; southbound it fans out to tool servers
//! over child-process, ssh, container-attach, HTTP and peer-agent
//! transports. Skills layer a declarative workflow executor on top and
//! are served back as prompts and tools.

pub mod config;
pub mod prompts;
pub mod rpc;
pub mod server;
pub mod sse;
pub mod state;

pub use config::GatewayConfig;
pub use state::AppState;
