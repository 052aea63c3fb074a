//! JSON-RPC 2.0 frames and tool types.
//!
//! The gateway speaks JSON-RPC on both sides of the bridge. Request ids are
//! preserved verbatim across the hop, including their JSON form (number,
//! string or null), so [`RequestId`] models all three.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Standard JSON-RPC error codes used by the gateway.
pub mod error_codes {
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// A JSON-RPC request id in any of its three wire forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
    #[default]
    Null,
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
            RequestId::Null => write!(f, "null"),
        }
    }
}

/// Deserializes a present `id` field, mapping JSON `null` to
/// [`RequestId::Null`] instead of `None`. Absence (a notification) is
/// handled by `#[serde(default)]` and stays `None`.
fn deserialize_present_id<'de, D>(deserializer: D) -> Result<Option<RequestId>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(Some(RequestId::Null)),
        Value::Number(n) => n
            .as_i64()
            .map(|n| Some(RequestId::Number(n)))
            .ok_or_else(|| serde::de::Error::custom("request id must be an integer")),
        Value::String(s) => Ok(Some(RequestId::String(s))),
        _ => Err(serde::de::Error::custom(
            "request id must be a number, string or null",
        )),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present_id"
    )]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params: Some(params),
        }
    }

    /// A request without an id expects no response.
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// A tool descriptor as advertised by a southbound server.
///
/// The name is unprefixed here; the catalog composes the
/// `«server»__«tool»` form at registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Map<String, Value>,
}

impl Tool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            description: None,
            input_schema: Map::new(),
        }
    }
}

/// One content item of a tool result. Only text parts cross the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
}

/// Result of a `tools/call` round trip.
///
/// `is_error = true` is a tool-reported failure; it is propagated verbatim
/// and never converted into a JSON-RPC protocol error. Only text content
/// crosses the bridge; other part kinds are dropped on decode.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CallToolResult {
    #[serde(default, deserialize_with = "text_parts_only")]
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

fn text_parts_only<'de, D>(deserializer: D) -> Result<Vec<ToolContent>, D::Error>
where
    D: Deserializer<'de>,
{
    let parts = Vec::<Value>::deserialize(deserializer)?;
    Ok(parts
        .into_iter()
        .filter_map(|part| serde_json::from_value(part).ok())
        .collect())
}

impl CallToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: true,
        }
    }

    /// Joined text of all content parts.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .map(|part| match part {
                ToolContent::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_round_trips_all_forms() {
        for (raw, expected) in [
            ("7", RequestId::Number(7)),
            ("\"abc\"", RequestId::String("abc".to_string())),
            ("null", RequestId::Null),
        ] {
            let parsed: RequestId = serde_json::from_str(raw).unwrap();
            assert_eq!(parsed, expected);
            assert_eq!(serde_json::to_string(&parsed).unwrap(), raw);
        }
    }

    #[test]
    fn explicit_null_id_is_not_a_notification() {
        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":null,"method":"tools/list"}"#).unwrap();
        assert_eq!(req.id, Some(RequestId::Null));
        assert!(!req.is_notification());

        let notif: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .unwrap();
        assert!(notif.is_notification());
    }

    #[test]
    fn response_preserves_id_form() {
        let resp = JsonRpcResponse::success(RequestId::String("x-1".into()), serde_json::json!({}));
        let raw = serde_json::to_value(&resp).unwrap();
        assert_eq!(raw["id"], "x-1");

        let resp = JsonRpcResponse::error(RequestId::Null, error_codes::INVALID_REQUEST, "bad");
        let raw = serde_json::to_value(&resp).unwrap();
        assert!(raw["id"].is_null());
        assert_eq!(raw["error"]["code"], -32600);
    }

    #[test]
    fn call_result_decodes_wire_form() {
        let result: CallToolResult = serde_json::from_value(serde_json::json!({
            "content": [{"type": "text", "text": "hello"}],
            "isError": false,
        }))
        .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.joined_text(), "hello");
    }

    #[test]
    fn call_result_drops_non_text_parts() {
        let result: CallToolResult = serde_json::from_value(serde_json::json!({
            "content": [
                {"type": "image", "data": "...", "mimeType": "image/png"},
                {"type": "text", "text": "caption"},
            ],
            "isError": true,
        }))
        .unwrap();
        assert!(result.is_error);
        assert_eq!(result.content.len(), 1);
        assert_eq!(result.joined_text(), "caption");
    }
}
