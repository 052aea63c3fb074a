//! Northbound JSON-RPC façade.
//!
//! One dispatch path serves both the direct `POST /mcp` endpoint and the
//! SSE message channel. Request ids are preserved verbatim; protocol
//! failures use standard JSON-RPC error codes while tool-reported errors
//! (including ACL denials) travel as tool results.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};
use toolgrid_mcp::{
    protocol::{error_codes, PROTOCOL_VERSION},
    CallToolResult, JsonRpcRequest, JsonRpcResponse, McpError, RequestId,
};
use tracing::{debug, warn};

use crate::{
    prompts::SKILL_TOOL_PREFIX,
    state::{AppState, SERVER_NAME, SERVER_VERSION},
};

/// Resolve the agent identity: query parameter first, header second,
/// empty otherwise.
pub fn agent_identity(query: &HashMap<String, String>, headers: &HeaderMap) -> String {
    if let Some(agent) = query.get("agent").filter(|agent| !agent.is_empty()) {
        return agent.clone();
    }
    headers
        .get("x-agent-name")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Direct JSON-RPC endpoint behind `POST /mcp`.
pub async fn handle_mcp(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let agent = agent_identity(&query, &headers);
    let request: JsonRpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(err) => {
            return Json(JsonRpcResponse::error(
                RequestId::Null,
                error_codes::INVALID_REQUEST,
                format!("invalid JSON-RPC request: {err}"),
            ))
            .into_response()
        }
    };
    match dispatch(&state, &agent, request).await {
        Some(response) => Json(response).into_response(),
        // A notification gets no JSON-RPC reply.
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Dispatch one request through the gateway. Notifications return `None`.
pub async fn dispatch(
    state: &Arc<AppState>,
    agent: &str,
    request: JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    let Some(id) = request.id.clone() else {
        debug!("notification: {}", request.method);
        return None;
    };
    if request.jsonrpc != "2.0" {
        return Some(JsonRpcResponse::error(
            id,
            error_codes::INVALID_REQUEST,
            "jsonrpc must be \"2.0\"",
        ));
    }

    let response = match request.method.as_str() {
        "initialize" => initialize(request.params.as_ref(), id),
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => tools_list(state, agent, id),
        "tools/call" => tools_call(state, agent, request.params, id).await,
        "prompts/list" => prompts_list(state, id),
        "prompts/get" => prompts_get(state, request.params.as_ref(), id),
        method => JsonRpcResponse::error(
            id,
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        ),
    };
    Some(response)
}

fn initialize(params: Option<&Value>, id: RequestId) -> JsonRpcResponse {
    if let Some(client) = params.and_then(|params| params.get("clientInfo")) {
        debug!(
            "initialize from {} {}",
            client.get("name").and_then(serde_json::Value::as_str).unwrap_or("?"),
            client.get("version").and_then(serde_json::Value::as_str).unwrap_or("?"),
        );
    }
    JsonRpcResponse::success(
        id,
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": {"listChanged": false},
                "prompts": {},
            },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": SERVER_VERSION,
            },
        }),
    )
}

fn tools_list(state: &Arc<AppState>, agent: &str, id: RequestId) -> JsonRpcResponse {
    let mut tools = state.catalog.list_tools();
    tools.extend(state.runner.skill_tools());
    let tools = state.acl.filter_tools(agent, tools);
    JsonRpcResponse::success(id, json!({ "tools": tools }))
}

async fn tools_call(
    state: &Arc<AppState>,
    agent: &str,
    params: Option<Value>,
    id: RequestId,
) -> JsonRpcResponse {
    let Some(params) = params else {
        return JsonRpcResponse::error(id, error_codes::INVALID_PARAMS, "missing params");
    };
    let Some(name) = params.get("name").and_then(Value::as_str).map(String::from) else {
        return JsonRpcResponse::error(id, error_codes::INVALID_PARAMS, "missing tool name");
    };
    let args: Map<String, Value> = match params.get("arguments") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return JsonRpcResponse::error(
                id,
                error_codes::INVALID_PARAMS,
                "arguments must be an object",
            )
        }
    };

    if !state.acl.allows_prefixed(agent, &name) {
        // Denials are tool results so clients surface them naturally.
        warn!("agent '{}' denied tool '{}'", agent, name);
        let denied = CallToolResult::error(format!(
            "Access denied: agent '{agent}' is not permitted to call '{name}'"
        ));
        return tool_result_response(id, denied);
    }

    let outcome = if let Some(skill) = name.strip_prefix(SKILL_TOOL_PREFIX) {
        state
            .runner
            .call_skill(&state.shutdown, &[], skill, args)
            .await
    } else {
        state.catalog.call_tool(&state.shutdown, &name, args).await
    };

    match outcome {
        Ok(result) => tool_result_response(id, result),
        Err(err @ (McpError::ToolNotFound(_) | McpError::ServerNotFound(_))) => {
            JsonRpcResponse::error(id, error_codes::INVALID_PARAMS, err.to_string())
        }
        Err(err) => {
            warn!("tools/call '{}' failed: {}", name, err);
            JsonRpcResponse::error(id, error_codes::INTERNAL_ERROR, err.to_string())
        }
    }
}

fn tool_result_response(id: RequestId, result: CallToolResult) -> JsonRpcResponse {
    match serde_json::to_value(&result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(err) => JsonRpcResponse::error(id, error_codes::INTERNAL_ERROR, err.to_string()),
    }
}

fn prompts_list(state: &Arc<AppState>, id: RequestId) -> JsonRpcResponse {
    JsonRpcResponse::success(id, json!({ "prompts": state.runner.list_prompts() }))
}

fn prompts_get(state: &Arc<AppState>, params: Option<&Value>, id: RequestId) -> JsonRpcResponse {
    let Some(name) = params
        .and_then(|params| params.get("name"))
        .and_then(Value::as_str)
    else {
        return JsonRpcResponse::error(id, error_codes::INVALID_PARAMS, "missing prompt name");
    };
    let arguments = params
        .and_then(|params| params.get("arguments"))
        .and_then(Value::as_object);
    match state.runner.get_prompt(name, arguments) {
        Some(prompt) => JsonRpcResponse::success(id, prompt),
        None => JsonRpcResponse::error(
            id,
            error_codes::INVALID_PARAMS,
            format!("Prompt not found: {name}"),
        ),
    }
}
