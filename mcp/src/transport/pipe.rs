//! Shared machinery for pipe-style transports.
//!
//! Child-process, remote-shell and container-attach clients all speak
//! newline-delimited JSON-RPC over a byte stream pair. [`PipeCore`] owns
//! the writer, the outbound id counter and the pending-request map; a
//! single reader task matches replies to pending requests.
//!
//! Fail-fast invariant: when the reader exits (EOF, read error or
//! cancellation) it completes every pending request with a connection-lost
//! error before terminating, so callers never sit out the full request
//! timeout against a dead peer.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{McpError, McpResult},
    protocol::{CallToolResult, JsonRpcRequest, JsonRpcResponse, RequestId, Tool, PROTOCOL_VERSION},
};

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<McpResult<JsonRpcResponse>>>>>;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct PipeCore {
    label: String,
    writer: tokio::sync::Mutex<BoxedWriter>,
    next_id: AtomicI64,
    pending: PendingMap,
    request_timeout: Duration,
}

impl PipeCore {
    pub fn new(
        label: impl Into<String>,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        request_timeout: Duration,
    ) -> Self {
        Self {
            label: label.into(),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            next_id: AtomicI64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            request_timeout,
        }
    }

    /// Spawn the single reader task for this pipe.
    ///
    /// The task is the only writer to pending completion channels. It
    /// drains the pending map on every exit path.
    pub fn spawn_reader(
        &self,
        reader: impl AsyncRead + Send + Unpin + 'static,
        cancel: CancellationToken,
    ) {
        let pending = Arc::clone(&self.pending);
        let label = self.label.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = lines.next_line() => match next {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            debug!("'{}': southbound stream closed", label);
                            break;
                        }
                        Err(err) => {
                            warn!("'{}': southbound read error: {}", label, err);
                            break;
                        }
                    },
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match decode_response(line) {
                    Some(response) => Self::complete(&pending, &label, response),
                    None => info!("'{}': {}", label, line),
                }
            }
            drain_pending(&pending, &label);
        });
    }

    fn complete(pending: &PendingMap, label: &str, response: JsonRpcResponse) {
        let RequestId::Number(id) = response.id else {
            debug!("'{}': response with non-numeric id dropped", label);
            return;
        };
        match pending.lock().remove(&id) {
            Some(sender) => {
                let _ = sender.send(Ok(response));
            }
            // Caller already timed out or cancelled; drop the late reply.
            None => debug!("'{}': late reply for request {} dropped", label, id),
        }
    }

    /// One outbound JSON-RPC round trip.
    ///
    /// Completion, the per-request deadline and the caller's cancellation
    /// race; whichever loses removes the pending entry so a late reply is
    /// discarded silently.
    pub async fn request(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: Value,
    ) -> McpResult<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().insert(id, sender);

        let request = JsonRpcRequest::new(RequestId::Number(id), method, params);
        if let Err(err) = self.write_frame(&request).await {
            self.pending.lock().remove(&id);
            return Err(err);
        }

        tokio::select! {
            completed = receiver => match completed {
                Ok(result) => result,
                Err(_) => Err(McpError::ConnectionLost(self.label.clone())),
            },
            _ = tokio::time::sleep(self.request_timeout) => {
                self.pending.lock().remove(&id);
                Err(McpError::Timeout(format!(
                    "'{}': {} after {:?}", self.label, method, self.request_timeout
                )))
            }
            _ = cancel.cancelled() => {
                self.pending.lock().remove(&id);
                Err(McpError::Cancelled)
            }
        }
    }

    /// Send a notification; no response is expected.
    pub async fn notify(&self, method: &str, params: Value) -> McpResult<()> {
        self.write_frame(&JsonRpcRequest::notification(method, params))
            .await
    }

    async fn write_frame(&self, request: &JsonRpcRequest) -> McpResult<()> {
        let mut frame = serde_json::to_string(request)
            .map_err(|err| McpError::Protocol(format!("encode frame: {err}")))?;
        frame.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|err| McpError::Transport(format!("'{}': write: {}", self.label, err)))?;
        writer
            .flush()
            .await
            .map_err(|err| McpError::Transport(format!("'{}': flush: {}", self.label, err)))
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    // --- MCP conversation helpers shared by the pipe transports ---

    pub async fn handshake(&self, cancel: &CancellationToken) -> McpResult<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "toolgrid",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let response = self.request(cancel, "initialize", params).await?;
        if let Some(err) = response.error {
            return Err(McpError::Handshake(format!(
                "'{}': {} ({})",
                self.label, err.message, err.code
            )));
        }
        self.notify("notifications/initialized", json!({})).await
    }

    pub async fn fetch_tools(&self, cancel: &CancellationToken) -> McpResult<Vec<Tool>> {
        let response = self.request(cancel, "tools/list", json!({})).await?;
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

    pub async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        args: Map<String, Value>,
    ) -> McpResult<CallToolResult> {
        let params = json!({ "name": name, "arguments": args });
        let response = self.request(cancel, "tools/call", params).await?;
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
}

/// Decode a line as a JSON-RPC response. Lines that are not responses
/// (notifications, log output, partial JSON) return `None`.
fn decode_response(line: &str) -> Option<JsonRpcResponse> {
    let value: Value = serde_json::from_str(line).ok()?;
    let object = value.as_object()?;
    if !object.contains_key("id") || !(object.contains_key("result") || object.contains_key("error"))
    {
        return None;
    }
    serde_json::from_value(value).ok()
}

fn drain_pending(pending: &PendingMap, label: &str) {
    let drained: Vec<_> = {
        let mut pending = pending.lock();
        pending.drain().collect()
    };
    if !drained.is_empty() {
        warn!(
            "'{}': draining {} pending request(s) after reader exit",
            label,
            drained.len()
        );
    }
    for (_, sender) in drained {
        let _ = sender.send(Err(McpError::ConnectionLost(label.to_string())));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;

    /// Splits an in-memory duplex into a core plus the far end's halves.
    fn test_core(timeout: Duration) -> (PipeCore, tokio::io::DuplexStream, CancellationToken) {
        let (near, far) = duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(near);
        let core = PipeCore::new("test", write_half, timeout);
        let cancel = CancellationToken::new();
        core.spawn_reader(read_half, cancel.clone());
        (core, far, cancel)
    }

    #[tokio::test]
    async fn request_matches_response_by_id() {
        let (core, far, cancel) = test_core(Duration::from_secs(5));
        let (far_read, mut far_write) = tokio::io::split(far);

        tokio::spawn(async move {
            let mut lines = BufReader::new(far_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: JsonRpcRequest = serde_json::from_str(&line).unwrap();
                let reply = JsonRpcResponse::success(
                    request.id.unwrap(),
                    json!({"echo": request.method}),
                );
                let mut frame = serde_json::to_string(&reply).unwrap();
                frame.push('\n');
                far_write.write_all(frame.as_bytes()).await.unwrap();
            }
        });

        let response = core.request(&cancel, "tools/list", json!({})).await.unwrap();
        assert_eq!(response.result.unwrap()["echo"], "tools/list");
        assert_eq!(core.pending_len(), 0);
    }

    #[tokio::test]
    async fn pending_requests_fail_fast_on_stream_close() {
        // Deliberately generous timeout: the error must come from the
        // reader draining, not from the deadline.
        let (core, far, cancel) = test_core(Duration::from_secs(30));

        let started = Instant::now();
        let request = core.request(&cancel, "tools/list", json!({}));
        let close = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(far);
        };
        let (result, ()) = tokio::join!(request, close);

        assert!(matches!(result, Err(McpError::ConnectionLost(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(core.pending_len(), 0);
    }

    #[tokio::test]
    async fn deadline_removes_pending_entry() {
        let (core, _far, cancel) = test_core(Duration::from_millis(50));
        let result = core.request(&cancel, "tools/list", json!({})).await;
        assert!(matches!(result, Err(McpError::Timeout(_))));
        assert_eq!(core.pending_len(), 0);
    }

    #[tokio::test]
    async fn cancellation_removes_pending_entry() {
        let (core, _far, cancel) = test_core(Duration::from_secs(30));
        let request = core.request(&cancel, "tools/list", json!({}));
        let trigger = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(request, trigger);
        assert!(matches!(result, Err(McpError::Cancelled)));
        assert_eq!(core.pending_len(), 0);
    }

    #[tokio::test]
    async fn non_response_lines_are_skipped() {
        let (core, far, cancel) = test_core(Duration::from_secs(5));
        let (far_read, mut far_write) = tokio::io::split(far);

        tokio::spawn(async move {
            let mut lines = BufReader::new(far_read).lines();
            if let Ok(Some(line)) = lines.next_line().await {
                let request: JsonRpcRequest = serde_json::from_str(&line).unwrap();
                // Noise first: plain log text, then a server notification.
                far_write.write_all(b"starting up...\n").await.unwrap();
                far_write
                    .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n")
                    .await
                    .unwrap();
                let reply = JsonRpcResponse::success(request.id.unwrap(), json!({"ok": true}));
                let mut frame = serde_json::to_string(&reply).unwrap();
                frame.push('\n');
                far_write.write_all(frame.as_bytes()).await.unwrap();
            }
        });

        let response = core.request(&cancel, "ping", json!({})).await.unwrap();
        assert_eq!(response.result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn late_reply_after_timeout_is_dropped() {
        let (core, far, cancel) = test_core(Duration::from_millis(50));
        let (far_read, mut far_write) = tokio::io::split(far);

        let result = core.request(&cancel, "slow", json!({})).await;
        assert!(matches!(result, Err(McpError::Timeout(_))));

        // Reply to the request that already timed out, then make a fresh
        // request to prove the pipe is still usable.
        let mut lines = BufReader::new(far_read).lines();
        let first = lines.next_line().await.unwrap().unwrap();
        let stale: JsonRpcRequest = serde_json::from_str(&first).unwrap();
        let stale_reply = JsonRpcResponse::success(stale.id.unwrap(), json!({"stale": true}));
        let mut frame = serde_json::to_string(&stale_reply).unwrap();
        frame.push('\n');
        far_write.write_all(frame.as_bytes()).await.unwrap();

        let next = core.request(&cancel, "fresh", json!({}));
        let serve = async {
            let line = lines.next_line().await.unwrap().unwrap();
            let request: JsonRpcRequest = serde_json::from_str(&line).unwrap();
            let reply = JsonRpcResponse::success(request.id.unwrap(), json!({"stale": false}));
            let mut frame = serde_json::to_string(&reply).unwrap();
            frame.push('\n');
            far_write.write_all(frame.as_bytes()).await.unwrap();
        };
        let (response, ()) = tokio::join!(next, serve);
        assert_eq!(response.unwrap().result.unwrap()["stale"], false);
    }
}
