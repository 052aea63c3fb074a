//! Northbound SSE sessions.
//!
//! `GET /sse` opens a long-lived event stream. The first event (name
//! `endpoint`) carries the paired POST path with the session id; every
//! JSON-RPC reply then arrives as a `message` event. `POST /message`
//! parses the request, dispatches it through the façade and answers
//! `202 Accepted` with an empty body; the real reply travels on the
//! stream.
//!
//! The SSE task is the sole owner of the HTTP response stream; the POST
//! handler only sends frames into the session's outbound channel. A
//! per-session pipeline mutex keeps replies in submission order on each
//! channel (no ordering exists across channels).

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures::{channel::mpsc, SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use toolgrid_mcp::{protocol::error_codes, JsonRpcRequest, JsonRpcResponse, RequestId};
use tracing::{debug, info, warn};

use crate::{rpc, state::AppState};

pub const MESSAGE_PATH: &str = "/message";

const OUTBOUND_BUFFER: usize = 64;

pub struct Session {
    pub id: String,
    pub agent: String,
    tx: mpsc::Sender<JsonRpcResponse>,
    created_at: Instant,
    /// Seconds since the manager's epoch, updated on every POST.
    last_seen: AtomicU64,
    /// FIFO slot serializing dispatch per channel.
    pipeline: tokio::sync::Mutex<()>,
    done: CancellationToken,
}

impl Session {
    /// Queue a frame for the SSE writer. False when the stream is gone.
    pub async fn send(&self, response: JsonRpcResponse) -> bool {
        let mut tx = self.tx.clone();
        tx.send(response).await.is_ok()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    epoch: Instant,
    max_idle: Duration,
}

impl SessionManager {
    pub fn new(max_idle: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
            max_idle,
        }
    }

    /// Allocate a session with a 128-bit random hex id.
    pub fn open(&self, agent: String) -> (Arc<Session>, mpsc::Receiver<JsonRpcResponse>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let session = Arc::new(Session {
            id: uuid::Uuid::new_v4().simple().to_string(),
            agent,
            tx,
            created_at: Instant::now(),
            last_seen: AtomicU64::new(self.epoch.elapsed().as_secs()),
            pipeline: tokio::sync::Mutex::new(()),
            done: CancellationToken::new(),
        });
        self.sessions
            .write()
            .insert(session.id.clone(), Arc::clone(&session));
        (session, rx)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).map(Arc::clone)
    }

    pub fn remove(&self, id: &str) {
        if let Some(session) = self.sessions.write().remove(id) {
            session.done.cancel();
            debug!("session {} removed after {:?}", id, session.age());
        }
    }

    pub fn touch(&self, session: &Session) {
        session
            .last_seen
            .store(self.epoch.elapsed().as_secs(), Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Drop sessions idle past `max_idle`.
    pub fn sweep(&self) {
        let now = self.epoch.elapsed().as_secs();
        let limit = self.max_idle.as_secs();
        let expired: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|session| now.saturating_sub(session.last_seen.load(Ordering::Relaxed)) > limit)
            .map(|session| session.id.clone())
            .collect();
        for id in expired {
            info!("sweeping idle session {}", id);
            self.remove(&id);
        }
    }

    /// Background sweep at a fixed cadence.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.sweep(),
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }
}

/// Removes the session when the SSE stream is dropped.
struct SessionGuard {
    manager: Arc<SessionManager>,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.manager.remove(&self.id);
    }
}

/// `GET /sse`
pub async fn handle_sse(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let agent = rpc::agent_identity(&query, &headers);
    let (session, rx) = state.sessions.open(agent);
    info!(
        "SSE session {} opened (agent: '{}', {} active)",
        session.id,
        session.agent,
        state.sessions.len()
    );

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("{MESSAGE_PATH}?sessionId={}", session.id));
    let done = session.done.clone();
    let guard = SessionGuard {
        manager: Arc::clone(&state.sessions),
        id: session.id.clone(),
    };

    let messages = rx.map(move |frame| {
        // The guard rides in the closure; dropping the stream drops it
        // and unregisters the session.
        let _ = &guard;
        Ok::<Event, Infallible>(
            Event::default()
                .event("message")
                .data(serde_json::to_string(&frame).unwrap_or_default()),
        )
    });
    let stream = futures::stream::once(async move { Ok::<Event, Infallible>(endpoint) })
        .chain(messages)
        .take_until(done.cancelled_owned());

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// `POST /message?sessionId=…`
pub async fn handle_message(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    let Some(session_id) = query.get("sessionId") else {
        return (StatusCode::BAD_REQUEST, "missing sessionId").into_response();
    };
    let Some(session) = state.sessions.get(session_id) else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };

    // Hold the pipeline slot across dispatch and send: replies leave in
    // the submission order of POSTs on this channel.
    let _slot = session.pipeline.lock().await;
    state.sessions.touch(&session);

    let reply = match serde_json::from_str::<JsonRpcRequest>(&body) {
        Ok(request) => rpc::dispatch(&state, &session.agent, request).await,
        Err(err) => Some(JsonRpcResponse::error(
            RequestId::Null,
            error_codes::INVALID_REQUEST,
            format!("invalid JSON-RPC request: {err}"),
        )),
    };
    if let Some(reply) = reply {
        if !session.send(reply).await {
            warn!("session {} stream closed before reply", session.id);
        }
    }

    // The JSON-RPC reply travels on the SSE stream, not in this body.
    StatusCode::ACCEPTED.into_response()
}
