#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep, timeout, Instant};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

use janus_client::{
    EngineError, IceCandidate, RetryPolicy, RtcEngine, SessionConfig, SessionDescription,
    TrackHandler, TrackInfo,
};

pub const SESSION_ID: u64 = 42;
pub const FIRST_HANDLE_ID: u64 = 7;
const KEEPALIVE_AFTER: Duration = Duration::from_millis(200);

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub fn fast_config() -> SessionConfig {
    SessionConfig::default()
        .with_request_timeout(Duration::from_secs(2))
        .with_poll_timeout(Duration::from_secs(2))
        .with_poll_retry(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        })
}

/// What the gateway does with one plugin message.
#[derive(Default)]
pub struct Scripted {
    /// Replaces the usual `ack` when set.
    pub reply: Option<Value>,
    /// Queued on the long-poll before the reply goes out.
    pub events: Vec<Value>,
}

impl Scripted {
    pub fn ack() -> Self {
        Self::default()
    }

    pub fn ack_then(events: Vec<Value>) -> Self {
        Self {
            reply: None,
            events,
        }
    }

    pub fn reply(reply: Value) -> Self {
        Self {
            reply: Some(reply),
            events: Vec::new(),
        }
    }
}

pub type Responder = Arc<dyn Fn(u64, &Value) -> Scripted + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Recorded {
    pub handle_id: u64,
    pub message: Value,
}

impl Recorded {
    pub fn transaction(&self) -> String {
        self.message["transaction"]
            .as_str()
            .unwrap_or_default()
            .to_string()
    }

    pub fn request(&self) -> Option<&str> {
        self.message["body"]["request"].as_str()
    }
}

#[derive(Default)]
struct GatewayState {
    next_handle: AtomicU64,
    events: Mutex<VecDeque<Value>>,
    events_ready: Notify,
    fail_polls: AtomicBool,
    poll_reply: Mutex<Option<Value>>,
    attach_delay: Mutex<Option<Duration>>,
    refuse_destroy: AtomicBool,
    polls: AtomicUsize,
    last_maxev: Mutex<Option<String>>,
    destroys: AtomicUsize,
    attaches: Mutex<Vec<String>>,
    messages: Mutex<Vec<Recorded>>,
    responder: Mutex<Option<Responder>>,
}

/// In-process gateway speaking the session/handle HTTP API.
pub struct MockGateway {
    state: Arc<GatewayState>,
    addr: std::net::SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<tokio::task::JoinHandle<()>>,
}

impl MockGateway {
    pub async fn start() -> Self {
        init_tracing();
        let state = Arc::new(GatewayState::default());
        state.next_handle.store(FIRST_HANDLE_ID, Ordering::SeqCst);

        let router = Router::new()
            .route("/janus", post(root_post))
            .route("/janus/:session", post(session_post).get(session_poll))
            .route("/janus/:session/:handle", post(handle_post))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener bind");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            state,
            addr,
            shutdown: Some(shutdown_tx),
            server: Some(server),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/janus", self.addr)
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(u64, &Value) -> Scripted + Send + Sync + 'static,
    {
        *self.state.responder.lock() = Some(Arc::new(responder));
    }

    pub fn push_event(&self, event: Value) {
        self.state.events.lock().push_back(event);
        self.state.events_ready.notify_one();
    }

    pub fn fail_polls(&self, fail: bool) {
        self.state.fail_polls.store(fail, Ordering::SeqCst);
    }

    /// Every long-poll answers `reply` with HTTP 200 instead of waiting.
    pub fn answer_polls_with(&self, reply: Value) {
        *self.state.poll_reply.lock() = Some(reply);
    }

    pub fn delay_attach(&self, delay: Duration) {
        *self.state.attach_delay.lock() = Some(delay);
    }

    pub fn refuse_destroy(&self, refuse: bool) {
        self.state.refuse_destroy.store(refuse, Ordering::SeqCst);
    }

    pub fn destroys(&self) -> usize {
        self.state.destroys.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.state.polls.load(Ordering::SeqCst)
    }

    pub fn last_maxev(&self) -> Option<String> {
        self.state.last_maxev.lock().clone()
    }

    pub fn attached_plugins(&self) -> Vec<String> {
        self.state.attaches.lock().clone()
    }

    pub fn messages(&self) -> Vec<Recorded> {
        self.state.messages.lock().clone()
    }

    pub async fn wait_for_messages(&self, count: usize) -> Vec<Recorded> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let messages = self.messages();
            if messages.len() >= count {
                return messages;
            }
            assert!(
                Instant::now() < deadline,
                "gateway saw {} of {count} messages",
                messages.len()
            );
            sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_polls(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.polls() < count {
            assert!(Instant::now() < deadline, "poll loop did not start");
            sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            let _ = timeout(Duration::from_secs(2), server).await;
        }
    }
}

pub fn event(handle_id: u64, transaction: Option<&str>, data: Value, jsep: Option<Value>) -> Value {
    let mut event = json!({
        "janus": "event",
        "session_id": SESSION_ID,
        "sender": handle_id,
        "plugindata": {
            "plugin": "janus.plugin.videoroom",
            "data": data,
        },
    });
    if let Some(transaction) = transaction {
        event["transaction"] = transaction.into();
    }
    if let Some(jsep) = jsep {
        event["jsep"] = jsep;
    }
    event
}

fn transaction_of(body: &Value) -> Value {
    body.get("transaction").cloned().unwrap_or(Value::Null)
}

async fn root_post(Json(body): Json<Value>) -> Response {
    match body["janus"].as_str() {
        Some("create") => Json(json!({
            "janus": "success",
            "transaction": transaction_of(&body),
            "data": {"id": SESSION_ID},
        }))
        .into_response(),
        _ => (StatusCode::BAD_REQUEST, "unsupported root request").into_response(),
    }
}

async fn session_post(
    State(state): State<Arc<GatewayState>>,
    Path(session): Path<u64>,
    Json(body): Json<Value>,
) -> Response {
    if session != SESSION_ID {
        return Json(json!({
            "janus": "error",
            "transaction": transaction_of(&body),
            "error": {"code": 458, "reason": "No such session"},
        }))
        .into_response();
    }
    match body["janus"].as_str() {
        Some("attach") => {
            let delay = *state.attach_delay.lock();
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            let id = state.next_handle.fetch_add(1, Ordering::SeqCst);
            state
                .attaches
                .lock()
                .push(body["plugin"].as_str().unwrap_or_default().to_string());
            Json(json!({
                "janus": "success",
                "session_id": SESSION_ID,
                "transaction": transaction_of(&body),
                "data": {"id": id},
            }))
            .into_response()
        }
        Some("destroy") => {
            state.destroys.fetch_add(1, Ordering::SeqCst);
            if state.refuse_destroy.load(Ordering::SeqCst) {
                return Json(json!({
                    "janus": "error",
                    "transaction": transaction_of(&body),
                    "error": {"code": 490, "reason": "Unexpected destroy"},
                }))
                .into_response();
            }
            Json(json!({
                "janus": "success",
                "session_id": SESSION_ID,
                "transaction": transaction_of(&body),
            }))
            .into_response()
        }
        _ => (StatusCode::BAD_REQUEST, "unsupported session request").into_response(),
    }
}

async fn session_poll(
    State(state): State<Arc<GatewayState>>,
    Path(_session): Path<u64>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state.polls.fetch_add(1, Ordering::SeqCst);
    *state.last_maxev.lock() = query.get("maxev").cloned();
    if state.fail_polls.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "poll refused").into_response();
    }
    let canned = state.poll_reply.lock().clone();
    if let Some(reply) = canned {
        return Json(reply).into_response();
    }

    let deadline = Instant::now() + KEEPALIVE_AFTER;
    loop {
        let next = state.events.lock().pop_front();
        if let Some(event) = next {
            return Json(event).into_response();
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero()
            || timeout(remaining, state.events_ready.notified())
                .await
                .is_err()
        {
            return Json(json!({"janus": "keepalive", "session_id": SESSION_ID}))
                .into_response();
        }
    }
}

async fn handle_post(
    State(state): State<Arc<GatewayState>>,
    Path((_session, handle)): Path<(u64, u64)>,
    Json(body): Json<Value>,
) -> Response {
    state.messages.lock().push(Recorded {
        handle_id: handle,
        message: body.clone(),
    });
    let responder = state.responder.lock().clone();
    let scripted = match responder {
        Some(responder) => responder(handle, &body),
        None => Scripted::ack(),
    };
    for event in scripted.events {
        state.events.lock().push_back(event);
        state.events_ready.notify_one();
    }
    let reply = scripted.reply.unwrap_or_else(|| {
        json!({
            "janus": "ack",
            "session_id": SESSION_ID,
            "transaction": transaction_of(&body),
        })
    });
    Json(reply).into_response()
}

/// Engine double that records what negotiation did to it.
#[derive(Default)]
pub struct FakeEngine {
    pub calls: Mutex<Vec<&'static str>>,
    pub remote: Mutex<Vec<SessionDescription>>,
    pub local: Mutex<Option<SessionDescription>>,
    pub candidates: Mutex<Vec<IceCandidate>>,
    handler: Mutex<Option<TrackHandler>>,
    fail_on: Option<&'static str>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(operation: &'static str) -> Self {
        Self {
            fail_on: Some(operation),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote.lock().clone()
    }

    /// Plays a remote track arrival through the registered handler.
    pub fn emit_track(&self, info: TrackInfo) -> bool {
        match self.handler.lock().as_ref() {
            Some(handler) => {
                handler(info);
                true
            }
            None => false,
        }
    }

    fn record(&self, operation: &'static str) -> Result<(), EngineError> {
        self.calls.lock().push(operation);
        if self.fail_on == Some(operation) {
            return Err(EngineError::new(operation, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl RtcEngine for FakeEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.record("create_offer")?;
        Ok(SessionDescription::offer("v=0\r\no=fake-offer\r\n"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.record("create_answer")?;
        Ok(SessionDescription::answer("v=0\r\no=fake-answer\r\n"))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.record("set_local_description")?;
        *self.local.lock() = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.record("set_remote_description")?;
        self.remote.lock().push(description);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.record("add_ice_candidate")?;
        self.candidates.lock().push(candidate);
        Ok(())
    }

    fn on_track(&self, handler: TrackHandler) {
        *self.handler.lock() = Some(handler);
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.record("close")
    }
}
