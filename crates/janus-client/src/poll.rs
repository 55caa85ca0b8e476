//! Background long-poll that feeds handle mailboxes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::JanusError;
use crate::handle::HandleInner;
use crate::mailbox::{Closed, Routed};
use crate::protocol::{Envelope, Event, HandleNotice, NO_SUCH_SESSION};
use crate::transport::SignalingTransport;

pub(crate) type HandleRegistry = Arc<RwLock<HashMap<u64, Arc<HandleInner>>>>;

/// Why the poll loop gave up, if it did. Written under the registry write
/// lock so a handle registered afterwards can see it.
pub(crate) type PollFailure = Arc<Mutex<Option<String>>>;

/// Observability and failure sink of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    /// An event whose sender matches no attached handle.
    Unmatched(Event),
    /// A handle lifecycle notification (`webrtcup`, `hangup`, ...).
    Handle(HandleNotice),
    /// The long-poll returned something other than a deliverable envelope.
    Protocol { reason: String, envelope: Value },
    /// The long-poll gave up after exhausting its retry budget.
    PollFailed { reason: String },
}

pub(crate) struct PollLoop {
    pub(crate) transport: Arc<dyn SignalingTransport>,
    pub(crate) session_url: String,
    pub(crate) handles: HandleRegistry,
    pub(crate) failure: PollFailure,
    pub(crate) notices: broadcast::Sender<SessionNotice>,
    pub(crate) config: SessionConfig,
}

pub(crate) struct PollTask {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl PollTask {
    pub(crate) fn spawn(poll: PollLoop) -> Self {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(poll.run(cancel.clone()));
        Self { cancel, join }
    }

    /// Cancels the loop and waits for it to exit.
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.join.await {
            if err.is_panic() {
                warn!(target = "janus::poll", error = %err, "poll task panicked");
            }
        }
    }
}

impl PollLoop {
    async fn run(self, cancel: CancellationToken) {
        let mut tags = RequestTags::default();
        let mut failures = 0u32;
        info!(target = "janus::poll", url = %self.session_url, "event poll started");

        loop {
            let query = [
                ("maxev", self.config.max_events.to_string()),
                ("rid", tags.next().to_string()),
            ];
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.transport.get(&self.session_url, &query) => result,
            };

            let reason = match result {
                Ok(body) => match self.dispatch(body) {
                    Polled::Healthy => {
                        failures = 0;
                        continue;
                    }
                    Polled::Terminal(reason) => {
                        self.fail(reason);
                        break;
                    }
                    Polled::Noise(reason) => reason,
                },
                Err(JanusError::Protocol { reason, envelope }) => {
                    self.report_protocol(reason.clone(), envelope);
                    reason
                }
                Err(JanusError::Transport(reason)) => reason,
                Err(err) => err.to_string(),
            };

            // Transport and protocol failures share one retry budget.
            failures += 1;
            if failures >= self.config.poll_retry.max_attempts {
                self.fail(reason);
                break;
            }
            let delay = self.config.poll_retry.backoff(failures);
            warn!(
                target = "janus::poll",
                failures,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "event poll failed; retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(target = "janus::poll", url = %self.session_url, "event poll stopped");
    }

    fn dispatch(&self, body: Value) -> Polled {
        match body {
            // maxev > 1 batches envelopes into an array.
            Value::Array(items) => items
                .into_iter()
                .map(|item| self.route(item))
                .reduce(Polled::merge)
                .unwrap_or(Polled::Healthy),
            other => self.route(other),
        }
    }

    fn route(&self, raw: Value) -> Polled {
        let envelope = match Envelope::parse(&raw) {
            Ok(envelope) => envelope,
            Err(JanusError::Protocol { reason, envelope }) => {
                self.report_protocol(reason.clone(), envelope);
                return Polled::Noise(reason);
            }
            Err(err) => {
                let reason = err.to_string();
                self.report_protocol(reason.clone(), raw);
                return Polled::Noise(reason);
            }
        };

        match envelope {
            Envelope::Event(event) => self.route_event(event),
            Envelope::KeepAlive => trace!(target = "janus::poll", "keepalive"),
            Envelope::Notice(notice) => {
                debug!(
                    target = "janus::poll",
                    sender = notice.sender,
                    kind = ?notice.kind,
                    "handle notice"
                );
                let _ = self.notices.send(SessionNotice::Handle(notice));
            }
            Envelope::Error { code, reason, .. } => {
                let reason = format!("gateway error {code}: {reason}");
                self.report_protocol(reason.clone(), raw);
                if code == NO_SUCH_SESSION {
                    return Polled::Terminal(reason);
                }
                return Polled::Noise(reason);
            }
            Envelope::Unknown(kind) if kind == "timeout" => {
                return Polled::Terminal("gateway timed out the session".into());
            }
            Envelope::Success { .. } | Envelope::Ack { .. } | Envelope::Unknown(_) => {
                let reason = "unexpected envelope on event poll".to_string();
                self.report_protocol(reason.clone(), raw);
                return Polled::Noise(reason);
            }
        }
        Polled::Healthy
    }

    fn route_event(&self, event: Event) {
        let handle = self.handles.read().get(&event.sender).cloned();
        let Some(handle) = handle else {
            warn!(
                target = "janus::poll",
                sender = event.sender,
                transaction = ?event.transaction,
                "event for unknown handle"
            );
            let _ = self.notices.send(SessionNotice::Unmatched(event));
            return;
        };
        let sender = event.sender;
        let routed = handle.deliver(event);
        trace!(target = "janus::poll", sender, routed = ?routed, "event routed");
        if routed == Routed::Stray {
            debug!(target = "janus::poll", sender, "stray event held in handle backlog");
        }
    }

    fn report_protocol(&self, reason: String, envelope: Value) {
        warn!(target = "janus::poll", %reason, "protocol error on event poll");
        let _ = self
            .notices
            .send(SessionNotice::Protocol { reason, envelope });
    }

    fn fail(&self, reason: String) {
        warn!(
            target = "janus::poll",
            url = %self.session_url,
            error = %reason,
            "event poll giving up"
        );
        {
            let handles = self.handles.write();
            *self.failure.lock() = Some(reason.clone());
            for handle in handles.values() {
                handle.close(Closed::PollFailed(reason.clone()));
            }
        }
        let _ = self.notices.send(SessionNotice::PollFailed { reason });
    }
}

/// What one long-poll reply did to the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Polled {
    /// At least one envelope was delivered, or the gateway kept us alive.
    Healthy,
    /// Nothing usable came back; counts against the retry budget.
    Noise(String),
    /// The gateway no longer knows the session.
    Terminal(String),
}

impl Polled {
    fn merge(self, other: Polled) -> Polled {
        match (self, other) {
            (Polled::Terminal(reason), _) | (_, Polled::Terminal(reason)) => {
                Polled::Terminal(reason)
            }
            (Polled::Healthy, _) | (_, Polled::Healthy) => Polled::Healthy,
            (_, noise) => noise,
        }
    }
}

/// Cache-busting `rid` values: wall-clock milliseconds, forced strictly
/// increasing so two polls in the same millisecond never share a tag.
#[derive(Default)]
struct RequestTags {
    last: u64,
}

impl RequestTags {
    fn next(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        self.last = now.max(self.last + 1);
        self.last
    }
}
