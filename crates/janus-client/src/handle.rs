use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::error::{JanusError, JanusResult};
use crate::mailbox::{Closed, Mailbox, Routed};
use crate::protocol::{self, Envelope, Event};
use crate::rtc::IceCandidate;
use crate::transaction::transaction_id;
use crate::transport::SignalingTransport;

/// State shared between a [`PluginHandle`] and the session registry.
pub(crate) struct HandleInner {
    id: u64,
    plugin: String,
    url: String,
    transport: Arc<dyn SignalingTransport>,
    mailbox: Mailbox,
}

impl HandleInner {
    pub(crate) fn new(
        id: u64,
        plugin: &str,
        url: String,
        transport: Arc<dyn SignalingTransport>,
        backlog_limit: usize,
    ) -> Self {
        Self {
            id,
            plugin: plugin.to_string(),
            url,
            transport,
            mailbox: Mailbox::new(id, backlog_limit),
        }
    }

    pub(crate) fn deliver(&self, event: Event) -> Routed {
        self.mailbox.deliver(event)
    }

    pub(crate) fn close(&self, reason: Closed) {
        self.mailbox.close(reason);
    }
}

/// One attached plugin instance. Cheap to clone; clones share the mailbox.
#[derive(Clone)]
pub struct PluginHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("id", &self.inner.id)
            .field("plugin", &self.inner.plugin)
            .field("url", &self.inner.url)
            .finish()
    }
}

impl PluginHandle {
    pub(crate) fn new(inner: Arc<HandleInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn plugin(&self) -> &str {
        &self.inner.plugin
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Sends a plugin message and waits for the asynchronous event that
    /// answers it.
    ///
    /// The gateway only acknowledges the POST; the business reply arrives
    /// later through the session's long-poll and is matched back to this
    /// call by transaction id, so concurrent sends on one handle are safe.
    pub async fn send(&self, payload: Value) -> JanusResult<Event> {
        let transaction = transaction_id();
        let message = protocol::request_with("message", &transaction, payload)?;
        let pending = self.inner.mailbox.expect(&transaction)?;

        let reply = self.inner.transport.post(&self.inner.url, &message).await?;
        protocol::expect_ack(&reply, &transaction)?;
        debug!(
            target = "janus::handle",
            handle_id = self.inner.id,
            %transaction,
            "message acknowledged; awaiting event"
        );

        let event = pending.wait().await?;
        if event.transaction.as_deref() != Some(transaction.as_str()) {
            return Err(JanusError::protocol(
                format!("event does not answer transaction {transaction}"),
                &event.raw,
            ));
        }
        Ok(event)
    }

    /// Synchronous plugin request (`list`, `exists`, ...) answered inline
    /// with `success` and `plugindata`. Returns `plugindata.data`.
    pub async fn request(&self, body: Value) -> JanusResult<Value> {
        let transaction = transaction_id();
        let message = protocol::request_with("message", &transaction, json!({ "body": body }))?;
        let reply = self.inner.transport.post(&self.inner.url, &message).await?;
        match protocol::expect_success(&reply, &transaction)? {
            Envelope::Success {
                plugin_data: Some(data),
                ..
            } => Ok(data),
            _ => Err(JanusError::protocol(
                "success reply carried no plugindata",
                &reply,
            )),
        }
    }

    /// Trickles one local candidate, or signals end-of-candidates with `None`.
    pub async fn trickle(&self, candidate: Option<&IceCandidate>) -> JanusResult<()> {
        let transaction = transaction_id();
        let candidate = match candidate {
            Some(candidate) => serde_json::to_value(candidate)
                .map_err(|err| JanusError::Transport(format!("serialize candidate: {err}")))?,
            None => json!({ "completed": true }),
        };
        let message =
            protocol::request_with("trickle", &transaction, json!({ "candidate": candidate }))?;
        let reply = self.inner.transport.post(&self.inner.url, &message).await?;
        protocol::expect_ack(&reply, &transaction)
    }

    /// Next event that no `send` call is waiting for, such as unsolicited
    /// room notifications. Resolves with `Cancelled` once the session is
    /// destroyed.
    pub async fn next_event(&self) -> JanusResult<Event> {
        self.inner.mailbox.next_unclaimed().await
    }
}
