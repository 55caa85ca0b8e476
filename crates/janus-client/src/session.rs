use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SessionConfig;
use crate::error::{JanusError, JanusResult};
use crate::handle::{HandleInner, PluginHandle};
use crate::mailbox::Closed;
use crate::poll::{HandleRegistry, PollFailure, PollLoop, PollTask, SessionNotice};
use crate::protocol::{self, request};
use crate::transaction::transaction_id;
use crate::transport::{HttpTransport, SignalingTransport};

enum Lifecycle {
    Idle,
    Active {
        session_id: u64,
        session_url: String,
        poll: PollTask,
        failure: PollFailure,
    },
    Destroyed,
}

struct SessionInner {
    root_url: String,
    config: SessionConfig,
    transport: parking_lot::Mutex<Option<Arc<dyn SignalingTransport>>>,
    lifecycle: AsyncMutex<Lifecycle>,
    handles: HandleRegistry,
    notices: broadcast::Sender<SessionNotice>,
}

/// A gateway session: create it, attach plugin handles, destroy it.
///
/// Cloning yields another reference to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("root_url", &self.inner.root_url)
            .field("handles", &self.handle_count())
            .finish()
    }
}

impl Session {
    /// Session over the default HTTP transport.
    pub fn new(root_url: &str, config: SessionConfig) -> JanusResult<Self> {
        let transport = Arc::new(HttpTransport::new(
            config.request_timeout,
            config.poll_timeout,
        ));
        Self::with_transport(root_url, transport, config)
    }

    pub fn with_transport(
        root_url: &str,
        transport: Arc<dyn SignalingTransport>,
        config: SessionConfig,
    ) -> JanusResult<Self> {
        Url::parse(root_url).map_err(|err| JanusError::InvalidUrl {
            url: root_url.to_string(),
            reason: err.to_string(),
        })?;
        let (notices, _) = broadcast::channel(config.notice_capacity.max(1));
        Ok(Self {
            inner: Arc::new(SessionInner {
                root_url: root_url.trim_end_matches('/').to_string(),
                config,
                transport: parking_lot::Mutex::new(Some(transport)),
                lifecycle: AsyncMutex::new(Lifecycle::Idle),
                handles: Arc::new(RwLock::new(HashMap::new())),
                notices,
            }),
        })
    }

    pub fn root_url(&self) -> &str {
        &self.inner.root_url
    }

    /// Subscribes to unmatched events, handle notices, and poll failures.
    pub fn notifications(&self) -> broadcast::Receiver<SessionNotice> {
        self.inner.notices.subscribe()
    }

    pub async fn session_id(&self) -> Option<u64> {
        match &*self.inner.lifecycle.lock().await {
            Lifecycle::Active { session_id, .. } => Some(*session_id),
            _ => None,
        }
    }

    pub async fn session_url(&self) -> Option<String> {
        match &*self.inner.lifecycle.lock().await {
            Lifecycle::Active { session_url, .. } => Some(session_url.clone()),
            _ => None,
        }
    }

    /// True between `create` and `destroy`, unless the event poll gave up.
    pub async fn is_active(&self) -> bool {
        match &*self.inner.lifecycle.lock().await {
            Lifecycle::Active { failure, .. } => failure.lock().is_none(),
            _ => false,
        }
    }

    pub fn handle_count(&self) -> usize {
        self.inner.handles.read().len()
    }

    fn transport(&self) -> JanusResult<Arc<dyn SignalingTransport>> {
        self.inner
            .transport
            .lock()
            .clone()
            .ok_or(JanusError::IllegalState("session transport released"))
    }

    /// Creates the gateway session and starts the event poll.
    pub async fn create(&self) -> JanusResult<u64> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        match &*lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Active { .. } => {
                return Err(JanusError::IllegalState("session already created"))
            }
            Lifecycle::Destroyed => return Err(JanusError::IllegalState("session destroyed")),
        }

        let transport = self.transport()?;
        let transaction = transaction_id();
        let reply = transport
            .post(&self.inner.root_url, &request("create", &transaction))
            .await?;
        let session_id = protocol::expect_success_id(&reply, &transaction)?;
        let session_url = format!("{}/{}", self.inner.root_url, session_id);

        let failure = PollFailure::default();
        let poll = PollTask::spawn(PollLoop {
            transport,
            session_url: session_url.clone(),
            handles: Arc::clone(&self.inner.handles),
            failure: Arc::clone(&failure),
            notices: self.inner.notices.clone(),
            config: self.inner.config.clone(),
        });
        info!(target = "janus::session", session_id, url = %session_url, "session created");

        *lifecycle = Lifecycle::Active {
            session_id,
            session_url,
            poll,
            failure,
        };
        Ok(session_id)
    }

    /// Attaches `plugin` and registers the new handle for event routing.
    /// Every call yields a fresh handle, even for the same plugin name.
    ///
    /// A session destroyed while the attach is in flight yields `Cancelled`.
    pub async fn attach(&self, plugin: &str) -> JanusResult<PluginHandle> {
        let (session_id, session_url) = match &*self.inner.lifecycle.lock().await {
            Lifecycle::Active {
                session_id,
                session_url,
                ..
            } => (*session_id, session_url.clone()),
            _ => return Err(JanusError::IllegalState("attach requires an active session")),
        };

        let transport = self.transport()?;
        let transaction = transaction_id();
        let mut message = request("attach", &transaction);
        message["plugin"] = plugin.into();
        let reply = transport.post(&session_url, &message).await?;
        let handle_id = protocol::expect_success_id(&reply, &transaction)?;

        let inner = Arc::new(HandleInner::new(
            handle_id,
            plugin,
            format!("{session_url}/{handle_id}"),
            transport,
            self.inner.config.backlog_limit,
        ));

        // Registration happens under the lifecycle lock so destroy either
        // drains this handle or runs first and we never register it.
        let lifecycle = self.inner.lifecycle.lock().await;
        let failure = match &*lifecycle {
            Lifecycle::Active {
                session_id: current,
                failure,
                ..
            } if *current == session_id => failure,
            _ => {
                debug!(
                    target = "janus::session",
                    handle_id, %plugin, "session torn down during attach"
                );
                return Err(JanusError::Cancelled);
            }
        };
        let replaced = {
            let mut handles = self.inner.handles.write();
            if let Some(reason) = failure.lock().clone() {
                return Err(JanusError::Transport(format!(
                    "event poll terminated: {reason}"
                )));
            }
            handles.insert(handle_id, Arc::clone(&inner))
        };
        drop(lifecycle);

        if let Some(previous) = replaced {
            warn!(
                target = "janus::session",
                handle_id, "gateway reused a handle id; closing the previous handle"
            );
            previous.close(Closed::Destroyed);
        }
        debug!(target = "janus::session", handle_id, %plugin, "plugin attached");
        Ok(PluginHandle::new(inner))
    }

    /// Stops the event poll, fails pending sends with `Cancelled`, destroys
    /// the gateway session if one is active, and releases the transport.
    ///
    /// Calling it again is a no-op. A gateway refusal is logged and reported
    /// on the notification channel; teardown still completes.
    pub async fn destroy(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let previous = std::mem::replace(&mut *lifecycle, Lifecycle::Destroyed);
        let active = match previous {
            Lifecycle::Destroyed => return,
            Lifecycle::Idle => None,
            Lifecycle::Active {
                session_id,
                session_url,
                poll,
                ..
            } => {
                poll.shutdown().await;
                Some((session_id, session_url))
            }
        };

        let handles: Vec<_> = self
            .inner
            .handles
            .write()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &handles {
            handle.close(Closed::Destroyed);
        }

        let transport = self.inner.transport.lock().take();
        if let (Some((session_id, session_url)), Some(transport)) = (active, transport) {
            let transaction = transaction_id();
            let outcome = match transport
                .post(&session_url, &request("destroy", &transaction))
                .await
            {
                Ok(reply) => protocol::expect_success(&reply, &transaction).map(|_| ()),
                Err(err) => Err(err),
            };
            match outcome {
                Ok(()) => info!(target = "janus::session", session_id, "session destroyed"),
                Err(err) => {
                    warn!(
                        target = "janus::session",
                        session_id,
                        error = %err,
                        "gateway did not confirm session destroy"
                    );
                    let envelope = match err {
                        JanusError::Protocol { envelope, .. } => envelope,
                        _ => serde_json::Value::Null,
                    };
                    let _ = self.inner.notices.send(SessionNotice::Protocol {
                        reason: "session destroy not confirmed".into(),
                        envelope,
                    });
                }
            }
        }
        debug!(
            target = "janus::session",
            closed_handles = handles.len(),
            "session torn down"
        );
    }
}
