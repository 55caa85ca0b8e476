use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::rtc::RtcEngine;

/// Owns every live peer connection so shutdown can close them in one place.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<Vec<(String, Arc<dyn RtcEngine>)>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, label: impl Into<String>, engine: Arc<dyn RtcEngine>) {
        let label = label.into();
        debug!(target = "janus::peers", %label, "peer registered");
        self.peers.lock().push((label, engine));
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Closes and forgets every registered peer. Close failures are logged;
    /// the remaining peers are still closed. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let peers = std::mem::take(&mut *self.peers.lock());
        let count = peers.len();
        for (label, engine) in peers {
            if let Err(err) = engine.close().await {
                warn!(target = "janus::peers", %label, error = %err, "peer close failed");
            }
        }
        debug!(target = "janus::peers", count, "peers closed");
        count
    }
}
