//! Per-handle inbound event queue.
//!
//! The poll loop is the only producer. Consumers are `send` calls, each
//! waiting on its own transaction, plus readers of unsolicited events.
//! Matching is by transaction id only; arrival order never decides which
//! waiter gets an event.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use crate::error::{JanusError, JanusResult};
use crate::protocol::Event;

/// Why a mailbox stopped accepting waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Closed {
    Destroyed,
    PollFailed(String),
}

impl Closed {
    fn to_error(&self) -> JanusError {
        match self {
            Closed::Destroyed => JanusError::Cancelled,
            Closed::PollFailed(reason) => {
                JanusError::Transport(format!("event poll terminated: {reason}"))
            }
        }
    }
}

type Delivery = Result<Event, Closed>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
    Matched,
    Queued,
    Stray,
    Dropped,
}

#[derive(Default)]
struct MailboxState {
    waiters: HashMap<String, oneshot::Sender<Delivery>>,
    backlog: VecDeque<Event>,
    closed: Option<Closed>,
}

pub(crate) struct Mailbox {
    handle_id: u64,
    backlog_limit: usize,
    state: Mutex<MailboxState>,
    backlog_ready: Notify,
}

impl Mailbox {
    pub(crate) fn new(handle_id: u64, backlog_limit: usize) -> Self {
        Self {
            handle_id,
            backlog_limit: backlog_limit.max(1),
            state: Mutex::new(MailboxState::default()),
            backlog_ready: Notify::new(),
        }
    }

    /// Registers interest in `transaction` before the request goes out, so a
    /// reply that beats the acknowledgement is not lost.
    pub(crate) fn expect(&self, transaction: &str) -> JanusResult<Pending<'_>> {
        let mut state = self.state.lock();
        if let Some(closed) = &state.closed {
            return Err(closed.to_error());
        }
        let (tx, rx) = oneshot::channel();
        if state.waiters.insert(transaction.to_string(), tx).is_some() {
            warn!(
                target = "janus::mailbox",
                handle_id = self.handle_id,
                %transaction,
                "replaced an existing waiter for the same transaction"
            );
        }
        Ok(Pending {
            mailbox: self,
            transaction: transaction.to_string(),
            rx: Some(rx),
        })
    }

    fn forget(&self, transaction: &str) {
        self.state.lock().waiters.remove(transaction);
    }

    pub(crate) fn deliver(&self, event: Event) -> Routed {
        let mut state = self.state.lock();
        if state.closed.is_some() {
            debug!(
                target = "janus::mailbox",
                handle_id = self.handle_id,
                "dropping event for closed handle"
            );
            return Routed::Dropped;
        }

        let waiter = event
            .transaction
            .as_deref()
            .and_then(|transaction| state.waiters.remove(transaction));
        let routed = match waiter {
            Some(tx) => match tx.send(Ok(event)) {
                Ok(()) => return Routed::Matched,
                // The waiting send was abandoned; keep the reply visible.
                Err(Ok(event)) => {
                    self.push_backlog(&mut state, event);
                    Routed::Stray
                }
                Err(Err(_)) => return Routed::Dropped,
            },
            None if event.transaction.is_some() => {
                warn!(
                    target = "janus::mailbox",
                    handle_id = self.handle_id,
                    transaction = ?event.transaction,
                    "event transaction matches no pending request"
                );
                self.push_backlog(&mut state, event);
                Routed::Stray
            }
            None => {
                self.push_backlog(&mut state, event);
                Routed::Queued
            }
        };
        drop(state);
        self.backlog_ready.notify_one();
        routed
    }

    fn push_backlog(&self, state: &mut MailboxState, event: Event) {
        if state.backlog.len() >= self.backlog_limit {
            if let Some(dropped) = state.backlog.pop_front() {
                warn!(
                    target = "janus::mailbox",
                    handle_id = self.handle_id,
                    limit = self.backlog_limit,
                    transaction = ?dropped.transaction,
                    "event backlog full; dropping oldest event"
                );
            }
        }
        state.backlog.push_back(event);
    }

    /// Next event no `send` claimed, in arrival order.
    pub(crate) async fn next_unclaimed(&self) -> JanusResult<Event> {
        loop {
            let notified = self.backlog_ready.notified();
            {
                let mut state = self.state.lock();
                if let Some(event) = state.backlog.pop_front() {
                    return Ok(event);
                }
                if let Some(closed) = &state.closed {
                    return Err(closed.to_error());
                }
            }
            notified.await;
        }
    }

    /// Fails every pending waiter and refuses new ones. Idempotent.
    pub(crate) fn close(&self, reason: Closed) {
        let waiters = {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(reason.clone());
            std::mem::take(&mut state.waiters)
        };
        let pending = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(Err(reason.clone()));
        }
        self.backlog_ready.notify_waiters();
        debug!(
            target = "janus::mailbox",
            handle_id = self.handle_id,
            pending,
            reason = ?reason,
            "mailbox closed"
        );
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

/// A registered waiter. Dropping it unregisters the transaction.
pub(crate) struct Pending<'a> {
    mailbox: &'a Mailbox,
    transaction: String,
    rx: Option<oneshot::Receiver<Delivery>>,
}

impl Pending<'_> {
    pub(crate) async fn wait(mut self) -> JanusResult<Event> {
        let Some(rx) = self.rx.take() else {
            return Err(JanusError::IllegalState("pending transaction already awaited"));
        };
        match rx.await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(closed)) => Err(closed.to_error()),
            Err(_) => Err(JanusError::Cancelled),
        }
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        self.mailbox.forget(&self.transaction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    fn event(transaction: Option<&str>) -> Event {
        Event {
            sender: 7,
            transaction: transaction.map(str::to_string),
            plugin: None,
            data: json!({"tx": transaction}),
            jsep: None,
            raw: Value::Null,
        }
    }

    #[tokio::test]
    async fn waiters_receive_their_own_transaction() {
        let mailbox = Mailbox::new(7, 8);
        let first = mailbox.expect("aaaa").unwrap();
        let second = mailbox.expect("bbbb").unwrap();

        assert_eq!(mailbox.deliver(event(Some("bbbb"))), Routed::Matched);
        assert_eq!(mailbox.deliver(event(Some("aaaa"))), Routed::Matched);

        let second = second.wait().await.unwrap();
        let first = first.wait().await.unwrap();
        assert_eq!(first.transaction.as_deref(), Some("aaaa"));
        assert_eq!(second.transaction.as_deref(), Some("bbbb"));
        assert_eq!(mailbox.pending_len(), 0);
    }

    #[tokio::test]
    async fn unsolicited_events_are_queued_in_order() {
        let mailbox = Mailbox::new(7, 8);
        assert_eq!(mailbox.deliver(event(None)), Routed::Queued);
        assert_eq!(mailbox.deliver(event(Some("zzzz"))), Routed::Stray);

        assert_eq!(mailbox.next_unclaimed().await.unwrap().transaction, None);
        assert_eq!(
            mailbox.next_unclaimed().await.unwrap().transaction.as_deref(),
            Some("zzzz")
        );
    }

    #[tokio::test]
    async fn backlog_drops_oldest_past_limit() {
        let mailbox = Mailbox::new(7, 2);
        mailbox.deliver(event(Some("one")));
        mailbox.deliver(event(Some("two")));
        mailbox.deliver(event(Some("three")));
        assert_eq!(
            mailbox.next_unclaimed().await.unwrap().transaction.as_deref(),
            Some("two")
        );
    }

    #[tokio::test]
    async fn close_fails_pending_and_future_waiters() {
        let mailbox = Arc::new(Mailbox::new(7, 8));
        let waiter = {
            let mailbox = Arc::clone(&mailbox);
            tokio::spawn(async move {
                let pending = mailbox.expect("aaaa").unwrap();
                pending.wait().await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mailbox.close(Closed::Destroyed);

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter resolved")
            .expect("join");
        assert!(matches!(result, Err(JanusError::Cancelled)));
        assert!(matches!(mailbox.expect("bbbb"), Err(JanusError::Cancelled)));
        assert!(matches!(
            mailbox.next_unclaimed().await,
            Err(JanusError::Cancelled)
        ));
        assert_eq!(mailbox.deliver(event(Some("aaaa"))), Routed::Dropped);
    }

    #[tokio::test]
    async fn poll_failure_surfaces_as_transport_error() {
        let mailbox = Mailbox::new(7, 8);
        let pending = mailbox.expect("aaaa").unwrap();
        mailbox.close(Closed::PollFailed("connection refused".into()));
        assert!(matches!(pending.wait().await, Err(JanusError::Transport(_))));
    }

    #[tokio::test]
    async fn abandoned_waiter_leaves_reply_in_backlog() {
        let mailbox = Mailbox::new(7, 8);
        drop(mailbox.expect("aaaa").unwrap());
        assert_eq!(mailbox.pending_len(), 0);
        assert_eq!(mailbox.deliver(event(Some("aaaa"))), Routed::Stray);
    }
}
