//! Room-less 1:1 negotiation over an arbitrary signaling channel.
//!
//! Messages use the JSON shape common to apprtc-style relays:
//! descriptions as `{type, sdp}`, candidates as
//! `{type: "candidate", candidate, id, label}`, and `{type: "bye"}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info};

use crate::error::{JanusError, JanusResult, NegotiationStage, Progress, Role};
use crate::rtc::{IceCandidate, RtcEngine, SdpKind, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    SessionDescription(SessionDescription),
    IceCandidate(IceCandidate),
    Bye,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Wire {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Pranswer {
        sdp: String,
    },
    Rollback {
        #[serde(default)]
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<u16>,
    },
    Bye,
}

impl SignalMessage {
    pub fn to_json(&self) -> Value {
        let wire = match self {
            SignalMessage::SessionDescription(description) => {
                let sdp = description.sdp.clone();
                match description.kind {
                    SdpKind::Offer => Wire::Offer { sdp },
                    SdpKind::Answer => Wire::Answer { sdp },
                    SdpKind::Pranswer => Wire::Pranswer { sdp },
                    SdpKind::Rollback => Wire::Rollback { sdp },
                }
            }
            SignalMessage::IceCandidate(candidate) => Wire::Candidate {
                candidate: candidate.candidate.clone(),
                id: candidate.sdp_mid.clone(),
                label: candidate.sdp_mline_index,
            },
            SignalMessage::Bye => Wire::Bye,
        };
        serde_json::to_value(wire).unwrap_or(Value::Null)
    }

    pub fn from_json(value: &Value) -> JanusResult<Self> {
        let wire = Wire::deserialize(value).map_err(|err| {
            JanusError::protocol(format!("malformed signal message: {err}"), value)
        })?;
        let description = |kind, sdp| SignalMessage::SessionDescription(SessionDescription { kind, sdp });
        Ok(match wire {
            Wire::Offer { sdp } => description(SdpKind::Offer, sdp),
            Wire::Answer { sdp } => description(SdpKind::Answer, sdp),
            Wire::Pranswer { sdp } => description(SdpKind::Pranswer, sdp),
            Wire::Rollback { sdp } => description(SdpKind::Rollback, sdp),
            Wire::Candidate {
                candidate,
                id,
                label,
            } => SignalMessage::IceCandidate(IceCandidate {
                candidate,
                sdp_mid: id,
                sdp_mline_index: label,
            }),
            Wire::Bye => SignalMessage::Bye,
        })
    }
}

/// Bidirectional message pipe to the remote peer.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, message: SignalMessage) -> JanusResult<()>;

    /// `Ok(None)` once the remote side has gone away.
    async fn receive(&self) -> JanusResult<Option<SignalMessage>>;
}

/// In-process channel that still round-trips every message through JSON.
pub struct LocalSignalingChannel {
    tx: mpsc::UnboundedSender<Value>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Value>>,
}

impl LocalSignalingChannel {
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: a_tx,
                rx: AsyncMutex::new(b_rx),
            },
            Self {
                tx: b_tx,
                rx: AsyncMutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl SignalingChannel for LocalSignalingChannel {
    async fn send(&self, message: SignalMessage) -> JanusResult<()> {
        self.tx
            .send(message.to_json())
            .map_err(|_| JanusError::Transport("signaling peer hung up".into()))
    }

    async fn receive(&self) -> JanusResult<Option<SignalMessage>> {
        match self.rx.lock().await.recv().await {
            Some(value) => SignalMessage::from_json(&value).map(Some),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOutcome {
    Bye,
    ChannelClosed,
}

/// Drives `engine` from `channel` until the remote says bye or the channel
/// closes. The initiator sends the first offer; the other side answers
/// whatever offer it receives.
pub async fn run_peer(
    engine: &dyn RtcEngine,
    channel: &dyn SignalingChannel,
    initiator: bool,
) -> JanusResult<PeerOutcome> {
    let mut progress = Progress::new(Role::Peer);

    if initiator {
        let offer = engine
            .create_offer()
            .await
            .map_err(|err| progress.fail(err))?;
        engine
            .set_local_description(offer.clone())
            .await
            .map_err(|err| progress.fail(err))?;
        let local = engine.local_description().await.unwrap_or(offer);
        channel
            .send(SignalMessage::SessionDescription(local))
            .await
            .map_err(|err| progress.fail(err))?;
        progress.advance(NegotiationStage::OfferCreated);
    }

    loop {
        let message = channel.receive().await.map_err(|err| progress.fail(err))?;
        match message {
            None => {
                debug!(target = "janus::peer", "signaling channel closed");
                return Ok(PeerOutcome::ChannelClosed);
            }
            Some(SignalMessage::Bye) => {
                info!(target = "janus::peer", "remote peer said bye");
                return Ok(PeerOutcome::Bye);
            }
            Some(SignalMessage::IceCandidate(candidate)) => {
                engine
                    .add_ice_candidate(candidate)
                    .await
                    .map_err(|err| progress.fail(err))?;
            }
            Some(SignalMessage::SessionDescription(description)) => {
                let kind = description.kind;
                engine
                    .set_remote_description(description)
                    .await
                    .map_err(|err| progress.fail(err))?;
                if kind != SdpKind::Offer {
                    progress.advance(NegotiationStage::AnswerApplied);
                    continue;
                }
                progress.advance(NegotiationStage::OfferApplied);

                let answer = engine
                    .create_answer()
                    .await
                    .map_err(|err| progress.fail(err))?;
                engine
                    .set_local_description(answer.clone())
                    .await
                    .map_err(|err| progress.fail(err))?;
                let local = engine.local_description().await.unwrap_or(answer);
                channel
                    .send(SignalMessage::SessionDescription(local))
                    .await
                    .map_err(|err| progress.fail(err))?;
                progress.advance(NegotiationStage::AnswerSent);
            }
        }
    }
}
