use std::fmt;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub type JanusResult<T> = Result<T, JanusError>;

#[derive(Debug, Error)]
pub enum JanusError {
    /// The gateway could not be reached or answered with a non-2xx status.
    #[error("transport error: {0}")]
    Transport(String),
    /// The gateway answered with an envelope we did not expect. The offending
    /// envelope is kept so callers can log or inspect it.
    #[error("protocol error: {reason}")]
    Protocol { reason: String, envelope: Value },
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    #[error("invalid gateway url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error(transparent)]
    Negotiation(Box<NegotiationError>),
    #[error("operation cancelled by session teardown")]
    Cancelled,
}

impl JanusError {
    pub(crate) fn protocol(reason: impl Into<String>, envelope: &Value) -> Self {
        JanusError::Protocol {
            reason: reason.into(),
            envelope: envelope.clone(),
        }
    }

    /// Only transport failures are worth retrying without caller intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JanusError::Transport(_))
    }

    pub fn negotiation(&self) -> Option<&NegotiationError> {
        match self {
            JanusError::Negotiation(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for JanusError {
    fn from(err: reqwest::Error) -> Self {
        JanusError::Transport(err.to_string())
    }
}

impl From<NegotiationError> for JanusError {
    fn from(err: NegotiationError) -> Self {
        JanusError::Negotiation(Box::new(err))
    }
}

/// Failure reported by an [`RtcEngine`](crate::rtc::RtcEngine) implementation.
#[derive(Debug, Clone, Error)]
#[error("rtc engine {operation} failed: {message}")]
pub struct EngineError {
    pub operation: &'static str,
    pub message: String,
}

impl EngineError {
    pub fn new(operation: &'static str, err: impl fmt::Display) -> Self {
        Self {
            operation,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Publisher,
    Subscriber,
    Peer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
            Role::Peer => "peer",
        })
    }
}

/// Last stage a negotiation flow completed before it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStage {
    Idle,
    Joined,
    OfferCreated,
    Configured,
    AnswerApplied,
    OfferApplied,
    AnswerSent,
    Started,
}

impl fmt::Display for NegotiationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NegotiationStage::Idle => "idle",
            NegotiationStage::Joined => "joined",
            NegotiationStage::OfferCreated => "offer_created",
            NegotiationStage::Configured => "configured",
            NegotiationStage::AnswerApplied => "answer_applied",
            NegotiationStage::OfferApplied => "offer_applied",
            NegotiationStage::AnswerSent => "answer_sent",
            NegotiationStage::Started => "started",
        })
    }
}

#[derive(Debug, Error)]
#[error("{role} negotiation failed after {stage}: {cause}")]
pub struct NegotiationError {
    pub role: Role,
    pub stage: NegotiationStage,
    #[source]
    pub cause: NegotiationCause,
}

#[derive(Debug, Error)]
pub enum NegotiationCause {
    #[error(transparent)]
    Signaling(JanusError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("{0} response carried no jsep")]
    MissingJsep(&'static str),
}

impl From<JanusError> for NegotiationCause {
    fn from(err: JanusError) -> Self {
        NegotiationCause::Signaling(err)
    }
}

/// Tracks the last completed stage of a negotiation flow.
pub(crate) struct Progress {
    role: Role,
    stage: NegotiationStage,
}

impl Progress {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            role,
            stage: NegotiationStage::Idle,
        }
    }

    pub(crate) fn advance(&mut self, stage: NegotiationStage) {
        debug!(target = "janus::negotiation", role = %self.role, %stage, "negotiation stage reached");
        self.stage = stage;
    }

    pub(crate) fn fail(&self, cause: impl Into<NegotiationCause>) -> JanusError {
        NegotiationError {
            role: self.role,
            stage: self.stage,
            cause: cause.into(),
        }
        .into()
    }
}
