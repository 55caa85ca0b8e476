//! Client for a Janus-style WebRTC gateway over its JSON/HTTP API.
//!
//! A [`Session`] owns the gateway session and a background long-poll that
//! routes asynchronous events to the [`PluginHandle`] they belong to. A
//! handle's [`send`](PluginHandle::send) posts a message and resolves once
//! the event carrying the same transaction id arrives, independent of the
//! order in which replies come back.
//!
//! Negotiation is expressed against the [`RtcEngine`] trait. [`VideoRoom`]
//! drives the publish and subscribe flows of the video-room plugin;
//! [`run_peer`] drives a direct 1:1 exchange over any [`SignalingChannel`].

pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
mod mailbox;
pub mod peer;
pub mod poll;
pub mod protocol;
pub mod registry;
pub mod rtc;
pub mod session;
pub mod transaction;
pub mod transport;
pub mod videoroom;

pub use config::{RetryPolicy, SessionConfig};
pub use engine::{IceServer, WebRtcEngine, WebRtcEngineConfig};
pub use error::{
    EngineError, JanusError, JanusResult, NegotiationCause, NegotiationError, NegotiationStage,
    Role,
};
pub use handle::PluginHandle;
pub use peer::{run_peer, LocalSignalingChannel, PeerOutcome, SignalMessage, SignalingChannel};
pub use poll::SessionNotice;
pub use protocol::{Envelope, Event, HandleNotice, NoticeKind};
pub use registry::PeerRegistry;
pub use rtc::{
    IceCandidate, MediaKind, RtcEngine, SdpKind, SessionDescription, TrackHandler, TrackInfo,
};
pub use session::Session;
pub use transaction::transaction_id;
pub use transport::{HttpTransport, SignalingTransport};
pub use videoroom::{
    MediaOptions, Publisher, PublisherInfo, Subscription, VideoRoom, VIDEOROOM_PLUGIN,
};
