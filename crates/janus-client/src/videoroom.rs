//! Publish/subscribe negotiation against the video-room plugin.
//!
//! Both flows are strictly sequential and never retried. A failure reports
//! the last stage that completed, so a caller can tell an offer that never
//! left from a configure the room rejected.

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::info;

use crate::error::{JanusError, JanusResult, NegotiationCause, NegotiationStage, Progress, Role};
use crate::handle::PluginHandle;
use crate::protocol::Event;
use crate::rtc::{RtcEngine, SessionDescription, TrackInfo};
use crate::session::Session;

pub const VIDEOROOM_PLUGIN: &str = "janus.plugin.videoroom";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PublisherInfo {
    pub id: u64,
    #[serde(default)]
    pub display: Option<String>,
}

/// Media flags announced in `configure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaOptions {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            audio: false,
            video: true,
        }
    }
}

/// A joined and configured publisher.
#[derive(Debug, Clone)]
pub struct Publisher {
    pub handle: PluginHandle,
    pub room: u64,
    /// Publishers already in the room when we joined.
    pub publishers: Vec<PublisherInfo>,
    pub answer: SessionDescription,
}

#[derive(Debug)]
pub struct Subscription {
    pub handle: PluginHandle,
    pub feed: u64,
    tracks: mpsc::UnboundedReceiver<TrackInfo>,
}

impl Subscription {
    /// Next remote track announced by the engine; `None` once the engine
    /// dropped its handler.
    pub async fn next_track(&mut self) -> Option<TrackInfo> {
        self.tracks.recv().await
    }
}

#[derive(Debug, Clone)]
pub struct VideoRoom {
    session: Session,
    room: u64,
    plugin: String,
}

impl VideoRoom {
    pub fn new(session: Session, room: u64) -> Self {
        Self::with_plugin(session, room, VIDEOROOM_PLUGIN)
    }

    pub fn with_plugin(session: Session, room: u64, plugin: impl Into<String>) -> Self {
        Self {
            session,
            room,
            plugin: plugin.into(),
        }
    }

    pub fn room(&self) -> u64 {
        self.room
    }

    /// Joins as `display`, offers the engine's media, and applies the
    /// room's answer.
    pub async fn publish(
        &self,
        display: &str,
        engine: &dyn RtcEngine,
        media: MediaOptions,
    ) -> JanusResult<Publisher> {
        let mut progress = Progress::new(Role::Publisher);

        let handle = self
            .session
            .attach(&self.plugin)
            .await
            .map_err(|err| progress.fail(err))?;
        let joined = handle
            .send(json!({
                "body": {
                    "request": "join",
                    "ptype": "publisher",
                    "room": self.room,
                    "display": display,
                }
            }))
            .await
            .and_then(reject_plugin_error)
            .map_err(|err| progress.fail(err))?;
        let publishers = publishers_of(&joined).map_err(|err| progress.fail(err))?;

        let offer = engine
            .create_offer()
            .await
            .map_err(|err| progress.fail(err))?;
        engine
            .set_local_description(offer.clone())
            .await
            .map_err(|err| progress.fail(err))?;
        progress.advance(NegotiationStage::OfferCreated);

        let local = engine.local_description().await.unwrap_or(offer);
        let configured = handle
            .send(json!({
                "body": {
                    "request": "configure",
                    "audio": media.audio,
                    "video": media.video,
                },
                "jsep": local.to_jsep(),
            }))
            .await
            .and_then(reject_plugin_error)
            .map_err(|err| progress.fail(err))?;
        let answer = configured
            .jsep
            .ok_or_else(|| progress.fail(NegotiationCause::MissingJsep("configure")))?;
        progress.advance(NegotiationStage::Configured);

        engine
            .set_remote_description(answer.clone())
            .await
            .map_err(|err| progress.fail(err))?;
        progress.advance(NegotiationStage::AnswerApplied);

        info!(
            target = "janus::videoroom",
            room = self.room,
            handle_id = handle.id(),
            publishers = publishers.len(),
            "publishing"
        );
        Ok(Publisher {
            handle,
            room: self.room,
            publishers,
            answer,
        })
    }

    /// Subscribes to `feed` on a fresh handle. Track arrivals are exposed on
    /// the returned [`Subscription`].
    pub async fn subscribe(&self, engine: &dyn RtcEngine, feed: u64) -> JanusResult<Subscription> {
        let mut progress = Progress::new(Role::Subscriber);

        let handle = self
            .session
            .attach(&self.plugin)
            .await
            .map_err(|err| progress.fail(err))?;
        let (tracks_tx, tracks) = mpsc::unbounded_channel();
        engine.on_track(Box::new(move |track| {
            let _ = tracks_tx.send(track);
        }));

        let joined = handle
            .send(json!({
                "body": {
                    "request": "join",
                    "ptype": "subscriber",
                    "room": self.room,
                    "feed": feed,
                }
            }))
            .await
            .and_then(reject_plugin_error)
            .map_err(|err| progress.fail(err))?;
        let offer = joined
            .jsep
            .ok_or_else(|| progress.fail(NegotiationCause::MissingJsep("join")))?;
        progress.advance(NegotiationStage::Joined);

        engine
            .set_remote_description(offer)
            .await
            .map_err(|err| progress.fail(err))?;
        progress.advance(NegotiationStage::OfferApplied);

        // `start` carries the answer, so nothing is sent unless it exists.
        let answer = engine
            .create_answer()
            .await
            .map_err(|err| progress.fail(err))?;
        engine
            .set_local_description(answer.clone())
            .await
            .map_err(|err| progress.fail(err))?;
        let local = engine.local_description().await.unwrap_or(answer);

        let started = handle
            .send(json!({
                "body": { "request": "start", "room": self.room },
                "jsep": local.to_jsep(),
            }))
            .await
            .map_err(|err| progress.fail(err))?;
        progress.advance(NegotiationStage::AnswerSent);

        let started = reject_plugin_error(started).map_err(|err| progress.fail(err))?;
        if started.data.get("started").and_then(Value::as_str) != Some("ok") {
            return Err(progress.fail(JanusError::protocol(
                "start was not confirmed",
                &started.raw,
            )));
        }
        progress.advance(NegotiationStage::Started);

        info!(
            target = "janus::videoroom",
            room = self.room,
            feed,
            handle_id = handle.id(),
            "subscribed"
        );
        Ok(Subscription {
            handle,
            feed,
            tracks,
        })
    }
}

impl Publisher {
    /// Current participants of the room, via a synchronous plugin request.
    pub async fn participants(&self) -> JanusResult<Vec<PublisherInfo>> {
        let data = self
            .handle
            .request(json!({ "request": "listparticipants", "room": self.room }))
            .await?;
        decode_list(&data, "participants")
    }
}

fn reject_plugin_error(event: Event) -> JanusResult<Event> {
    match event.plugin_error() {
        Some((code, reason)) => Err(JanusError::protocol(
            format!("plugin error {code}: {reason}"),
            &event.raw,
        )),
        None => Ok(event),
    }
}

fn publishers_of(event: &Event) -> JanusResult<Vec<PublisherInfo>> {
    decode_list(&event.data, "publishers").map_err(|err| match err {
        JanusError::Protocol { reason, .. } => JanusError::protocol(reason, &event.raw),
        other => other,
    })
}

fn decode_list(data: &Value, field: &str) -> JanusResult<Vec<PublisherInfo>> {
    match data.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(list) => Vec::<PublisherInfo>::deserialize(list)
            .map_err(|err| JanusError::protocol(format!("malformed {field}: {err}"), data)),
    }
}
