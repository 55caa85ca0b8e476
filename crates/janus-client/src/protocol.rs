//! Gateway wire envelopes.
//!
//! Requests are `{janus: <verb>, transaction, ...}`. Replies and long-poll
//! deliveries are tagged by the same `janus` field; decoding keeps the raw
//! envelope around so protocol errors can carry what the gateway sent.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::{JanusError, JanusResult};
use crate::rtc::SessionDescription;

/// Gateway error code for a session it no longer knows.
pub(crate) const NO_SUCH_SESSION: i64 = 458;

/// An asynchronous plugin event delivered through the long-poll.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub sender: u64,
    pub transaction: Option<String>,
    pub plugin: Option<String>,
    /// `plugindata.data`, or `null` when the event carried none.
    pub data: Value,
    pub jsep: Option<SessionDescription>,
    pub raw: Value,
}

impl Event {
    /// Plugins report request failures as regular events carrying
    /// `error_code`/`error`.
    pub fn plugin_error(&self) -> Option<(i64, String)> {
        let code = self.data.get("error_code")?.as_i64()?;
        let reason = self
            .data
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unspecified plugin error")
            .to_string();
        Some((code, reason))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    WebrtcUp,
    Media,
    SlowLink,
    Hangup,
    Detached,
    Trickle,
}

/// Handle-scoped lifecycle notification that is not a plugin event.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleNotice {
    pub sender: u64,
    pub kind: NoticeKind,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Success {
        transaction: Option<String>,
        id: Option<u64>,
        plugin_data: Option<Value>,
    },
    Ack {
        transaction: Option<String>,
    },
    Event(Event),
    Error {
        transaction: Option<String>,
        code: i64,
        reason: String,
    },
    KeepAlive,
    Notice(HandleNotice),
    Unknown(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "janus", rename_all = "lowercase")]
enum Wire {
    Success {
        #[serde(default)]
        transaction: Option<String>,
        #[serde(default)]
        data: Option<IdData>,
        #[serde(default)]
        plugindata: Option<PluginData>,
    },
    Ack {
        #[serde(default)]
        transaction: Option<String>,
    },
    Event {
        sender: u64,
        #[serde(default)]
        transaction: Option<String>,
        #[serde(default)]
        plugindata: Option<PluginData>,
        #[serde(default)]
        jsep: Option<SessionDescription>,
    },
    Error {
        #[serde(default)]
        transaction: Option<String>,
        error: ErrorBody,
    },
    Keepalive,
    Webrtcup {
        sender: u64,
    },
    Media {
        sender: u64,
    },
    Slowlink {
        sender: u64,
    },
    Hangup {
        sender: u64,
    },
    Detached {
        sender: u64,
    },
    Trickle {
        sender: u64,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct IdData {
    #[serde(default)]
    id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PluginData {
    #[serde(default)]
    plugin: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: i64,
    #[serde(default)]
    reason: String,
}

impl Envelope {
    pub fn parse(raw: &Value) -> JanusResult<Envelope> {
        let wire = Wire::deserialize(raw)
            .map_err(|err| JanusError::protocol(format!("malformed envelope: {err}"), raw))?;
        let notice = |sender, kind| {
            Envelope::Notice(HandleNotice {
                sender,
                kind,
                raw: raw.clone(),
            })
        };
        Ok(match wire {
            Wire::Success {
                transaction,
                data,
                plugindata,
            } => Envelope::Success {
                transaction,
                id: data.and_then(|data| data.id),
                plugin_data: plugindata.map(|p| p.data),
            },
            Wire::Ack { transaction } => Envelope::Ack { transaction },
            Wire::Event {
                sender,
                transaction,
                plugindata,
                jsep,
            } => {
                let (plugin, data) = match plugindata {
                    Some(p) => (p.plugin, p.data),
                    None => (None, Value::Null),
                };
                Envelope::Event(Event {
                    sender,
                    transaction,
                    plugin,
                    data,
                    jsep,
                    raw: raw.clone(),
                })
            }
            Wire::Error { transaction, error } => Envelope::Error {
                transaction,
                code: error.code,
                reason: error.reason,
            },
            Wire::Keepalive => Envelope::KeepAlive,
            Wire::Webrtcup { sender } => notice(sender, NoticeKind::WebrtcUp),
            Wire::Media { sender } => notice(sender, NoticeKind::Media),
            Wire::Slowlink { sender } => notice(sender, NoticeKind::SlowLink),
            Wire::Hangup { sender } => notice(sender, NoticeKind::Hangup),
            Wire::Detached { sender } => notice(sender, NoticeKind::Detached),
            Wire::Trickle { sender } => notice(sender, NoticeKind::Trickle),
            Wire::Unknown => Envelope::Unknown(
                raw.get("janus")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            ),
        })
    }
}

pub(crate) fn request(verb: &str, transaction: &str) -> Value {
    json!({ "janus": verb, "transaction": transaction })
}

/// Builds a request from a caller payload. The payload is merged first so it
/// can never override the verb or the transaction.
pub(crate) fn request_with(verb: &str, transaction: &str, payload: Value) -> JanusResult<Value> {
    let mut message = match payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        _ => return Err(JanusError::IllegalState("request payload must be a JSON object")),
    };
    message.insert("janus".into(), Value::String(verb.into()));
    message.insert("transaction".into(), Value::String(transaction.into()));
    Ok(Value::Object(message))
}

fn check_transaction(reply: &Value, expected: &str, got: Option<&str>) -> JanusResult<()> {
    match got {
        Some(got) if got != expected => Err(JanusError::protocol(
            format!("reply transaction {got} does not match {expected}"),
            reply,
        )),
        _ => Ok(()),
    }
}

fn unexpected(expected: &str, reply: &Value, envelope: &Envelope) -> JanusError {
    match envelope {
        Envelope::Error { code, reason, .. } => {
            JanusError::protocol(format!("gateway error {code}: {reason}"), reply)
        }
        _ => JanusError::protocol(format!("expected {expected} envelope"), reply),
    }
}

/// Validates a `success` reply and returns it for further inspection.
pub(crate) fn expect_success(reply: &Value, transaction: &str) -> JanusResult<Envelope> {
    let envelope = Envelope::parse(reply)?;
    match &envelope {
        Envelope::Success {
            transaction: got, ..
        } => check_transaction(reply, transaction, got.as_deref())?,
        other => return Err(unexpected("success", reply, other)),
    }
    Ok(envelope)
}

/// Validates a `success` reply that must carry `data.id`.
pub(crate) fn expect_success_id(reply: &Value, transaction: &str) -> JanusResult<u64> {
    match expect_success(reply, transaction)? {
        Envelope::Success { id: Some(id), .. } => Ok(id),
        _ => Err(JanusError::protocol("success reply carried no data.id", reply)),
    }
}

pub(crate) fn expect_ack(reply: &Value, transaction: &str) -> JanusResult<()> {
    match Envelope::parse(reply)? {
        Envelope::Ack { transaction: got } => check_transaction(reply, transaction, got.as_deref()),
        other => Err(unexpected("ack", reply, &other)),
    }
}
