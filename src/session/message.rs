//! Phoenix channel messages.
//!
//! Every text frame is a five element array:
//!
//! ```text
//! [join_ref, ref, topic, event, payload]
//! ```
//!
//! Replies reuse the request's refs and carry `{"response": .., "status": ..}`.
//! Server pushes (timer diffs, navigation) have null refs.

use serde_json::{Value, json};
use thiserror::Error;

use super::upload::{BinaryFrame, UploadError};
use crate::render::Cid;

/// Topic of connection-level heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Topics of upload channels start with this.
pub const UPLOAD_TOPIC_PREFIX: &str = "lvu:";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON")]
    Json(#[from] serde_json::Error),

    #[error("bad envelope: {0}")]
    Envelope(String),

    #[error("bad binary frame")]
    Binary(#[from] UploadError),

    #[error("`{event}` is missing `{field}`")]
    MissingField { event: String, field: &'static str },

    #[error("no live view is routed at `{0}`")]
    UnknownRoute(String),

    #[error("`{0}` is not a valid url")]
    BadUrl(String),
}

/// What an inbound message asks for, decided once from its event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Join,
    Heartbeat,
    Event,
    LivePatch,
    AllowUpload,
    Progress,
    Chunk,
    CidsWillDestroy,
    CidsDestroyed,
    Leave,
    Unknown,
}

impl Inbound {
    pub fn of(event: &str) -> Self {
        match event {
            "phx_join" => Self::Join,
            "heartbeat" => Self::Heartbeat,
            "event" => Self::Event,
            "live_patch" => Self::LivePatch,
            "allow_upload" => Self::AllowUpload,
            "progress" => Self::Progress,
            "chunk" => Self::Chunk,
            "cids_will_destroy" => Self::CidsWillDestroy,
            "cids_destroyed" => Self::CidsDestroyed,
            "phx_leave" => Self::Leave,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub join_ref: Option<String>,
    pub msg_ref: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Array(mut parts) = value else {
            return Err(ProtocolError::Envelope("expected an array".into()));
        };
        if parts.len() != 5 {
            return Err(ProtocolError::Envelope(format!(
                "expected 5 elements, got {}",
                parts.len()
            )));
        }
        let payload = parts.pop().unwrap_or(Value::Null);
        let event = required_str(parts.pop(), "event")?;
        let topic = required_str(parts.pop(), "topic")?;
        let msg_ref = optional_ref(parts.pop());
        let join_ref = optional_ref(parts.pop());
        Ok(Self {
            join_ref,
            msg_ref,
            topic,
            event,
            payload,
        })
    }

    /// A push from the server, not answering anything.
    pub fn push(topic: &str, event: &str, payload: Value) -> Self {
        Self {
            join_ref: None,
            msg_ref: None,
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        }
    }

    /// Successful reply to this message.
    pub fn reply(&self, response: Value) -> Self {
        self.reply_with_status("ok", response)
    }

    pub fn reply_error(&self, response: Value) -> Self {
        self.reply_with_status("error", response)
    }

    fn reply_with_status(&self, status: &str, response: Value) -> Self {
        Self {
            join_ref: self.join_ref.clone(),
            msg_ref: self.msg_ref.clone(),
            topic: self.topic.clone(),
            event: "phx_reply".to_string(),
            payload: json!({ "response": response, "status": status }),
        }
    }

    pub fn to_json(&self) -> String {
        json!([
            self.join_ref,
            self.msg_ref,
            self.topic,
            self.event,
            self.payload
        ])
        .to_string()
    }

    /// String field of the payload, or a protocol error naming it.
    pub fn field(&self, field: &'static str) -> Result<&str, ProtocolError> {
        self.payload
            .get(field)
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MissingField {
                event: self.event.clone(),
                field,
            })
    }

    /// The `cids` array of the component teardown messages.
    pub fn cids(&self) -> Result<Vec<Cid>, ProtocolError> {
        let missing = || ProtocolError::MissingField {
            event: self.event.clone(),
            field: "cids",
        };
        self.payload
            .get("cids")
            .and_then(Value::as_array)
            .ok_or_else(missing)?
            .iter()
            .map(|v| v.as_u64().and_then(|n| Cid::try_from(n).ok()).ok_or_else(missing))
            .collect()
    }

    pub fn kind(&self) -> Inbound {
        Inbound::of(&self.event)
    }

    pub fn is_upload_topic(&self) -> bool {
        self.topic.starts_with(UPLOAD_TOPIC_PREFIX)
    }

    /// Split a binary frame into its envelope and raw payload.
    pub fn from_binary(frame: BinaryFrame) -> (Self, Vec<u8>) {
        let envelope = Self {
            join_ref: Some(frame.join_ref),
            msg_ref: Some(frame.msg_ref),
            topic: frame.topic,
            event: frame.event,
            payload: Value::Null,
        };
        (envelope, frame.payload)
    }
}

fn required_str(value: Option<Value>, name: &str) -> Result<String, ProtocolError> {
    match value {
        Some(Value::String(s)) => Ok(s),
        _ => Err(ProtocolError::Envelope(format!("`{name}` must be a string"))),
    }
}

/// Refs are strings in practice; accept numbers too.
fn optional_ref(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_envelope() {
        let env = Envelope::parse(r#"["1","2","lv:phx-1","event",{"event":"inc"}]"#).unwrap();
        assert_eq!(env.join_ref.as_deref(), Some("1"));
        assert_eq!(env.msg_ref.as_deref(), Some("2"));
        assert_eq!(env.topic, "lv:phx-1");
        assert_eq!(env.event, "event");
        assert_eq!(env.field("event").unwrap(), "inc");
        assert_eq!(env.kind(), Inbound::Event);
    }

    #[test]
    fn test_parse_heartbeat_with_null_join_ref() {
        let env = Envelope::parse(r#"[null,"9","phoenix","heartbeat",{}]"#).unwrap();
        assert_eq!(env.join_ref, None);
        let reply = env.reply(json!({}));
        assert_eq!(
            reply.to_json(),
            r#"[null,"9","phoenix","phx_reply",{"response":{},"status":"ok"}]"#
        );
    }

    #[test]
    fn test_bad_envelopes() {
        assert!(matches!(Envelope::parse("{"), Err(ProtocolError::Json(_))));
        assert!(matches!(
            Envelope::parse(r#"["1","2","t"]"#),
            Err(ProtocolError::Envelope(_))
        ));
        assert!(matches!(
            Envelope::parse(r#"["1","2",3,"event",{}]"#),
            Err(ProtocolError::Envelope(_))
        ));
    }

    #[test]
    fn test_inbound_kinds() {
        assert_eq!(Inbound::of("phx_join"), Inbound::Join);
        assert_eq!(Inbound::of("phx_leave"), Inbound::Leave);
        assert_eq!(Inbound::of("cids_destroyed"), Inbound::CidsDestroyed);
        assert_eq!(Inbound::of("bogus"), Inbound::Unknown);
    }

    #[test]
    fn test_push_has_null_refs() {
        let push = Envelope::push("lv:1", "diff", json!({"0": "1"}));
        assert_eq!(push.to_json(), r#"[null,null,"lv:1","diff",{"0":"1"}]"#);
    }

    #[test]
    fn test_cids() {
        let env = Envelope::parse(r#"["1","6","lv:1","cids_destroyed",{"cids":[1,2]}]"#).unwrap();
        assert_eq!(env.cids().unwrap(), vec![1, 2]);

        let env = Envelope::parse(r#"["1","6","lv:1","cids_destroyed",{"cids":["x"]}]"#).unwrap();
        assert!(env.cids().is_err());
    }
}
