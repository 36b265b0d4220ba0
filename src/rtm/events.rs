//! Typed events delivered to the consumer stream.
//!
//! Wire frames are classified by their `type` discriminator. Frames the
//! client does not know about are passed through as
//! [`RtmEvent::Unclassified`] so newer server events never break a consumer.
//! The manager interleaves synthetic lifecycle events (connecting, connected,
//! disconnected, latency reports) with the classified frames.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::rtm::error::{DisconnectCause, SendError};
use crate::rtm::proto::{
    AckMessage, ErrorFrame, MessageEvent, Pong, PresenceChangeEvent, ReconnectUrlEvent,
    RtmErrorBody, UserTypingEvent,
};
use crate::web_api::SessionInfo;

#[derive(Clone, Debug, PartialEq)]
pub enum RtmEvent {
    /// A connection attempt is starting.
    Connecting {
        attempt: usize,
        connection_count: u64,
    },
    /// A connection attempt failed; the manager sleeps `backoff` before the
    /// next one.
    ConnectionError {
        attempt: usize,
        backoff: Duration,
        error: String,
    },
    Connected {
        connection_count: u64,
        info: Box<SessionInfo>,
    },
    Disconnected {
        intentional: bool,
        cause: DisconnectCause,
    },
    /// Round-trip time of an acknowledged liveness probe.
    LatencyReport {
        latency: Duration,
    },
    /// Negotiation was rejected for bad credentials. The manager stops.
    InvalidAuth {
        code: String,
    },
    OutgoingError {
        id: u64,
        error: SendError,
    },
    MessageTooLong {
        id: u64,
        len: usize,
        max: usize,
    },

    Hello,
    Goodbye,
    Message(MessageEvent),
    PresenceChange(PresenceChangeEvent),
    UserTyping(UserTypingEvent),
    ReconnectUrl(ReconnectUrlEvent),
    Error(RtmErrorBody),
    /// Probe reply. Consumed by the manager's ping loop, never published.
    Pong(Pong),
    Ack(AckMessage),
    AckError(AckMessage),
    /// A frame with a known discriminator whose body did not decode.
    UnmarshallingError {
        kind: String,
        error: String,
        raw: Value,
    },
    /// A frame with a discriminator this client does not model.
    Unclassified {
        kind: String,
        raw: Value,
    },
}

impl RtmEvent {
    /// Stable name of the event, matching the wire discriminator for
    /// classified frames.
    pub fn kind(&self) -> &str {
        match self {
            Self::Connecting { .. } => "connecting",
            Self::ConnectionError { .. } => "connection_error",
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::LatencyReport { .. } => "latency_report",
            Self::InvalidAuth { .. } => "invalid_auth",
            Self::OutgoingError { .. } => "outgoing_error",
            Self::MessageTooLong { .. } => "message_too_long",
            Self::Hello => "hello",
            Self::Goodbye => "goodbye",
            Self::Message(_) => "message",
            Self::PresenceChange(_) => "presence_change",
            Self::UserTyping(_) => "user_typing",
            Self::ReconnectUrl(_) => "reconnect_url",
            Self::Error(_) => "error",
            Self::Pong(_) => "pong",
            Self::Ack(_) => "ack",
            Self::AckError(_) => "ack_error",
            Self::UnmarshallingError { .. } => "unmarshalling_error",
            Self::Unclassified { kind, .. } => kind,
        }
    }

    /// Whether the event was synthesized by the manager rather than read
    /// from the wire.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::Connecting { .. }
                | Self::ConnectionError { .. }
                | Self::Connected { .. }
                | Self::Disconnected { .. }
                | Self::LatencyReport { .. }
                | Self::InvalidAuth { .. }
                | Self::OutgoingError { .. }
                | Self::MessageTooLong { .. }
        )
    }
}

/// Classifies one raw inbound frame.
pub fn classify(frame: Value) -> RtmEvent {
    if !frame.is_object() {
        return RtmEvent::UnmarshallingError {
            kind: String::new(),
            error: "frame is not a json object".to_string(),
            raw: frame,
        };
    }

    let discriminator = frame
        .get("type")
        .map(|kind| kind.as_str().map(str::to_owned));
    let kind = match discriminator {
        Some(Some(kind)) => kind,
        Some(None) => {
            return RtmEvent::UnmarshallingError {
                kind: String::new(),
                error: "frame type is not a string".to_string(),
                raw: frame,
            };
        }
        None if frame.get("reply_to").is_some() => return classify_ack(frame),
        None => {
            return RtmEvent::Unclassified {
                kind: String::new(),
                raw: frame,
            };
        }
    };

    match kind.as_str() {
        "hello" => RtmEvent::Hello,
        "goodbye" => RtmEvent::Goodbye,
        "message" => decode(kind, frame, RtmEvent::Message),
        "presence_change" => decode(kind, frame, RtmEvent::PresenceChange),
        "user_typing" => decode(kind, frame, RtmEvent::UserTyping),
        "reconnect_url" => decode(kind, frame, RtmEvent::ReconnectUrl),
        "error" => decode(kind, frame, |body: ErrorFrame| RtmEvent::Error(body.error)),
        "pong" => decode(kind, frame, RtmEvent::Pong),
        _ => RtmEvent::Unclassified { kind, raw: frame },
    }
}

fn classify_ack(frame: Value) -> RtmEvent {
    decode("ack".to_string(), frame, |ack: AckMessage| {
        if ack.ok {
            RtmEvent::Ack(ack)
        } else {
            RtmEvent::AckError(ack)
        }
    })
}

fn decode<T, F>(kind: String, frame: Value, wrap: F) -> RtmEvent
where
    T: DeserializeOwned,
    F: FnOnce(T) -> RtmEvent,
{
    match T::deserialize(&frame) {
        Ok(body) => wrap(body),
        Err(err) => RtmEvent::UnmarshallingError {
            kind,
            error: err.to_string(),
            raw: frame,
        },
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{classify, RtmEvent};
    use crate::rtm::proto::Pong;

    #[test]
    fn classifies_message() {
        let event = classify(json!({
            "type": "message",
            "channel": "C1",
            "user": "U1",
            "text": "hi",
            "ts": "1700000000.000100"
        }));
        match event {
            RtmEvent::Message(message) => {
                assert_eq!(message.channel, "C1");
                assert_eq!(message.text, "hi");
                assert_eq!(message.ts, "1700000000.000100");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn classifies_presence_change() {
        let event = classify(json!({"type": "presence_change", "user": "U1", "presence": "active"}));
        assert!(matches!(event, RtmEvent::PresenceChange(ref presence) if presence.presence == "active"));
        assert_eq!(event.kind(), "presence_change");
    }

    #[test]
    fn unknown_type_is_unclassified_not_an_error() {
        let raw = json!({"type": "emoji_changed", "name": "party"});
        let event = classify(raw.clone());
        assert_eq!(
            event,
            RtmEvent::Unclassified {
                kind: "emoji_changed".to_string(),
                raw,
            }
        );
        assert_eq!(event.kind(), "emoji_changed");
        assert!(!event.is_lifecycle());
    }

    #[test]
    fn known_type_with_bad_body_reports_unmarshalling_error() {
        let event = classify(json!({"type": "presence_change", "user": "U1"}));
        match event {
            RtmEvent::UnmarshallingError { kind, .. } => assert_eq!(kind, "presence_change"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn reply_without_type_is_an_ack() {
        let ok = classify(json!({"ok": true, "reply_to": 5, "ts": "1.2", "text": "hi"}));
        assert!(matches!(ok, RtmEvent::Ack(ref ack) if ack.reply_to == 5));

        let failed = classify(json!({"ok": false, "reply_to": 6, "error": {"code": 1, "msg": "nope"}}));
        assert!(matches!(failed, RtmEvent::AckError(ref ack) if ack.reply_to == 6));
    }

    #[test]
    fn pong_and_error_frames() {
        assert_eq!(
            classify(json!({"type": "pong", "reply_to": 9})),
            RtmEvent::Pong(Pong { reply_to: 9 })
        );

        let error = classify(json!({"type": "error", "error": {"code": 1, "msg": "socket URL has expired"}}));
        assert!(matches!(error, RtmEvent::Error(ref body) if body.code == 1));
    }

    #[test]
    fn non_object_frames_are_reported() {
        assert!(matches!(
            classify(json!([1, 2, 3])),
            RtmEvent::UnmarshallingError { .. }
        ));
        assert!(matches!(
            classify(json!({"type": 42})),
            RtmEvent::UnmarshallingError { .. }
        ));
        assert!(matches!(
            classify(json!({"hello": "world"})),
            RtmEvent::Unclassified { ref kind, .. } if kind.is_empty()
        ));
    }
}
