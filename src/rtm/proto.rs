use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Frames written by the client.
///
/// An `id` of `0` is unassigned; the manager fills it in before transmission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping {
        id: u64,
    },
    Message {
        id: u64,
        channel: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_ts: Option<String>,
    },
    Typing {
        id: u64,
        channel: String,
    },
}

impl ClientFrame {
    pub fn message(channel: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Message {
            id: 0,
            channel: channel.into(),
            text: text.into(),
            thread_ts: None,
        }
    }

    pub fn typing(channel: impl Into<String>) -> Self {
        Self::Typing {
            id: 0,
            channel: channel.into(),
        }
    }

    /// Posts the message as a reply in the thread rooted at `thread_ts`.
    pub fn in_thread(mut self, ts: impl Into<String>) -> Self {
        if let Self::Message { thread_ts, .. } = &mut self {
            *thread_ts = Some(ts.into());
        }
        self
    }

    pub fn id(&self) -> u64 {
        match self {
            Self::Ping { id } | Self::Message { id, .. } | Self::Typing { id, .. } => *id,
        }
    }

    pub(crate) fn set_id(&mut self, value: u64) {
        match self {
            Self::Ping { id } | Self::Message { id, .. } | Self::Typing { id, .. } => *id = value,
        }
    }

    /// Length in characters of the user-visible text, if any.
    pub fn text_len(&self) -> usize {
        match self {
            Self::Message { text, .. } => text.chars().count(),
            Self::Ping { .. } | Self::Typing { .. } => 0,
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Error body carried by `error` frames and failed acks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RtmErrorBody {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct ErrorFrame {
    pub error: RtmErrorBody,
}

/// Reply to a liveness probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pong {
    pub reply_to: u64,
}

/// Server acknowledgement of a client frame, correlated by `reply_to`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AckMessage {
    pub ok: bool,
    pub reply_to: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RtmErrorBody>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageEvent {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Presence update for one user, or for a batch when the session opted into
/// batched presence.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceChangeEvent {
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
    pub presence: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserTypingEvent {
    pub channel: String,
    pub user: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconnectUrlEvent {
    pub url: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AckMessage, ClientFrame, PresenceChangeEvent};

    #[test]
    fn ping_encodes_type_and_id() {
        let value = ClientFrame::Ping { id: 7 }.to_value().expect("encode");
        assert_eq!(value, json!({"type": "ping", "id": 7}));
    }

    #[test]
    fn message_omits_thread_when_unset() {
        let mut frame = ClientFrame::message("C1", "hello");
        frame.set_id(3);
        let value = frame.to_value().expect("encode");
        assert_eq!(
            value,
            json!({"type": "message", "id": 3, "channel": "C1", "text": "hello"})
        );

        let threaded = ClientFrame::message("C1", "reply").in_thread("1700.01");
        let value = threaded.to_value().expect("encode");
        assert_eq!(value.get("thread_ts"), Some(&json!("1700.01")));
    }

    #[test]
    fn typing_ignores_thread_and_text_len() {
        let frame = ClientFrame::typing("C9").in_thread("1.0");
        assert_eq!(frame, ClientFrame::typing("C9"));
        assert_eq!(frame.text_len(), 0);
        assert_eq!(ClientFrame::message("C1", "héllo").text_len(), 5);
    }

    #[test]
    fn ack_error_decodes_nested_error() {
        let ack: AckMessage = serde_json::from_value(json!({
            "ok": false,
            "reply_to": 4,
            "error": {"code": 2, "msg": "message text is missing"}
        }))
        .expect("decode ack");
        assert!(!ack.ok);
        assert_eq!(ack.error.map(|error| error.code), Some(2));
    }

    #[test]
    fn batched_presence_decodes_user_list() {
        let event: PresenceChangeEvent = serde_json::from_value(json!({
            "type": "presence_change",
            "users": ["U1", "U2"],
            "presence": "away"
        }))
        .expect("decode presence");
        assert_eq!(event.users, vec!["U1".to_string(), "U2".to_string()]);
        assert!(event.user.is_empty());
    }
}
