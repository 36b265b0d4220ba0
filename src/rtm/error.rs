use std::time::Duration;

use thiserror::Error;

/// Failure to transmit one outbound frame.
///
/// Reported to the caller that queued the frame and mirrored on the event
/// stream as [`RtmEvent::OutgoingError`](crate::rtm::events::RtmEvent).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("send queue is full")]
    QueueFull,

    #[error("send queue is closed")]
    QueueClosed,

    #[error("message is {len} characters, limit is {max}")]
    MessageTooLong { len: usize, max: usize },

    #[error("transport write failed: {0}")]
    Transport(String),

    /// The frame was dequeued but the connection went away before it was
    /// written, or the manager shut down with it still queued.
    #[error("connection closed before the frame was written")]
    Disconnected,
}

/// Caller-facing manager misuse.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RtmError {
    #[error("manager has been terminated")]
    Terminated,
}

/// Why a connection ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Read or write failure on the streaming connection.
    Transport(String),
    /// A liveness probe went unacknowledged past the latency threshold.
    PingTimeout { id: u64, elapsed: Duration },
    /// The server announced it is about to close the connection.
    ServerGoodbye,
    /// The caller asked to disconnect.
    Intentional,
    /// The reconnect policy ran out of attempts.
    RetriesExhausted,
    /// Negotiation was rejected for bad credentials.
    InvalidAuth(String),
}

impl DisconnectCause {
    /// Whether the manager will try to connect again after this cause.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::PingTimeout { .. } | Self::ServerGoodbye
        )
    }
}

impl std::fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "transport error: {err}"),
            Self::PingTimeout { id, elapsed } => {
                write!(f, "ping {id} unacknowledged after {}ms", elapsed.as_millis())
            }
            Self::ServerGoodbye => write!(f, "server said goodbye"),
            Self::Intentional => write!(f, "disconnect requested"),
            Self::RetriesExhausted => write!(f, "reconnect attempts exhausted"),
            Self::InvalidAuth(code) => write!(f, "authentication rejected: {code}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::DisconnectCause;

    #[test]
    fn only_connection_failures_are_recoverable() {
        assert!(DisconnectCause::Transport("reset".to_string()).is_recoverable());
        assert!(DisconnectCause::ServerGoodbye.is_recoverable());
        assert!(DisconnectCause::PingTimeout {
            id: 3,
            elapsed: Duration::from_secs(61),
        }
        .is_recoverable());

        assert!(!DisconnectCause::Intentional.is_recoverable());
        assert!(!DisconnectCause::RetriesExhausted.is_recoverable());
        assert!(!DisconnectCause::InvalidAuth("invalid_auth".to_string()).is_recoverable());
    }

    #[test]
    fn ping_timeout_reports_probe_and_age() {
        let cause = DisconnectCause::PingTimeout {
            id: 12,
            elapsed: Duration::from_millis(60_250),
        };
        assert_eq!(cause.to_string(), "ping 12 unacknowledged after 60250ms");
    }
}
