//! Streaming transport used by the connection manager.
//!
//! The manager only sees JSON frames: a [`Dialer`] opens a connection and
//! hands back a sink for outbound frames and a stream of inbound ones. The
//! websocket implementation lives here; tests substitute in-memory channels.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

pub type FrameSink = Pin<Box<dyn Sink<Value, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Value, TransportError>> + Send>>;

/// An open streaming connection split into its write and read halves.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Connection {
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<Value, Error = TransportError> + Send + 'static,
        St: Stream<Item = Result<Value, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens streaming connections to negotiated endpoints.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, url: &str) -> Result<Connection, TransportError>;
}

/// Errors produced by the streaming transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization error on an outbound frame.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("dial timed out after {0:?}")]
    Timeout(Duration),
}

/// [`Dialer`] backed by tokio-tungstenite.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketDialer;

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, url: &str) -> Result<Connection, TransportError> {
        let (socket, response) = connect_async(url).await?;
        debug!(event = "websocket_dialed", status = response.status().as_u16());

        let (write, read) = socket.split();
        let sink = write
            .sink_map_err(|err: WsError| TransportError::from(err))
            .with(|frame: Value| future::ready(encode_frame(&frame)));
        let stream = read.filter_map(|message| future::ready(decode_message(message)));

        Ok(Connection::new(sink, stream))
    }
}

fn encode_frame(frame: &Value) -> Result<Message, TransportError> {
    let text = serde_json::to_string(frame)?;
    Ok(Message::Text(text.into()))
}

/// Maps one websocket message to an inbound frame.
///
/// Control frames are absorbed. Text that is not valid JSON is surfaced as a
/// JSON string so the router can report it instead of losing it.
fn decode_message(message: Result<Message, WsError>) -> Option<Result<Value, TransportError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(parse_frame(&text))),
        Ok(Message::Binary(bytes)) => Some(Ok(parse_frame(&String::from_utf8_lossy(&bytes)))),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => None,
        Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
        Err(err) => Some(Err(TransportError::WebSocket(err))),
    }
}

fn parse_frame(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};

    use super::{decode_message, encode_frame, TransportError};

    #[test]
    fn text_frames_decode_to_json() {
        let decoded = decode_message(Ok(Message::Text(r#"{"type":"hello"}"#.to_string().into())));
        assert_eq!(decoded.map(|frame| frame.ok()), Some(Some(json!({"type": "hello"}))));
    }

    #[test]
    fn invalid_json_is_kept_as_raw_text() {
        let decoded = decode_message(Ok(Message::Text("not json".to_string().into())));
        assert_eq!(decoded.map(|frame| frame.ok()), Some(Some(json!("not json"))));
    }

    #[test]
    fn control_frames_are_absorbed() {
        assert!(decode_message(Ok(Message::Ping(Vec::new().into()))).is_none());
        assert!(decode_message(Ok(Message::Pong(Vec::new().into()))).is_none());
    }

    #[test]
    fn close_and_errors_end_the_stream() {
        assert!(matches!(
            decode_message(Ok(Message::Close(None))),
            Some(Err(TransportError::Closed))
        ));
        assert!(matches!(
            decode_message(Err(WsError::ConnectionClosed)),
            Some(Err(TransportError::WebSocket(_)))
        ));
    }

    #[test]
    fn frames_encode_as_text() {
        let message = encode_frame(&json!({"type": "ping", "id": 1})).expect("encode");
        match message {
            Message::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).expect("json");
                assert_eq!(value, json!({"type": "ping", "id": 1}));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
