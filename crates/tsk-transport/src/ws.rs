//! WebSocket push transport.
//!
//! Two wire formats:
//! - `json`: one text frame per event, `{"event": "task:created", "data": {..}}`.
//! - `socket_io`: Engine.IO v4 text packets carrying Socket.IO packets. The
//!   reader answers the open packet with a namespace connect (credential in
//!   the auth payload), answers pings with pongs and decodes `42[..]`
//!   event packets.
//!
//! Frame decoding is a pure function ([`decode_frame`]) so the protocol
//! handling is testable without a socket.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::{PushFrame, PushStream, PushTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    SocketIo,
    Json,
}

impl WireFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "socket_io" | "socketio" | "socket.io" => Some(Self::SocketIo),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SocketIo => "socket_io",
            Self::Json => "json",
        }
    }
}

/// What one inbound text frame means.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(PushFrame),
    /// Engine.IO open: answer with [`connect_packet`].
    Open,
    /// Send this text back verbatim.
    Reply(String),
    /// Peer ended the session.
    Close(String),
    Ignore,
}

/// Socket.IO namespace connect packet, with the credential as auth payload.
pub fn connect_packet(token: Option<&str>) -> String {
    match token {
        Some(t) => format!("40{}", serde_json::json!({ "token": t })),
        None => "40".to_string(),
    }
}

pub fn decode_frame(text: &str, format: WireFormat) -> Decoded {
    match format {
        WireFormat::Json => decode_json(text),
        WireFormat::SocketIo => decode_socket_io(text),
    }
}

fn decode_json(text: &str) -> Decoded {
    let Ok(Value::Object(mut obj)) = serde_json::from_str::<Value>(text) else {
        return Decoded::Ignore;
    };
    let Some(Value::String(event)) = obj.remove("event") else {
        return Decoded::Ignore;
    };
    let payload = obj
        .remove("data")
        .or_else(|| obj.remove("payload"))
        .unwrap_or(Value::Null);
    Decoded::Event(PushFrame::new(event, payload))
}

fn decode_socket_io(text: &str) -> Decoded {
    let mut chars = text.chars();
    match chars.next() {
        Some('0') => Decoded::Open,
        Some('1') => Decoded::Close("engine.io close".to_string()),
        Some('2') => Decoded::Reply(format!("3{}", chars.as_str())),
        Some('4') => decode_socket_io_packet(chars.as_str()),
        _ => Decoded::Ignore,
    }
}

fn decode_socket_io_packet(packet: &str) -> Decoded {
    let mut chars = packet.chars();
    match chars.next() {
        // EVENT
        Some('2') => {
            let mut rest = chars.as_str();
            // Optional "/namespace," prefix.
            if rest.starts_with('/') {
                match rest.find(',') {
                    Some(i) => rest = &rest[i + 1..],
                    None => return Decoded::Ignore,
                }
            }
            // Optional ack id.
            let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());
            let Ok(Value::Array(mut items)) = serde_json::from_str::<Value>(rest) else {
                return Decoded::Ignore;
            };
            if items.is_empty() {
                return Decoded::Ignore;
            }
            let Value::String(event) = items.remove(0) else {
                return Decoded::Ignore;
            };
            let payload = if items.is_empty() {
                Value::Null
            } else {
                items.remove(0)
            };
            Decoded::Event(PushFrame::new(event, payload))
        }
        Some('1') => Decoded::Close("socket.io disconnect".to_string()),
        // CONNECT_ERROR, usually a refused credential.
        Some('4') => Decoded::Close(format!("socket.io connect error: {}", chars.as_str())),
        _ => Decoded::Ignore,
    }
}

/// Push transport over a WebSocket.
#[derive(Clone)]
pub struct WsPushTransport {
    url: String,
    format: WireFormat,
    bearer: Option<String>,
    buffer: usize,
}

impl std::fmt::Debug for WsPushTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsPushTransport")
            .field("url", &self.url)
            .field("format", &self.format)
            .field("bearer", &self.bearer.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl WsPushTransport {
    pub fn new(url: impl Into<String>, format: WireFormat, bearer: Option<String>) -> Self {
        Self {
            url: url.into(),
            format,
            bearer,
            buffer: 256,
        }
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }
}

#[async_trait]
impl PushTransport for WsPushTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn subscribe(&self) -> Result<PushStream, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Config(e.to_string()))?;
        if let Some(token) = &self.bearer {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| TransportError::Config("bearer credential is not a valid header".into()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::Transport(e.to_string()))?;
        info!(url = %self.url, format = self.format.as_str(), "push channel connected");

        let (mut sink, mut source) = socket.split();
        let (tx, rx) = mpsc::channel(self.buffer);
        let format = self.format;
        let bearer = self.bearer.clone();

        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "push channel read failed");
                        break;
                    }
                };
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Ping(data) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Message::Close(_) => break,
                    _ => continue,
                };
                let reply = match decode_frame(&text, format) {
                    Decoded::Event(frame) => {
                        if tx.send(frame).await.is_err() {
                            // Subscriber went away.
                            break;
                        }
                        None
                    }
                    Decoded::Open => Some(connect_packet(bearer.as_deref())),
                    Decoded::Reply(r) => Some(r),
                    Decoded::Close(reason) => {
                        info!(reason = %reason, "push channel closed by peer");
                        break;
                    }
                    Decoded::Ignore => {
                        debug!(len = text.len(), "push frame ignored");
                        None
                    }
                };
                if let Some(r) = reply {
                    if sink.send(Message::Text(r)).await.is_err() {
                        break;
                    }
                }
            }
            let _ = sink.close().await;
            debug!("push reader finished");
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn socket_io_event_packet() {
        let d = decode_frame(
            r#"42["task:created",{"_id":"srv-1","title":"x"}]"#,
            WireFormat::SocketIo,
        );
        assert_eq!(
            d,
            Decoded::Event(PushFrame::new(
                "task:created",
                json!({"_id": "srv-1", "title": "x"})
            ))
        );
    }

    #[test]
    fn socket_io_namespace_and_ack_id() {
        let d = decode_frame(r#"42/tasks,17["task:deleted",{"id":"srv-5"}]"#, WireFormat::SocketIo);
        assert_eq!(
            d,
            Decoded::Event(PushFrame::new("task:deleted", json!({"id": "srv-5"})))
        );
    }

    #[test]
    fn socket_io_control_packets() {
        assert_eq!(
            decode_frame(r#"0{"sid":"abc","pingInterval":25000}"#, WireFormat::SocketIo),
            Decoded::Open
        );
        assert_eq!(decode_frame("2", WireFormat::SocketIo), Decoded::Reply("3".into()));
        assert_eq!(decode_frame(r#"40{"sid":"x"}"#, WireFormat::SocketIo), Decoded::Ignore);
        assert!(matches!(
            decode_frame(r#"44{"message":"unauthorized"}"#, WireFormat::SocketIo),
            Decoded::Close(_)
        ));
        assert_eq!(decode_frame("42not json", WireFormat::SocketIo), Decoded::Ignore);
    }

    #[test]
    fn connect_packet_carries_token() {
        assert_eq!(connect_packet(None), "40");
        assert_eq!(connect_packet(Some("abc")), r#"40{"token":"abc"}"#);
    }

    #[test]
    fn json_frames() {
        assert_eq!(
            decode_frame(r#"{"event":"updated","data":{"id":1}}"#, WireFormat::Json),
            Decoded::Event(PushFrame::new("updated", json!({"id": 1})))
        );
        assert_eq!(decode_frame(r#"{"data":{}}"#, WireFormat::Json), Decoded::Ignore);
        assert_eq!(decode_frame("[1,2]", WireFormat::Json), Decoded::Ignore);
    }

    #[test]
    fn wire_format_parse() {
        assert_eq!(WireFormat::parse("socket.io"), Some(WireFormat::SocketIo));
        assert_eq!(WireFormat::parse("JSON"), Some(WireFormat::Json));
        assert_eq!(WireFormat::parse("grpc"), None);
    }

    #[test]
    fn debug_redacts_bearer() {
        let t = WsPushTransport::new("ws://h", WireFormat::Json, Some("secret-value".into()));
        let s = format!("{t:?}");
        assert!(!s.contains("secret-value"));
    }
}
