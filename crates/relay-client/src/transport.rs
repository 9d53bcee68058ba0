use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use relay_core::GatewayError;

/// One inbound occurrence on an open link.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Text(String),
    Ping,
    Pong,
    Binary,
    Closed { code: Option<u16>, reason: String },
}

/// A connector. The seam that lets tests drive the state machine without
/// real sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn TransportLink>, GatewayError>;
}

/// One open bidirectional text channel.
#[async_trait]
pub trait TransportLink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), GatewayError>;
    async fn close(&mut self, code: u16, reason: &str);
    /// Next inbound event; `None` once the stream is exhausted.
    async fn next_event(&mut self) -> Option<TransportEvent>;
}

/// Production transport over tokio-tungstenite.
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn TransportLink>, GatewayError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl TransportLink for WsLink {
    async fn send_text(&mut self, text: String) -> Result<(), GatewayError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self.stream.send(Message::Close(Some(frame))).await;
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            return Some(match self.stream.next().await? {
                Ok(Message::Text(text)) => TransportEvent::Text(text.to_string()),
                // tungstenite answers protocol pings itself; surfaced only so
                // the caller can observe liveness.
                Ok(Message::Ping(_)) => TransportEvent::Ping,
                Ok(Message::Pong(_)) => TransportEvent::Pong,
                Ok(Message::Binary(_)) => TransportEvent::Binary,
                Ok(Message::Close(frame)) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                        None => (None, String::new()),
                    };
                    TransportEvent::Closed { code, reason }
                }
                Ok(Message::Frame(_)) => continue,
                Err(e) => TransportEvent::Closed {
                    code: None,
                    reason: e.to_string(),
                },
            });
        }
    }
}
