/// Push transport seam and its WebSocket implementation
use crate::connection::state::{EndpointKey, NORMAL_CLOSE_CODE};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// One frame off the wire, after control frames are handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    /// Close frame with its status code, if the peer sent one
    Close(Option<u16>),
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, endpoint: &EndpointKey, token: &str) -> Result<Box<dyn PushSocket>>;
}

#[async_trait]
pub trait PushSocket: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next data or close frame. `None` means the stream ended without a close frame.
    async fn next_frame(&mut self) -> Option<Result<InboundFrame>>;

    /// Send a normal close frame
    async fn close(&mut self) -> Result<()>;
}

/// WebSocket transport (`ws://host/ws/...?token=...`)
#[derive(Debug, Clone)]
pub struct WsTransport {
    base_url: String,
}

impl WsTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint_url(&self, endpoint: &EndpointKey, token: &str) -> String {
        format!(
            "{}{}?token={}",
            self.base_url,
            endpoint.path(),
            urlencoding::encode(token)
        )
    }
}

#[async_trait]
impl PushTransport for WsTransport {
    async fn connect(&self, endpoint: &EndpointKey, token: &str) -> Result<Box<dyn PushSocket>> {
        let url = self.endpoint_url(endpoint, token);
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SyncError::WebSocket(format!("connect {} failed: {}", endpoint, e)))?;
        debug!("WebSocket handshake complete for {}", endpoint);
        Ok(Box::new(WsSocket { stream }))
    }
}

struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushSocket for WsSocket {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| SyncError::WebSocket(e.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<InboundFrame>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(frame) => frame,
                Err(e) => return Some(Err(SyncError::WebSocket(e.to_string()))),
            };
            match frame {
                WsMessage::Text(text) => return Some(Ok(InboundFrame::Text(text))),
                WsMessage::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(InboundFrame::Text(text))),
                    Err(_) => {
                        debug!("Dropping non-UTF-8 binary frame");
                        continue;
                    }
                },
                WsMessage::Close(frame) => {
                    return Some(Ok(InboundFrame::Close(frame.map(|f| u16::from(f.code)))))
                }
                // tungstenite answers pings itself
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(NORMAL_CLOSE_CODE),
            reason: "client closing".into(),
        };
        self.stream
            .close(Some(frame))
            .await
            .map_err(|e| SyncError::WebSocket(e.to_string()))
    }
}
