//! WebSocket connection wrapper
//!
//! Thin layer over tokio-tungstenite that adds what every caller needs:
//! - connect with a timeout and TCP_NODELAY
//! - control frames (ping/pong) hidden from the data path
//! - close detection folded into the connection state
//! - last-activity tracking for heartbeat checks

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Errors that can occur with WebSocket connections
#[derive(Debug, thiserror::Error)]
pub enum WebSocketError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
    #[error("Timeout")]
    Timeout,
    #[error("Not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Data frame delivered to callers
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Client-side WebSocket connection
pub struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    state: ConnectionState,
    last_activity: Instant,
    url: String,
}

impl WebSocketConnection {
    /// Connect to a `ws://` or `wss://` endpoint
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self> {
        let (ws_stream, _) = timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| WebSocketError::Timeout)?
            .map_err(|e| WebSocketError::ConnectionFailed(e.to_string()))?;

        let tcp = match ws_stream.get_ref() {
            MaybeTlsStream::Plain(tcp) => Some(tcp),
            MaybeTlsStream::Rustls(tls) => Some(tls.get_ref().0),
            _ => None,
        };
        if let Some(tcp) = tcp {
            tcp.set_nodelay(true)
                .map_err(|e| WebSocketError::ConnectionFailed(e.to_string()))?;
        }

        Ok(Self {
            stream: ws_stream,
            state: ConnectionState::Connected,
            last_activity: Instant::now(),
            url: url.to_string(),
        })
    }

    async fn send(&mut self, msg: Message) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(WebSocketError::NotConnected);
        }
        if let Err(e) = self.stream.send(msg).await {
            self.state = ConnectionState::Disconnected;
            return Err(WebSocketError::SendFailed(e.to_string()));
        }
        Ok(())
    }

    #[inline]
    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.send(Message::text(text.into())).await
    }

    #[inline]
    pub async fn send_binary(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::binary(data)).await
    }

    /// Next data frame; `Ok(None)` once the peer closed the connection
    ///
    /// Cancel safe: a frame is either returned or left in the stream.
    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        if self.state != ConnectionState::Connected {
            return Err(WebSocketError::NotConnected);
        }

        loop {
            match self.stream.next().await {
                Some(Ok(msg)) => {
                    self.last_activity = Instant::now();
                    match msg {
                        Message::Text(text) => return Ok(Some(Frame::Text(text.as_str().to_owned()))),
                        Message::Binary(data) => return Ok(Some(Frame::Binary(data))),
                        Message::Close(_) => {
                            self.state = ConnectionState::Disconnected;
                            return Ok(None);
                        }
                        // tungstenite queues the pong itself
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    }
                }
                Some(Err(e)) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(WebSocketError::ReceiveFailed(e.to_string()));
                }
                None => {
                    self.state = ConnectionState::Disconnected;
                    return Ok(None);
                }
            }
        }
    }

    #[inline(always)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline(always)]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Time since the last inbound frame
    #[inline]
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Close the connection gracefully; errors on an already-dead socket are ignored
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Connected {
            let _ = self.stream.close(None).await;
            self.state = ConnectionState::Disconnected;
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}
