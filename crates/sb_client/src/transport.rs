//! Transport abstraction.
//!
//! The connection logic is written against [`Transport`] so tests can run
//! over in-process channels; production uses [`WsTransport`], a thin wrapper
//! over tokio-tungstenite. Framing, TLS, and reconnection policy all live
//! below this seam.

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::ClientError;

/// One bidirectional text-frame channel.
///
/// `send` may be called from any task; `recv` is only ever called from the
/// connection's single reader task.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: String) -> Result<(), ClientError>;

    /// Next inbound text frame. `None` means the channel is closed.
    async fn recv(&self) -> Option<Result<String, ClientError>>;

    /// Close the channel. Idempotent; errors are swallowed, the caller is
    /// tearing down regardless.
    async fn close(&self);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport over tokio-tungstenite.
pub struct WsTransport {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

impl WsTransport {
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        debug!(url, "dialing websocket");
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let (sink, stream) = ws.split();
        Ok(Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, frame: String) -> Result<(), ClientError> {
        self.sink
            .lock()
            .await
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn recv(&self) -> Option<Result<String, ClientError>> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Close(_)) => return None,
                // Pings are answered by tungstenite internally.
                Ok(_) => continue,
                Err(e) => return Some(Err(ClientError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.send(Message::Close(None)).await;
    }
}
