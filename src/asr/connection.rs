//! Message channel to the transcription server

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

/// WebSocket connection as returned by [`connect`]
pub type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bidirectional, ordered message channel owned by one session
#[async_trait]
pub trait Connection: Send {
    /// Send one message
    async fn send(&mut self, msg: Message) -> Result<(), WsError>;

    /// Receive the next message; `None` once the peer has closed the stream
    async fn recv(&mut self) -> Option<Result<Message, WsError>>;

    /// Close the channel
    async fn close(&mut self) -> Result<(), WsError>;
}

#[async_trait]
impl<S> Connection for WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: Message) -> Result<(), WsError> {
        SinkExt::send(self, msg).await
    }

    async fn recv(&mut self) -> Option<Result<Message, WsError>> {
        self.next().await
    }

    async fn close(&mut self) -> Result<(), WsError> {
        WebSocketStream::close(self, None).await
    }
}

/// Open a WebSocket to `endpoint` with no limit on inbound message or frame size
pub(crate) async fn connect(endpoint: &str) -> Result<WsConnection, WsError> {
    let config = WebSocketConfig {
        max_message_size: None,
        max_frame_size: None,
        ..Default::default()
    };

    tracing::info!("Connecting to transcription server: {}", endpoint);
    let (ws_stream, _) = connect_async_with_config(endpoint, Some(config), false).await?;
    tracing::info!("WebSocket connected successfully");

    Ok(ws_stream)
}

/// Whether a receive error only means the peer already finished the closing handshake
pub(crate) fn is_clean_close(err: &WsError) -> bool {
    matches!(err, WsError::ConnectionClosed | WsError::AlreadyClosed)
}
