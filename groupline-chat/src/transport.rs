//! Socket transport: JSON frames over a WebSocket.
//!
//! The socket is split into a [`FrameSender`] and a [`FrameReceiver`] so the
//! owning worker can write and read from a single `select!` loop. No business
//! logic lives here; callers only see frames, close codes and failures.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::ProtocolError;

/// Socket type produced by [`connect`].
pub type ClientSocket = MaybeTlsStream<TcpStream>;

/// What the receiving half observed.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent<T> {
    /// A well-formed frame.
    Frame(T),
    /// A text message that is not a valid frame. The connection stays usable.
    Malformed(String),
    /// The peer closed the connection, with its close code if one was sent.
    Closed(Option<u16>),
    /// The socket failed.
    Failed(String),
}

/// Writing half of a framed socket.
pub struct FrameSender<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> FrameSender<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Serialize and send one frame.
    pub async fn send<T: Serialize>(&mut self, frame: &T) -> Result<(), ProtocolError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        self.send_text(&text).await
    }

    /// Send an already-encoded frame (fan-out fast path).
    pub async fn send_text(&mut self, text: &str) -> Result<(), ProtocolError> {
        self.sink
            .send(Message::text(text.to_string()))
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))
    }

    /// Send a close frame with `code` and shut the sink.
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<(), ProtocolError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        // The close frame is already out; a failing shutdown changes nothing.
        let _ = self.sink.close().await;
        Ok(())
    }
}

/// Reading half of a framed socket.
pub struct FrameReceiver<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> FrameReceiver<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wait for the next frame, close or failure. Control messages are skipped.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> TransportEvent<T> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return decode_event(text.as_str()),
                Some(Ok(Message::Binary(bytes))) => {
                    return match std::str::from_utf8(&bytes) {
                        Ok(text) => decode_event(text),
                        Err(e) => TransportEvent::Malformed(e.to_string()),
                    };
                }
                Some(Ok(Message::Close(frame))) => {
                    return TransportEvent::Closed(frame.map(|f| u16::from(f.code)));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return TransportEvent::Failed(e.to_string()),
                None => return TransportEvent::Closed(None),
            }
        }
    }
}

fn decode_event<T: DeserializeOwned>(text: &str) -> TransportEvent<T> {
    match serde_json::from_str(text) {
        Ok(frame) => TransportEvent::Frame(frame),
        Err(e) => TransportEvent::Malformed(e.to_string()),
    }
}

/// Split an established WebSocket into framed halves.
pub fn split<S>(ws: WebSocketStream<S>) -> (FrameSender<S>, FrameReceiver<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = ws.split();
    (FrameSender { sink }, FrameReceiver { stream })
}

/// Open a client connection to `url`, giving up after `timeout`.
pub async fn connect(
    url: &str,
    timeout: Duration,
) -> Result<(FrameSender<ClientSocket>, FrameReceiver<ClientSocket>), ProtocolError> {
    let (ws, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| ProtocolError::Timeout)?
        .map_err(|e| ProtocolError::Transport(e.to_string()))?;
    Ok(split(ws))
}

/// Complete the server side of the WebSocket handshake.
pub async fn accept(
    stream: TcpStream,
) -> Result<(FrameSender<TcpStream>, FrameReceiver<TcpStream>), ProtocolError> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| ProtocolError::Transport(e.to_string()))?;
    Ok(split(ws))
}
