//! The control channel (C2): a single full-duplex, ordered,
//! message-framed link between one client and the server.
//!
//! Frames travel as binary WebSocket messages over the mutual-TLS stream.
//! `tokio-tungstenite` gives us message framing for free (one WebSocket
//! message == one [`Frame`]), so this module's only job is to serialize
//! concurrent senders onto the single writer half and decode whatever the
//! reader half hands back.

use crate::frame::Frame;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::warn;

/// Errors surfaced while sending or receiving on a [`ControlChannel`].
///
/// A malformed frame is deliberately *not* a variant here: per §7/§8 it
/// must be logged and dropped without disturbing the channel, so
/// [`ControlChannel::recv_frame`] handles it internally and never surfaces
/// it as an error to its caller.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The underlying WebSocket connection failed or was closed.
    #[error("control channel transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    /// A text, non-close control message arrived; the protocol only uses
    /// binary messages for frames.
    #[error("unexpected non-binary WebSocket message")]
    UnexpectedMessage,
}

/// A single authenticated, message-framed duplex link to one peer.
///
/// Cheaply cloneable: both halves are behind `Arc`-backed async mutexes, so
/// any number of link tasks can hold a clone and call [`Self::send_frame`]
/// concurrently. Sends are serialized through the writer lock, which is
/// what keeps frames sent in one direction delivered in send order (§5).
#[derive(Debug, Clone)]
pub struct ControlChannel<S> {
    inner: std::sync::Arc<Inner<S>>,
}

#[derive(Debug)]
struct Inner<S> {
    writer: Mutex<futures_util::stream::SplitSink<WebSocketStream<S>, Message>>,
    reader: Mutex<futures_util::stream::SplitStream<WebSocketStream<S>>>,
}

impl<S> ControlChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an already-handshaken WebSocket stream.
    #[must_use]
    pub fn new(ws_stream: WebSocketStream<S>) -> Self {
        let (writer, reader) = ws_stream.split();
        Self {
            inner: std::sync::Arc::new(Inner {
                writer: Mutex::new(writer),
                reader: Mutex::new(reader),
            }),
        }
    }

    /// Sends one frame as a binary WebSocket message.
    ///
    /// Safe to call from multiple tasks concurrently: the writer lock
    /// ensures one frame's bytes never interleave with another's.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Transport`] if the underlying send fails.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), ChannelError> {
        let mut writer = self.inner.writer.lock().await;
        writer.send(Message::Binary(frame.encode().to_vec())).await?;
        Ok(())
    }

    /// Receives the next frame.
    ///
    /// Returns `Ok(None)` on a clean WebSocket close. Native WebSocket
    /// ping/pong/close control frames are handled transparently and never
    /// surfaced here; only `Message::Binary` payloads are decoded as
    /// [`Frame`]s (the protocol's own `PING`/`PONG` frame types, §4.3,
    /// travel as ordinary binary messages, not native WS pings).
    ///
    /// A malformed binary message (shorter than the frame header) is
    /// logged and skipped rather than surfaced as an error: per §7/§8 a
    /// `MalformedFrame` must not tear down the channel, so this method
    /// keeps reading until it has a real frame, a clean close, or a
    /// genuine transport failure to report.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::UnexpectedMessage`] if a text message
    /// arrives (the protocol never sends one).
    pub async fn recv_frame(&self) -> Result<Option<Frame>, ChannelError> {
        let mut reader = self.inner.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(Message::Binary(bytes))) => match Frame::decode(&bytes) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => {
                        warn!(error = %e, "malformed frame, dropping");
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Text(_) | Message::Frame(_))) => {
                    return Err(ChannelError::UnexpectedMessage)
                }
                Some(Err(e)) => return Err(ChannelError::Transport(e)),
            }
        }
    }

    /// Initiates a graceful close with a WebSocket close code and reason.
    ///
    /// Per §4.7/§7, admission rejection closes with code 1001
    /// ("Client certificate not whitelisted" / "Client certificate
    /// required").
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Transport`] if the close frame cannot be
    /// sent (the peer may already be gone, which is not itself fatal to
    /// the caller's own teardown).
    pub async fn close(&self, code: u16, reason: impl Into<String>) -> Result<(), ChannelError> {
        let mut writer = self.inner.writer.lock().await;
        writer
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into().into(),
            })))
            .await?;
        writer.close().await?;
        Ok(())
    }
}
