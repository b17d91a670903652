//! Errors the client dialer (C8) can hit connecting to and serving a
//! control channel. Proxy-rule parsing failures surface as [`crate::Error`]
//! instead, since they happen before any network activity.

use thiserror::Error;

/// Why the client dialer gave up and is about to exit non-zero (§4.8/§7:
/// the client is crash-only — every one of these ends the process).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The initial TCP connection to the gateway server failed.
    #[error("could not connect to {addr}: {source}")]
    Connect {
        /// The `host:port` that was attempted.
        addr: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The configured remote host is not a valid DNS name or IP literal,
    /// so TLS's server-name extension cannot be constructed for it.
    #[error("invalid remote host name {0:?}")]
    InvalidServerName(String),

    /// The TLS handshake, or any later socket I/O, failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The WebSocket handshake on top of the TLS stream failed.
    #[error("WebSocket handshake failed: {0}")]
    WebSocketHandshake(#[from] tokio_tungstenite::tungstenite::Error),

    /// The control channel itself failed after the handshake completed.
    #[error("control channel error: {0}")]
    Channel(#[from] crate::channel::ChannelError),

    /// The control channel closed gracefully before a `BIND_ACK` arrived.
    #[error("channel closed before a BIND_ACK was received")]
    ChannelClosedDuringBind,

    /// The control channel closed gracefully while serving `OPEN` requests.
    #[error("control channel closed")]
    ChannelClosed,

    /// The `BIND` request was answered with `success: false`.
    #[error("server refused bind: {0}")]
    BindRefused(String),

    /// No `PING` arrived for the heartbeat silence deadline (§4.3).
    #[error("heartbeat timed out, no PING received")]
    HeartbeatTimeout,

    /// The `BIND_ACK` payload was not valid JSON.
    #[error("malformed BIND_ACK payload: {0}")]
    MalformedBindAck(#[from] serde_json::Error),
}
