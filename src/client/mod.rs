//! Client dialer (C8): connects to the gateway server, issues a single
//! `BIND` for the configured proxy rule, and then serves `OPEN` requests by
//! dialing the local destination and relaying bytes (§4.8).
//!
//! The client never reconnects with stream continuity (§4.8/§9): any
//! channel loss, bind refusal, or heartbeat starvation is fatal and ends
//! [`run`] with an error. The caller (see `src/bin/client.rs`) turns that
//! into a non-zero process exit; an external supervisor is expected to
//! restart the process from scratch.

pub mod error;
pub mod rule;

pub use error::ClientError;
pub use rule::{ProxyRule, RuleParseError};

use crate::channel::ControlChannel;
use crate::frame::{encode_bind_payload, BindAckPayload, Frame, FrameType};
use crate::heartbeat::{ClientHeartbeat, SILENCE_DEADLINE};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Collaborators [`run`] needs: the remote control endpoint, the client's
/// mutual-TLS config, and the single proxy rule parsed from the CLI.
pub struct ClientConfig {
    /// Gateway server host to connect to.
    pub remote_host: String,
    /// Gateway server port.
    pub remote_port: u16,
    /// `rustls::ClientConfig` built by [`crate::tls::client_config`].
    pub tls: Arc<tokio_rustls::rustls::ClientConfig>,
    /// The one proxy rule this client instance serves.
    pub rule: ProxyRule,
}

/// A command routed to a link's forwarding task by the reader loop.
enum LinkCommand {
    /// A `DATA` frame arrived for this link; write it to the local socket.
    Data(Bytes),
    /// A `CLOSE` frame arrived (or the channel is tearing down); end the
    /// task without emitting another `CLOSE`.
    Close,
}

#[derive(Default)]
struct LinkTasks {
    senders: parking_lot::Mutex<HashMap<u32, mpsc::UnboundedSender<LinkCommand>>>,
}

impl LinkTasks {
    fn insert(&self, link_id: u32, tx: mpsc::UnboundedSender<LinkCommand>) {
        self.senders.lock().insert(link_id, tx);
    }

    fn remove(&self, link_id: u32) -> Option<mpsc::UnboundedSender<LinkCommand>> {
        self.senders.lock().remove(&link_id)
    }

    fn send(&self, link_id: u32, cmd: LinkCommand) {
        let sender = self.senders.lock().get(&link_id).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(cmd);
        } else {
            warn!(link_id, "frame for unknown link id, dropping");
        }
    }
}

/// Connects, binds, and serves forever until a fatal condition ends the
/// channel. Always returns an error: per §6, the client never exits 0.
pub async fn run(config: ClientConfig) -> ClientError {
    match run_inner(&config).await {
        Ok(()) => ClientError::ChannelClosed,
        Err(e) => e,
    }
}

async fn run_inner(config: &ClientConfig) -> Result<(), ClientError> {
    let channel = dial(config).await?;
    info!(host = %config.remote_host, port = config.remote_port, "connected to gateway server");

    let bind_link_id = 0;
    let payload = encode_bind_payload(&config.rule.bind_host, config.rule.bind_port);
    channel
        .send_frame(&Frame::new(FrameType::Bind, bind_link_id, payload))
        .await?;

    let ack = await_bind_ack(&channel, bind_link_id).await?;
    if !ack.success {
        return Err(ClientError::BindRefused(
            ack.error.unwrap_or_else(|| "no reason given".to_string()),
        ));
    }
    info!(
        bind_host = %config.rule.bind_host,
        bind_port = config.rule.bind_port,
        "bind acknowledged, serving OPEN requests"
    );

    serve(config, channel).await
}

async fn dial(
    config: &ClientConfig,
) -> Result<ControlChannel<tokio_rustls::client::TlsStream<TcpStream>>, ClientError> {
    let addr = format!("{}:{}", config.remote_host, config.remote_port);
    let tcp = TcpStream::connect(&addr)
        .await
        .map_err(|source| ClientError::Connect {
            addr: addr.clone(),
            source,
        })?;

    let server_name = ServerName::try_from(config.remote_host.clone())
        .map_err(|_| ClientError::InvalidServerName(config.remote_host.clone()))?;
    let connector = TlsConnector::from(Arc::clone(&config.tls));
    let tls_stream = connector.connect(server_name, tcp).await?;

    let url = format!("wss://{}:{}/", config.remote_host, config.remote_port);
    let (ws_stream, _response) = tokio_tungstenite::client_async(url, tls_stream).await?;
    Ok(ControlChannel::new(ws_stream))
}

async fn await_bind_ack<S>(
    channel: &ControlChannel<S>,
    expected_link_id: u32,
) -> Result<BindAckPayload, ClientError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        match channel.recv_frame().await? {
            Some(frame)
                if frame.frame_type() == Some(FrameType::BindAck) && frame.link_id == expected_link_id =>
            {
                return Ok(serde_json::from_slice(&frame.payload)?);
            }
            Some(frame) if frame.frame_type() == Some(FrameType::Ping) => {
                channel.send_frame(&Frame::empty(FrameType::Pong, 0)).await?;
            }
            Some(_) => {}
            None => return Err(ClientError::ChannelClosedDuringBind),
        }
    }
}

async fn serve<S>(config: &ClientConfig, channel: ControlChannel<S>) -> Result<(), ClientError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let links = Arc::new(LinkTasks::default());
    let mut heartbeat = ClientHeartbeat::new(Instant::now());
    let mut watchdog = tokio::time::interval(SILENCE_DEADLINE / 3);

    loop {
        tokio::select! {
            frame = channel.recv_frame() => {
                let Some(frame) = frame? else {
                    return Err(ClientError::ChannelClosed);
                };
                handle_frame(config, &channel, &links, &mut heartbeat, frame).await?;
            }
            _ = watchdog.tick() => {
                if heartbeat.is_starved(Instant::now()) {
                    warn!("no PING received within the heartbeat deadline, exiting");
                    return Err(ClientError::HeartbeatTimeout);
                }
            }
        }
    }
}

async fn handle_frame<S>(
    config: &ClientConfig,
    channel: &ControlChannel<S>,
    links: &Arc<LinkTasks>,
    heartbeat: &mut ClientHeartbeat,
    frame: Frame,
) -> Result<(), ClientError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    match frame.frame_type() {
        Some(FrameType::Ping) => {
            heartbeat.on_ping(Instant::now());
            channel.send_frame(&Frame::empty(FrameType::Pong, 0)).await?;
        }
        Some(FrameType::Pong) => {}
        Some(FrameType::Open) => {
            on_open(config, channel, links, frame.link_id).await?;
        }
        Some(FrameType::Close) => {
            if let Some(tx) = links.remove(frame.link_id) {
                let _ = tx.send(LinkCommand::Close);
            }
        }
        Some(FrameType::Data) => {
            links.send(frame.link_id, LinkCommand::Data(frame.payload));
        }
        Some(FrameType::Bind | FrameType::BindAck) => {
            debug!(link_id = frame.link_id, "ignoring post-startup BIND traffic");
        }
        None => {
            warn!(raw_type = frame.raw_type, "unknown frame type, dropping");
        }
    }
    Ok(())
}

async fn on_open<S>(
    config: &ClientConfig,
    channel: &ControlChannel<S>,
    links: &Arc<LinkTasks>,
    link_id: u32,
) -> Result<(), ClientError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let addr = format!("{}:{}", config.rule.local_host, config.rule.local_port);
    match TcpStream::connect(&addr).await {
        Ok(socket) => {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            links.insert(link_id, cmd_tx);
            channel.send_frame(&Frame::empty(FrameType::Open, link_id)).await?;
            let channel = channel.clone();
            let links = Arc::clone(links);
            tokio::spawn(async move {
                serve_local_link(link_id, socket, channel, links, cmd_rx).await;
            });
            Ok(())
        }
        Err(e) => {
            warn!(link_id, %addr, error = %e, "local dial failed, closing link");
            channel.send_frame(&Frame::empty(FrameType::Close, link_id)).await
        }
    }
}

/// The forwarding task for one client-owned local socket: relays bytes
/// read from the socket as `DATA` frames, and writes inbound `DATA` frames
/// back to the socket. The client never buffers early data (§4.4: it only
/// enters `READY` once the dial has already succeeded), so there is no
/// `Opening` state to model here, unlike [`crate::server`]'s counterpart.
async fn serve_local_link<S>(
    link_id: u32,
    socket: TcpStream,
    channel: ControlChannel<S>,
    links: Arc<LinkTasks>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut read_half, mut write_half) = socket.into_split();
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            read_result = read_half.read(&mut buf) => {
                match read_result {
                    Ok(0) => {
                        links.remove(link_id);
                        let _ = channel.send_frame(&Frame::empty(FrameType::Close, link_id)).await;
                        break;
                    }
                    Ok(n) => {
                        let bytes = Bytes::copy_from_slice(&buf[..n]);
                        if channel.send_frame(&Frame::new(FrameType::Data, link_id, bytes)).await.is_err() {
                            links.remove(link_id);
                            break;
                        }
                    }
                    Err(_) => {
                        links.remove(link_id);
                        let _ = channel.send_frame(&Frame::empty(FrameType::Close, link_id)).await;
                        break;
                    }
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(LinkCommand::Data(bytes)) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            links.remove(link_id);
                            let _ = channel.send_frame(&Frame::empty(FrameType::Close, link_id)).await;
                            break;
                        }
                    }
                    Some(LinkCommand::Close) | None => break,
                }
            }
        }
    }
}
