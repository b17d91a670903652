//! Server front (C9): accepts TLS-wrapped WebSocket connections, runs
//! admission (C7), and wires each admitted channel to its own stream
//! registry (C4/C5), heartbeat (C3), and bind participation (C6).
//!
//! One [`GatewayServer`] owns the process-wide [`BindRegistry`] and
//! [`AllowList`]; every accepted connection becomes one [`ClientConnection`]
//! task tree: a heartbeat ticker, a control-channel reader loop, and one
//! forwarding task per live link.

use crate::admission::{self, AdmissionError, REJECTION_CLOSE_CODE};
use crate::allowlist::AllowList;
use crate::bind::{BindError, BindRegistry, ClientId};
use crate::channel::{ChannelError, ControlChannel};
use crate::frame::{decode_bind_payload, BindAckPayload, Frame, FrameType};
use crate::heartbeat::{ServerHeartbeat, Tick, PING_INTERVAL};
use crate::ids::LiveIds;
use crate::link::{Link, PushOutcome};
use crate::registry::LinkRegistry;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Listen address and collaborators a [`GatewayServer`] needs to run.
pub struct ServerConfig {
    /// Address to accept control-channel connections on.
    pub bind_addr: SocketAddr,
    /// `rustls::ServerConfig` built by [`crate::tls::server_config`].
    pub tls: Arc<tokio_rustls::rustls::ServerConfig>,
    /// Allow-list admission checks against (§4.7).
    pub allow_list: Arc<AllowList>,
}

/// The gateway server: one TLS listener, fanned out to one task tree per
/// admitted client.
pub struct GatewayServer {
    config: ServerConfig,
    bind_registry: Arc<BindRegistry>,
    next_client_id: AtomicU64,
}

/// A command routed to a link's forwarding task by the control-channel
/// reader loop.
enum LinkCommand {
    /// A `DATA` frame arrived for this link; write it to the owned socket.
    Data(Bytes),
    /// A `CLOSE` frame arrived for this link (or the channel is tearing
    /// down); end the task without emitting another `CLOSE`.
    Close,
}

/// Per-connection state the control-channel reader loop needs beyond the
/// link registry itself: a sender into each live link's forwarding task.
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

    fn drain(&self) -> Vec<mpsc::UnboundedSender<LinkCommand>> {
        self.senders.lock().drain().map(|(_, tx)| tx).collect()
    }
}

impl GatewayServer {
    /// Builds a server from `config`. Does not bind the listener yet; call
    /// [`Self::run`].
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            bind_registry: Arc::new(BindRegistry::new()),
            next_client_id: AtomicU64::new(0),
        }
    }

    /// Accepts connections forever. Each connection is handled on its own
    /// task; a failure admitting or serving one connection never brings
    /// down the listener.
    ///
    /// # Errors
    ///
    /// Returns an I/O error only if the listener itself cannot be bound.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Binds the configured address without serving yet, so callers (tests,
    /// mainly) can read back the actual bound address when the configured
    /// port is `0`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the listener cannot be bound.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(self.config.bind_addr).await
    }

    /// Accepts connections on an already-bound `listener` forever. See
    /// [`Self::run`] for the all-in-one entry point.
    ///
    /// # Errors
    ///
    /// Never returns `Err` in practice: individual accept failures are
    /// logged and the loop continues. The signature stays fallible so a
    /// future change (e.g. a listener-level fatal error) has somewhere to
    /// put it.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %self.config.bind_addr, "gateway server listening");
        let acceptor = TlsAcceptor::from(Arc::clone(&self.config.tls));

        loop {
            let (socket, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let server = Arc::clone(&self);
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(socket, peer_addr, acceptor).await {
                    warn!(%peer_addr, error = %e, "control channel ended with an error");
                }
            });
        }
    }

    async fn handle_connection(
        &self,
        socket: TcpStream,
        peer_addr: SocketAddr,
        acceptor: TlsAcceptor,
    ) -> Result<(), ChannelError> {
        let tls_stream = match acceptor.accept(socket).await {
            Ok(s) => s,
            Err(e) => {
                debug!(%peer_addr, error = %e, "TLS handshake failed");
                return Ok(());
            }
        };
        let peer_certs = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .map(<[_]>::to_vec)
            .unwrap_or_default();

        let ws_stream = tokio_tungstenite::accept_async(tls_stream).await?;
        let channel = ControlChannel::new(ws_stream);

        let digest = match admission::admit(&peer_certs, &self.config.allow_list) {
            Ok(digest) => digest,
            Err(e) => {
                info!(%peer_addr, error = %e, "admission rejected");
                let reason = admission_reason(&e);
                channel.close(REJECTION_CLOSE_CODE, reason).await?;
                return Ok(());
            }
        };

        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        info!(%peer_addr, client_id, %digest, "client admitted");
        self.serve_client(client_id, channel).await
    }

    async fn serve_client<S>(
        &self,
        client_id: ClientId,
        channel: ControlChannel<S>,
    ) -> Result<(), ChannelError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let registry = Arc::new(LinkRegistry::new());
        let ids = Arc::new(LiveIds::new());
        let link_tasks = Arc::new(LinkTasks::default());
        let bind_keys: Arc<parking_lot::Mutex<Vec<String>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let heartbeat = Arc::new(parking_lot::Mutex::new(ServerHeartbeat::new(Instant::now())));

        let heartbeat_task = {
            let channel = channel.clone();
            let heartbeat = Arc::clone(&heartbeat);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PING_INTERVAL);
                ticker.tick().await; // first tick fires immediately; skip it
                loop {
                    ticker.tick().await;
                    if heartbeat.lock().is_silent(Instant::now()) {
                        warn!(client_id, "channel silent past the heartbeat deadline, terminating");
                        let _ = channel.close(1001, "heartbeat timeout").await;
                        break;
                    }
                    let action = heartbeat.lock().tick();
                    match action {
                        Tick::SendPing => {
                            if channel
                                .send_frame(&Frame::empty(FrameType::Ping, 0))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Tick::Terminate => {
                            warn!(client_id, "heartbeat timed out, terminating channel");
                            let _ = channel.close(1001, "heartbeat timeout").await;
                            break;
                        }
                    }
                }
            })
        };

        let result = self
            .reader_loop(client_id, &channel, &registry, &ids, &link_tasks, &bind_keys, &heartbeat)
            .await;

        heartbeat_task.abort();
        for key in bind_keys.lock().drain(..) {
            self.bind_registry.leave(&key, client_id);
        }
        for tx in link_tasks.drain() {
            let _ = tx.send(LinkCommand::Close);
        }
        for link in registry.drain_all() {
            ids.release(link.link_id());
        }
        info!(client_id, "client connection torn down");
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn reader_loop<S>(
        &self,
        client_id: ClientId,
        channel: &ControlChannel<S>,
        registry: &Arc<LinkRegistry>,
        ids: &Arc<LiveIds>,
        link_tasks: &Arc<LinkTasks>,
        bind_keys: &Arc<parking_lot::Mutex<Vec<String>>>,
        heartbeat: &Arc<parking_lot::Mutex<ServerHeartbeat>>,
    ) -> Result<(), ChannelError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            let frame = match channel.recv_frame().await? {
                Some(frame) => frame,
                None => return Ok(()),
            };
            match frame.frame_type() {
                Some(FrameType::Pong) => {
                    heartbeat.lock().note_activity(Instant::now());
                }
                Some(FrameType::Ping) => {
                    heartbeat.lock().note_activity(Instant::now());
                    channel.send_frame(&Frame::empty(FrameType::Pong, 0)).await?;
                }
                Some(FrameType::Open) => {
                    self.on_open_ack(channel, registry, frame.link_id).await?;
                }
                Some(FrameType::Close) => {
                    if let Some(tx) = link_tasks.remove(frame.link_id) {
                        let _ = tx.send(LinkCommand::Close);
                    }
                    if registry.remove(frame.link_id).is_some() {
                        ids.release(frame.link_id);
                    }
                }
                Some(FrameType::Data) => {
                    link_tasks.send(frame.link_id, LinkCommand::Data(frame.payload));
                }
                Some(FrameType::Bind) => {
                    self.on_bind(client_id, channel, link_tasks, registry, ids, bind_keys, frame)
                        .await?;
                }
                Some(FrameType::BindAck) => {
                    warn!(client_id, link_id = frame.link_id, "unexpected BIND_ACK from client, dropping");
                }
                None => {
                    warn!(client_id, raw_type = frame.raw_type, "unknown frame type, dropping");
                }
            }
        }
    }

    async fn on_open_ack<S>(
        &self,
        channel: &ControlChannel<S>,
        registry: &Arc<LinkRegistry>,
        link_id: u32,
    ) -> Result<(), ChannelError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let drained = registry.with_link(link_id, Link::confirm);
        match drained {
            Some(Ok(chunks)) => {
                for chunk in chunks {
                    channel.send_frame(&Frame::new(FrameType::Data, link_id, chunk)).await?;
                }
                Ok(())
            }
            Some(Err(_)) => {
                warn!(link_id, "OPEN ack for a link that is not awaiting confirmation, closing");
                registry.remove(link_id);
                channel.send_frame(&Frame::empty(FrameType::Close, link_id)).await
            }
            None => {
                warn!(link_id, "OPEN ack for unknown link id, dropping");
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_bind<S>(
        &self,
        client_id: ClientId,
        channel: &ControlChannel<S>,
        link_tasks: &Arc<LinkTasks>,
        registry: &Arc<LinkRegistry>,
        ids: &Arc<LiveIds>,
        bind_keys: &Arc<parking_lot::Mutex<Vec<String>>>,
        frame: Frame,
    ) -> Result<(), ChannelError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let link_id = frame.link_id;
        let (host, port) = match decode_bind_payload(&frame.payload) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(client_id, error = %e, "malformed BIND payload");
                let ack = BindAckPayload::failed(e.to_string());
                return channel
                    .send_frame(&Frame::new(FrameType::BindAck, link_id, ack.to_bytes()))
                    .await;
            }
        };
        let key = format!("{host}:{port}");

        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<TcpStream>();
        let outcome = self.bind_registry.bind(key.clone(), client_id, conn_tx).await;
        let ack = match outcome {
            Ok(()) => {
                bind_keys.lock().push(key.clone());
                BindAckPayload::ok()
            }
            Err(BindError::Listen { source, .. }) => BindAckPayload::failed(source.to_string()),
        };
        channel
            .send_frame(&Frame::new(FrameType::BindAck, link_id, ack.to_bytes()))
            .await?;
        if !ack.success {
            return Ok(());
        }

        let channel = channel.clone();
        let registry = Arc::clone(registry);
        let ids = Arc::clone(ids);
        let link_tasks = Arc::clone(link_tasks);
        tokio::spawn(async move {
            while let Some(socket) = conn_rx.recv().await {
                let new_link_id = ids.allocate();
                registry.insert(Link::new(new_link_id));
                let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                link_tasks.insert(new_link_id, cmd_tx);
                if channel
                    .send_frame(&Frame::empty(FrameType::Open, new_link_id))
                    .await
                    .is_err()
                {
                    registry.remove(new_link_id);
                    ids.release(new_link_id);
                    link_tasks.remove(new_link_id);
                    break;
                }
                let channel = channel.clone();
                let registry = Arc::clone(&registry);
                let ids = Arc::clone(&ids);
                let link_tasks = Arc::clone(&link_tasks);
                tokio::spawn(async move {
                    serve_external_link(new_link_id, socket, channel, registry, ids, link_tasks, cmd_rx)
                        .await;
                });
            }
        });

        Ok(())
    }
}

fn admission_reason(err: &AdmissionError) -> &'static str {
    match err {
        AdmissionError::NoCertificate => "Client certificate required",
        AdmissionError::MalformedCertificate => "Client certificate required",
        AdmissionError::NotWhitelisted => "Client certificate not whitelisted",
    }
}

/// The forwarding task for one server-owned external socket: relays bytes
/// read from the socket through the link's early-buffer/confirmation state
/// machine and onto the control channel as `DATA` frames, and writes
/// inbound `DATA` frames back to the socket (§4.4/§4.5).
async fn serve_external_link<S>(
    link_id: u32,
    socket: TcpStream,
    channel: ControlChannel<S>,
    registry: Arc<LinkRegistry>,
    ids: Arc<LiveIds>,
    link_tasks: Arc<LinkTasks>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut read_half, mut write_half) = socket.into_split();
    let mut buf = vec![0u8; 16 * 1024];

    let emit_close_and_cleanup = |registry: &Arc<LinkRegistry>, ids: &Arc<LiveIds>, link_tasks: &Arc<LinkTasks>| {
        link_tasks.remove(link_id);
        if registry.remove(link_id).is_some() {
            ids.release(link_id);
        }
    };

    loop {
        tokio::select! {
            read_result = read_half.read(&mut buf) => {
                match read_result {
                    Ok(0) => {
                        emit_close_and_cleanup(&registry, &ids, &link_tasks);
                        let _ = channel.send_frame(&Frame::empty(FrameType::Close, link_id)).await;
                        break;
                    }
                    Ok(n) => {
                        let bytes = Bytes::copy_from_slice(&buf[..n]);
                        let outcome = registry.with_link(link_id, |link| link.push(bytes));
                        match outcome {
                            Some(PushOutcome::Forward(bytes)) => {
                                if channel.send_frame(&Frame::new(FrameType::Data, link_id, bytes)).await.is_err() {
                                    emit_close_and_cleanup(&registry, &ids, &link_tasks);
                                    break;
                                }
                            }
                            Some(PushOutcome::Buffered) => {}
                            Some(PushOutcome::Overflow) => {
                                warn!(link_id, "early-data buffer overflow, closing link");
                                emit_close_and_cleanup(&registry, &ids, &link_tasks);
                                let _ = channel.send_frame(&Frame::empty(FrameType::Close, link_id)).await;
                                break;
                            }
                            Some(PushOutcome::Dropped) | None => break,
                        }
                    }
                    Err(_) => {
                        emit_close_and_cleanup(&registry, &ids, &link_tasks);
                        let _ = channel.send_frame(&Frame::empty(FrameType::Close, link_id)).await;
                        break;
                    }
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(LinkCommand::Data(bytes)) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            emit_close_and_cleanup(&registry, &ids, &link_tasks);
                            let _ = channel.send_frame(&Frame::empty(FrameType::Close, link_id)).await;
                            break;
                        }
                    }
                    Some(LinkCommand::Close) | None => {
                        break;
                    }
                }
            }
        }
    }
}
