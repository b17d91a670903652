//! End-to-end coverage (§8): a real [`GatewayServer`] bound to an ephemeral
//! loopback port, driven either by the real client dialer
//! (`portcullis::client::run`) or by a scriptable fake peer that speaks the
//! wire protocol directly so buffering/overflow/round-robin timing can be
//! controlled precisely.

use portcullis::admission::subject_public_key_sha1;
use portcullis::allowlist::AllowList;
use portcullis::channel::ControlChannel;
use portcullis::client::{run as run_client, ClientConfig, ClientError, ProxyRule};
use portcullis::frame::{decode_bind_payload, encode_bind_payload, BindAckPayload, Frame, FrameType};
use portcullis::server::{GatewayServer, ServerConfig};
use portcullis::tls;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;

type FakePeer = ControlChannel<tokio_rustls::client::TlsStream<TcpStream>>;

/// A [`tokio_rustls::rustls::client::danger::ServerCertVerifier`] that
/// accepts whatever certificate the server presents without validating
/// its chain, mirroring the trust model `portcullis::tls` uses in
/// production (the allow-list, not the chain, is the trust root) but
/// built locally here so this test can dial in without ever presenting a
/// client certificate — something `portcullis::tls::client_config`
/// doesn't allow, since it always attaches one.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<tokio_rustls::rustls::crypto::CryptoProvider>,
}

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<tokio_rustls::rustls::client::danger::ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<tokio_rustls::rustls::client::danger::HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        tokio_rustls::rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<tokio_rustls::rustls::client::danger::HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        tokio_rustls::rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// A TLS client config that presents no client certificate at all, for
/// exercising admission's "no certificate" rejection path.
fn certless_client_config() -> Arc<tokio_rustls::rustls::ClientConfig> {
    let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
    let verifier = Arc::new(AcceptAnyServerCert {
        provider: Arc::clone(&provider),
    });
    let config = tokio_rustls::rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Arc::new(config)
}

struct CertPair {
    cert_path: PathBuf,
    key_path: PathBuf,
    digest: String,
}

fn write_self_signed(dir: &Path, name: &str) -> CertPair {
    let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();

    let cert_path = dir.join(format!("{name}-cert.pem"));
    let key_path = dir.join(format!("{name}-key.pem"));
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

    let der = CertificateDer::from(cert.der().to_vec());
    let digest = subject_public_key_sha1(&der).unwrap();
    CertPair { cert_path, key_path, digest }
}

/// Starts a real `GatewayServer` on an ephemeral loopback port, with
/// `authorized` as the only allow-listed client key hashes. Returns the
/// bound address; the serve loop runs in a background task for the
/// lifetime of the test runtime.
async fn start_server(dir: &Path, authorized: &[&str]) -> SocketAddr {
    let server_certs = write_self_signed(dir, "server");
    let tls_config = tls::server_config(&server_certs.cert_path, &server_certs.key_path).unwrap();

    let allow_path = dir.join("allowlist.txt");
    std::fs::write(&allow_path, authorized.join("\n")).unwrap();
    let allow_list = Arc::new(AllowList::load(&allow_path).unwrap());

    let server = Arc::new(GatewayServer::new(ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        tls: tls_config,
        allow_list,
    }));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&server).serve(listener));
    addr
}

/// Connects a fake protocol peer to `addr` as `client`, completing the TLS
/// and WebSocket handshakes but speaking no protocol traffic yet.
async fn dial_fake_peer(addr: SocketAddr, client: &CertPair) -> FakePeer {
    let tls_config = tls::client_config(&client.cert_path, &client.key_path).unwrap();
    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let tls_stream = TlsConnector::from(tls_config).connect(server_name, tcp).await.unwrap();
    let url = format!("wss://localhost:{}/", addr.port());
    let (ws, _response) = tokio_tungstenite::client_async(url, tls_stream).await.unwrap();
    ControlChannel::new(ws)
}

/// Sends a `BIND` for `host:port` as link 0 and waits for the `BIND_ACK`,
/// transparently answering any `PING`s that arrive first.
async fn bind(peer: &FakePeer, host: &str, port: u16) -> BindAckPayload {
    peer.send_frame(&Frame::new(FrameType::Bind, 0, encode_bind_payload(host, port)))
        .await
        .unwrap();
    loop {
        let frame = peer.recv_frame().await.unwrap().expect("channel closed during bind");
        match frame.frame_type() {
            Some(FrameType::BindAck) => return serde_json::from_slice(&frame.payload).unwrap(),
            Some(FrameType::Ping) => {
                peer.send_frame(&Frame::empty(FrameType::Pong, 0)).await.unwrap();
            }
            other => panic!("unexpected frame while awaiting BIND_ACK: {other:?}"),
        }
    }
}

/// Waits for the next frame of `want`'s type, transparently answering
/// `PING`s and ignoring anything else in between.
async fn recv_until(peer: &FakePeer, want: FrameType) -> Frame {
    loop {
        let frame = peer.recv_frame().await.unwrap().expect("channel closed unexpectedly");
        match frame.frame_type() {
            Some(FrameType::Ping) => {
                peer.send_frame(&Frame::empty(FrameType::Pong, 0)).await.unwrap();
            }
            Some(t) if t == want => return frame,
            _ => {}
        }
    }
}

async fn connect_retrying(addr: SocketAddr) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("could not connect to {addr} after retrying");
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_bind_and_echo_via_real_client() {
    let dir = tempfile::tempdir().unwrap();
    let client_certs = write_self_signed(dir.path(), "client");
    let addr = start_server(dir.path(), &[client_certs.digest.as_str()]).await;

    let local_echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local_echo.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = local_echo.accept().await.unwrap();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let bind_port = 19101;
    let client_tls = tls::client_config(&client_certs.cert_path, &client_certs.key_path).unwrap();
    let config = ClientConfig {
        remote_host: "localhost".to_string(),
        remote_port: addr.port(),
        tls: client_tls,
        rule: ProxyRule {
            bind_host: "127.0.0.1".to_string(),
            bind_port,
            local_host: local_addr.ip().to_string(),
            local_port: local_addr.port(),
        },
    };
    tokio::spawn(run_client(config));

    let mut external = connect_retrying(format!("127.0.0.1:{bind_port}").parse().unwrap()).await;
    external.write_all(b"hello, gateway").await.unwrap();
    let mut buf = [0u8; 64];
    let n = external.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello, gateway");
}

#[tokio::test(flavor = "multi_thread")]
async fn early_data_is_buffered_until_open_is_confirmed() {
    let dir = tempfile::tempdir().unwrap();
    let client_certs = write_self_signed(dir.path(), "client");
    let addr = start_server(dir.path(), &[client_certs.digest.as_str()]).await;
    let peer = dial_fake_peer(addr, &client_certs).await;

    let bind_port = 19102;
    let ack = bind(&peer, "127.0.0.1", bind_port).await;
    assert!(ack.success);

    let mut external = connect_retrying(format!("127.0.0.1:{bind_port}").parse().unwrap()).await;
    let payload = vec![b'x'; 512 * 1024];
    external.write_all(&payload).await.unwrap();

    // Give the server a moment to read it all into the link's early buffer
    // before we confirm the OPEN; none of it should reach us yet.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let open = recv_until(&peer, FrameType::Open).await;
    let link_id = open.link_id;
    peer.send_frame(&Frame::empty(FrameType::Open, link_id)).await.unwrap();

    let mut received = Vec::new();
    while received.len() < payload.len() {
        let frame = recv_until(&peer, FrameType::Data).await;
        assert_eq!(frame.link_id, link_id);
        received.extend_from_slice(&frame.payload);
    }
    assert_eq!(received, payload);
}

#[tokio::test(flavor = "multi_thread")]
async fn early_data_overflow_closes_the_link_but_not_the_channel() {
    let dir = tempfile::tempdir().unwrap();
    let client_certs = write_self_signed(dir.path(), "client");
    let addr = start_server(dir.path(), &[client_certs.digest.as_str()]).await;
    let peer = dial_fake_peer(addr, &client_certs).await;

    let bind_port = 19103;
    let ack = bind(&peer, "127.0.0.1", bind_port).await;
    assert!(ack.success);

    let mut external = connect_retrying(format!("127.0.0.1:{bind_port}").parse().unwrap()).await;
    // More than EARLY_BUFFER_CAP (1 MiB) while the link sits unconfirmed. The
    // server stops reading as soon as it detects overflow, so the write side
    // can end up blocked on a full socket buffer afterward; run it in the
    // background rather than block this test on it.
    tokio::spawn(async move {
        let chunk = vec![b'y'; 256 * 1024];
        for _ in 0..8 {
            if external.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });

    let open = recv_until(&peer, FrameType::Open).await;
    let link_id = open.link_id;
    let close = recv_until(&peer, FrameType::Close).await;
    assert_eq!(close.link_id, link_id);

    // The control channel itself must still be usable: a fresh BIND on a
    // different port should succeed.
    let second_ack = bind(&peer, "127.0.0.1", bind_port + 1).await;
    assert!(second_ack.success);
}

#[tokio::test(flavor = "multi_thread")]
async fn admission_rejects_an_unlisted_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let listed = write_self_signed(dir.path(), "listed");
    let unlisted = write_self_signed(dir.path(), "unlisted");
    let addr = start_server(dir.path(), &[listed.digest.as_str()]).await;

    let tls_config = tls::client_config(&unlisted.cert_path, &unlisted.key_path).unwrap();
    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let tls_stream = TlsConnector::from(tls_config).connect(server_name, tcp).await.unwrap();
    let url = format!("wss://localhost:{}/", addr.port());
    let (mut ws, _response) = tokio_tungstenite::client_async(url, tls_stream).await.unwrap();

    use futures_util::StreamExt;
    let message = ws.next().await.unwrap().unwrap();
    match message {
        tokio_tungstenite::tungstenite::Message::Close(Some(frame)) => {
            let code: u16 = frame.code.into();
            assert_eq!(code, 1001);
            assert_eq!(frame.reason.to_string(), "Client certificate not whitelisted");
        }
        other => panic!("expected a close frame, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn admission_rejects_a_connection_with_no_client_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path(), &[]).await;

    let tls_config = certless_client_config();
    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let tls_stream = TlsConnector::from(tls_config).connect(server_name, tcp).await.unwrap();
    let url = format!("wss://localhost:{}/", addr.port());
    let (mut ws, _response) = tokio_tungstenite::client_async(url, tls_stream).await.unwrap();

    use futures_util::StreamExt;
    let message = ws.next().await.unwrap().unwrap();
    match message {
        tokio_tungstenite::tungstenite::Message::Close(Some(frame)) => {
            let code: u16 = frame.code.into();
            assert_eq!(code, 1001);
            assert_eq!(frame.reason.to_string(), "Client certificate required");
        }
        other => panic!("expected a close frame, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn shared_bind_round_robins_between_two_clients() {
    let dir = tempfile::tempdir().unwrap();
    let client_a = write_self_signed(dir.path(), "a");
    let client_b = write_self_signed(dir.path(), "b");
    let addr = start_server(dir.path(), &[client_a.digest.as_str(), client_b.digest.as_str()]).await;

    let peer_a = dial_fake_peer(addr, &client_a).await;
    let peer_b = dial_fake_peer(addr, &client_b).await;

    let bind_port = 19105;
    assert!(bind(&peer_a, "127.0.0.1", bind_port).await.success);
    assert!(bind(&peer_b, "127.0.0.1", bind_port).await.success);

    let _first_external = connect_retrying(format!("127.0.0.1:{bind_port}").parse().unwrap()).await;
    let _second_external = connect_retrying(format!("127.0.0.1:{bind_port}").parse().unwrap()).await;

    let first_open = tokio::time::timeout(Duration::from_secs(2), recv_until(&peer_a, FrameType::Open));
    let second_open = tokio::time::timeout(Duration::from_secs(2), recv_until(&peer_b, FrameType::Open));
    let (first, second) = tokio::join!(first_open, second_open);
    first.expect("first participant never saw an OPEN");
    second.expect("second participant never saw an OPEN");
}

#[tokio::test(start_paused = true)]
async fn client_exits_non_zero_on_heartbeat_starvation() {
    let dir = tempfile::tempdir().unwrap();
    let server_certs = write_self_signed(dir.path(), "server");
    let client_certs = write_self_signed(dir.path(), "client");

    let server_tls = tls::server_config(&server_certs.cert_path, &server_certs.key_path).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // A bare-bones fake server: accept one connection, ack the BIND, then
    // never send another frame, so the client's heartbeat watchdog fires.
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(server_tls);
        let tls_stream = acceptor.accept(socket).await.unwrap();
        let ws = tokio_tungstenite::accept_async(tls_stream).await.unwrap();
        let peer: ControlChannel<_> = ControlChannel::new(ws);
        let bind_frame = peer.recv_frame().await.unwrap().unwrap();
        assert_eq!(bind_frame.frame_type(), Some(FrameType::Bind));
        let (_host, _port) = decode_bind_payload(&bind_frame.payload).unwrap();
        peer.send_frame(&Frame::new(FrameType::BindAck, bind_frame.link_id, BindAckPayload::ok().to_bytes()))
            .await
            .unwrap();
        // Hold the connection open without ever pinging again.
        tokio::time::sleep(Duration::from_secs(3600)).await;
    });

    let client_tls = tls::client_config(&client_certs.cert_path, &client_certs.key_path).unwrap();
    let config = ClientConfig {
        remote_host: "localhost".to_string(),
        remote_port: addr.port(),
        tls: client_tls,
        rule: ProxyRule {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 19106,
            local_host: "127.0.0.1".to_string(),
            local_port: 19107,
        },
    };

    let err = run_client(config).await;
    assert!(matches!(err, ClientError::HeartbeatTimeout));
}
