//! `portcullis-server`: accepts mutual-TLS control channels from clients
//! and multiplexes external TCP connections back down to them (C9/C11).

use clap::Parser;
use portcullis::allowlist::AllowList;
use portcullis::server::{GatewayServer, ServerConfig};
use portcullis::{tls, Error};
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

/// Secure reverse-tunneling gateway server.
#[derive(Parser, Debug)]
#[command(name = "portcullis-server", about = "Secure reverse-tunneling gateway server")]
struct Cli {
    /// Address to accept client control channels on.
    #[arg(long, env = "CONTROL_HOST", default_value = "127.0.0.1")]
    control_host: String,

    /// Port to accept client control channels on.
    #[arg(long, env = "CONTROL_PORT", default_value_t = 8000)]
    control_port: u16,

    /// Path to the server's TLS private key (PEM).
    #[arg(long, env = "SERVER_KEY_PATH")]
    server_key_path: PathBuf,

    /// Path to the server's TLS certificate chain (PEM).
    #[arg(long, env = "SERVER_CERT_PATH")]
    server_cert_path: PathBuf,

    /// Path to the newline-delimited allow-listed client key-hash file.
    #[arg(long, env = "AUTHORIZED_CLIENTS")]
    authorized_clients: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server exited");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> portcullis::Result<()> {
    let tls_config = tls::server_config(&cli.server_cert_path, &cli.server_key_path)?;
    let allow_list = Arc::new(AllowList::load(&cli.authorized_clients)?);

    let host_port = format!("{}:{}", cli.control_host, cli.control_port);
    let bind_addr = host_port
        .to_socket_addrs()
        .map_err(Error::Io)?
        .next()
        .ok_or(Error::UnresolvedAddress { host_port })?;

    let server = Arc::new(GatewayServer::new(ServerConfig {
        bind_addr,
        tls: tls_config,
        allow_list,
    }));
    let listener = server.bind().await.map_err(Error::Io)?;
    info!(addr = %listener.local_addr().map_err(Error::Io)?, "listening");

    tokio::select! {
        result = Arc::clone(&server).serve(listener) => result.map_err(Error::Io),
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            Ok(())
        }
    }
}
