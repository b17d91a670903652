//! `portcullis-client`: connects to a gateway server, binds one public
//! endpoint, and relays accepted connections to a local TCP destination
//! (C8/C11). Crash-only: any fatal condition exits non-zero and relies on
//! an external supervisor to restart the process.

use clap::Parser;
use portcullis::client::{ClientConfig, ProxyRule};
use portcullis::tls;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

/// Secure reverse-tunneling gateway client.
#[derive(Parser, Debug)]
#[command(name = "portcullis-client", about = "Secure reverse-tunneling gateway client")]
struct Cli {
    /// Path to the client's TLS private key (PEM).
    #[arg(short = 'k', long = "ssl-key", env = "CLIENT_KEY_PATH")]
    ssl_key: PathBuf,

    /// Path to the client's TLS certificate chain (PEM).
    #[arg(short = 'c', long = "ssl-crt", env = "CLIENT_CERT_PATH")]
    ssl_crt: PathBuf,

    /// Gateway server host.
    #[arg(short = 'h', long = "host", env = "REMOTE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Gateway server port.
    #[arg(short = 'p', long = "port", env = "REMOTE_PORT", default_value_t = 8000)]
    port: u16,

    /// `<bind_host>:<bind_port>:<local_host>:<local_port>`.
    rule: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let rule = match ProxyRule::parse(&cli.rule) {
        Ok(rule) => rule,
        Err(e) => {
            error!(rule = %cli.rule, error = %e, "invalid proxy rule");
            return ExitCode::FAILURE;
        }
    };

    let tls_config = match tls::client_config(&cli.ssl_crt, &cli.ssl_key) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "could not build TLS client config");
            return ExitCode::FAILURE;
        }
    };

    let config = ClientConfig {
        remote_host: cli.host,
        remote_port: cli.port,
        tls: tls_config,
        rule,
    };

    let err = portcullis::client::run(config).await;
    error!(error = %err, "client exiting");
    ExitCode::FAILURE
}
