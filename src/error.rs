//! Crate-wide error type for the parts of the gateway that are not scoped
//! to a single module (the client and server binaries mostly surface this
//! one). Module-local concerns get their own `thiserror` enum instead of
//! being folded in here — see [`crate::client::error`],
//! [`crate::bind::BindError`], and [`crate::frame::DecodeError`].

use thiserror::Error;

/// Top-level error returned by setup and glue code (TLS context
/// construction, allow-list loading, control-address resolution).
#[derive(Debug, Error)]
pub enum Error {
    /// Failure reading or parsing a certificate/key file.
    #[error("TLS configuration error: {0}")]
    Tls(#[from] crate::tls::TlsConfigError),

    /// Failure loading or watching the allow-list file.
    #[error("allow-list error: {0}")]
    AllowList(#[from] crate::admission::AllowListError),

    /// Underlying I/O failure (bind, accept, connect).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A configured `host:port` did not resolve to any address.
    #[error("{host_port} did not resolve to any address")]
    UnresolvedAddress {
        /// The `host:port` string that failed to resolve.
        host_port: String,
    },
}

/// Convenience alias for fallible setup operations.
pub type Result<T> = std::result::Result<T, Error>;
