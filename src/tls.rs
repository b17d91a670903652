//! TLS context construction (C10, ambient): loads the operator-provided
//! certificate/key PEM files and builds the `rustls` configs both roles
//! need for mutual TLS (§4.10).
//!
//! The allow-list (§4.7), not the certificate chain, is this system's trust
//! root: neither side validates the other's chain against a root store. The
//! server requests a client certificate but does not make the TLS layer
//! reject the handshake if one is missing — it accepts whatever chain (or
//! absence of one) the client presents and lets [`crate::admission`] make
//! the real trust decision, including the "no certificate" rejection,
//! after the handshake completes, so that rejection can close the
//! WebSocket gracefully with a reason instead of failing as a bare TLS
//! alert. Skipping chain validation this way follows the same "dangerous"
//! custom-verifier pattern other WebSocket clients in this tree use to pin
//! trust outside of `rustls`'s own root-store machinery, generalized here
//! to also cover the server's client-auth verifier.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls;

/// Errors building a TLS context from the operator's certificate/key files.
#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    /// The certificate or key file could not be read.
    #[error("could not read {path}: {source}")]
    Io {
        /// Path that failed to read.
        path: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// The PEM contents did not contain a parseable certificate chain.
    #[error("no certificates found in {0}")]
    NoCertificates(String),
    /// The PEM contents did not contain a parseable private key.
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    /// `rustls` rejected the assembled configuration.
    #[error("rustls configuration error: {0}")]
    Rustls(#[from] rustls::Error),
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsConfigError> {
    std::fs::read(path).map_err(|source| TlsConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Parses every certificate in a PEM file into a DER chain, leaf first.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let bytes = read_file(path)?;
    let certs = rustls_pemfile::certs(&mut bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsConfigError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

/// Parses the first private key (PKCS#8 or PKCS#1/SEC1) in a PEM file.
fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    let bytes = read_file(path)?;
    rustls_pemfile::private_key(&mut bytes.as_slice())
        .map_err(|source| TlsConfigError::Io {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| TlsConfigError::NoPrivateKey(path.display().to_string()))
}

/// A [`ClientCertVerifier`] that requests a client certificate but never
/// validates its chain against a root store — only that the handshake
/// signature itself is genuine (i.e. the peer really holds the private key
/// for the certificate it presented). Identity trust is delegated entirely
/// to [`crate::admission`]'s allow-list check, which runs after the
/// handshake completes.
///
/// `client_auth_mandatory` is deliberately `false`: `rustls` would
/// otherwise reject a certless handshake with a bare TLS alert before any
/// WebSocket connection exists, which would bypass the graceful
/// "Client certificate required" close §4.7 step 1 requires. Letting the
/// handshake complete and rejecting the missing certificate in
/// [`crate::admission::admit`] keeps that rejection on the protocol's own
/// close-with-reason path instead of a raw TLS failure.
#[derive(Debug)]
struct AnyClientCert {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl ClientCertVerifier for AnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
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
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
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

/// A [`rustls::client::danger::ServerCertVerifier`] with the same "require
/// a certificate, don't chain-validate it" policy as [`AnyClientCert`], for
/// the client side of the handshake (§4.10: "the server identity is not
/// checked beyond TCP reachability").
#[derive(Debug)]
struct AnyServerCert {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for AnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
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
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
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

/// Builds the server's `rustls::ServerConfig`: presents `cert_path`/
/// `key_path` and requires (but does not chain-validate) a client
/// certificate.
///
/// # Errors
///
/// Returns [`TlsConfigError`] if the files cannot be read/parsed or
/// `rustls` rejects the resulting configuration.
pub fn server_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<rustls::ServerConfig>, TlsConfigError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(AnyClientCert {
        provider: Arc::clone(&provider),
    });

    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier as Arc<dyn ClientCertVerifier>)
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![];
    Ok(Arc::new(config))
}

/// Builds the client's `rustls::ClientConfig`: presents `cert_path`/
/// `key_path` as its own certificate and accepts the server's certificate
/// without chain validation (§4.10).
///
/// # Errors
///
/// Returns [`TlsConfigError`] if the files cannot be read/parsed or
/// `rustls` rejects the resulting configuration.
pub fn client_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<rustls::ClientConfig>, TlsConfigError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(AnyServerCert {
        provider: Arc::clone(&provider),
    });

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(certs, key)
        .map_err(TlsConfigError::Rustls)?;
    config.alpn_protocols = vec![];
    Ok(Arc::new(config))
}
