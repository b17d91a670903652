//! Admission control (C7, server only): mutual-TLS peer-certificate
//! extraction and the SHA-1 public-key-hash allow-list check (§4.7).
//!
//! The allow-list itself lives in [`crate::allowlist`]; this module only
//! derives the digest a fresh connection should be checked against and
//! applies the policy.

pub use crate::allowlist::AllowListError;
use crate::allowlist::AllowList;
use sha1::{Digest, Sha1};
use tokio_rustls::rustls::pki_types::CertificateDer;

/// WebSocket close code used for every admission rejection (§4.7).
pub const REJECTION_CLOSE_CODE: u16 = 1001;

/// Why a connection was refused admission.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdmissionError {
    /// The TLS handshake completed without a client certificate.
    #[error("Client certificate required")]
    NoCertificate,
    /// The certificate did not parse, or carried no usable subject public key.
    #[error("Client certificate is malformed")]
    MalformedCertificate,
    /// The certificate's key hash is not in the allow-list.
    #[error("Client certificate not whitelisted")]
    NotWhitelisted,
}

/// Computes the lowercase hex SHA-1 digest of a certificate's DER-encoded
/// subject public key (§4.7 step 2–3).
///
/// # Errors
///
/// Returns [`AdmissionError::MalformedCertificate`] if the certificate is
/// not valid X.509.
pub fn subject_public_key_sha1(cert: &CertificateDer<'_>) -> Result<String, AdmissionError> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|_| AdmissionError::MalformedCertificate)?;
    let spki = parsed.public_key().raw;
    let mut hasher = Sha1::new();
    hasher.update(spki);
    Ok(hex::encode(hasher.finalize()))
}

/// Applies §4.7's admission policy to one incoming connection's peer
/// certificate chain.
///
/// # Errors
///
/// Returns [`AdmissionError::NoCertificate`] if `peer_certs` is empty,
/// [`AdmissionError::MalformedCertificate`] if the leaf certificate does
/// not parse, or [`AdmissionError::NotWhitelisted`] if its key hash is not
/// in `allow_list`'s current snapshot.
pub fn admit(
    peer_certs: &[CertificateDer<'_>],
    allow_list: &AllowList,
) -> Result<String, AdmissionError> {
    let leaf = peer_certs.first().ok_or(AdmissionError::NoCertificate)?;
    let digest = subject_public_key_sha1(leaf)?;
    if allow_list.contains(&digest) {
        Ok(digest)
    } else {
        Err(AdmissionError::NotWhitelisted)
    }
}
