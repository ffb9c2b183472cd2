//! TLS credential store and context.
//!
//! The certificate chain and PKCS#8 key are loaded once at startup from
//! DER files; when absent, an ephemeral self-signed ECDSA P-256 identity
//! is generated so the server can come up in a fresh checkout. The rustls
//! context is TLS 1.3 only with server-preference ALPN over `h3` then
//! `echo`, session tickets, and 0-RTT enabled.

use crate::config::Config;
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;
use tracing::{info, warn};

/// ALPN identifiers, in server preference order.
pub const ALPN_H3: &[u8] = b"h3";
pub const ALPN_ECHO: &[u8] = b"echo";

pub struct Credentials {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    /// SHA-256 of the leaf certificate, base64; clients pin this.
    pub cert_digest: String,
}

/// Load the DER credential pair, generating a self-signed fallback when
/// the files do not exist. A file that exists but does not parse is a
/// startup-fatal configuration fault.
pub fn load_credentials(config: &Config) -> Result<Credentials> {
    let (cert, key) = if config.cert_path.exists() && config.key_path.exists() {
        let cert = std::fs::read(&config.cert_path)
            .with_context(|| format!("reading certificate {}", config.cert_path.display()))?;
        let key = std::fs::read(&config.key_path)
            .with_context(|| format!("reading private key {}", config.key_path.display()))?;
        info!(
            cert = %config.cert_path.display(),
            cert_len = cert.len(),
            key_len = key.len(),
            "loaded certificate and key"
        );
        (cert, key)
    } else {
        warn!(
            cert = %config.cert_path.display(),
            "certificate files missing, generating ephemeral self-signed identity"
        );
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .context("generating self-signed certificate")?;
        (
            generated.cert.der().to_vec(),
            generated.key_pair.serialize_der(),
        )
    };

    let cert = CertificateDer::from(cert);
    let cert_digest = cert_digest_b64(&cert);
    Ok(Credentials {
        cert_chain: vec![cert],
        key: PrivateKeyDer::Pkcs8(key.into()),
        cert_digest,
    })
}

/// Base64 SHA-256 over the certificate DER, matching what the client pins.
pub fn cert_digest_b64(cert: &CertificateDer<'_>) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, cert.as_ref());
    BASE64.encode(digest.as_ref())
}

/// Build the rustls server context for the QUIC profile.
pub fn build_server_crypto(credentials: &Credentials) -> Result<rustls::ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut crypto = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("selecting TLS 1.3")?
        .with_no_client_auth()
        .with_single_cert(credentials.cert_chain.clone(), credentials.key.clone_key())
        .context("installing certificate and key")?;

    // Server-preference ALPN; no overlap yields a fatal TLS alert.
    crypto.alpn_protocols = vec![ALPN_H3.to_vec(), ALPN_ECHO.to_vec()];

    // Session tickets and early data for 0-RTT resumption.
    crypto.ticketer = rustls::crypto::ring::Ticketer::new().context("creating ticketer")?;
    crypto.max_early_data_size = u32::MAX;

    Ok(crypto)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral() -> Credentials {
        let config = Config {
            cert_path: "/nonexistent/cert.der".into(),
            key_path: "/nonexistent/key.der".into(),
            ..Config::default()
        };
        load_credentials(&config).unwrap()
    }

    #[test]
    fn generates_fallback_identity() {
        let credentials = ephemeral();
        assert_eq!(credentials.cert_chain.len(), 1);
        // SHA-256, base64: 44 characters including padding.
        assert_eq!(credentials.cert_digest.len(), 44);
    }

    #[test]
    fn crypto_context_prefers_h3() {
        let crypto = build_server_crypto(&ephemeral()).unwrap();
        assert_eq!(
            crypto.alpn_protocols,
            vec![b"h3".to_vec(), b"echo".to_vec()]
        );
        assert_eq!(crypto.max_early_data_size, u32::MAX);
    }

    #[test]
    fn digest_is_stable_per_cert() {
        let credentials = ephemeral();
        assert_eq!(
            credentials.cert_digest,
            cert_digest_b64(&credentials.cert_chain[0])
        );
    }
}
