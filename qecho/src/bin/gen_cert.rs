//! Sidecar certificate generator.
//!
//! Writes `cert.der` (X.509, self-signed ECDSA P-256, 14-day validity) and
//! `key.der` (PKCS#8), and prints the certificate's SHA-256 digest in
//! base64 so clients can pin it.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use time::{Duration, OffsetDateTime};

const VALIDITY_DAYS: i64 = 14;

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let cert_path = args.next().unwrap_or_else(|| "cert.der".to_string());
    let key_path = args.next().unwrap_or_else(|| "key.der".to_string());

    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .context("building certificate parameters")?;
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::hours(1);
    params.not_after = now + Duration::days(VALIDITY_DAYS);

    // rcgen's default key algorithm is ECDSA P-256 with SHA-256.
    let key_pair = rcgen::KeyPair::generate().context("generating key pair")?;
    let cert = params
        .self_signed(&key_pair)
        .context("self-signing certificate")?;

    let cert_der = cert.der().to_vec();
    let key_der = key_pair.serialize_der();

    std::fs::write(&cert_path, &cert_der)
        .with_context(|| format!("writing {cert_path}"))?;
    std::fs::write(&key_path, &key_der).with_context(|| format!("writing {key_path}"))?;

    let digest = ring::digest::digest(&ring::digest::SHA256, &cert_der);
    println!("certificate: {cert_path} ({} bytes)", cert_der.len());
    println!("private key: {key_path} ({} bytes)", key_der.len());
    println!("sha256 (base64): {}", BASE64.encode(digest.as_ref()));

    Ok(())
}
