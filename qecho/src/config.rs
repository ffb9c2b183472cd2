//! Server configuration.
//!
//! Defaults reproduce the compiled-in constants of the original echo
//! server; a TOML file named by `QECHO_CONFIG` can override them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Upper bound for a single outbound UDP payload.
pub const MAX_UDP_PAYLOAD: u16 = 1200;

/// Per-stream echo buffer cap. Input beyond this is silently truncated.
pub const STREAM_BUF_SIZE: usize = 64 * 1024;

/// Per-stream flow control window (initial_max_stream_data).
pub const STREAM_RECEIVE_WINDOW: u32 = 256 * 1024;

/// Connection flow control window (initial_max_data).
pub const RECEIVE_WINDOW: u32 = 1024 * 1024;

/// Concurrent bidirectional streams granted to the client.
pub const MAX_STREAMS_BIDI: u32 = 100;

/// Concurrent unidirectional streams granted to the client.
/// HTTP/3 needs at least 3 (control + QPACK pair), plus WebTransport extras.
pub const MAX_STREAMS_UNI: u32 = 10;

/// Largest DATAGRAM frame we accept; enables DATAGRAM support.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// X.509 certificate, DER. Generated on the fly when missing.
    pub cert_path: PathBuf,
    /// PKCS#8 private key, DER.
    pub key_path: PathBuf,
    /// Idle timeout after which connections are dropped, in seconds.
    pub idle_timeout_secs: u64,
    /// Optional SO_RCVBUF override.
    pub socket_recv_buffer_size: Option<usize>,
    /// Optional SO_SNDBUF override.
    pub socket_send_buffer_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4433,
            cert_path: PathBuf::from("cert.der"),
            key_path: PathBuf::from("key.der"),
            idle_timeout_secs: 30,
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
        }
    }
}

impl Config {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.port == 0 {
            errors.push("port must be nonzero".to_string());
        }
        if self.idle_timeout_secs == 0 {
            errors.push("idle_timeout_secs must be nonzero".to_string());
        }
        if self.host.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!("host {:?} is not an IP address", self.host));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("invalid configuration: {}", errors.join("; "))
        }
    }
}

/// Load the configuration: `QECHO_CONFIG` names a TOML file, otherwise the
/// built-in defaults apply.
pub fn load() -> Result<Config> {
    let config = match std::env::var_os("QECHO_CONFIG") {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.to_string_lossy()))?;
            toml::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.to_string_lossy()))?
        }
        None => Config::default(),
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_constants() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 4433);
        assert!(config.bind_addr().unwrap().ip().is_unspecified());
        assert_eq!(config.idle_timeout_secs, 30);
        config.validate().unwrap();
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config: Config = toml::from_str("port = 8443\n").unwrap();
        assert_eq!(config.port, 8443);
        assert_eq!(config.host, "0.0.0.0");
        config.validate().unwrap();
    }

    #[test]
    fn invalid_values_rejected() {
        let config: Config = toml::from_str("port = 0\n").unwrap();
        assert!(config.validate().is_err());
        let config: Config = toml::from_str("host = \"not-an-ip\"\n").unwrap();
        assert!(config.validate().is_err());
    }
}
