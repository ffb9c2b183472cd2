//! UDP socket construction.
//!
//! Built with socket2 for buffer sizing, then handed to tokio in
//! nonblocking mode. Each datagram is one QUIC packet; the endpoint never
//! fragments.

use crate::config::Config;
use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;

pub fn bind_udp_socket(bind_addr: SocketAddr, config: &Config) -> Result<tokio::net::UdpSocket> {
    let domain = match bind_addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("creating UDP socket")?;

    socket
        .set_reuse_address(true)
        .context("setting SO_REUSEADDR")?;

    if let Some(size) = config.socket_recv_buffer_size {
        socket
            .set_recv_buffer_size(size)
            .with_context(|| format!("setting SO_RCVBUF to {size}"))?;
    }
    if let Some(size) = config.socket_send_buffer_size {
        socket
            .set_send_buffer_size(size)
            .with_context(|| format!("setting SO_SNDBUF to {size}"))?;
    }

    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("binding UDP socket to {bind_addr}"))?;

    let socket: std::net::UdpSocket = socket.into();
    socket
        .set_nonblocking(true)
        .context("setting O_NONBLOCK")?;

    tokio::net::UdpSocket::from_std(socket).context("registering socket with the runtime")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_port() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let socket = bind_udp_socket("127.0.0.1:0".parse().unwrap(), &Config::default()).unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(addr.port() != 0);
        assert!(addr.ip().is_loopback());
    }
}
