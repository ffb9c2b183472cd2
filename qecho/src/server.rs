//! The endpoint and its single-threaded event loop.
//!
//! One task owns the UDP socket, the transport endpoint, and every
//! connection. Each iteration waits for a datagram or the earliest
//! transport deadline (clamped to one second), dispatches, fires expired
//! timers, and reaps drained connections. Inbound packets are routed to
//! connections by the endpoint's CID table, so any number of concurrent
//! connections is supported.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::BytesMut;
use quinn_proto::crypto::rustls::QuicServerConfig;
use quinn_proto::{
    ConnectionHandle, ConnectionIdGenerator, DatagramEvent, Endpoint, EndpointConfig,
    IdleTimeout, RandomConnectionIdGenerator, ServerConfig, TransportConfig, Transmit, VarInt,
};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, info, trace, warn};

use crate::config::{
    Config, MAX_DATAGRAM_SIZE, MAX_STREAMS_BIDI, MAX_STREAMS_UNI, MAX_UDP_PAYLOAD,
    RECEIVE_WINDOW, STREAM_RECEIVE_WINDOW,
};
use crate::connection::ConnectionDriver;
use crate::{netio, tls};

/// Server-chosen connection ids are 16 random bytes.
const LOCAL_CID_LEN: usize = 16;

/// Poll clamp: never sleep longer than this, even with no work pending.
const MAX_POLL_TIMEOUT: Duration = Duration::from_millis(1000);

pub struct Server {
    endpoint: Endpoint,
    socket: tokio::net::UdpSocket,
    local_addr: SocketAddr,
    connections: HashMap<ConnectionHandle, ConnectionDriver>,
}

impl Server {
    /// Build the TLS context, transport configuration, and socket.
    pub fn bind(config: Config) -> Result<Self> {
        let credentials = tls::load_credentials(&config)?;
        info!(digest = %credentials.cert_digest, "certificate SHA-256 (base64), pin this");
        let crypto = tls::build_server_crypto(&credentials)?;
        let crypto: QuicServerConfig = crypto
            .try_into()
            .context("building QUIC TLS configuration")?;

        // Process-wide stateless-reset secret; reset tokens for each CID are
        // derived from it by the transport.
        let rng = SystemRandom::new();
        let mut reset_secret = [0u8; 32];
        rng.fill(&mut reset_secret)
            .map_err(|_| anyhow::anyhow!("gathering entropy for the reset secret"))?;
        let reset_key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, &reset_secret);

        let mut endpoint_config = EndpointConfig::new(Arc::new(reset_key));
        endpoint_config.cid_generator(|| -> Box<dyn ConnectionIdGenerator> {
            Box::new(RandomConnectionIdGenerator::new(LOCAL_CID_LEN))
        });

        let mut transport = TransportConfig::default();
        transport
            .stream_receive_window(VarInt::from_u32(STREAM_RECEIVE_WINDOW))
            .receive_window(VarInt::from_u32(RECEIVE_WINDOW))
            .max_concurrent_bidi_streams(VarInt::from_u32(MAX_STREAMS_BIDI))
            .max_concurrent_uni_streams(VarInt::from_u32(MAX_STREAMS_UNI))
            .max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(
                (config.idle_timeout_secs * 1000) as u32,
            ))))
            .datagram_receive_buffer_size(Some(MAX_DATAGRAM_SIZE))
            .datagram_send_buffer_size(MAX_DATAGRAM_SIZE)
            .initial_mtu(MAX_UDP_PAYLOAD)
            .mtu_discovery_config(None);

        let mut server_config = ServerConfig::with_crypto(Arc::new(crypto));
        server_config
            .transport_config(Arc::new(transport))
            .migration(false);

        let endpoint = Endpoint::new(
            Arc::new(endpoint_config),
            Some(Arc::new(server_config)),
            true,
            None,
        );

        let bind_addr = config.bind_addr()?;
        let socket = netio::bind_udp_socket(bind_addr, &config)?;
        let local_addr = socket.local_addr().context("reading local address")?;
        info!(%local_addr, "listening (ALPN: h3 = HTTP/3 + WebTransport + WebSocket, echo = raw echo)");

        Ok(Self {
            endpoint,
            socket,
            local_addr,
            connections: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run until an unrecoverable socket error or Ctrl-C.
    pub async fn run(mut self) -> Result<()> {
        let mut rxbuf = vec![0u8; 65536];
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal.context("waiting for shutdown signal")?;
                    info!("shutdown signal received");
                    self.shutdown();
                    return Ok(());
                }
                received = self.socket.recv_from(&mut rxbuf) => {
                    match received {
                        Ok((len, peer)) => {
                            let now = Instant::now();
                            self.handle_datagram(now, peer, &rxbuf[..len]);
                        }
                        // ICMP-derived errors are transient on UDP sockets.
                        Err(e) if matches!(
                            e.kind(),
                            std::io::ErrorKind::ConnectionRefused
                                | std::io::ErrorKind::ConnectionReset
                        ) => {
                            trace!(error = %e, "transient socket error");
                        }
                        Err(e) => return Err(e).context("receiving datagram"),
                    }
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
            }

            let now = Instant::now();
            self.fire_timeouts(now);
        }
    }

    /// Earliest transport deadline across connections, clamped to
    /// `[now, now + 1s]`.
    fn next_deadline(&mut self) -> Instant {
        let now = Instant::now();
        let mut deadline = now + MAX_POLL_TIMEOUT;
        for driver in self.connections.values_mut() {
            if let Some(timeout) = driver.conn.poll_timeout() {
                deadline = deadline.min(timeout);
            }
        }
        deadline.max(now)
    }

    fn handle_datagram(&mut self, now: Instant, peer: SocketAddr, datagram: &[u8]) {
        let mut out = Vec::new();
        let event = self.endpoint.handle(
            now,
            peer,
            Some(self.local_addr.ip()),
            None,
            BytesMut::from(datagram),
            &mut out,
        );

        match event {
            Some(DatagramEvent::NewConnection(incoming)) => {
                out.clear();
                match self.endpoint.accept(incoming, now, &mut out, None) {
                    Ok((handle, conn)) => {
                        info!(%peer, "accepted connection");
                        let driver = ConnectionDriver::new(conn, peer);
                        self.connections.insert(handle, driver);
                        self.drive(handle, now);
                    }
                    Err(error) => {
                        debug!(%peer, cause = %error.cause, "rejected incoming packet");
                        if let Some(transmit) = error.response {
                            self.transmit(&transmit, &out);
                        }
                    }
                }
            }
            Some(DatagramEvent::ConnectionEvent(handle, event)) => {
                if let Some(driver) = self.connections.get_mut(&handle) {
                    driver.conn.handle_event(event);
                    self.drive(handle, now);
                } else {
                    debug!(?handle, "event for unknown connection, dropping");
                }
            }
            Some(DatagramEvent::Response(transmit)) => {
                // Version negotiation or stateless reset produced by the
                // endpoint itself.
                debug!(%peer, len = transmit.size, "endpoint-level response");
                self.transmit(&transmit, &out);
            }
            None => {}
        }
    }

    /// Fire `handle_timeout` on every connection whose deadline has passed,
    /// then drive it (loss timers produce retransmits, idle timers produce
    /// drained connections).
    fn fire_timeouts(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for (&handle, driver) in self.connections.iter_mut() {
            if driver
                .conn
                .poll_timeout()
                .is_some_and(|deadline| deadline <= now)
            {
                expired.push(handle);
            }
        }

        for handle in expired {
            if let Some(driver) = self.connections.get_mut(&handle) {
                driver.conn.handle_timeout(now);
            }
            self.drive(handle, now);
        }
    }

    /// Application events, endpoint events, and the transmit pass for one
    /// connection; removes it once the transport reports it drained.
    fn drive(&mut self, handle: ConnectionHandle, now: Instant) {
        let Some(driver) = self.connections.get_mut(&handle) else {
            return;
        };
        driver.process(now);

        let mut drained = false;
        while let Some(event) = driver.conn.poll_endpoint_events() {
            drained |= event.is_drained();
            if let Some(conn_event) = self.endpoint.handle_event(handle, event) {
                driver.conn.handle_event(conn_event);
            }
        }

        let mut buf = Vec::with_capacity(usize::from(MAX_UDP_PAYLOAD));
        while let Some(transmit) = driver.conn.poll_transmit(now, 1, &mut buf) {
            match self.socket.try_send_to(&buf[..transmit.size], transmit.destination) {
                Ok(sent) => trace!(len = sent, peer = %transmit.destination, "sent packet"),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    debug!(peer = %transmit.destination, "socket backpressure, dropping packet");
                }
                Err(e) => warn!(peer = %transmit.destination, error = %e, "send failed"),
            }
            buf.clear();
        }

        if drained {
            let peer = driver.remote();
            self.connections.remove(&handle);
            info!(%peer, "connection drained and removed");
        }
    }

    fn transmit(&self, transmit: &Transmit, payload: &[u8]) {
        match self
            .socket
            .try_send_to(&payload[..transmit.size], transmit.destination)
        {
            Ok(_) => {}
            Err(e) => debug!(peer = %transmit.destination, error = %e, "endpoint send failed"),
        }
    }

    /// Close every connection gracefully and flush the close packets.
    fn shutdown(&mut self) {
        let now = Instant::now();
        let handles: Vec<ConnectionHandle> = self.connections.keys().copied().collect();
        for handle in handles {
            if let Some(driver) = self.connections.get_mut(&handle) {
                driver.shutdown(now);
            }
            self.drive(handle, now);
        }
        info!(remaining = self.connections.len(), "shutdown complete");
    }
}
