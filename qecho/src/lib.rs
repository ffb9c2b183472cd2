//! qecho: a QUIC echo / HTTP-3 / WebTransport server.
//!
//! One UDP socket, one single-threaded event loop, three application
//! protocols negotiated by ALPN: raw stream echo (`echo`), HTTP/3 with
//! Extended CONNECT (`h3`), and WebTransport/WebSocket tunnelled over the
//! latter. The QUIC transport and TLS stack are `quinn-proto` + `rustls`;
//! HTTP/3 framing and QPACK live in the `qecho-h3` / `qecho-qpack`
//! workspace crates.

pub mod config;
pub mod connection;
pub mod netio;
pub mod server;
pub mod streams;
pub mod telemetry;
pub mod tls;
