//! Sans-io HTTP/3 server session for the qecho daemon.
//!
//! The session consumes stream bytes handed to it by the transport driver
//! and produces events plus per-stream outbound byte queues; it never
//! touches a socket. On top of RFC 9114 framing it understands the
//! Extended CONNECT handshake (RFC 9220), HTTP datagram negotiation
//! (RFC 9297), and the WebTransport stream signals of
//! draft-ietf-webtrans-http3-02 (`0x41` bidirectional frames and `0x54`
//! unidirectional streams).

pub mod error;
pub mod frame;
pub mod session;
pub mod settings;
pub mod stream_type;
pub mod varint;

pub use error::{Error, ErrorCode, Result};
pub use session::{Event, ServerSession};
pub use settings::{PeerSettings, Settings};

pub use qecho_qpack::FieldLine;
