//! Unidirectional stream types per RFC 9114 Section 6.2.
//!
//! Every unidirectional stream opens with a varint type identifier.
//! Unknown types must be tolerated (peers may grease); WebTransport adds
//! `0x54` for session-bound unidirectional streams.

use crate::varint;
use bytes::BytesMut;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    /// Control stream (0x00): SETTINGS, GOAWAY and friends.
    Control,
    /// Push stream (0x01); this server never accepts pushes.
    Push,
    /// QPACK encoder stream (0x02, RFC 9204 Section 4.2).
    QpackEncoder,
    /// QPACK decoder stream (0x03, RFC 9204 Section 4.2).
    QpackDecoder,
    /// WebTransport unidirectional stream (0x54, draft-02).
    WebTransport,
    /// Anything else; ignored per RFC 9114 Section 6.2.
    Unknown(u64),
}

pub const WEBTRANSPORT_UNI_STREAM: u64 = 0x54;

impl StreamType {
    pub fn from_id(id: u64) -> Self {
        match id {
            0x00 => Self::Control,
            0x01 => Self::Push,
            0x02 => Self::QpackEncoder,
            0x03 => Self::QpackDecoder,
            WEBTRANSPORT_UNI_STREAM => Self::WebTransport,
            other => Self::Unknown(other),
        }
    }

    pub fn to_id(self) -> u64 {
        match self {
            Self::Control => 0x00,
            Self::Push => 0x01,
            Self::QpackEncoder => 0x02,
            Self::QpackDecoder => 0x03,
            Self::WebTransport => WEBTRANSPORT_UNI_STREAM,
            Self::Unknown(id) => id,
        }
    }
}

/// Try to read a stream type from the front of `buf`, consuming it.
/// `None` means the varint is not complete yet.
pub fn read_stream_type(buf: &mut BytesMut) -> Option<StreamType> {
    let (id, consumed) = varint::decode(buf)?;
    let _ = buf.split_to(consumed);
    Some(StreamType::from_id(id))
}

/// Append a stream type prefix to `buf`.
pub fn write_stream_type(stream_type: StreamType, buf: &mut BytesMut) {
    varint::encode(stream_type.to_id(), buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types_roundtrip() {
        for t in [
            StreamType::Control,
            StreamType::Push,
            StreamType::QpackEncoder,
            StreamType::QpackDecoder,
            StreamType::WebTransport,
        ] {
            let mut buf = BytesMut::new();
            write_stream_type(t, &mut buf);
            assert_eq!(read_stream_type(&mut buf), Some(t));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn unknown_type_preserved() {
        let mut buf = BytesMut::new();
        varint::encode(0x1f * 7 + 0x21, &mut buf); // a grease value
        match read_stream_type(&mut buf) {
            Some(StreamType::Unknown(id)) => assert_eq!(id, 0x1f * 7 + 0x21),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn incomplete_prefix_waits() {
        let mut buf = BytesMut::from(&[0x80u8][..]);
        assert_eq!(read_stream_type(&mut buf), None);
        assert_eq!(buf.len(), 1);
    }
}
