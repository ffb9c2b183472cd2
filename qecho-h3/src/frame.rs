//! HTTP/3 frame codec per RFC 9114 Section 7.2.
//!
//! Frames are `type varint | length varint | payload`, except the
//! WebTransport signal `0x41`, which has no length and flips the rest of
//! the stream into raw payload; the parser surfaces it as a distinct item
//! so the session can switch modes.

use crate::error::{Error, ErrorCode, Result};
use crate::varint;
use bytes::{Buf, Bytes, BytesMut};

pub const FRAME_DATA: u64 = 0x00;
pub const FRAME_HEADERS: u64 = 0x01;
pub const FRAME_CANCEL_PUSH: u64 = 0x03;
pub const FRAME_SETTINGS: u64 = 0x04;
pub const FRAME_PUSH_PROMISE: u64 = 0x05;
pub const FRAME_GOAWAY: u64 = 0x07;
pub const FRAME_MAX_PUSH_ID: u64 = 0x0d;
/// WEBTRANSPORT_STREAM signal value (draft-ietf-webtrans-http3-02).
pub const FRAME_WEBTRANSPORT_STREAM: u64 = 0x41;

/// A parsed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Bytes),
    Headers(Bytes),
    Settings(Vec<(u64, u64)>),
    CancelPush(u64),
    GoAway(u64),
    MaxPushId(u64),
    /// `0x41` + session id; everything after it is unframed payload.
    WebTransportStream { session_id: u64 },
    /// Reserved / grease frames, skipped per RFC 9114 Section 9.
    Unknown { frame_type: u64, len: u64 },
}

impl Frame {
    /// Try to parse one frame from the front of `buf`, consuming it on
    /// success. `Ok(None)` means more bytes are needed.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Frame>> {
        let Some((frame_type, type_len)) = varint::decode(buf) else {
            return Ok(None);
        };

        if frame_type == FRAME_WEBTRANSPORT_STREAM {
            let Some((session_id, id_len)) = varint::decode(&buf[type_len..]) else {
                return Ok(None);
            };
            buf.advance(type_len + id_len);
            return Ok(Some(Frame::WebTransportStream { session_id }));
        }

        let Some((len, len_len)) = varint::decode(&buf[type_len..]) else {
            return Ok(None);
        };
        let header = type_len + len_len;
        let len_usize = usize::try_from(len)
            .map_err(|_| Error::protocol(ErrorCode::FrameError, "frame length overflow"))?;
        if buf.len() < header + len_usize {
            return Ok(None);
        }

        buf.advance(header);
        let payload = buf.split_to(len_usize).freeze();

        let frame = match frame_type {
            FRAME_DATA => Frame::Data(payload),
            FRAME_HEADERS => Frame::Headers(payload),
            FRAME_SETTINGS => Frame::Settings(parse_settings(&payload)?),
            FRAME_CANCEL_PUSH => Frame::CancelPush(parse_single_varint(&payload)?),
            FRAME_GOAWAY => Frame::GoAway(parse_single_varint(&payload)?),
            FRAME_MAX_PUSH_ID => Frame::MaxPushId(parse_single_varint(&payload)?),
            other => Frame::Unknown {
                frame_type: other,
                len,
            },
        };
        Ok(Some(frame))
    }

    /// Append the frame's wire encoding to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Data(payload) => encode_frame(FRAME_DATA, payload, buf),
            Frame::Headers(payload) => encode_frame(FRAME_HEADERS, payload, buf),
            Frame::Settings(pairs) => {
                let mut body = BytesMut::new();
                for &(id, value) in pairs {
                    varint::encode(id, &mut body);
                    varint::encode(value, &mut body);
                }
                encode_frame(FRAME_SETTINGS, &body, buf);
            }
            Frame::CancelPush(id) => encode_varint_frame(FRAME_CANCEL_PUSH, *id, buf),
            Frame::GoAway(id) => encode_varint_frame(FRAME_GOAWAY, *id, buf),
            Frame::MaxPushId(id) => encode_varint_frame(FRAME_MAX_PUSH_ID, *id, buf),
            Frame::WebTransportStream { session_id } => {
                varint::encode(FRAME_WEBTRANSPORT_STREAM, buf);
                varint::encode(*session_id, buf);
            }
            Frame::Unknown { frame_type, len } => {
                varint::encode(*frame_type, buf);
                varint::encode(*len, buf);
                buf.extend_from_slice(&vec![0u8; *len as usize]);
            }
        }
    }
}

fn encode_frame(frame_type: u64, payload: &[u8], buf: &mut BytesMut) {
    varint::encode(frame_type, buf);
    varint::encode(payload.len() as u64, buf);
    buf.extend_from_slice(payload);
}

fn encode_varint_frame(frame_type: u64, value: u64, buf: &mut BytesMut) {
    varint::encode(frame_type, buf);
    varint::encode(varint::encoded_len(value) as u64, buf);
    varint::encode(value, buf);
}

fn parse_settings(mut payload: &[u8]) -> Result<Vec<(u64, u64)>> {
    let mut pairs = Vec::new();
    while !payload.is_empty() {
        let (id, n) = varint::decode(payload)
            .ok_or_else(|| Error::protocol(ErrorCode::SettingsError, "truncated setting id"))?;
        payload = &payload[n..];
        let (value, n) = varint::decode(payload)
            .ok_or_else(|| Error::protocol(ErrorCode::SettingsError, "truncated setting value"))?;
        payload = &payload[n..];
        pairs.push((id, value));
    }
    Ok(pairs)
}

fn parse_single_varint(payload: &[u8]) -> Result<u64> {
    match varint::decode(payload) {
        Some((value, n)) if n == payload.len() => Ok(value),
        _ => Err(Error::protocol(
            ErrorCode::FrameError,
            "frame payload is not a single varint",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(mut data: BytesMut) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = Frame::parse(&mut data).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn data_and_headers_roundtrip() {
        let mut buf = BytesMut::new();
        Frame::Headers(Bytes::from_static(b"\x00\x00\xd1")).encode(&mut buf);
        Frame::Data(Bytes::from_static(b"hello")).encode(&mut buf);

        let frames = parse_all(buf);
        assert_eq!(
            frames,
            vec![
                Frame::Headers(Bytes::from_static(b"\x00\x00\xd1")),
                Frame::Data(Bytes::from_static(b"hello")),
            ]
        );
    }

    #[test]
    fn settings_roundtrip_with_large_id() {
        let pairs = vec![(0x01, 4096), (0x33, 1), (0x14e9cd29, 100)];
        let mut buf = BytesMut::new();
        Frame::Settings(pairs.clone()).encode(&mut buf);
        assert_eq!(parse_all(buf), vec![Frame::Settings(pairs)]);
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut full = BytesMut::new();
        Frame::Data(Bytes::from_static(b"0123456789")).encode(&mut full);

        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(Frame::parse(&mut partial).unwrap().is_none());
            // Nothing consumed while incomplete.
            assert_eq!(partial.len(), cut);
        }
    }

    #[test]
    fn webtransport_signal_has_no_length() {
        let mut buf = BytesMut::new();
        Frame::WebTransportStream { session_id: 0 }.encode(&mut buf);
        buf.extend_from_slice(b"raw payload");

        let mut parse_buf = buf.clone();
        let frame = Frame::parse(&mut parse_buf).unwrap().unwrap();
        assert_eq!(frame, Frame::WebTransportStream { session_id: 0 });
        // The raw payload stays in the buffer for the caller.
        assert_eq!(&parse_buf[..], b"raw payload");
    }

    #[test]
    fn goaway_roundtrip() {
        let mut buf = BytesMut::new();
        Frame::GoAway(400).encode(&mut buf);
        assert_eq!(parse_all(buf), vec![Frame::GoAway(400)]);
    }

    #[test]
    fn unknown_frame_skipped_with_payload() {
        let mut buf = BytesMut::new();
        varint::encode(0x21, &mut buf); // reserved type
        varint::encode(3, &mut buf);
        buf.extend_from_slice(&[1, 2, 3]);
        Frame::Data(Bytes::from_static(b"x")).encode(&mut buf);

        let frames = parse_all(buf);
        assert_eq!(
            frames,
            vec![
                Frame::Unknown {
                    frame_type: 0x21,
                    len: 3
                },
                Frame::Data(Bytes::from_static(b"x")),
            ]
        );
    }
}
