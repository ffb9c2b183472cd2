//! Encoder and decoder stream instructions per RFC 9204 Section 4.3.

use crate::error::{QpackError, Result};
use crate::huffman;
use crate::prefix_int;
use bytes::{Bytes, BytesMut};

/// Instructions received on the peer's encoder stream (Section 4.3.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderInstruction {
    /// `001xxxxx` - Set Dynamic Table Capacity.
    SetCapacity { capacity: u64 },
    /// `1Txxxxxx` - Insert With Name Reference (T=1 static).
    InsertWithNameRef {
        is_static: bool,
        name_index: u64,
        value: Bytes,
    },
    /// `01Hxxxxx` - Insert With Literal Name.
    InsertLiteral { name: Bytes, value: Bytes },
    /// `000xxxxx` - Duplicate.
    Duplicate { index: u64 },
}

impl EncoderInstruction {
    /// Decode one instruction. Returns the instruction and bytes consumed;
    /// `UnexpectedEof` means the caller should wait for more stream data.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let first = *data.first().ok_or(QpackError::UnexpectedEof)?;

        if first & 0x80 != 0 {
            let is_static = first & 0x40 != 0;
            let (name_index, mut pos) = prefix_int::decode(data, 6)?;
            let (value, n) = decode_string(&data[pos..], 8)?;
            pos += n;
            Ok((
                Self::InsertWithNameRef {
                    is_static,
                    name_index,
                    value,
                },
                pos,
            ))
        } else if first & 0xc0 == 0x40 {
            let (name, mut pos) = decode_string(data, 6)?;
            let (value, n) = decode_string(&data[pos..], 8)?;
            pos += n;
            Ok((Self::InsertLiteral { name, value }, pos))
        } else if first & 0xe0 == 0x20 {
            let (capacity, pos) = prefix_int::decode(data, 5)?;
            Ok((Self::SetCapacity { capacity }, pos))
        } else {
            let (index, pos) = prefix_int::decode(data, 5)?;
            Ok((Self::Duplicate { index }, pos))
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::SetCapacity { capacity } => {
                prefix_int::encode(*capacity, 5, 0x20, buf);
            }
            Self::InsertWithNameRef {
                is_static,
                name_index,
                value,
            } => {
                let flags = if *is_static { 0xc0 } else { 0x80 };
                prefix_int::encode(*name_index, 6, flags, buf);
                encode_string(value, 8, 0, buf);
            }
            Self::InsertLiteral { name, value } => {
                encode_string(name, 6, 0x40, buf);
                encode_string(value, 8, 0, buf);
            }
            Self::Duplicate { index } => {
                prefix_int::encode(*index, 5, 0x00, buf);
            }
        }
    }
}

/// Instructions we emit on our decoder stream (Section 4.3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderInstruction {
    /// `1xxxxxxx` - Section Acknowledgment.
    SectionAck { stream_id: u64 },
    /// `01xxxxxx` - Stream Cancellation.
    StreamCancel { stream_id: u64 },
    /// `00xxxxxx` - Insert Count Increment.
    InsertCountIncrement { increment: u64 },
}

impl DecoderInstruction {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::SectionAck { stream_id } => prefix_int::encode(*stream_id, 7, 0x80, buf),
            Self::StreamCancel { stream_id } => prefix_int::encode(*stream_id, 6, 0x40, buf),
            Self::InsertCountIncrement { increment } => {
                prefix_int::encode(*increment, 6, 0x00, buf)
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let first = *data.first().ok_or(QpackError::UnexpectedEof)?;
        if first & 0x80 != 0 {
            let (stream_id, pos) = prefix_int::decode(data, 7)?;
            Ok((Self::SectionAck { stream_id }, pos))
        } else if first & 0xc0 == 0x40 {
            let (stream_id, pos) = prefix_int::decode(data, 6)?;
            Ok((Self::StreamCancel { stream_id }, pos))
        } else {
            let (increment, pos) = prefix_int::decode(data, 6)?;
            Ok((Self::InsertCountIncrement { increment }, pos))
        }
    }
}

/// Decode a length-prefixed string whose Huffman bit sits just above the
/// length prefix (`prefix_bits` low bits of the first byte).
pub(crate) fn decode_string(data: &[u8], prefix_bits: u8) -> Result<(Bytes, usize)> {
    let first = *data.first().ok_or(QpackError::UnexpectedEof)?;
    let h_bit = if prefix_bits == 8 { 0x80 } else { 1 << (prefix_bits - 1) };
    let huffman_coded = first & h_bit != 0;

    let len_bits = if prefix_bits == 8 { 7 } else { prefix_bits - 1 };
    let (len, consumed) = prefix_int::decode(data, len_bits)?;
    let len = usize::try_from(len).map_err(|_| QpackError::IntegerOverflow)?;

    if data.len() < consumed + len {
        return Err(QpackError::UnexpectedEof);
    }
    let raw = &data[consumed..consumed + len];
    let value = if huffman_coded {
        let mut out = Vec::with_capacity(len * 2);
        huffman::decode(raw, &mut out)?;
        Bytes::from(out)
    } else {
        Bytes::copy_from_slice(raw)
    };
    Ok((value, consumed + len))
}

/// Encode a string literal. Huffman is used when it shortens the output.
pub(crate) fn encode_string(data: &[u8], prefix_bits: u8, flags: u8, buf: &mut BytesMut) {
    let h_bit = if prefix_bits == 8 { 0x80 } else { 1 << (prefix_bits - 1) };
    let len_bits = if prefix_bits == 8 { 7 } else { prefix_bits - 1 };

    let huffman_len = huffman::encoded_len(data);
    if huffman_len < data.len() {
        prefix_int::encode(huffman_len as u64, len_bits, flags | h_bit, buf);
        let mut encoded = Vec::with_capacity(huffman_len);
        huffman::encode(data, &mut encoded);
        buf.extend_from_slice(&encoded);
    } else {
        prefix_int::encode(data.len() as u64, len_bits, flags, buf);
        buf.extend_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_encoder(inst: EncoderInstruction) {
        let mut buf = BytesMut::new();
        inst.encode(&mut buf);
        let (decoded, consumed) = EncoderInstruction::decode(&buf).unwrap();
        assert_eq!(decoded, inst);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn encoder_instruction_roundtrips() {
        roundtrip_encoder(EncoderInstruction::SetCapacity { capacity: 4096 });
        roundtrip_encoder(EncoderInstruction::InsertWithNameRef {
            is_static: true,
            name_index: 17,
            value: Bytes::from_static(b"custom"),
        });
        roundtrip_encoder(EncoderInstruction::InsertWithNameRef {
            is_static: false,
            name_index: 3,
            value: Bytes::from_static(b""),
        });
        roundtrip_encoder(EncoderInstruction::InsertLiteral {
            name: Bytes::from_static(b"x-wt-session"),
            value: Bytes::from_static(b"0"),
        });
        roundtrip_encoder(EncoderInstruction::Duplicate { index: 5 });
    }

    #[test]
    fn decoder_instruction_roundtrips() {
        for inst in [
            DecoderInstruction::SectionAck { stream_id: 0 },
            DecoderInstruction::SectionAck { stream_id: 4000 },
            DecoderInstruction::StreamCancel { stream_id: 8 },
            DecoderInstruction::InsertCountIncrement { increment: 3 },
        ] {
            let mut buf = BytesMut::new();
            inst.encode(&mut buf);
            let (decoded, consumed) = DecoderInstruction::decode(&buf).unwrap();
            assert_eq!(decoded, inst);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn partial_instruction_reports_eof() {
        let mut buf = BytesMut::new();
        EncoderInstruction::InsertLiteral {
            name: Bytes::from_static(b"content-type"),
            value: Bytes::from_static(b"text/plain"),
        }
        .encode(&mut buf);
        for cut in 0..buf.len() {
            assert!(matches!(
                EncoderInstruction::decode(&buf[..cut]),
                Err(QpackError::UnexpectedEof)
            ));
        }
    }

    #[test]
    fn huffman_chosen_when_shorter() {
        let mut buf = BytesMut::new();
        // Long lowercase string compresses below its literal length.
        encode_string(b"www.example.com", 8, 0, &mut buf);
        assert!(buf[0] & 0x80 != 0);
        let (decoded, _) = decode_string(&buf, 8).unwrap();
        assert_eq!(&decoded[..], b"www.example.com");
    }
}
