//! QPACK decoder per RFC 9204 Sections 4.3-4.5.
//!
//! Decodes encoded field sections, applies encoder stream instructions to
//! the dynamic table, parks sections that reference not-yet-received
//! insertions, and accumulates the decoder-stream instructions (section
//! acknowledgments, insert count increments, stream cancellations) the peer
//! is owed.

use crate::dynamic_table::DynamicTable;
use crate::error::{QpackError, Result};
use crate::field_line::FieldLine;
use crate::instructions::{decode_string, DecoderInstruction, EncoderInstruction};
use crate::prefix_int;
use crate::static_table;
use bytes::{Buf, Bytes, BytesMut};

/// Outcome of decoding a field section.
#[derive(Debug)]
pub enum Section {
    Decoded(Vec<FieldLine>),
    /// The section references insertions that have not arrived on the
    /// encoder stream yet; it will surface from `read_encoder_stream`.
    Blocked,
}

struct BlockedSection {
    stream_id: u64,
    required_insert_count: u64,
    data: Vec<u8>,
}

pub struct Decoder {
    table: DynamicTable,
    max_blocked: usize,
    blocked: Vec<BlockedSection>,
    stream_output: BytesMut,
}

impl Decoder {
    /// `max_table_capacity` and `max_blocked` are the values this endpoint
    /// advertised in SETTINGS.
    pub fn new(max_table_capacity: usize, max_blocked: usize) -> Self {
        Self {
            table: DynamicTable::new(max_table_capacity),
            max_blocked,
            blocked: Vec::new(),
            stream_output: BytesMut::new(),
        }
    }

    /// Decode an encoded field section received on `stream_id`.
    pub fn decode_section(&mut self, stream_id: u64, data: &[u8]) -> Result<Section> {
        let (required_insert_count, base, offset) = self.decode_prefix(data)?;

        if required_insert_count > self.table.insert_count() {
            if self.blocked.len() >= self.max_blocked {
                return Err(QpackError::TooManyBlockedStreams(
                    self.blocked.len() + 1,
                    self.max_blocked,
                ));
            }
            self.blocked.push(BlockedSection {
                stream_id,
                required_insert_count,
                data: data.to_vec(),
            });
            return Ok(Section::Blocked);
        }

        let fields = self.decode_field_lines(&data[offset..], base, required_insert_count)?;
        if required_insert_count > 0 {
            self.push_instruction(DecoderInstruction::SectionAck { stream_id });
        }
        Ok(Section::Decoded(fields))
    }

    /// Consume encoder stream bytes from `buf`, leaving any trailing partial
    /// instruction in place. Returns sections unblocked by the new insertions
    /// as `(stream_id, fields)` pairs.
    pub fn read_encoder_stream(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Vec<(u64, Vec<FieldLine>)>> {
        let mut inserted = 0u64;
        loop {
            let (instruction, consumed) = match EncoderInstruction::decode(&buf[..]) {
                Ok(ok) => ok,
                Err(QpackError::UnexpectedEof) => break,
                Err(e) => return Err(e),
            };
            buf.advance(consumed);
            if self.apply_encoder_instruction(instruction)? {
                inserted += 1;
            }
        }

        if inserted > 0 {
            self.push_instruction(DecoderInstruction::InsertCountIncrement {
                increment: inserted,
            });
        }

        self.retry_blocked()
    }

    /// Drop decoder state for a cancelled request stream.
    pub fn cancel_stream(&mut self, stream_id: u64) {
        let before = self.blocked.len();
        self.blocked.retain(|b| b.stream_id != stream_id);
        if self.blocked.len() != before {
            self.push_instruction(DecoderInstruction::StreamCancel { stream_id });
        }
    }

    /// Pending bytes for our decoder stream, if any.
    pub fn take_stream_output(&mut self) -> Option<Bytes> {
        if self.stream_output.is_empty() {
            None
        } else {
            Some(self.stream_output.split().freeze())
        }
    }

    fn push_instruction(&mut self, instruction: DecoderInstruction) {
        instruction.encode(&mut self.stream_output);
    }

    /// Returns whether the instruction inserted an entry.
    fn apply_encoder_instruction(&mut self, instruction: EncoderInstruction) -> Result<bool> {
        match instruction {
            EncoderInstruction::SetCapacity { capacity } => {
                self.table.set_capacity(capacity)?;
                Ok(false)
            }
            EncoderInstruction::InsertWithNameRef {
                is_static,
                name_index,
                value,
            } => {
                let name = if is_static {
                    static_table::get(name_index)
                        .map(|(n, _)| Bytes::from_static(n.as_bytes()))
                        .ok_or_else(|| {
                            QpackError::EncoderStream(format!(
                                "invalid static name index {name_index}"
                            ))
                        })?
                } else {
                    // Relative to the current insert count.
                    let absolute = self
                        .table
                        .insert_count()
                        .checked_sub(name_index + 1)
                        .ok_or_else(|| {
                            QpackError::EncoderStream(format!(
                                "invalid dynamic name index {name_index}"
                            ))
                        })?;
                    self.table
                        .get(absolute)
                        .map(|f| f.name.clone())
                        .ok_or_else(|| {
                            QpackError::EncoderStream("evicted dynamic name reference".into())
                        })?
                };
                self.table.insert(FieldLine { name, value })?;
                Ok(true)
            }
            EncoderInstruction::InsertLiteral { name, value } => {
                self.table.insert(FieldLine { name, value })?;
                Ok(true)
            }
            EncoderInstruction::Duplicate { index } => {
                let absolute = self
                    .table
                    .insert_count()
                    .checked_sub(index + 1)
                    .ok_or_else(|| {
                        QpackError::EncoderStream(format!("invalid duplicate index {index}"))
                    })?;
                let field = self
                    .table
                    .get(absolute)
                    .cloned()
                    .ok_or_else(|| QpackError::EncoderStream("evicted duplicate index".into()))?;
                self.table.insert(field)?;
                Ok(true)
            }
        }
    }

    fn retry_blocked(&mut self) -> Result<Vec<(u64, Vec<FieldLine>)>> {
        let insert_count = self.table.insert_count();
        let mut ready = Vec::new();
        let mut i = 0;
        while i < self.blocked.len() {
            if self.blocked[i].required_insert_count <= insert_count {
                ready.push(self.blocked.swap_remove(i));
            } else {
                i += 1;
            }
        }

        let mut sections = Vec::with_capacity(ready.len());
        for section in ready {
            let (required_insert_count, base, offset) = self.decode_prefix(&section.data)?;
            let fields =
                self.decode_field_lines(&section.data[offset..], base, required_insert_count)?;
            self.push_instruction(DecoderInstruction::SectionAck {
                stream_id: section.stream_id,
            });
            sections.push((section.stream_id, fields));
        }
        Ok(sections)
    }

    /// Decode the Required Insert Count and Base from the section prefix
    /// (RFC 9204 Section 4.5.1).
    fn decode_prefix(&self, data: &[u8]) -> Result<(u64, u64, usize)> {
        let (encoded_insert_count, mut pos) = prefix_int::decode(data, 8)?;

        let max_entries = (self.table.max_capacity() / 32) as u64;
        let required_insert_count = if encoded_insert_count == 0 {
            0
        } else {
            if max_entries == 0 {
                return Err(QpackError::DecompressionFailed(
                    "dynamic reference with zero-capacity table".into(),
                ));
            }
            let full_range = 2 * max_entries;
            if encoded_insert_count > full_range {
                return Err(QpackError::DecompressionFailed(
                    "encoded insert count exceeds full range".into(),
                ));
            }
            let max_value = self.table.insert_count() + max_entries;
            let max_wrapped = (max_value / full_range) * full_range;
            let mut count = max_wrapped + encoded_insert_count - 1;
            if count > max_value {
                if count <= full_range {
                    return Err(QpackError::DecompressionFailed(
                        "required insert count wrapped below zero".into(),
                    ));
                }
                count -= full_range;
            }
            if count == 0 {
                return Err(QpackError::DecompressionFailed(
                    "non-zero encoding of zero insert count".into(),
                ));
            }
            count
        };

        let sign_and_delta = *data.get(pos).ok_or(QpackError::UnexpectedEof)?;
        let negative = sign_and_delta & 0x80 != 0;
        let (delta_base, consumed) = prefix_int::decode(&data[pos..], 7)?;
        pos += consumed;

        let base = if negative {
            required_insert_count
                .checked_sub(delta_base + 1)
                .ok_or_else(|| QpackError::DecompressionFailed("negative base".into()))?
        } else {
            required_insert_count + delta_base
        };

        Ok((required_insert_count, base, pos))
    }

    fn decode_field_lines(
        &self,
        mut data: &[u8],
        base: u64,
        required_insert_count: u64,
    ) -> Result<Vec<FieldLine>> {
        let mut fields = Vec::new();
        while !data.is_empty() {
            let (field, consumed) = self.decode_field_line(data, base, required_insert_count)?;
            fields.push(field);
            data = &data[consumed..];
        }
        Ok(fields)
    }

    fn decode_field_line(
        &self,
        data: &[u8],
        base: u64,
        required_insert_count: u64,
    ) -> Result<(FieldLine, usize)> {
        let first = *data.first().ok_or(QpackError::UnexpectedEof)?;

        if first & 0x80 != 0 {
            // Indexed Field Line: 1 T Index(6+).
            let is_static = first & 0x40 != 0;
            let (index, consumed) = prefix_int::decode(data, 6)?;
            let field = if is_static {
                let (name, value) = static_table::get(index).ok_or_else(|| {
                    QpackError::DecompressionFailed(format!("invalid static index {index}"))
                })?;
                FieldLine::new(name.as_bytes().to_vec(), value.as_bytes().to_vec())
            } else {
                self.dynamic_relative(index, base, required_insert_count)?
                    .clone()
            };
            Ok((field, consumed))
        } else if first & 0xc0 == 0x40 {
            // Literal Field Line With Name Reference: 01 N T NameIndex(4+).
            let is_static = first & 0x10 != 0;
            let (name_index, mut pos) = prefix_int::decode(data, 4)?;
            let name = if is_static {
                static_table::get(name_index)
                    .map(|(n, _)| Bytes::from_static(n.as_bytes()))
                    .ok_or_else(|| {
                        QpackError::DecompressionFailed(format!(
                            "invalid static name index {name_index}"
                        ))
                    })?
            } else {
                self.dynamic_relative(name_index, base, required_insert_count)?
                    .name
                    .clone()
            };
            let (value, consumed) = decode_string(&data[pos..], 8)?;
            pos += consumed;
            Ok((FieldLine { name, value }, pos))
        } else if first & 0xe0 == 0x20 {
            // Literal Field Line With Literal Name: 001 N H NameLen(3+).
            let (name, mut pos) = decode_string(data, 4)?;
            let (value, consumed) = decode_string(&data[pos..], 8)?;
            pos += consumed;
            Ok((FieldLine { name, value }, pos))
        } else if first & 0xf0 == 0x10 {
            // Indexed Field Line With Post-Base Index: 0001 Index(4+).
            let (index, consumed) = prefix_int::decode(data, 4)?;
            let field = self
                .dynamic_post_base(index, base, required_insert_count)?
                .clone();
            Ok((field, consumed))
        } else {
            // Literal Field Line With Post-Base Name Reference: 0000 N NameIdx(3+).
            let (name_index, mut pos) = prefix_int::decode(data, 3)?;
            let name = self
                .dynamic_post_base(name_index, base, required_insert_count)?
                .name
                .clone();
            let (value, consumed) = decode_string(&data[pos..], 8)?;
            pos += consumed;
            Ok((FieldLine { name, value }, pos))
        }
    }

    fn dynamic_relative(
        &self,
        index: u64,
        base: u64,
        required_insert_count: u64,
    ) -> Result<&FieldLine> {
        let absolute = base.checked_sub(index + 1).ok_or_else(|| {
            QpackError::DecompressionFailed(format!("relative index {index} underflows base"))
        })?;
        if absolute >= required_insert_count {
            return Err(QpackError::DecompressionFailed(
                "reference beyond required insert count".into(),
            ));
        }
        self.table.get(absolute).ok_or_else(|| {
            QpackError::DecompressionFailed(format!("evicted dynamic entry {absolute}"))
        })
    }

    fn dynamic_post_base(
        &self,
        index: u64,
        base: u64,
        required_insert_count: u64,
    ) -> Result<&FieldLine> {
        let absolute = base + index;
        if absolute >= required_insert_count {
            return Err(QpackError::DecompressionFailed(
                "post-base reference beyond required insert count".into(),
            ));
        }
        self.table.get(absolute).ok_or_else(|| {
            QpackError::DecompressionFailed(format!("evicted post-base entry {absolute}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_only_section() {
        let mut decoder = Decoder::new(4096, 100);
        // Prefix: RIC=0, Base=0; then indexed static 17 (:method GET).
        let data = [0x00, 0x00, 0xc0 | 17];
        match decoder.decode_section(0, &data).unwrap() {
            Section::Decoded(fields) => {
                assert_eq!(fields.len(), 1);
                assert_eq!(&fields[0].name[..], b":method");
                assert_eq!(&fields[0].value[..], b"GET");
            }
            Section::Blocked => panic!("unexpectedly blocked"),
        }
        assert!(decoder.take_stream_output().is_none());
    }

    #[test]
    fn literal_name_section() {
        let mut decoder = Decoder::new(4096, 100);
        let data = [
            0x00, 0x00, // prefix
            0x24, b't', b'e', b's', b't', // literal name "test", not huffman
            0x05, b'v', b'a', b'l', b'u', b'e',
        ];
        let Section::Decoded(fields) = decoder.decode_section(0, &data).unwrap() else {
            panic!("blocked");
        };
        assert_eq!(&fields[0].name[..], b"test");
        assert_eq!(&fields[0].value[..], b"value");
    }

    #[test]
    fn dynamic_reference_blocks_until_insert_arrives() {
        let mut decoder = Decoder::new(4096, 100);

        // Section with Required Insert Count 1, Base 1, referencing the
        // most recent dynamic entry (relative index 0).
        let section = [0x02, 0x00, 0x80];
        assert!(matches!(
            decoder.decode_section(4, &section).unwrap(),
            Section::Blocked
        ));

        // Encoder stream: set capacity, then insert with static name ref 17.
        let mut enc = BytesMut::new();
        EncoderInstruction::SetCapacity { capacity: 4096 }.encode(&mut enc);
        EncoderInstruction::InsertWithNameRef {
            is_static: true,
            name_index: 17,
            value: Bytes::from_static(b"GET"),
        }
        .encode(&mut enc);

        let unblocked = decoder.read_encoder_stream(&mut enc).unwrap();
        assert!(enc.is_empty());
        assert_eq!(unblocked.len(), 1);
        let (stream_id, fields) = &unblocked[0];
        assert_eq!(*stream_id, 4);
        assert_eq!(&fields[0].name[..], b":method");
        assert_eq!(&fields[0].value[..], b"GET");

        // Owed: one Insert Count Increment plus one Section Ack.
        let out = decoder.take_stream_output().unwrap();
        let (first, n) = DecoderInstruction::decode(&out).unwrap();
        assert_eq!(first, DecoderInstruction::InsertCountIncrement { increment: 1 });
        let (second, _) = DecoderInstruction::decode(&out[n..]).unwrap();
        assert_eq!(second, DecoderInstruction::SectionAck { stream_id: 4 });
    }

    #[test]
    fn partial_encoder_instruction_left_in_buffer() {
        let mut decoder = Decoder::new(4096, 100);
        let mut full = BytesMut::new();
        EncoderInstruction::SetCapacity { capacity: 4096 }.encode(&mut full);
        EncoderInstruction::InsertLiteral {
            name: Bytes::from_static(b"a"),
            value: Bytes::from_static(b"b"),
        }
        .encode(&mut full);

        let keep = full.len() - 1;
        let mut partial = BytesMut::from(&full[..keep]);
        decoder.read_encoder_stream(&mut partial).unwrap();
        // The incomplete insert must remain buffered.
        assert!(!partial.is_empty());

        partial.extend_from_slice(&full[keep..]);
        decoder.read_encoder_stream(&mut partial).unwrap();
        assert!(partial.is_empty());
    }

    #[test]
    fn cancelling_blocked_stream_emits_cancel() {
        let mut decoder = Decoder::new(4096, 1);
        let section = [0x02, 0x00, 0x80];
        assert!(matches!(
            decoder.decode_section(8, &section).unwrap(),
            Section::Blocked
        ));
        decoder.cancel_stream(8);
        let out = decoder.take_stream_output().unwrap();
        let (inst, _) = DecoderInstruction::decode(&out).unwrap();
        assert_eq!(inst, DecoderInstruction::StreamCancel { stream_id: 8 });
    }

    #[test]
    fn blocked_limit_enforced() {
        let mut decoder = Decoder::new(4096, 1);
        let section = [0x02, 0x00, 0x80];
        decoder.decode_section(0, &section).unwrap();
        assert!(matches!(
            decoder.decode_section(4, &section),
            Err(QpackError::TooManyBlockedStreams(2, 1))
        ));
    }
}
