//! Field-section encoding for server responses.
//!
//! Responses are encoded with a Required Insert Count of zero: indexed or
//! name-referenced against the static table where possible, literal
//! otherwise. Never touching the dynamic table means sections are never
//! blocked on the peer and need no acknowledgment tracking.

use crate::field_line::FieldLine;
use crate::instructions::encode_string;
use crate::prefix_int;
use crate::static_table;
use bytes::{Bytes, BytesMut};

/// Encode a complete field section.
pub fn encode_field_section(fields: &[FieldLine]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + fields.len() * 16);

    // Section prefix: Required Insert Count 0, Delta Base 0.
    buf.extend_from_slice(&[0x00, 0x00]);

    for field in fields {
        if let Some(index) = static_table::find_exact(&field.name, &field.value) {
            // Indexed Field Line, static: 11 Index(6+).
            prefix_int::encode(index, 6, 0xc0, &mut buf);
        } else if let Some(index) = static_table::find_name(&field.name) {
            // Literal With Name Reference, static: 01 N=0 T=1 NameIndex(4+).
            prefix_int::encode(index, 4, 0x50, &mut buf);
            encode_string(&field.value, 8, 0, &mut buf);
        } else {
            // Literal With Literal Name: 001 N=0 H NameLen(3+).
            encode_string(&field.name, 4, 0x20, &mut buf);
            encode_string(&field.value, 8, 0, &mut buf);
        }
    }

    buf.freeze()
}
