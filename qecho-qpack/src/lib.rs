//! QPACK header compression per RFC 9204.
//!
//! This crate provides the field-section codec used by `qecho-h3`: prefix
//! integers, Huffman strings, the static table, a dynamic table fed by
//! encoder stream instructions, and the decoder/encoder state machines.
//!
//! The decoder handles the full inbound representation space (clients may
//! use the dynamic table and Huffman strings). The encoder only produces
//! sections with a Required Insert Count of zero; the server's responses
//! never reference the dynamic table.

pub mod decoder;
pub mod dynamic_table;
pub mod encoder;
pub mod error;
pub mod field_line;
pub mod huffman;
pub mod instructions;
pub mod prefix_int;
pub mod static_table;

pub use decoder::{Decoder, Section};
pub use encoder::encode_field_section;
pub use error::{QpackError, Result};
pub use field_line::FieldLine;
pub use instructions::{DecoderInstruction, EncoderInstruction};
