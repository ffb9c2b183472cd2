//! QPACK error types.

use thiserror::Error;

/// Result type for QPACK operations.
pub type Result<T> = std::result::Result<T, QpackError>;

/// Errors raised by the QPACK codec.
///
/// `DecompressionFailed`, `EncoderStream` and `DecoderStream` map onto the
/// three QPACK error codes of RFC 9204 Section 6; the remaining variants are
/// internal precursors that callers fold into those codes.
#[derive(Debug, Error)]
pub enum QpackError {
    /// Input ended in the middle of an integer, string, or instruction.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A prefix integer exceeded the representable range.
    #[error("prefix integer overflow")]
    IntegerOverflow,

    /// Huffman-encoded string could not be decoded.
    #[error("invalid Huffman encoding")]
    InvalidHuffman,

    /// A field-section could not be interpreted.
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    /// An instruction on the encoder stream was invalid.
    #[error("encoder stream error: {0}")]
    EncoderStream(String),

    /// An instruction on the decoder stream was invalid.
    #[error("decoder stream error: {0}")]
    DecoderStream(String),

    /// Dynamic table capacity or entry-size violation.
    #[error("dynamic table error: {0}")]
    DynamicTable(String),

    /// More sections are blocked than SETTINGS_QPACK_BLOCKED_STREAMS allows.
    #[error("too many blocked streams ({0} > {1})")]
    TooManyBlockedStreams(usize, usize),
}
