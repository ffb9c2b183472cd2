//! A single header field line.

use bytes::Bytes;

/// A decoded `name: value` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLine {
    pub name: Bytes,
    pub value: Bytes,
}

impl FieldLine {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Table size contribution per RFC 9204 Section 3.2.1.
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}
