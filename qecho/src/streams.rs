//! Per-stream echo state.
//!
//! Each active stream gets a record tagged with its classification at the
//! first meaningful event. The record carries the echo buffer for raw
//! mode, the lifetime byte budget shared by all echo modes, and the
//! captured pseudo-headers for HTTP/3 request streams.

use crate::config::STREAM_BUF_SIZE;
use bytes::BytesMut;
use std::collections::HashMap;

const METHOD_MAX: usize = 16;
const PATH_MAX: usize = 256;
const PROTOCOL_MAX: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamClass {
    /// Raw QUIC echo (ALPN `echo`).
    RawEcho,
    /// HTTP/3 request stream.
    H3Request,
    /// WebTransport bidirectional stream (session or in-session).
    WtBidi,
    /// WebTransport unidirectional stream.
    WtUni,
    /// WebSocket over HTTP/3 (RFC 9220).
    Ws,
}

#[derive(Debug)]
pub struct StreamRecord {
    pub class: StreamClass,
    /// Unsent echo bytes (raw mode only; H3 modes queue in the session).
    sendbuf: BytesMut,
    /// Total bytes ever admitted; the 64 KiB cap is a lifetime budget.
    admitted: usize,
    fin_received: bool,
    pub fin_sent: bool,
    pub method: String,
    pub path: String,
    pub protocol: String,
    pub wt_session_id: Option<u64>,
}

impl StreamRecord {
    pub fn new(class: StreamClass) -> Self {
        Self {
            class,
            sendbuf: BytesMut::new(),
            admitted: 0,
            fin_received: false,
            fin_sent: false,
            method: String::new(),
            path: String::new(),
            protocol: String::new(),
            wt_session_id: None,
        }
    }

    /// Reserve space against the lifetime budget; the overflow is dropped.
    pub fn admit(&mut self, len: usize) -> usize {
        let allowed = len.min(STREAM_BUF_SIZE - self.admitted);
        self.admitted += allowed;
        allowed
    }

    /// Append data for raw echo, honoring the budget. Returns accepted count.
    pub fn buffer(&mut self, data: &[u8]) -> usize {
        let allowed = self.admit(data.len());
        self.sendbuf.extend_from_slice(&data[..allowed]);
        allowed
    }

    pub fn unsent(&self) -> &[u8] {
        &self.sendbuf
    }

    /// The transport accepted `n` echo bytes.
    pub fn advance(&mut self, n: usize) {
        let _ = self.sendbuf.split_to(n);
    }

    pub fn is_drained(&self) -> bool {
        self.sendbuf.is_empty()
    }

    /// FIN seen from the peer; monotone.
    pub fn set_fin_received(&mut self) {
        self.fin_received = true;
    }

    pub fn fin_received(&self) -> bool {
        self.fin_received
    }

    pub fn set_method(&mut self, value: &[u8]) {
        self.method = bounded_copy(value, METHOD_MAX);
    }

    pub fn set_path(&mut self, value: &[u8]) {
        self.path = bounded_copy(value, PATH_MAX);
    }

    pub fn set_protocol(&mut self, value: &[u8]) {
        self.protocol = bounded_copy(value, PROTOCOL_MAX);
    }
}

fn bounded_copy(value: &[u8], cap: usize) -> String {
    let end = value.len().min(cap);
    String::from_utf8_lossy(&value[..end]).into_owned()
}

/// Stream records keyed by stream id.
#[derive(Default)]
pub struct StreamTable {
    records: HashMap<u64, StreamRecord>,
}

impl StreamTable {
    pub fn get_or_create(&mut self, stream_id: u64, class: StreamClass) -> &mut StreamRecord {
        self.records
            .entry(stream_id)
            .or_insert_with(|| StreamRecord::new(class))
    }

    pub fn get_mut(&mut self, stream_id: u64) -> Option<&mut StreamRecord> {
        self.records.get_mut(&stream_id)
    }

    pub fn get(&self, stream_id: u64) -> Option<&StreamRecord> {
        self.records.get(&stream_id)
    }

    pub fn remove(&mut self, stream_id: u64) -> Option<StreamRecord> {
        self.records.remove(&stream_id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&u64, &mut StreamRecord)> {
        self.records.iter_mut()
    }

    /// Ids with unsent bytes or an unsent FIN, in id order.
    pub fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .records
            .iter()
            .filter(|(_, r)| !r.is_drained() || (r.fin_received() && !r.fin_sent))
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_bytes_are_fifo() {
        let mut record = StreamRecord::new(StreamClass::RawEcho);
        assert_eq!(record.buffer(b"hello "), 6);
        assert_eq!(record.buffer(b"world"), 5);
        assert_eq!(record.unsent(), b"hello world");

        record.advance(6);
        assert_eq!(record.unsent(), b"world");
        record.advance(5);
        assert!(record.is_drained());
    }

    #[test]
    fn lifetime_cap_truncates_silently() {
        let mut record = StreamRecord::new(StreamClass::RawEcho);
        let big = vec![0xabu8; STREAM_BUF_SIZE - 10];
        assert_eq!(record.buffer(&big), STREAM_BUF_SIZE - 10);
        // Only 10 bytes of budget remain, even after draining.
        record.advance(STREAM_BUF_SIZE - 10);
        assert_eq!(record.buffer(&[0u8; 64]), 10);
        assert_eq!(record.buffer(b"more"), 0);
    }

    #[test]
    fn fin_is_monotone() {
        let mut record = StreamRecord::new(StreamClass::RawEcho);
        assert!(!record.fin_received());
        record.set_fin_received();
        record.set_fin_received();
        assert!(record.fin_received());
    }

    #[test]
    fn pseudo_headers_are_bounded() {
        let mut record = StreamRecord::new(StreamClass::H3Request);
        record.set_method(b"CONNECT");
        record.set_protocol(b"webtransport");
        record.set_path(&vec![b'a'; 1000]);
        assert_eq!(record.method, "CONNECT");
        assert_eq!(record.protocol, "webtransport");
        assert_eq!(record.path.len(), 256);
    }

    #[test]
    fn pending_ids_cover_data_and_bare_fin() {
        let mut table = StreamTable::default();
        table
            .get_or_create(0, StreamClass::RawEcho)
            .buffer(b"data");
        table.get_or_create(4, StreamClass::RawEcho).set_fin_received();
        let drained = table.get_or_create(8, StreamClass::RawEcho);
        drained.buffer(b"x");
        drained.advance(1);

        assert_eq!(table.pending_ids(), vec![0, 4]);

        // Once the FIN is echoed the stream drops out.
        table.get_mut(4).unwrap().fin_sent = true;
        assert_eq!(table.pending_ids(), vec![0]);
    }
}
