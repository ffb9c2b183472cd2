//! The sans-io HTTP/3 server session.
//!
//! The transport driver feeds stream bytes in (`read_uni_stream`,
//! `read_request_stream`), drains events (`poll_event`), submits responses
//! and echo payload, and pumps the per-stream outbound queues
//! (`writable` / `pending` / `consume`) into the transport.

use std::collections::{HashMap, VecDeque};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use qecho_qpack::decoder::{Decoder, Section};
use qecho_qpack::encoder::encode_field_section;
use qecho_qpack::instructions::DecoderInstruction;
use qecho_qpack::{FieldLine, QpackError};

use crate::error::{Error, ErrorCode, Result};
use crate::frame::Frame;
use crate::settings::{PeerSettings, Settings};
use crate::stream_type::{self, StreamType};

/// Events surfaced to the connection driver.
#[derive(Debug)]
pub enum Event {
    /// The peer's SETTINGS arrived on its control stream.
    PeerSettings(PeerSettings),
    /// A complete header section on a request stream. `fin` is set when the
    /// stream ended with the headers (a bodiless request).
    Headers {
        stream_id: u64,
        fields: Vec<FieldLine>,
        fin: bool,
    },
    /// DATA frame payload on a request stream.
    Data { stream_id: u64, data: Bytes },
    /// The peer finished its side of a request stream.
    Finished { stream_id: u64 },
    /// A bidirectional stream announced itself as belonging to a
    /// WebTransport session (`0x41` signal).
    WebTransportBidi { stream_id: u64, session_id: u64 },
    /// A `0x54` unidirectional stream bound to a WebTransport session.
    WebTransportUni { stream_id: u64, session_id: u64 },
    /// Raw payload on a WebTransport stream (no HTTP/3 framing).
    WebTransportData { stream_id: u64, data: Bytes },
    /// GOAWAY from the peer.
    GoAway { id: u64 },
}

#[derive(Default)]
struct UniStream {
    kind: Option<StreamType>,
    buf: BytesMut,
    /// For WebTransport streams: session id once parsed.
    wt_session: Option<u64>,
}

#[derive(Default)]
struct RequestStream {
    buf: BytesMut,
    headers_received: bool,
    /// Headers parked in the QPACK decoder awaiting encoder-stream inserts.
    blocked: bool,
    wt_session: Option<u64>,
    fin_received: bool,
    finished_emitted: bool,
}

#[derive(Default)]
struct SendBuf {
    buf: BytesMut,
    fin: bool,
}

pub struct ServerSession {
    settings: Settings,
    peer_settings: Option<PeerSettings>,
    decoder: Decoder,

    /// Our three locally opened unidirectional streams.
    control_stream: Option<u64>,
    decoder_stream: Option<u64>,

    /// Peer-initiated unidirectional streams, keyed by stream id.
    peer_uni: HashMap<u64, UniStream>,
    peer_control: Option<u64>,
    peer_qpack_encoder: Option<u64>,
    peer_qpack_decoder: Option<u64>,

    requests: HashMap<u64, RequestStream>,
    highest_request_stream: Option<u64>,
    outbound: HashMap<u64, SendBuf>,
    events: VecDeque<Event>,
    max_client_streams_bidi: u64,
}

impl ServerSession {
    pub fn new(settings: Settings) -> Self {
        let decoder = Decoder::new(
            settings.qpack_max_table_capacity as usize,
            settings.qpack_blocked_streams as usize,
        );
        Self {
            settings,
            peer_settings: None,
            decoder,
            control_stream: None,
            decoder_stream: None,
            peer_uni: HashMap::new(),
            peer_control: None,
            peer_qpack_encoder: None,
            peer_qpack_decoder: None,
            requests: HashMap::new(),
            highest_request_stream: None,
            outbound: HashMap::new(),
            events: VecDeque::new(),
            max_client_streams_bidi: 0,
        }
    }

    /// Bind the three locally opened unidirectional streams as control and
    /// QPACK encoder/decoder, queueing their type prefixes and our SETTINGS.
    pub fn bind_uni_streams(&mut self, control: u64, encoder: u64, decoder: u64) {
        debug_assert!(control != encoder && encoder != decoder && control != decoder);

        let out = self.outbound.entry(control).or_default();
        stream_type::write_stream_type(StreamType::Control, &mut out.buf);
        Frame::Settings(self.settings.to_pairs()).encode(&mut out.buf);
        self.control_stream = Some(control);

        let out = self.outbound.entry(encoder).or_default();
        stream_type::write_stream_type(StreamType::QpackEncoder, &mut out.buf);

        let out = self.outbound.entry(decoder).or_default();
        stream_type::write_stream_type(StreamType::QpackDecoder, &mut out.buf);
        self.decoder_stream = Some(decoder);

        debug!(control, encoder, decoder, "bound HTTP/3 control and QPACK streams");
    }

    /// Mirror of the transport's `initial_max_streams_bidi`, used for the
    /// GOAWAY bound.
    pub fn set_max_client_streams_bidi(&mut self, n: u64) {
        self.max_client_streams_bidi = n;
    }

    pub fn peer_settings(&self) -> Option<&PeerSettings> {
        self.peer_settings.as_ref()
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Feed bytes received on a peer-initiated unidirectional stream.
    pub fn read_uni_stream(&mut self, stream_id: u64, data: &[u8], fin: bool) -> Result<()> {
        let stream = self.peer_uni.entry(stream_id).or_default();
        stream.buf.extend_from_slice(data);

        if stream.kind.is_none() {
            let Some(kind) = stream_type::read_stream_type(&mut stream.buf) else {
                return Ok(());
            };
            stream.kind = Some(kind);
            match kind {
                StreamType::Control => {
                    if self.peer_control.is_some() {
                        return Err(Error::protocol(
                            ErrorCode::StreamCreationError,
                            "duplicate control stream",
                        ));
                    }
                    self.peer_control = Some(stream_id);
                }
                StreamType::QpackEncoder => {
                    if self.peer_qpack_encoder.is_some() {
                        return Err(Error::protocol(
                            ErrorCode::StreamCreationError,
                            "duplicate QPACK encoder stream",
                        ));
                    }
                    self.peer_qpack_encoder = Some(stream_id);
                }
                StreamType::QpackDecoder => {
                    if self.peer_qpack_decoder.is_some() {
                        return Err(Error::protocol(
                            ErrorCode::StreamCreationError,
                            "duplicate QPACK decoder stream",
                        ));
                    }
                    self.peer_qpack_decoder = Some(stream_id);
                }
                StreamType::Push => {
                    return Err(Error::protocol(
                        ErrorCode::StreamCreationError,
                        "client-initiated push stream",
                    ));
                }
                StreamType::WebTransport | StreamType::Unknown(_) => {}
            }
        }

        match stream.kind {
            Some(StreamType::Control) => self.process_control_stream(stream_id, fin),
            Some(StreamType::QpackEncoder) => self.process_encoder_stream(stream_id, fin),
            Some(StreamType::QpackDecoder) => self.process_decoder_stream(stream_id, fin),
            Some(StreamType::WebTransport) => {
                self.process_webtransport_uni(stream_id);
                Ok(())
            }
            Some(StreamType::Push) | Some(StreamType::Unknown(_)) => {
                // Tolerated and drained without interpretation.
                if let Some(stream) = self.peer_uni.get_mut(&stream_id) {
                    trace!(stream_id, len = stream.buf.len(), "discarding unknown uni stream data");
                    stream.buf.clear();
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Feed bytes received on a client-initiated bidirectional stream.
    pub fn read_request_stream(&mut self, stream_id: u64, data: &[u8], fin: bool) -> Result<()> {
        let state = self.requests.entry(stream_id).or_default();
        state.buf.extend_from_slice(data);
        state.fin_received |= fin;
        self.highest_request_stream = Some(
            self.highest_request_stream
                .map_or(stream_id, |h| h.max(stream_id)),
        );
        self.process_request_stream(stream_id)
    }

    fn process_control_stream(&mut self, stream_id: u64, fin: bool) -> Result<()> {
        if fin {
            return Err(Error::protocol(
                ErrorCode::ClosedCriticalStream,
                "peer closed its control stream",
            ));
        }
        loop {
            let Some(stream) = self.peer_uni.get_mut(&stream_id) else {
                return Ok(());
            };
            let Some(frame) = Frame::parse(&mut stream.buf)? else {
                return Ok(());
            };
            match frame {
                Frame::Settings(pairs) => {
                    if self.peer_settings.is_some() {
                        return Err(Error::protocol(
                            ErrorCode::FrameUnexpected,
                            "duplicate SETTINGS",
                        ));
                    }
                    let peer = PeerSettings::from_pairs(&pairs);
                    debug!(
                        connect_protocol = peer.enable_connect_protocol,
                        h3_datagram = peer.h3_datagram,
                        "received peer SETTINGS"
                    );
                    self.peer_settings = Some(peer.clone());
                    self.events.push_back(Event::PeerSettings(peer));
                }
                frame if self.peer_settings.is_none() => {
                    return Err(Error::protocol(
                        ErrorCode::MissingSettings,
                        format!("control stream began with {frame:?}"),
                    ));
                }
                Frame::GoAway(id) => self.events.push_back(Event::GoAway { id }),
                Frame::MaxPushId(_) | Frame::CancelPush(_) => {
                    // Push is disabled; nothing to update.
                }
                Frame::Unknown { frame_type, .. } => {
                    trace!(frame_type, "ignoring unknown control frame");
                }
                Frame::Data(_) | Frame::Headers(_) | Frame::WebTransportStream { .. } => {
                    return Err(Error::protocol(
                        ErrorCode::FrameUnexpected,
                        "request frame on control stream",
                    ));
                }
            }
        }
    }

    fn process_encoder_stream(&mut self, stream_id: u64, fin: bool) -> Result<()> {
        if fin {
            return Err(Error::protocol(
                ErrorCode::ClosedCriticalStream,
                "peer closed its QPACK encoder stream",
            ));
        }
        let Some(stream) = self.peer_uni.get_mut(&stream_id) else {
            return Ok(());
        };
        let unblocked = self
            .decoder
            .read_encoder_stream(&mut stream.buf)
            .map_err(Error::from)?;
        self.flush_decoder_stream();

        for (request_id, fields) in unblocked {
            if let Some(state) = self.requests.get_mut(&request_id) {
                state.blocked = false;
                state.headers_received = true;
                let fin = state.fin_received && state.buf.is_empty();
                self.events.push_back(Event::Headers {
                    stream_id: request_id,
                    fields,
                    fin,
                });
                self.process_request_stream(request_id)?;
            }
        }
        Ok(())
    }

    fn process_decoder_stream(&mut self, stream_id: u64, fin: bool) -> Result<()> {
        if fin {
            return Err(Error::protocol(
                ErrorCode::ClosedCriticalStream,
                "peer closed its QPACK decoder stream",
            ));
        }
        // Our encoder never references the dynamic table, so there is
        // nothing to act on; instructions are validated and dropped.
        let Some(stream) = self.peer_uni.get_mut(&stream_id) else {
            return Ok(());
        };
        loop {
            match DecoderInstruction::decode(&stream.buf) {
                Ok((instruction, consumed)) => {
                    trace!(?instruction, "peer decoder stream instruction");
                    let _ = stream.buf.split_to(consumed);
                }
                Err(QpackError::UnexpectedEof) => return Ok(()),
                Err(e) => {
                    return Err(Error::Qpack(QpackError::DecoderStream(e.to_string())));
                }
            }
        }
    }

    fn process_webtransport_uni(&mut self, stream_id: u64) {
        let Some(stream) = self.peer_uni.get_mut(&stream_id) else {
            return;
        };
        if stream.wt_session.is_none() {
            let Some((session_id, consumed)) = crate::varint::decode(&stream.buf) else {
                return;
            };
            let _ = stream.buf.split_to(consumed);
            stream.wt_session = Some(session_id);
            self.events.push_back(Event::WebTransportUni {
                stream_id,
                session_id,
            });
        }
        // One-way stream: payload has no echo path, drop it.
        if !stream.buf.is_empty() {
            trace!(
                stream_id,
                len = stream.buf.len(),
                "dropping WebTransport uni payload"
            );
            stream.buf.clear();
        }
    }

    fn process_request_stream(&mut self, stream_id: u64) -> Result<()> {
        loop {
            let Some(state) = self.requests.get_mut(&stream_id) else {
                return Ok(());
            };

            if state.blocked {
                // Headers parked in the QPACK decoder; nothing may be
                // delivered out of order behind them.
                return Ok(());
            }

            if state.wt_session.is_some() {
                if !state.buf.is_empty() {
                    let data = state.buf.split().freeze();
                    self.events.push_back(Event::WebTransportData { stream_id, data });
                }
                break;
            }

            let Some(frame) = Frame::parse(&mut state.buf)? else {
                break;
            };
            match frame {
                Frame::Headers(block) => {
                    if state.headers_received {
                        trace!(stream_id, "ignoring trailer section");
                        continue;
                    }
                    match self.decoder.decode_section(stream_id, &block)? {
                        Section::Decoded(fields) => {
                            state.headers_received = true;
                            let fin = state.fin_received && state.buf.is_empty();
                            self.events.push_back(Event::Headers {
                                stream_id,
                                fields,
                                fin,
                            });
                        }
                        Section::Blocked => {
                            debug!(stream_id, "header section blocked on QPACK inserts");
                            state.blocked = true;
                        }
                    }
                    self.flush_decoder_stream();
                }
                Frame::Data(payload) => {
                    if !state.headers_received {
                        return Err(Error::protocol(
                            ErrorCode::FrameUnexpected,
                            "DATA before HEADERS",
                        ));
                    }
                    self.events.push_back(Event::Data {
                        stream_id,
                        data: payload,
                    });
                }
                Frame::WebTransportStream { session_id } => {
                    if state.headers_received {
                        return Err(Error::protocol(
                            ErrorCode::FrameUnexpected,
                            "WEBTRANSPORT_STREAM after HEADERS",
                        ));
                    }
                    state.wt_session = Some(session_id);
                    self.events.push_back(Event::WebTransportBidi {
                        stream_id,
                        session_id,
                    });
                }
                Frame::Unknown { frame_type, .. } => {
                    trace!(stream_id, frame_type, "ignoring unknown request frame");
                }
                Frame::Settings(_) | Frame::GoAway(_) | Frame::MaxPushId(_)
                | Frame::CancelPush(_) => {
                    return Err(Error::protocol(
                        ErrorCode::FrameUnexpected,
                        "control frame on request stream",
                    ));
                }
            }
        }

        let Some(state) = self.requests.get_mut(&stream_id) else {
            return Ok(());
        };
        if state.fin_received
            && state.buf.is_empty()
            && !state.blocked
            && !state.finished_emitted
            && (state.headers_received || state.wt_session.is_some())
        {
            state.finished_emitted = true;
            self.events.push_back(Event::Finished { stream_id });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stream lifecycle
    // ------------------------------------------------------------------

    /// The peer reset its sending side of a request stream.
    pub fn stream_reset(&mut self, stream_id: u64) {
        self.decoder.cancel_stream(stream_id);
        self.flush_decoder_stream();
        self.requests.remove(&stream_id);
    }

    /// The peer asked us to stop sending on a stream.
    pub fn stream_stopped(&mut self, stream_id: u64) {
        self.outbound.remove(&stream_id);
    }

    /// The stream is gone at the transport level.
    pub fn stream_closed(&mut self, stream_id: u64) {
        self.decoder.cancel_stream(stream_id);
        self.flush_decoder_stream();
        self.requests.remove(&stream_id);
        self.peer_uni.remove(&stream_id);
        self.outbound.remove(&stream_id);
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Queue a response header section on a request stream.
    pub fn submit_response(
        &mut self,
        stream_id: u64,
        fields: &[FieldLine],
        fin: bool,
    ) -> Result<()> {
        if !self.requests.contains_key(&stream_id) {
            return Err(Error::UnknownStream(stream_id));
        }
        let section = encode_field_section(fields);
        let out = self.outbound.entry(stream_id).or_default();
        Frame::Headers(section).encode(&mut out.buf);
        out.fin |= fin;
        Ok(())
    }

    /// Queue payload on a request stream: raw bytes on WebTransport
    /// streams, a DATA frame otherwise.
    pub fn submit_data(&mut self, stream_id: u64, data: &[u8]) -> Result<()> {
        let raw = self
            .requests
            .get(&stream_id)
            .ok_or(Error::UnknownStream(stream_id))?
            .wt_session
            .is_some();
        let out = self.outbound.entry(stream_id).or_default();
        if raw {
            out.buf.extend_from_slice(data);
        } else {
            Frame::Data(Bytes::copy_from_slice(data)).encode(&mut out.buf);
        }
        Ok(())
    }

    /// Request FIN on a stream once its queue drains.
    pub fn finish_stream(&mut self, stream_id: u64) {
        self.outbound.entry(stream_id).or_default().fin = true;
    }

    /// Queue GOAWAY on our control stream, bounding accepted requests.
    pub fn goaway(&mut self) {
        let Some(control) = self.control_stream else {
            return;
        };
        let id = self
            .highest_request_stream
            .map_or(0, |h| h + 4)
            .min(self.max_client_streams_bidi.saturating_mul(4));
        let out = self.outbound.entry(control).or_default();
        Frame::GoAway(id).encode(&mut out.buf);
        debug!(id, "queued GOAWAY");
    }

    /// Stream ids with pending bytes or a deliverable FIN.
    pub fn writable(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .outbound
            .iter()
            .filter(|(_, out)| !out.buf.is_empty() || out.fin)
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// The unsent slice for a stream and whether FIN follows it.
    pub fn pending(&self, stream_id: u64) -> Option<(&[u8], bool)> {
        self.outbound
            .get(&stream_id)
            .map(|out| (&out.buf[..], out.fin))
    }

    /// The transport accepted `n` bytes of the pending slice.
    pub fn consume(&mut self, stream_id: u64, n: usize) {
        if let Some(out) = self.outbound.get_mut(&stream_id) {
            let _ = out.buf.split_to(n);
        }
    }

    /// FIN was handed to the transport; the stream's queue is done.
    pub fn fin_sent(&mut self, stream_id: u64) {
        self.outbound.remove(&stream_id);
    }

    fn flush_decoder_stream(&mut self) {
        if let Some(bytes) = self.decoder.take_stream_output() {
            if let Some(decoder_stream) = self.decoder_stream {
                self.outbound
                    .entry(decoder_stream)
                    .or_default()
                    .buf
                    .extend_from_slice(&bytes);
            } else {
                warn!("dropping QPACK decoder output: no decoder stream bound");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FRAME_WEBTRANSPORT_STREAM;
    use crate::varint;

    fn session() -> ServerSession {
        let mut s = ServerSession::new(Settings::default());
        s.bind_uni_streams(3, 7, 11);
        s.set_max_client_streams_bidi(100);
        s
    }

    fn client_headers(fields: &[FieldLine]) -> BytesMut {
        let mut buf = BytesMut::new();
        Frame::Headers(encode_field_section(fields)).encode(&mut buf);
        buf
    }

    fn get_request(path: &str) -> BytesMut {
        client_headers(&[
            FieldLine::new(":method", "GET"),
            FieldLine::new(":scheme", "https"),
            FieldLine::new(":authority", "localhost"),
            FieldLine::new(":path", path.to_string()),
        ])
    }

    #[test]
    fn control_stream_carries_settings_first() {
        let mut s = session();
        let (data, fin) = s.pending(3).expect("control stream queued");
        assert!(!fin);
        // Type prefix 0x00 then a SETTINGS frame.
        assert_eq!(data[0], 0x00);
        assert_eq!(data[1], 0x04);

        let mut buf = BytesMut::from(&data[1..]);
        let frame = Frame::parse(&mut buf).unwrap().unwrap();
        match frame {
            Frame::Settings(pairs) => {
                assert!(pairs.contains(&(crate::settings::SETTINGS_WT_MAX_SESSIONS, 100)));
            }
            other => panic!("expected SETTINGS, got {other:?}"),
        }
    }

    #[test]
    fn qpack_streams_carry_type_prefixes() {
        let s = session();
        assert_eq!(s.pending(7).unwrap().0, &[0x02]);
        assert_eq!(s.pending(11).unwrap().0, &[0x03]);
        assert_eq!(s.writable(), vec![3, 7, 11]);
    }

    #[test]
    fn get_request_produces_headers_and_finished() {
        let mut s = session();
        let request = get_request("/");
        s.read_request_stream(0, &request, true).unwrap();

        match s.poll_event() {
            Some(Event::Headers { stream_id, fields, fin }) => {
                assert_eq!(stream_id, 0);
                assert!(fin);
                assert!(fields
                    .iter()
                    .any(|f| &f.name[..] == b":method" && &f.value[..] == b"GET"));
            }
            other => panic!("expected Headers, got {other:?}"),
        }
        assert!(matches!(
            s.poll_event(),
            Some(Event::Finished { stream_id: 0 })
        ));
    }

    #[test]
    fn split_delivery_reassembles() {
        let mut s = session();
        let request = get_request("/.well-known/webtransport");
        let (a, b) = request.split_at(3);
        s.read_request_stream(0, a, false).unwrap();
        assert!(s.poll_event().is_none());
        s.read_request_stream(0, b, true).unwrap();
        assert!(matches!(s.poll_event(), Some(Event::Headers { fin: true, .. })));
    }

    #[test]
    fn response_is_framed_and_finned() {
        let mut s = session();
        s.read_request_stream(0, &get_request("/"), true).unwrap();
        while s.poll_event().is_some() {}

        s.submit_response(
            0,
            &[
                FieldLine::new(":status", "200"),
                FieldLine::new("content-type", "text/plain"),
            ],
            true,
        )
        .unwrap();

        let (data, fin) = s.pending(0).unwrap();
        assert!(fin);
        let mut buf = BytesMut::from(data);
        assert!(matches!(
            Frame::parse(&mut buf).unwrap(),
            Some(Frame::Headers(_))
        ));
        assert!(buf.is_empty());

        // Drain in two steps, then mark the FIN delivered.
        let n = data.len();
        s.consume(0, 1);
        assert_eq!(s.pending(0).unwrap().0.len(), n - 1);
        s.consume(0, n - 1);
        assert!(s.pending(0).unwrap().0.is_empty());
        s.fin_sent(0);
        assert!(s.pending(0).is_none());
    }

    #[test]
    fn webtransport_bidi_signal_switches_to_raw() {
        let mut s = session();

        let mut wire = BytesMut::new();
        varint::encode(FRAME_WEBTRANSPORT_STREAM, &mut wire);
        varint::encode(0, &mut wire); // session id = CONNECT stream 0
        wire.extend_from_slice(b"ping");
        s.read_request_stream(8, &wire, false).unwrap();

        assert!(matches!(
            s.poll_event(),
            Some(Event::WebTransportBidi { stream_id: 8, session_id: 0 })
        ));
        match s.poll_event() {
            Some(Event::WebTransportData { stream_id: 8, data }) => {
                assert_eq!(&data[..], b"ping")
            }
            other => panic!("expected WebTransportData, got {other:?}"),
        }

        // Echo goes back unframed.
        s.submit_data(8, b"ping").unwrap();
        assert_eq!(s.pending(8).unwrap().0, b"ping");
    }

    #[test]
    fn websocket_data_echo_uses_data_frames() {
        let mut s = session();
        let connect = client_headers(&[
            FieldLine::new(":method", "CONNECT"),
            FieldLine::new(":protocol", "websocket"),
            FieldLine::new(":scheme", "https"),
            FieldLine::new(":authority", "localhost"),
            FieldLine::new(":path", "/chat"),
        ]);
        s.read_request_stream(0, &connect, false).unwrap();
        assert!(matches!(s.poll_event(), Some(Event::Headers { fin: false, .. })));

        let mut wire = BytesMut::new();
        Frame::Data(Bytes::from_static(b"frame")).encode(&mut wire);
        s.read_request_stream(0, &wire, false).unwrap();
        match s.poll_event() {
            Some(Event::Data { stream_id: 0, data }) => assert_eq!(&data[..], b"frame"),
            other => panic!("expected Data, got {other:?}"),
        }

        s.submit_data(0, b"frame").unwrap();
        let (pending, fin) = s.pending(0).unwrap();
        assert!(!fin);
        let mut buf = BytesMut::from(pending);
        assert_eq!(
            Frame::parse(&mut buf).unwrap(),
            Some(Frame::Data(Bytes::from_static(b"frame")))
        );
    }

    #[test]
    fn peer_settings_surface_and_stick() {
        let mut s = session();
        let mut wire = BytesMut::new();
        stream_type::write_stream_type(StreamType::Control, &mut wire);
        Frame::Settings(vec![(0x08, 1), (0x33, 1)]).encode(&mut wire);
        s.read_uni_stream(2, &wire, false).unwrap();

        match s.poll_event() {
            Some(Event::PeerSettings(peer)) => assert!(peer.supports_webtransport()),
            other => panic!("expected PeerSettings, got {other:?}"),
        }
        assert!(s.peer_settings().unwrap().enable_connect_protocol);
    }

    #[test]
    fn control_stream_must_start_with_settings() {
        let mut s = session();
        let mut wire = BytesMut::new();
        stream_type::write_stream_type(StreamType::Control, &mut wire);
        Frame::GoAway(0).encode(&mut wire);
        let err = s.read_uni_stream(2, &wire, false).unwrap_err();
        assert_eq!(err.to_error_code(), ErrorCode::MissingSettings);
    }

    #[test]
    fn duplicate_control_stream_rejected() {
        let mut s = session();
        let mut wire = BytesMut::new();
        stream_type::write_stream_type(StreamType::Control, &mut wire);
        Frame::Settings(vec![]).encode(&mut wire);
        s.read_uni_stream(2, &wire, false).unwrap();

        let mut wire = BytesMut::new();
        stream_type::write_stream_type(StreamType::Control, &mut wire);
        let err = s.read_uni_stream(6, &wire, false).unwrap_err();
        assert_eq!(err.to_error_code(), ErrorCode::StreamCreationError);
    }

    #[test]
    fn webtransport_uni_classified_then_discarded() {
        let mut s = session();
        let mut wire = BytesMut::new();
        stream_type::write_stream_type(StreamType::WebTransport, &mut wire);
        varint::encode(0, &mut wire);
        wire.extend_from_slice(b"one-way payload");
        s.read_uni_stream(2, &wire, false).unwrap();
        assert!(matches!(
            s.poll_event(),
            Some(Event::WebTransportUni { stream_id: 2, session_id: 0 })
        ));
        assert!(s.poll_event().is_none());
    }

    #[test]
    fn goaway_points_past_highest_request() {
        let mut s = session();
        s.read_request_stream(8, &get_request("/"), true).unwrap();
        while s.poll_event().is_some() {}
        s.goaway();
        let (control, _) = s.pending(3).unwrap();
        // Skip type prefix + SETTINGS, then expect GOAWAY(12).
        let mut buf = BytesMut::from(&control[1..]);
        let _settings = Frame::parse(&mut buf).unwrap().unwrap();
        assert_eq!(Frame::parse(&mut buf).unwrap(), Some(Frame::GoAway(12)));
    }
}
