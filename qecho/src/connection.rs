//! Per-connection driver.
//!
//! Binds one transport connection to its TLS-negotiated protocol, the
//! stream table, and (for `h3`) the HTTP/3 session. The server feeds it
//! transport events and timeouts; the driver reacts by mutating stream
//! state, queueing echo bytes and HTTP/3 responses, and running the write
//! engine so the transport has packets to emit.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use quinn_proto::{
    Connection, Dir, Event, ReadError, Side, StreamEvent, StreamId, VarInt, WriteError,
};
use tracing::{debug, info, trace, warn};

use qecho_h3::{self as h3, FieldLine, ServerSession, Settings};

use crate::config::MAX_STREAMS_BIDI;
use crate::streams::{StreamClass, StreamTable};

/// Application protocol, fixed by ALPN right after the Initial flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Echo,
    H3,
}

/// `index | dir | initiator` packing of RFC 9000 Section 2.1.
fn raw_stream_id(id: StreamId) -> u64 {
    let initiator = match id.initiator() {
        Side::Client => 0,
        Side::Server => 1,
    };
    let dir = match id.dir() {
        Dir::Bi => 0,
        Dir::Uni => 2,
    };
    (id.index() << 2) | dir | initiator
}

pub struct ConnectionDriver {
    pub(crate) conn: Connection,
    remote: SocketAddr,
    proto: Option<Proto>,
    handshake_done: bool,
    lost: bool,
    h3: Option<ServerSession>,
    /// Our three H3 unidirectional streams, collected as credit allows.
    h3_uni_streams: Vec<StreamId>,
    /// Streams left unread until the H3 session exists (0-RTT arrivals).
    deferred_readable: Vec<StreamId>,
    streams: StreamTable,
    stream_ids: HashMap<u64, StreamId>,
    wt_session_stream: Option<u64>,
}

impl ConnectionDriver {
    pub fn new(conn: Connection, remote: SocketAddr) -> Self {
        Self {
            conn,
            remote,
            proto: None,
            handshake_done: false,
            lost: false,
            h3: None,
            h3_uni_streams: Vec::new(),
            deferred_readable: Vec::new(),
            streams: StreamTable::default(),
            stream_ids: HashMap::new(),
            wt_session_stream: None,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn proto(&self) -> Option<Proto> {
        self.proto
    }

    /// Process pending transport events, then run the write engine.
    pub fn process(&mut self, now: Instant) {
        while let Some(event) = self.conn.poll() {
            match event {
                Event::HandshakeDataReady => self.dispatch_alpn(),
                Event::Connected => {
                    self.handshake_done = true;
                    info!(peer = %self.remote, "handshake completed");
                }
                Event::ConnectionLost { reason } => {
                    info!(peer = %self.remote, %reason, "connection lost");
                    self.lost = true;
                }
                Event::Stream(StreamEvent::Opened { dir }) => self.accept_streams(dir, now),
                Event::Stream(StreamEvent::Readable { id }) => self.read_stream(id, now),
                Event::Stream(StreamEvent::Stopped { id, error_code }) => {
                    self.on_stopped(id, error_code)
                }
                Event::Stream(StreamEvent::Finished { id }) => {
                    trace!(stream_id = raw_stream_id(id), "send side fully acknowledged");
                }
                Event::Stream(StreamEvent::Writable { .. })
                | Event::Stream(StreamEvent::Available { .. }) => {}
                Event::DatagramReceived => self.echo_datagrams(),
                Event::DatagramsUnblocked => {}
            }
        }

        if self.lost {
            return;
        }
        self.maybe_setup_h3(now);
        self.write_streams();
    }

    /// Read the negotiated ALPN and fix the connection's protocol. Runs on
    /// the first flight, before the handshake completes, so 0-RTT data is
    /// already dispatched correctly.
    fn dispatch_alpn(&mut self) {
        if self.proto.is_some() {
            return;
        }
        let alpn = self
            .conn
            .crypto_session()
            .handshake_data()
            .and_then(|data| {
                data.downcast::<quinn_proto::crypto::rustls::HandshakeData>()
                    .ok()
            })
            .and_then(|hd| hd.protocol);

        let proto = match alpn.as_deref() {
            Some(b"h3") => Proto::H3,
            _ => Proto::Echo,
        };
        self.proto = Some(proto);
        match proto {
            Proto::H3 => info!(peer = %self.remote, "protocol: HTTP/3 (WebTransport + WebSocket enabled)"),
            Proto::Echo => info!(peer = %self.remote, "protocol: raw echo"),
        }
    }

    fn accept_streams(&mut self, dir: Dir, now: Instant) {
        while let Some(id) = self.conn.streams().accept(dir) {
            let sid = raw_stream_id(id);
            self.stream_ids.insert(sid, id);
            debug!(stream_id = sid, ?dir, "peer opened stream");
            if self.proto == Some(Proto::Echo) && dir == Dir::Bi {
                self.streams.get_or_create(sid, StreamClass::RawEcho);
            }
            self.read_stream(id, now);
        }
    }

    fn read_stream(&mut self, id: StreamId, now: Instant) {
        // H3 streams stay buffered in the transport until the session is up.
        if self.proto == Some(Proto::H3) && self.h3.is_none() {
            if !self.deferred_readable.contains(&id) {
                self.deferred_readable.push(id);
            }
            return;
        }

        let zero_rtt = self.conn.is_handshaking();
        let mut data: Vec<Bytes> = Vec::new();
        let mut fin = false;
        let mut reset_code: Option<VarInt> = None;
        {
            let mut recv = self.conn.recv_stream(id);
            let mut chunks = match recv.read(true) {
                Ok(chunks) => chunks,
                Err(_) => return,
            };
            loop {
                match chunks.next(usize::MAX) {
                    Ok(Some(chunk)) => data.push(chunk.bytes),
                    Ok(None) => {
                        fin = true;
                        break;
                    }
                    Err(ReadError::Blocked) => break,
                    Err(ReadError::Reset(code)) => {
                        reset_code = Some(code);
                        break;
                    }
                }
            }
            let _ = chunks.finalize();
        }

        let sid = raw_stream_id(id);
        self.stream_ids.insert(sid, id);

        if let Some(code) = reset_code {
            self.on_reset(sid, code);
            return;
        }
        if data.is_empty() && !fin {
            return;
        }

        match self.proto {
            Some(Proto::H3) => self.read_h3(sid, id.dir(), data, fin, now),
            _ => self.read_echo(sid, id.dir(), data, fin, zero_rtt),
        }
    }

    fn read_echo(&mut self, sid: u64, dir: Dir, data: Vec<Bytes>, fin: bool, zero_rtt: bool) {
        if dir == Dir::Uni {
            // No send side to echo on; drain and drop.
            let len: usize = data.iter().map(Bytes::len).sum();
            debug!(stream_id = sid, len, "discarding payload on uni echo stream");
            return;
        }
        let record = self.streams.get_or_create(sid, StreamClass::RawEcho);
        let mut received = 0usize;
        let mut accepted = 0usize;
        for chunk in &data {
            received += chunk.len();
            accepted += record.buffer(chunk);
        }
        if fin {
            record.set_fin_received();
        }
        if accepted < received {
            warn!(
                stream_id = sid,
                dropped = received - accepted,
                "echo buffer full, truncating"
            );
        }
        debug!(stream_id = sid, bytes = received, fin, zero_rtt, "buffered echo payload");
    }

    fn read_h3(&mut self, sid: u64, dir: Dir, data: Vec<Bytes>, fin: bool, now: Instant) {
        let Some(session) = self.h3.as_mut() else {
            return;
        };
        let feed = |session: &mut ServerSession, chunk: &[u8], fin: bool| {
            if dir == Dir::Uni {
                session.read_uni_stream(sid, chunk, fin)
            } else {
                session.read_request_stream(sid, chunk, fin)
            }
        };

        let result = if data.is_empty() {
            feed(&mut *session, &[], fin)
        } else {
            let last = data.len() - 1;
            data.iter()
                .enumerate()
                .try_for_each(|(i, chunk)| feed(&mut *session, chunk, fin && i == last))
        };

        if let Err(error) = result {
            self.on_h3_error(sid, error, now);
            return;
        }
        self.drain_h3_events();
    }

    /// Stream-level HTTP/3 errors shut down the offending stream with the
    /// inferred application code; connection-level ones close the whole
    /// connection.
    fn on_h3_error(&mut self, sid: u64, error: h3::Error, now: Instant) {
        if error.is_connection_error() {
            self.close_h3(error, now);
            return;
        }
        let code = error.to_error_code();
        warn!(stream_id = sid, %error, %code, "request stream error, resetting stream");
        if let Some(&id) = self.stream_ids.get(&sid) {
            let code = VarInt::from_u32(code.to_code() as u32);
            let _ = self.conn.recv_stream(id).stop(code);
            let _ = self.conn.send_stream(id).reset(code);
        }
        if let Some(session) = self.h3.as_mut() {
            session.stream_reset(sid);
            session.stream_stopped(sid);
        }
        if self.wt_session_stream == Some(sid) {
            info!(stream_id = sid, "WebTransport session closed");
            self.wt_session_stream = None;
        }
        self.streams.remove(sid);
        self.stream_ids.remove(&sid);
    }

    fn drain_h3_events(&mut self) {
        while let Some(event) = self.h3.as_mut().and_then(ServerSession::poll_event) {
            self.on_h3_event(event);
        }
    }

    fn on_h3_event(&mut self, event: h3::Event) {
        match event {
            h3::Event::PeerSettings(peer) => {
                if !peer.supports_webtransport() {
                    warn!(
                        connect_protocol = peer.enable_connect_protocol,
                        h3_datagram = peer.h3_datagram,
                        "peer SETTINGS insufficient for WebTransport"
                    );
                }
            }
            h3::Event::Headers { stream_id, fields, fin } => {
                self.on_request_headers(stream_id, &fields, fin)
            }
            h3::Event::Data { stream_id, data }
            | h3::Event::WebTransportData { stream_id, data } => {
                self.echo_h3_payload(stream_id, &data)
            }
            h3::Event::Finished { stream_id } => {
                if let Some(record) = self.streams.get_mut(stream_id) {
                    record.set_fin_received();
                }
                if let Some(session) = self.h3.as_mut() {
                    session.finish_stream(stream_id);
                }
            }
            h3::Event::WebTransportBidi { stream_id, session_id } => {
                if self.wt_session_stream != Some(session_id) {
                    warn!(stream_id, session_id, "stream names an unknown WebTransport session");
                }
                let record = self.streams.get_or_create(stream_id, StreamClass::WtBidi);
                record.class = StreamClass::WtBidi;
                record.wt_session_id = Some(session_id);
                debug!(stream_id, session_id, "WebTransport stream opened");
            }
            h3::Event::WebTransportUni { stream_id, session_id } => {
                let record = self.streams.get_or_create(stream_id, StreamClass::WtUni);
                record.wt_session_id = Some(session_id);
                debug!(stream_id, session_id, "WebTransport uni stream (no echo path)");
            }
            h3::Event::GoAway { id } => info!(id, "peer sent GOAWAY"),
        }
    }

    fn on_request_headers(&mut self, stream_id: u64, fields: &[FieldLine], fin: bool) {
        let record = self.streams.get_or_create(stream_id, StreamClass::H3Request);
        for field in fields {
            match &field.name[..] {
                b":method" => record.set_method(&field.value),
                b":path" => record.set_path(&field.value),
                b":protocol" => record.set_protocol(&field.value),
                _ => {}
            }
        }
        if fin {
            record.set_fin_received();
        }
        let method = record.method.clone();
        let path = record.path.clone();
        let protocol = record.protocol.clone();
        info!(stream_id, %method, %path, %protocol, "request");

        if method == "CONNECT" && protocol == "webtransport" {
            let negotiated = self
                .h3
                .as_ref()
                .and_then(ServerSession::peer_settings)
                .map_or(false, |p| p.supports_webtransport());
            if !negotiated {
                warn!(stream_id, "accepting WebTransport CONNECT without full peer negotiation");
            }
            if let Some(record) = self.streams.get_mut(stream_id) {
                record.class = StreamClass::WtBidi;
                record.wt_session_id = Some(stream_id);
            }
            self.wt_session_stream = Some(stream_id);
            self.respond(
                stream_id,
                &[
                    (":status", "200"),
                    ("sec-webtransport-http3-draft", "draft02"),
                ],
                false,
            );
            info!(stream_id, "WebTransport session established");
        } else if method == "CONNECT" && protocol == "websocket" {
            if let Some(record) = self.streams.get_mut(stream_id) {
                record.class = StreamClass::Ws;
            }
            self.respond(stream_id, &[(":status", "200")], false);
            info!(stream_id, %path, "WebSocket-over-H3 session established, echoing");
        } else if method == "GET" && (path == "/" || path == "/.well-known/webtransport") {
            self.respond(
                stream_id,
                &[(":status", "200"), ("content-type", "text/plain")],
                true,
            );
        } else if method == "GET" {
            self.respond(
                stream_id,
                &[(":status", "404"), ("content-type", "text/plain")],
                true,
            );
        } else {
            self.respond(stream_id, &[(":status", "405")], true);
        }
    }

    fn respond(&mut self, stream_id: u64, fields: &[(&'static str, &'static str)], fin: bool) {
        let fields: Vec<FieldLine> = fields
            .iter()
            .map(|&(name, value)| FieldLine::new(name, value))
            .collect();
        if let Some(session) = self.h3.as_mut() {
            if let Err(error) = session.submit_response(stream_id, &fields, fin) {
                warn!(stream_id, %error, "failed to queue response");
            }
        }
    }

    /// Echo DATA / WebTransport payload back on the same stream, within the
    /// per-stream byte budget.
    fn echo_h3_payload(&mut self, stream_id: u64, data: &[u8]) {
        let Some(record) = self.streams.get_mut(stream_id) else {
            return;
        };
        if !matches!(record.class, StreamClass::WtBidi | StreamClass::Ws) {
            trace!(stream_id, len = data.len(), "ignoring request body");
            return;
        }
        let allowed = record.admit(data.len());
        if allowed < data.len() {
            warn!(
                stream_id,
                dropped = data.len() - allowed,
                "echo buffer full, truncating"
            );
        }
        if allowed > 0 {
            debug!(stream_id, len = allowed, "echoing payload");
            if let Some(session) = self.h3.as_mut() {
                if let Err(error) = session.submit_data(stream_id, &data[..allowed]) {
                    warn!(stream_id, %error, "failed to queue echo payload");
                }
            }
        }
    }

    fn on_reset(&mut self, sid: u64, code: VarInt) {
        debug!(stream_id = sid, code = code.into_inner(), "peer reset stream");
        if let Some(session) = self.h3.as_mut() {
            session.stream_reset(sid);
        }
        if self.wt_session_stream == Some(sid) {
            info!(stream_id = sid, "WebTransport session closed");
            self.wt_session_stream = None;
        }
        self.streams.remove(sid);
    }

    fn on_stopped(&mut self, id: StreamId, code: VarInt) {
        let sid = raw_stream_id(id);
        debug!(stream_id = sid, code = code.into_inner(), "peer stopped reading stream");
        if let Some(session) = self.h3.as_mut() {
            session.stream_stopped(sid);
        }
        self.streams.remove(sid);
    }

    /// HTTP/3 activation: runs once, after the handshake, once the peer has
    /// granted the three unidirectional streams the layer needs.
    fn maybe_setup_h3(&mut self, now: Instant) {
        if self.proto != Some(Proto::H3) || !self.handshake_done || self.h3.is_some() {
            return;
        }
        while self.h3_uni_streams.len() < 3 {
            match self.conn.streams().open(Dir::Uni) {
                Some(id) => self.h3_uni_streams.push(id),
                None => {
                    debug!(
                        granted = self.h3_uni_streams.len(),
                        "waiting for peer unidirectional stream credit"
                    );
                    return;
                }
            }
        }

        let control = self.h3_uni_streams[0];
        let encoder = self.h3_uni_streams[1];
        let decoder = self.h3_uni_streams[2];
        for id in [control, encoder, decoder] {
            self.stream_ids.insert(raw_stream_id(id), id);
        }

        let mut session = ServerSession::new(Settings::default());
        session.set_max_client_streams_bidi(u64::from(MAX_STREAMS_BIDI));
        session.bind_uni_streams(
            raw_stream_id(control),
            raw_stream_id(encoder),
            raw_stream_id(decoder),
        );
        self.h3 = Some(session);
        info!(
            control = raw_stream_id(control),
            qpack_encoder = raw_stream_id(encoder),
            qpack_decoder = raw_stream_id(decoder),
            "HTTP/3 layer ready (Extended CONNECT + WebTransport enabled)"
        );

        for id in std::mem::take(&mut self.deferred_readable) {
            self.read_stream(id, now);
        }
    }

    // ------------------------------------------------------------------
    // Datagrams
    // ------------------------------------------------------------------

    fn echo_datagrams(&mut self) {
        while let Some(payload) = self.conn.datagrams().recv() {
            debug!(len = payload.len(), "received DATAGRAM frame");
            match self.proto {
                Some(Proto::H3) => self.echo_wt_datagram(payload),
                _ => self.send_datagram(payload),
            }
        }
    }

    /// WebTransport datagrams carry a quarter-stream-id prefix naming the
    /// session; it must match the live session and is re-encoded on the
    /// echo.
    fn echo_wt_datagram(&mut self, payload: Bytes) {
        let Some((quarter_id, prefix_len)) = h3::varint::decode(&payload) else {
            warn!(len = payload.len(), "datagram without session prefix, dropping");
            return;
        };
        let session_stream = quarter_id * 4;
        if self.wt_session_stream != Some(session_stream) {
            warn!(session_stream, "datagram for unknown WebTransport session, dropping");
            return;
        }
        let mut out = BytesMut::with_capacity(payload.len());
        h3::varint::encode(quarter_id, &mut out);
        out.extend_from_slice(&payload[prefix_len..]);
        self.send_datagram(out.freeze());
    }

    fn send_datagram(&mut self, payload: Bytes) {
        let len = payload.len();
        match self.conn.datagrams().send(payload, true) {
            Ok(()) => trace!(len, "echoed DATAGRAM frame"),
            Err(error) => warn!(%error, "failed to echo DATAGRAM frame"),
        }
    }

    // ------------------------------------------------------------------
    // Write engine
    // ------------------------------------------------------------------

    /// Drain queued response/echo bytes into the transport's send streams.
    /// Packets themselves are produced by the server's transmit pass.
    fn write_streams(&mut self) {
        self.write_h3_streams();
        self.write_echo_streams();
    }

    fn write_h3_streams(&mut self) {
        let Some(session) = self.h3.as_mut() else {
            return;
        };
        let mut finished: Vec<u64> = Vec::new();
        for sid in session.writable() {
            let Some(&id) = self.stream_ids.get(&sid) else {
                continue;
            };
            loop {
                let Some((data, fin)) = session.pending(sid) else {
                    break;
                };
                if data.is_empty() {
                    if fin {
                        let _ = self.conn.send_stream(id).finish();
                        session.fin_sent(sid);
                        finished.push(sid);
                    }
                    break;
                }
                let len = data.len();
                match self.conn.send_stream(id).write(data) {
                    Ok(n) => {
                        session.consume(sid, n);
                        if n < len {
                            break;
                        }
                    }
                    Err(WriteError::Blocked) => break,
                    Err(_) => {
                        session.stream_stopped(sid);
                        break;
                    }
                }
            }
        }

        for sid in finished {
            let closed = self
                .streams
                .get(sid)
                .map_or(false, |record| record.fin_received());
            if closed {
                session.stream_closed(sid);
                self.streams.remove(sid);
                self.stream_ids.remove(&sid);
                if self.wt_session_stream == Some(sid) {
                    info!(stream_id = sid, "WebTransport session closed");
                    self.wt_session_stream = None;
                }
                debug!(stream_id = sid, "stream complete");
            }
        }
    }

    fn write_echo_streams(&mut self) {
        let mut completed: Vec<u64> = Vec::new();
        for sid in self.streams.pending_ids() {
            // H3-class records drain through the session's buffers; finishing
            // them here would truncate a response the session still holds.
            if self
                .streams
                .get(sid)
                .map_or(true, |record| record.class != StreamClass::RawEcho)
            {
                continue;
            }
            let Some(&id) = self.stream_ids.get(&sid) else {
                continue;
            };
            loop {
                let Some(record) = self.streams.get_mut(sid) else {
                    break;
                };
                if record.is_drained() {
                    break;
                }
                let len = record.unsent().len();
                match self.conn.send_stream(id).write(record.unsent()) {
                    Ok(n) => {
                        record.advance(n);
                        if n < len {
                            break;
                        }
                    }
                    Err(WriteError::Blocked) => break,
                    Err(_) => {
                        completed.push(sid);
                        break;
                    }
                }
            }

            if let Some(record) = self.streams.get_mut(sid) {
                if record.fin_received() && record.is_drained() && !record.fin_sent {
                    record.fin_sent = true;
                    let _ = self.conn.send_stream(id).finish();
                    completed.push(sid);
                    debug!(stream_id = sid, "echo complete, FIN sent");
                }
            }
        }
        for sid in completed {
            self.streams.remove(sid);
            self.stream_ids.remove(&sid);
        }
    }

    fn close_h3(&mut self, error: h3::Error, now: Instant) {
        let code = error.to_error_code();
        warn!(peer = %self.remote, %error, %code, "HTTP/3 failure, closing connection");
        self.conn
            .close(now, VarInt::from_u32(code.to_code() as u32), Bytes::new());
    }

    /// Graceful shutdown: GOAWAY for H3 peers, then an application close.
    pub fn shutdown(&mut self, now: Instant) {
        if let Some(session) = self.h3.as_mut() {
            session.goaway();
        }
        self.write_streams();
        let code = match self.proto {
            Some(Proto::H3) => qecho_h3::ErrorCode::NoError.to_code() as u32,
            _ => 0,
        };
        self.conn
            .close(now, VarInt::from_u32(code), Bytes::from_static(b"shutting down"));
    }
}
