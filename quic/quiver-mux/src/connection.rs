// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The mux connection: demux state machine, flow control and frame
//! emission
//!
//! The demuxer consumes the transport's byte stream through the
//! [`DemuxBuffer`]; decoded requests surface per stream as HTX messages.
//! The emission side serializes HTX from the upper layer into HEADERS /
//! DATA / CONTINUATION frames under three windows (connection, stream,
//! max frame size) and queues blocked streams on exactly one of the
//! send / fctl / blocked lists.

use crate::{
    config::Config,
    demux_buf::DemuxBuffer,
    error::ErrorCode,
    frame::*,
    hpack::{Header, HeaderCodec},
    htx,
    stream::{blocked, event, MuxStream, Queue, StreamState},
};
use quiver_codec::{DecoderBuffer, Encoder, EncoderBuffer};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace};

/// Demux state, the top-level FSM
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ConnState {
    /// Waiting for the connection preface
    Preface,
    /// Preface seen, the first frame must be SETTINGS
    Settings1,
    /// Waiting for a frame header
    FrameH,
    /// Waiting for the current frame's payload
    FrameP,
    /// Payload handled, an acknowledgement must go out first
    FrameA,
    /// Payload handled, an RST_STREAM must go out first
    FrameE,
    /// A connection error wants a GOAWAY
    Error,
    /// GOAWAY sent or abandoned; only draining remains
    Error2,
}

// connection flags
const F_GOAWAY_SENT: u32 = 0x0001;
const F_GOAWAY_FAILED: u32 = 0x0002;
const F_WINDOW_OPENED: u32 = 0x0004;
const F_SETTINGS_SENT: u32 = 0x0008;
const F_MUX_MFULL: u32 = 0x0010;
const F_GOAWAY_RCVD: u32 = 0x0020;

/// The mux output ring: 32 fixed slots
const MBUF_CNT: usize = 32;
const MBUF_SLOT_SZ: usize = 16_384;

#[derive(Debug, Default)]
struct MbufRing {
    segments: VecDeque<bytes::Bytes>,
    used: usize,
}

impl MbufRing {
    fn room(&self) -> usize {
        MBUF_CNT * MBUF_SLOT_SZ - self.used
    }

    /// All-or-nothing append
    fn write(&mut self, data: &[u8]) -> bool {
        if data.len() > self.room() {
            return false;
        }
        self.used += data.len();
        self.segments.push_back(bytes::Bytes::copy_from_slice(data));
        true
    }

    /// Moves an owned block in whole, no payload copy
    fn write_bytes(&mut self, data: bytes::Bytes) -> bool {
        if data.len() > self.room() {
            return false;
        }
        self.used += data.len();
        self.segments.push_back(data);
        true
    }

    fn is_empty(&self) -> bool {
        self.used == 0
    }

    fn take_all(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.used);
        for segment in self.segments.drain(..) {
            out.extend_from_slice(&segment);
        }
        self.used = 0;
        out
    }
}

/// What a stream-id lookup resolved to
enum Lookup {
    /// A live stream in the tree
    Known(i32),
    /// Once existed, already closed and freed
    Closed,
    /// Not yet created (id above `max_id`)
    Idle,
    /// An id the peer can never legally use
    Error,
}

pub struct MuxConn<C: HeaderCodec> {
    state: ConnState,
    errcode: ErrorCode,
    flags: u32,
    config: Config,
    codec: C,
    dbuf: DemuxBuffer,

    // demux frame scratch
    dsi: i32,
    dft: u8,
    dff: u8,
    dfl: u32,
    dpl: u8,
    /// Folded header-block bytes collected so far (CONTINUATION)
    hdr_len: usize,
    /// PING payload awaiting acknowledgement
    ping_payload: [u8; 8],
    /// Error code for the RST_STREAM FrameE owes, when no stream object
    /// carries it
    rst_code: ErrorCode,
    /// A SETTINGS frame awaiting acknowledgement
    settings_unacked: bool,

    /// Outgoing connection towards an origin server
    is_back: bool,
    streams: BTreeMap<i32, MuxStream>,
    /// Outgoing streams awaiting their id, assigned on first send
    reserved: Vec<Option<MuxStream>>,
    /// Next odd id for an outgoing stream
    next_out_id: i32,
    send_list: VecDeque<i32>,
    fctl_list: VecDeque<i32>,
    blocked_list: VecDeque<i32>,
    /// Highest stream id seen on this connection
    max_id: i32,
    /// Last stream id processed once GOAWAY is armed; -1 before
    last_sid: i32,
    nb_streams: u32,
    nb_reserved: u32,
    stream_cnt: u32,

    // flow control, mux direction
    /// Peer's initial window for new streams
    miw: i32,
    /// Connection send window; may go negative transiently
    mws: i32,
    /// Peer's max frame size
    mfs: u32,
    streams_limit: u32,

    // receive accounting for WINDOW_UPDATE emission
    rcvd_c: u32,
    rcvd_s: u32,

    mbuf: MbufRing,
}

impl<C: HeaderCodec> MuxConn<C> {
    /// A frontend connection: the peer is a client and opens streams
    pub fn new(config: Config, codec: C) -> Self {
        Self::with_role(config, codec, false)
    }

    /// A backend connection towards an origin server: we open streams
    pub fn new_back(config: Config, codec: C) -> Self {
        Self::with_role(config, codec, true)
    }

    fn with_role(config: Config, codec: C, is_back: bool) -> Self {
        Self {
            // servers answer our preface with a bare SETTINGS frame
            state: if is_back {
                ConnState::Settings1
            } else {
                ConnState::Preface
            },
            errcode: ErrorCode::NoError,
            flags: 0,
            config,
            codec,
            dbuf: DemuxBuffer::new(),
            dsi: -1,
            dft: 0,
            dff: 0,
            dfl: 0,
            dpl: 0,
            hdr_len: 0,
            ping_payload: [0; 8],
            rst_code: ErrorCode::StreamClosed,
            settings_unacked: false,
            is_back,
            streams: BTreeMap::new(),
            reserved: Vec::new(),
            next_out_id: 1,
            send_list: VecDeque::new(),
            fctl_list: VecDeque::new(),
            blocked_list: VecDeque::new(),
            max_id: -1,
            last_sid: -1,
            nb_streams: 0,
            nb_reserved: 0,
            stream_cnt: 0,
            miw: INITIAL_WINDOW_SIZE,
            mws: INITIAL_WINDOW_SIZE,
            mfs: DEFAULT_MAX_FRAME_SIZE,
            streams_limit: u32::MAX,
            rcvd_c: 0,
            rcvd_s: 0,
            mbuf: MbufRing::default(),
        }
    }

    // === upper-layer observers ==========================================

    pub fn is_errored(&self) -> bool {
        matches!(self.state, ConnState::Error | ConnState::Error2)
    }

    pub fn error_code(&self) -> ErrorCode {
        self.errcode
    }

    pub fn stream(&mut self, id: i32) -> Option<&mut MuxStream> {
        self.streams.get_mut(&id)
    }

    pub fn nb_streams(&self) -> u32 {
        self.nb_streams
    }

    pub fn max_id(&self) -> i32 {
        self.max_id
    }

    pub fn last_sid(&self) -> i32 {
        self.last_sid
    }

    pub fn goaway_sent(&self) -> bool {
        self.flags & F_GOAWAY_SENT != 0
    }

    pub fn goaway_failed(&self) -> bool {
        self.flags & F_GOAWAY_FAILED != 0
    }

    /// Streams holding decoded input for the upper layer
    pub fn ready_streams(&self) -> Vec<i32> {
        self.streams
            .iter()
            .filter(|(_, stream)| !stream.rxbuf.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Streams moved back to the send list since the last call; the
    /// upper layer should retry their writes
    pub fn take_sendable_streams(&mut self) -> Vec<i32> {
        let ids: Vec<i32> = self.send_list.drain(..).collect();
        for sid in &ids {
            if let Some(stream) = self.streams.get_mut(sid) {
                stream.queue = Queue::None;
                stream.blocked = 0;
            }
        }
        ids
    }

    /// Drains everything queued for the transport
    pub fn take_output(&mut self) -> Vec<u8> {
        self.flags &= !F_MUX_MFULL;
        self.mbuf.take_all()
    }

    // === input ==========================================================

    /// Appends transport bytes to the demux buffer
    pub fn recv(&mut self, data: &[u8]) {
        self.dbuf.append(data);
    }

    /// Runs the demuxer as far as the buffered input allows
    pub fn process(&mut self) {
        // both sides open with SETTINGS; a backend leads with the preface
        if self.flags & F_SETTINGS_SENT == 0 {
            if !self.is_back || self.mbuf.write(PREFACE) {
                self.emit_settings();
            }
        }

        loop {
            match self.state {
                ConnState::Preface => {
                    if self.dbuf.readable() < PREFACE.len() {
                        break;
                    }
                    let preface = self.dbuf.read(PREFACE.len()).expect("checked readable");
                    if preface != PREFACE {
                        debug!("invalid connection preface");
                        self.conn_error(ErrorCode::ProtocolError);
                        continue;
                    }
                    trace!("preface received");
                    self.state = ConnState::Settings1;
                }
                ConnState::Settings1 | ConnState::FrameH => {
                    let Some(header_bytes) = self.dbuf.read(FRAME_HEADER_LEN) else {
                        break;
                    };
                    let (header, _) = FrameHeader::decode(DecoderBuffer::new(&header_bytes))
                        .expect("9 bytes read");

                    if header.len > self.config.max_frame_size {
                        self.conn_error(ErrorCode::FrameSizeError);
                        continue;
                    }
                    if self.state == ConnState::Settings1
                        && (header.ty != FT_SETTINGS || header.flags & FL_ACK != 0)
                    {
                        // the first frame of a connection must be the
                        // peer's initial SETTINGS
                        self.conn_error(ErrorCode::ProtocolError);
                        continue;
                    }

                    trace!(
                        ty = header.ty,
                        flags = header.flags,
                        sid = header.sid,
                        len = header.len,
                        "frame header"
                    );
                    self.dsi = header.sid;
                    self.dft = header.ty;
                    self.dff = header.flags;
                    self.dfl = header.len;
                    self.dpl = 0;
                    self.hdr_len = 0;
                    self.state = ConnState::FrameP;
                }
                ConnState::FrameP => {
                    if !self.demux_frame() {
                        break;
                    }
                }
                ConnState::FrameA => {
                    if !self.send_acknowledgements() {
                        break;
                    }
                    self.state = ConnState::FrameH;
                }
                ConnState::FrameE => {
                    let errcode = self
                        .streams
                        .get(&self.dsi)
                        .map(|stream| stream.errcode)
                        .unwrap_or(self.rst_code);
                    if !self.emit_rst(self.dsi, errcode) {
                        break;
                    }
                    if let Some(stream) = self.streams.get_mut(&self.dsi) {
                        stream.on_send_rst();
                    }
                    self.state = ConnState::FrameH;
                }
                ConnState::Error => {
                    if self.emit_goaway(self.errcode, self.goaway_last_sid()) {
                        self.flags |= F_GOAWAY_SENT;
                    } else {
                        self.flags |= F_GOAWAY_FAILED;
                    }
                    self.state = ConnState::Error2;
                }
                ConnState::Error2 => {
                    // drain and discard whatever else arrives
                    let leftover = self.dbuf.readable();
                    if leftover > 0 {
                        self.dbuf.advance(leftover);
                    }
                    break;
                }
            }
        }
    }

    fn goaway_last_sid(&self) -> i32 {
        if self.last_sid >= 0 {
            self.last_sid
        } else {
            self.max_id.max(0)
        }
    }

    fn conn_error(&mut self, errcode: ErrorCode) {
        debug!(%errcode, "connection error");
        self.errcode = errcode;
        self.state = ConnState::Error;
    }

    fn stream_error(&mut self, sid: i32, errcode: ErrorCode) {
        trace!(sid, %errcode, "stream error");
        if let Some(stream) = self.streams.get_mut(&sid) {
            stream.set_error(errcode);
        }
        self.rst_code = errcode;
        self.dsi = sid;
        self.state = ConnState::FrameE;
    }

    // === demux ==========================================================

    /// Resolves a stream id the peer referenced
    fn lookup(&self, sid: i32) -> Lookup {
        if self.streams.contains_key(&sid) {
            return Lookup::Known(sid);
        }
        if sid & 1 == 0 {
            // even ids would be push reservations, which nobody uses
            return Lookup::Error;
        }
        if self.is_back {
            // odd ids are ours; a server cannot invent new ones
            return if sid < self.next_out_id {
                Lookup::Closed
            } else {
                Lookup::Error
            };
        }
        if sid <= self.max_id {
            Lookup::Closed
        } else {
            Lookup::Idle
        }
    }

    /// Handles one frame whose header is in the scratch registers.
    /// Returns `false` when more input is needed.
    fn demux_frame(&mut self) -> bool {
        match self.dft {
            FT_SETTINGS => self.demux_settings(),
            FT_PING => self.demux_ping(),
            FT_WINDOW_UPDATE => self.demux_window_update(),
            FT_PRIORITY => self.demux_priority(),
            FT_RST_STREAM => self.demux_rst_stream(),
            FT_GOAWAY => self.demux_goaway(),
            FT_DATA => self.demux_data(),
            FT_HEADERS => self.demux_headers(),
            FT_CONTINUATION => {
                // a CONTINUATION not preceded by a HEADERS (those are
                // folded below) is always a connection error
                self.conn_error(ErrorCode::ProtocolError);
                true
            }
            FT_PUSH_PROMISE => {
                // clients must not push
                self.conn_error(ErrorCode::ProtocolError);
                true
            }
            _ => {
                // unknown frame types are skipped
                if self.dbuf.readable() < self.dfl as usize {
                    return false;
                }
                self.dbuf.advance(self.dfl as usize);
                self.state = ConnState::FrameH;
                true
            }
        }
    }

    fn demux_settings(&mut self) -> bool {
        if self.dsi != 0 {
            self.conn_error(ErrorCode::ProtocolError);
            return true;
        }
        if self.dff & FL_ACK != 0 {
            if self.dfl != 0 {
                self.conn_error(ErrorCode::FrameSizeError);
                return true;
            }
            self.state = ConnState::FrameH;
            return true;
        }
        if self.dfl % 6 != 0 {
            self.conn_error(ErrorCode::FrameSizeError);
            return true;
        }
        let Some(payload) = self.dbuf.read(self.dfl as usize) else {
            return false;
        };

        let mut buffer = DecoderBuffer::new(&payload);
        while !buffer.is_empty() {
            let (id, rest) = buffer.decode::<u16>().expect("length multiple of 6");
            let (value, rest) = rest.decode::<u32>().expect("length multiple of 6");
            buffer = rest;

            match id {
                SETTINGS_INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW_SIZE as u32 {
                        self.conn_error(ErrorCode::FlowControlError);
                        return true;
                    }
                    self.miw = value as i32;
                    self.unblock_stream_fctl();
                }
                SETTINGS_MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_FRAME_SIZE_LIMIT).contains(&value) {
                        self.conn_error(ErrorCode::ProtocolError);
                        return true;
                    }
                    self.mfs = value;
                }
                SETTINGS_MAX_CONCURRENT_STREAMS => self.streams_limit = value,
                SETTINGS_HEADER_TABLE_SIZE => self.codec.set_max_table_size(value),
                SETTINGS_ENABLE_PUSH => {
                    if value > 1 {
                        self.conn_error(ErrorCode::ProtocolError);
                        return true;
                    }
                }
                _ => {}
            }
        }

        self.settings_unacked = true;
        self.state = ConnState::FrameA;
        true
    }

    fn demux_ping(&mut self) -> bool {
        if self.dsi != 0 {
            self.conn_error(ErrorCode::ProtocolError);
            return true;
        }
        if self.dfl != 8 {
            self.conn_error(ErrorCode::FrameSizeError);
            return true;
        }
        let Some(payload) = self.dbuf.read(8) else {
            return false;
        };
        if self.dff & FL_ACK != 0 {
            self.state = ConnState::FrameH;
            return true;
        }
        self.ping_payload.copy_from_slice(&payload);
        self.state = ConnState::FrameA;
        true
    }

    fn demux_window_update(&mut self) -> bool {
        if self.dfl != 4 {
            self.conn_error(ErrorCode::FrameSizeError);
            return true;
        }
        let Some(payload) = self.dbuf.read(4) else {
            return false;
        };
        let increment = u32::from_be_bytes(payload.try_into().expect("4 bytes")) & 0x7fff_ffff;

        if self.dsi == 0 {
            if increment == 0 {
                self.conn_error(ErrorCode::ProtocolError);
                return true;
            }
            if self.mws.checked_add(increment as i32).is_none()
                || self.mws.saturating_add(increment as i32) > MAX_WINDOW_SIZE
            {
                self.conn_error(ErrorCode::FlowControlError);
                return true;
            }
            self.mws += increment as i32;
            self.unblock_conn_fctl();
            self.state = ConnState::FrameH;
            return true;
        }

        match self.lookup(self.dsi) {
            Lookup::Known(sid) => {
                if increment == 0 {
                    self.stream_error(sid, ErrorCode::ProtocolError);
                    return true;
                }
                let stream = self.streams.get_mut(&sid).expect("known");
                let window = i64::from(self.miw) + i64::from(stream.sws) + i64::from(increment);
                if window > MAX_WINDOW_SIZE as i64 {
                    self.stream_error(sid, ErrorCode::FlowControlError);
                    return true;
                }
                stream.sws += increment as i32;
                if i64::from(self.miw) + i64::from(stream.sws) > 0 {
                    self.unblock_one_stream_fctl(sid);
                }
            }
            Lookup::Idle => {
                self.conn_error(ErrorCode::ProtocolError);
                return true;
            }
            // quietly ignored on closed streams
            Lookup::Closed | Lookup::Error => {}
        }
        self.state = ConnState::FrameH;
        true
    }

    fn demux_priority(&mut self) -> bool {
        if self.dfl != 5 {
            self.stream_error(self.dsi, ErrorCode::FrameSizeError);
            return true;
        }
        let Some(payload) = self.dbuf.read(5) else {
            return false;
        };
        let dependency =
            (u32::from_be_bytes(payload[..4].try_into().expect("4 bytes")) & 0x7fff_ffff) as i32;
        if dependency == self.dsi {
            // a stream cannot depend on itself
            self.conn_error(ErrorCode::ProtocolError);
            return true;
        }
        self.state = ConnState::FrameH;
        true
    }

    fn demux_rst_stream(&mut self) -> bool {
        if self.dsi == 0 {
            self.conn_error(ErrorCode::ProtocolError);
            return true;
        }
        if self.dfl != 4 {
            self.conn_error(ErrorCode::FrameSizeError);
            return true;
        }
        let Some(payload) = self.dbuf.read(4) else {
            return false;
        };
        let errcode = ErrorCode::from_wire(u32::from_be_bytes(
            payload.try_into().expect("4 bytes"),
        ));

        match self.lookup(self.dsi) {
            Lookup::Known(sid) => {
                let stream = self.streams.get_mut(&sid).expect("known");
                stream.on_recv_rst(errcode);
                self.release_stream(sid);
            }
            Lookup::Idle => {
                self.conn_error(ErrorCode::ProtocolError);
                return true;
            }
            Lookup::Closed | Lookup::Error => {}
        }
        self.state = ConnState::FrameH;
        true
    }

    fn demux_goaway(&mut self) -> bool {
        if self.dsi != 0 {
            self.conn_error(ErrorCode::ProtocolError);
            return true;
        }
        if self.dfl < 8 {
            self.conn_error(ErrorCode::FrameSizeError);
            return true;
        }
        let Some(payload) = self.dbuf.read(self.dfl as usize) else {
            return false;
        };
        let last =
            (u32::from_be_bytes(payload[..4].try_into().expect("4 bytes")) & 0x7fff_ffff) as i32;
        debug!(last, "GOAWAY received");
        self.flags |= F_GOAWAY_RCVD;
        if self.is_back {
            // the peer's watermark blocks new outgoing streams
            self.last_sid = last;
        }
        self.state = ConnState::FrameH;
        true
    }

    fn demux_data(&mut self) -> bool {
        if self.dsi == 0 {
            self.conn_error(ErrorCode::ProtocolError);
            return true;
        }
        if self.dbuf.readable() < self.dfl as usize {
            return false;
        }

        let sid = match self.lookup(self.dsi) {
            Lookup::Known(sid) => sid,
            Lookup::Idle => {
                // DATA on an idle stream is a connection error
                self.conn_error(ErrorCode::ProtocolError);
                return true;
            }
            Lookup::Closed | Lookup::Error => {
                self.dbuf.advance(self.dfl as usize);
                self.rcvd_c += self.dfl;
                self.dsi_stream_error_closed();
                return true;
            }
        };

        let state = self.streams.get(&sid).map(|s| s.state);
        if matches!(
            state,
            Some(StreamState::HalfClosedRemote | StreamState::Closed)
        ) {
            self.dbuf.advance(self.dfl as usize);
            self.rcvd_c += self.dfl;
            self.stream_error(sid, ErrorCode::StreamClosed);
            return true;
        }

        let mut payload_len = self.dfl as usize;
        if self.dff & FL_PADDED != 0 {
            let pad = self.dbuf.read(1).expect("readable checked")[0];
            if usize::from(pad) + 1 > payload_len {
                // padding cannot exceed the frame
                self.conn_error(ErrorCode::ProtocolError);
                return true;
            }
            self.dpl = pad;
            payload_len -= 1 + usize::from(pad);
        }

        let data = self.dbuf.read(payload_len).expect("readable checked");
        if self.dpl > 0 {
            self.dbuf.advance(usize::from(self.dpl));
        }

        // padding consumes flow-control window too
        self.rcvd_c += self.dfl;
        self.rcvd_s += self.dfl;

        let stream = self.streams.get_mut(&sid).expect("known");
        if stream.account_body(data.len() as u64).is_err() {
            self.stream_error(sid, ErrorCode::ProtocolError);
            return true;
        }
        if !data.is_empty() {
            stream.rxbuf.push(htx::Block::Data(bytes::Bytes::from(data)));
        }
        if self.dff & FL_END_STREAM != 0 {
            if stream.body_len.map_or(false, |remaining| remaining > 0) {
                // short body under content-length
                self.stream_error(sid, ErrorCode::ProtocolError);
                return true;
            }
            stream.rxbuf.push(htx::Block::Eom);
            stream.on_recv_es();
        }

        self.state = ConnState::FrameA;
        true
    }

    fn dsi_stream_error_closed(&mut self) {
        let sid = self.dsi;
        self.stream_error(sid, ErrorCode::StreamClosed);
    }

    /// HEADERS: folds every CONTINUATION of the block, decodes it and
    /// dispatches to a new stream or to an existing one as trailers
    fn demux_headers(&mut self) -> bool {
        if self.dsi == 0 {
            self.conn_error(ErrorCode::ProtocolError);
            return true;
        }
        if self.hdr_len == 0 && self.dbuf.readable() < self.dfl as usize {
            return false;
        }

        if self.hdr_len == 0 {
            // first pass over this HEADERS frame: strip pad/priority
            let mut skip_front = 0usize;
            let mut block_len = self.dfl as usize;
            if self.dff & FL_PADDED != 0 {
                let pad = self.dbuf.peek(1).expect("readable checked")[0];
                if usize::from(pad) + 1 > block_len {
                    self.conn_error(ErrorCode::ProtocolError);
                    return true;
                }
                self.dpl = pad;
                skip_front += 1;
                block_len -= 1 + usize::from(pad);
            }
            if self.dff & FL_PRIORITY != 0 {
                if block_len < 5 {
                    self.conn_error(ErrorCode::FrameSizeError);
                    return true;
                }
                skip_front += 5;
                block_len -= 5;
            }
            if skip_front > 0 {
                self.dbuf.advance(skip_front);
            }
            if self.dpl > 0 {
                // punch the trailing padding out of the block
                let pad_at = self.dbuf.offset_of_readable(block_len);
                self.dbuf.punch_hole(pad_at, usize::from(self.dpl));
            }
            self.hdr_len = block_len;
        }

        // fold CONTINUATION frames until END_HEADERS
        let mut end_flags = self.dff;
        while end_flags & FL_END_HEADERS == 0 {
            let Some(tail) = self.dbuf.peek(self.hdr_len + FRAME_HEADER_LEN) else {
                return false;
            };
            let (cont, _) =
                FrameHeader::decode(DecoderBuffer::new(&tail[self.hdr_len..])).expect("9 bytes");

            // CONTINUATION must continue the same header block on the
            // same stream
            if cont.ty != FT_CONTINUATION || cont.sid != self.dsi {
                self.conn_error(ErrorCode::ProtocolError);
                return true;
            }
            let total = self.hdr_len + FRAME_HEADER_LEN + cont.len as usize;
            if self.dbuf.peek(total).is_none() {
                return false;
            }

            // punch the CONTINUATION header out: its payload now reads
            // contiguously with the preceding fragment
            let hole_at = self.dbuf.offset_of_readable(self.hdr_len);
            self.dbuf.punch_hole(hole_at, FRAME_HEADER_LEN);
            self.hdr_len += cont.len as usize;
            end_flags = cont.flags;
        }

        let block = self.dbuf.read(self.hdr_len).expect("peeked above");
        self.hdr_len = 0;

        let headers = match self.codec.decode(&block) {
            Ok(headers) => headers,
            Err(_) => {
                self.conn_error(ErrorCode::CompressionError);
                return true;
            }
        };

        match self.lookup(self.dsi) {
            Lookup::Known(sid) => {
                let awaiting_response = self.is_back
                    && !self
                        .streams
                        .get(&sid)
                        .map(|stream| stream.has_event(event::HEADERS_RCVD))
                        .unwrap_or(false);
                if awaiting_response {
                    self.headers_as_response(sid, headers)
                } else {
                    self.headers_as_trailers(sid, headers)
                }
            }
            Lookup::Idle => self.headers_as_request(headers),
            Lookup::Closed => {
                self.dsi_stream_error_closed();
                true
            }
            Lookup::Error => {
                self.conn_error(ErrorCode::ProtocolError);
                true
            }
        }
    }

    /// On a backend connection, HEADERS on one of our streams carries
    /// the origin server's response
    fn headers_as_response(&mut self, sid: i32, headers: Vec<Header>) -> bool {
        let mut status = None;
        let mut plain = Vec::new();
        let mut body_len = None;
        let mut pseudo_done = false;

        for header in headers {
            if header.is_pseudo() {
                if pseudo_done || header.name != b":status" {
                    self.stream_error(sid, ErrorCode::ProtocolError);
                    return true;
                }
                status = std::str::from_utf8(&header.value)
                    .ok()
                    .and_then(|value| value.parse::<u16>().ok());
                if status.is_none() {
                    self.stream_error(sid, ErrorCode::ProtocolError);
                    return true;
                }
            } else {
                pseudo_done = true;
                if header.name == b"content-length" {
                    body_len = std::str::from_utf8(&header.value)
                        .ok()
                        .and_then(|value| value.parse::<u64>().ok());
                    if body_len.is_none() {
                        self.stream_error(sid, ErrorCode::ProtocolError);
                        return true;
                    }
                }
                plain.push(header);
            }
        }

        let Some(status) = status else {
            self.stream_error(sid, ErrorCode::ProtocolError);
            return true;
        };

        let end_stream = self.dff & FL_END_STREAM != 0;
        let stream = self.streams.get_mut(&sid).expect("caller looked up");
        stream.latch(event::HEADERS_RCVD);
        stream.status = status;
        if let Some(len) = body_len {
            stream.body_len = Some(len);
            stream.latch(event::DATA_CLEN);
        }
        stream.rxbuf.push(htx::Block::ResStart { status });
        for header in plain {
            stream.rxbuf.push(htx::Block::Header(header));
        }
        if end_stream {
            stream.rxbuf.push(htx::Block::Eom);
            stream.on_recv_es();
        }
        self.state = ConnState::FrameH;
        true
    }

    /// A first HEADERS creates the stream and surfaces the request
    fn headers_as_request(&mut self, headers: Vec<Header>) -> bool {
        let sid = self.dsi;

        if self.last_sid >= 0 && sid > self.last_sid {
            // past the GOAWAY watermark: refuse, the client may retry
            self.refuse_stream(sid);
            return true;
        }
        if self.nb_streams >= self.config.max_concurrent_streams {
            self.refuse_stream(sid);
            return true;
        }

        let mut method = None;
        let mut scheme = None;
        let mut authority = None;
        let mut path = None;
        let mut plain = Vec::new();
        let mut body_len = None;
        let mut pseudo_done = false;

        for header in headers {
            if header.is_pseudo() {
                if pseudo_done {
                    // pseudo-headers cannot follow regular ones
                    self.stream_error_new(sid, ErrorCode::ProtocolError);
                    return true;
                }
                match header.name.as_slice() {
                    b":method" => method = Some(header.value),
                    b":scheme" => scheme = Some(header.value),
                    b":authority" => authority = Some(header.value),
                    b":path" => path = Some(header.value),
                    _ => {
                        self.stream_error_new(sid, ErrorCode::ProtocolError);
                        return true;
                    }
                }
            } else {
                pseudo_done = true;
                if header.name == b"content-length" {
                    body_len = std::str::from_utf8(&header.value)
                        .ok()
                        .and_then(|value| value.parse::<u64>().ok());
                    if body_len.is_none() {
                        self.stream_error_new(sid, ErrorCode::ProtocolError);
                        return true;
                    }
                }
                plain.push(header);
            }
        }

        let (Some(method), Some(scheme), Some(path)) = (method, scheme, path) else {
            self.stream_error_new(sid, ErrorCode::ProtocolError);
            return true;
        };

        let mut stream = MuxStream::new(sid);
        stream.state = StreamState::Open;
        stream.latch(event::HEADERS_RCVD);
        if let Some(len) = body_len {
            stream.body_len = Some(len);
            stream.latch(event::DATA_CLEN);
        }
        stream.rxbuf.push(htx::Block::ReqStart {
            method,
            scheme,
            authority: authority.unwrap_or_default(),
            path,
        });
        for header in plain {
            stream.rxbuf.push(htx::Block::Header(header));
        }

        if self.dff & FL_END_STREAM != 0 {
            stream.rxbuf.push(htx::Block::Eom);
            stream.on_recv_es();
        }

        trace!(sid, "stream opened");
        self.streams.insert(sid, stream);
        self.nb_streams += 1;
        self.stream_cnt += 1;
        self.max_id = self.max_id.max(sid);
        self.state = ConnState::FrameH;
        true
    }

    /// A second HEADERS on an open stream carries trailers
    fn headers_as_trailers(&mut self, sid: i32, headers: Vec<Header>) -> bool {
        // trailers must end the stream
        if self.dff & FL_END_STREAM == 0 {
            self.conn_error(ErrorCode::ProtocolError);
            return true;
        }
        let closed = matches!(
            self.streams.get(&sid).map(|stream| stream.state),
            Some(StreamState::HalfClosedRemote | StreamState::Closed)
        );
        if closed {
            self.conn_error(ErrorCode::StreamClosed);
            return true;
        }
        if headers.iter().any(Header::is_pseudo) {
            self.stream_error(sid, ErrorCode::ProtocolError);
            return true;
        }
        let stream = self.streams.get_mut(&sid).expect("caller looked up");
        for header in headers {
            stream.rxbuf.push(htx::Block::Trailer(header));
        }
        stream.rxbuf.push(htx::Block::Eom);
        stream.on_recv_es();
        self.state = ConnState::FrameH;
        true
    }

    /// Creates the stream in error state just to send the RST
    fn stream_error_new(&mut self, sid: i32, errcode: ErrorCode) {
        let mut stream = MuxStream::new(sid);
        stream.set_error(errcode);
        self.streams.insert(sid, stream);
        self.nb_streams += 1;
        self.stream_cnt += 1;
        self.max_id = self.max_id.max(sid);
        self.stream_error(sid, errcode);
    }

    fn refuse_stream(&mut self, sid: i32) {
        trace!(sid, "stream refused");
        // the id is burned even though no stream object exists
        self.max_id = self.max_id.max(sid);
        if self.emit_rst(sid, ErrorCode::RefusedStream) {
            self.state = ConnState::FrameH;
        } else {
            self.rst_code = ErrorCode::RefusedStream;
            self.dsi = sid;
            self.state = ConnState::FrameE;
        }
    }

    // === list management ================================================

    fn remove_from_lists(&mut self, sid: i32) {
        self.send_list.retain(|id| *id != sid);
        self.fctl_list.retain(|id| *id != sid);
        self.blocked_list.retain(|id| *id != sid);
    }

    fn queue_stream(&mut self, sid: i32, queue: Queue) {
        self.remove_from_lists(sid);
        let Some(stream) = self.streams.get_mut(&sid) else {
            return;
        };
        stream.queue = queue;
        stream.blocked = match queue {
            Queue::None => 0,
            Queue::Send => blocked::MUX_ROOM,
            Queue::Fctl => blocked::MUX_FCTL,
            Queue::Blocked => blocked::STREAM_FCTL,
        };
        match queue {
            Queue::None => {}
            Queue::Send => self.send_list.push_back(sid),
            Queue::Fctl => self.fctl_list.push_back(sid),
            Queue::Blocked => self.blocked_list.push_back(sid),
        }
    }

    /// The connection window reopened: everything fctl-blocked may try
    /// again
    fn unblock_conn_fctl(&mut self) {
        let unblocked: Vec<i32> = self.fctl_list.drain(..).collect();
        for sid in unblocked {
            self.queue_stream(sid, Queue::Send);
        }
    }

    /// The peer's initial window changed: streams whose effective
    /// window became positive may try again
    fn unblock_stream_fctl(&mut self) {
        let candidates: Vec<i32> = self.blocked_list.iter().copied().collect();
        for sid in candidates {
            let positive = self
                .streams
                .get(&sid)
                .map(|stream| i64::from(self.miw) + i64::from(stream.sws) > 0)
                .unwrap_or(false);
            if positive {
                self.queue_stream(sid, Queue::Send);
            }
        }
    }

    fn unblock_one_stream_fctl(&mut self, sid: i32) {
        if self
            .streams
            .get(&sid)
            .map(|stream| stream.queue == Queue::Blocked)
            .unwrap_or(false)
        {
            self.queue_stream(sid, Queue::Send);
        }
    }

    /// Frees a closed stream; its id stays burned in `max_id`
    pub fn release_stream(&mut self, sid: i32) {
        self.remove_from_lists(sid);
        if self.streams.remove(&sid).is_some() {
            self.nb_streams -= 1;
            trace!(sid, "stream released");
        }
    }

    // === emission =======================================================

    fn emit_settings(&mut self) {
        let mut payload = Vec::with_capacity(4 * 6);
        for (id, value) in [
            (SETTINGS_HEADER_TABLE_SIZE, self.config.header_table_size),
            (SETTINGS_INITIAL_WINDOW_SIZE, self.config.initial_window_size),
            (
                SETTINGS_MAX_CONCURRENT_STREAMS,
                self.config.max_concurrent_streams,
            ),
            (SETTINGS_MAX_FRAME_SIZE, self.config.max_frame_size),
        ] {
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(&value.to_be_bytes());
        }
        if self.emit_frame(FT_SETTINGS, 0, 0, &payload) {
            self.flags |= F_SETTINGS_SENT;
        }
    }

    /// SETTINGS ack, PING ack and pending WINDOW_UPDATEs
    fn send_acknowledgements(&mut self) -> bool {
        if self.settings_unacked {
            if !self.emit_frame(FT_SETTINGS, FL_ACK, 0, &[]) {
                return false;
            }
            self.settings_unacked = false;
        }
        if self.dft == FT_PING && self.dff & FL_ACK == 0 {
            let payload = self.ping_payload;
            if !self.emit_frame(FT_PING, FL_ACK, 0, &payload) {
                return false;
            }
        }

        // the advertised connection window is opened to its maximum on
        // the first update
        if self.flags & F_WINDOW_OPENED == 0 {
            let mut payload = [0u8; 4];
            payload.copy_from_slice(&INITIAL_WINDOW_INCREMENT.to_be_bytes());
            if !self.emit_frame(FT_WINDOW_UPDATE, 0, 0, &payload) {
                return false;
            }
            self.flags |= F_WINDOW_OPENED;
            self.rcvd_c = 0;
        }
        if self.rcvd_c > 0 {
            let payload = self.rcvd_c.to_be_bytes();
            if !self.emit_frame(FT_WINDOW_UPDATE, 0, 0, &payload) {
                return false;
            }
            self.rcvd_c = 0;
        }
        if self.rcvd_s > 0 && self.streams.contains_key(&self.dsi) {
            let payload = self.rcvd_s.to_be_bytes();
            let dsi = self.dsi;
            if !self.emit_frame(FT_WINDOW_UPDATE, 0, dsi, &payload) {
                return false;
            }
        }
        self.rcvd_s = 0;
        true
    }

    fn emit_frame(&mut self, ty: u8, flags: u8, sid: i32, payload: &[u8]) -> bool {
        let header = FrameHeader {
            len: payload.len() as u32,
            ty,
            flags,
            sid,
        };
        let mut header_bytes = [0u8; FRAME_HEADER_LEN];
        let mut encoder = EncoderBuffer::new(&mut header_bytes);
        encoder.encode(&header);
        let mut bytes = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        bytes.extend_from_slice(&header_bytes);
        bytes.extend_from_slice(payload);

        if self.mbuf.write(&bytes) {
            trace!(ty, sid, len = payload.len(), "frame emitted");
            true
        } else {
            self.flags |= F_MUX_MFULL;
            false
        }
    }

    fn emit_rst(&mut self, sid: i32, errcode: ErrorCode) -> bool {
        let payload = errcode.to_wire().to_be_bytes();
        self.emit_frame(FT_RST_STREAM, 0, sid, &payload)
    }

    /// GOAWAY goes out at most once
    fn emit_goaway(&mut self, errcode: ErrorCode, last_sid: i32) -> bool {
        if self.flags & (F_GOAWAY_SENT | F_GOAWAY_FAILED) != 0 {
            return self.flags & F_GOAWAY_SENT != 0;
        }
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&(last_sid as u32 & 0x7fff_ffff).to_be_bytes());
        payload.extend_from_slice(&errcode.to_wire().to_be_bytes());
        self.emit_frame(FT_GOAWAY, 0, 0, &payload)
    }

    // === upper-layer send path ==========================================

    /// Serializes response blocks from `msg` onto stream `sid`
    ///
    /// Consumes blocks from the front of `msg` as far as buffers and
    /// windows allow; the remainder stays for a later call. Returns the
    /// number of payload bytes emitted. A call against an errored
    /// connection is a no-op returning zero.
    pub fn snd_response(&mut self, sid: i32, msg: &mut htx::Message) -> usize {
        if self.is_errored() {
            return 0;
        }
        let Some(stream) = self.streams.get(&sid) else {
            return 0;
        };
        if matches!(stream.state, StreamState::Error | StreamState::Closed)
            && !stream.has_event(event::RST_RCVD)
        {
            return 0;
        }
        if stream.has_event(event::RST_RCVD) {
            // peer aborted: swallow the message
            while msg.pop().is_some() {}
            return 0;
        }

        let mut sent = 0usize;
        loop {
            match msg.front() {
                Some(htx::Block::ResStart { .. } | htx::Block::Header(_)) => {
                    if !self.send_response_headers(sid, msg) {
                        self.queue_stream(sid, Queue::Send);
                        break;
                    }
                }
                Some(htx::Block::Data(_)) => match self.send_data(sid, msg) {
                    SendData::Sent(bytes) => sent += bytes,
                    SendData::BlockedMux => {
                        self.queue_stream(sid, Queue::Send);
                        break;
                    }
                    SendData::BlockedConnWindow => {
                        self.queue_stream(sid, Queue::Fctl);
                        break;
                    }
                    SendData::BlockedStreamWindow => {
                        self.queue_stream(sid, Queue::Blocked);
                        break;
                    }
                },
                Some(htx::Block::Trailer(_)) => {
                    if !self.send_trailers(sid, msg) {
                        self.queue_stream(sid, Queue::Send);
                        break;
                    }
                }
                Some(htx::Block::Eom) => {
                    if !self.emit_frame(FT_DATA, FL_END_STREAM, sid, &[]) {
                        self.queue_stream(sid, Queue::Send);
                        break;
                    }
                    msg.pop();
                    if let Some(stream) = self.streams.get_mut(&sid) {
                        stream.on_send_es();
                    }
                }
                Some(htx::Block::ReqStart { .. }) => {
                    // requests go towards servers; this mux side is a
                    // frontend
                    msg.pop();
                }
                None => break,
            }
        }
        sent
    }

    /// Reserves an outgoing stream on a backend connection
    ///
    /// The stream keeps id 0 until the first send assigns the next odd
    /// id; `nb_reserved` counts these.
    pub fn attach(&mut self) -> Option<usize> {
        if !self.is_back || self.is_errored() {
            return None;
        }
        // once a GOAWAY was processed, no new outgoing stream may be
        // allocated
        if self.last_sid >= 0 || self.flags & F_GOAWAY_RCVD != 0 {
            return None;
        }
        // honor the peer's concurrency limit, reservations included
        if self.nb_streams + self.nb_reserved >= self.streams_limit {
            return None;
        }
        self.reserved.push(Some(MuxStream::new(0)));
        self.nb_reserved += 1;
        Some(self.reserved.len() - 1)
    }

    pub fn nb_reserved(&self) -> u32 {
        self.nb_reserved
    }

    /// Sends the request head of a reserved stream, assigning its id
    ///
    /// Returns the assigned stream id; the message body that remains in
    /// `msg` continues through [`Self::snd_response`]'s DATA path.
    pub fn snd_request(&mut self, reserved: usize, msg: &mut htx::Message) -> Option<i32> {
        if self.is_errored() {
            return None;
        }
        if self.last_sid >= 0 || self.flags & F_GOAWAY_RCVD != 0 {
            return None;
        }
        self.reserved.get(reserved)?.as_ref()?;

        let mut headers = Vec::new();
        let mut blocks = 0usize;
        for block in msg.iter() {
            match block {
                htx::Block::ReqStart { method, scheme, authority, path } => {
                    // pseudo-headers precede every regular header
                    headers.push(Header::new(":method", method));
                    headers.push(Header::new(":scheme", scheme));
                    if !authority.is_empty() {
                        headers.push(Header::new(":authority", authority));
                    }
                    headers.push(Header::new(":path", path));
                    blocks += 1;
                }
                htx::Block::Header(header) => {
                    if !drop_hop_by_hop(header) {
                        headers.push(header.clone());
                    }
                    blocks += 1;
                }
                _ => break,
            }
        }
        if blocks == 0 {
            return None;
        }

        let mut block = Vec::new();
        if self.codec.encode(&headers, &mut block).is_err() {
            self.conn_error(ErrorCode::InternalError);
            return None;
        }

        let sid = self.next_out_id;
        let end_stream =
            matches!(msg.iter().nth(blocks), Some(htx::Block::Eom)) && msg.len() == blocks + 1;
        if !self.send_header_block(sid, &block, end_stream) {
            // buffers full; the stream stays reserved for a retry
            return None;
        }

        let mut stream = self.reserved[reserved].take().expect("checked above");
        self.nb_reserved -= 1;
        self.next_out_id += 2;
        stream.id = sid;
        stream.state = StreamState::Open;
        stream.latch(event::HEADERS_SENT);
        for _ in 0..blocks {
            msg.pop();
        }
        if end_stream {
            msg.pop();
            stream.on_send_es();
        }
        self.max_id = self.max_id.max(sid);
        self.streams.insert(sid, stream);
        self.nb_streams += 1;
        self.stream_cnt += 1;
        trace!(sid, "outgoing stream assigned");
        Some(sid)
    }

    /// Collects the leading ResStart+Header blocks into one HEADERS
    /// frame (fragmented into CONTINUATIONs past the peer's max frame
    /// size)
    fn send_response_headers(&mut self, sid: i32, msg: &mut htx::Message) -> bool {
        let mut headers = Vec::new();
        let mut blocks = 0usize;
        let mut status = 0u16;

        for block in msg.iter() {
            match block {
                htx::Block::ResStart { status: code } => {
                    status = *code;
                    headers.push(Header::new(":status", code.to_string()));
                    blocks += 1;
                }
                htx::Block::Header(header) => {
                    if !drop_hop_by_hop(header) {
                        headers.push(header.clone());
                    }
                    blocks += 1;
                }
                _ => break,
            }
        }

        let mut block = Vec::new();
        if self.codec.encode(&headers, &mut block).is_err() {
            self.conn_error(ErrorCode::InternalError);
            return false;
        }

        let end_stream = matches!(msg.iter().nth(blocks), Some(htx::Block::Eom))
            && msg.len() == blocks + 1;

        if !self.send_header_block(sid, &block, end_stream) {
            return false;
        }

        for _ in 0..blocks {
            msg.pop();
        }
        if end_stream {
            msg.pop();
        }

        if let Some(stream) = self.streams.get_mut(&sid) {
            stream.latch(event::HEADERS_SENT);
            stream.status = status;
            if end_stream {
                stream.on_send_es();
            }
        }
        true
    }

    /// Writes one header block as HEADERS (+ CONTINUATIONs when it
    /// exceeds the peer's max frame size)
    fn send_header_block(&mut self, sid: i32, block: &[u8], end_stream: bool) -> bool {
        let mfs = self.mfs as usize;
        let es_flag = if end_stream { FL_END_STREAM } else { 0 };

        if block.len() <= mfs {
            return self.emit_frame(FT_HEADERS, FL_END_HEADERS | es_flag, sid, block);
        }

        // needed room for every fragment, all-or-nothing
        let fragments = (block.len() + mfs - 1) / mfs;
        if self.mbuf.room() < block.len() + fragments * FRAME_HEADER_LEN {
            self.flags |= F_MUX_MFULL;
            return false;
        }

        // the initial frame loses END_HEADERS; CONTINUATIONs follow on
        // the same stream id
        let mut chunks = block.chunks(mfs);
        let first = chunks.next().expect("block longer than mfs");
        if !self.emit_frame(FT_HEADERS, es_flag, sid, first) {
            return false;
        }
        let mut rest = chunks.peekable();
        while let Some(chunk) = rest.next() {
            let flags = if rest.peek().is_none() { FL_END_HEADERS } else { 0 };
            if !self.emit_frame(FT_CONTINUATION, flags, sid, chunk) {
                return false;
            }
        }
        true
    }

    fn send_trailers(&mut self, sid: i32, msg: &mut htx::Message) -> bool {
        let mut trailers = Vec::new();
        let mut blocks = 0usize;
        for block in msg.iter() {
            match block {
                htx::Block::Trailer(header) => {
                    trailers.push(header.clone());
                    blocks += 1;
                }
                _ => break,
            }
        }

        let mut block = Vec::new();
        if self.codec.encode(&trailers, &mut block).is_err() {
            self.conn_error(ErrorCode::InternalError);
            return false;
        }
        // trailers always close the stream
        if !self.send_header_block(sid, &block, true) {
            return false;
        }
        for _ in 0..blocks {
            msg.pop();
        }
        if matches!(msg.front(), Some(htx::Block::Eom)) {
            msg.pop();
        }
        if let Some(stream) = self.streams.get_mut(&sid) {
            stream.on_send_es();
        }
        true
    }

    fn send_data(&mut self, sid: i32, msg: &mut htx::Message) -> SendData {
        let stream_window = {
            let stream = self.streams.get(&sid).expect("caller checked");
            i64::from(self.miw) + i64::from(stream.sws)
        };
        if stream_window <= 0 {
            return SendData::BlockedStreamWindow;
        }
        if self.mws <= 0 {
            return SendData::BlockedConnWindow;
        }
        let budget = (stream_window.min(i64::from(self.mws)) as usize).min(self.mfs as usize);

        // zero-copy path: a single exact-fit data block moves whole,
        // only the 9-byte frame header is written in front of it
        if self.mbuf.is_empty() {
            let len = match msg.front() {
                Some(htx::Block::Data(data)) if data.len() <= budget => data.len(),
                _ => 0,
            };
            let single = msg.len() == 1
                || (msg.len() == 2 && matches!(msg.iter().nth(1), Some(htx::Block::Eom)));
            if len > 0 && single {
                if self.mbuf.room() < FRAME_HEADER_LEN + len {
                    self.flags |= F_MUX_MFULL;
                    return SendData::BlockedMux;
                }
                let (data, eom) = msg.take_single_data_block().expect("shape checked");
                let flags = if eom { FL_END_STREAM } else { 0 };
                let header = FrameHeader {
                    len: data.len() as u32,
                    ty: FT_DATA,
                    flags,
                    sid,
                };
                let mut header_bytes = [0u8; FRAME_HEADER_LEN];
                let mut encoder = EncoderBuffer::new(&mut header_bytes);
                encoder.encode(&header);
                let sent = data.len();
                self.mbuf.write(&header_bytes);
                self.mbuf.write_bytes(data);
                trace!(sid, len = sent, "data block moved whole");
                self.account_sent(sid, sent, eom);
                return SendData::Sent(sent);
            }
        }

        let Some(htx::Block::Data(data)) = msg.front() else {
            return SendData::Sent(0);
        };
        let take = data.len().min(budget);
        let chunk = data.slice(..take);
        let consumed_whole = take == data.len();
        // end-of-stream rides the last DATA frame when EOM is next
        let eom_next = consumed_whole
            && msg.len() == 2
            && matches!(msg.iter().nth(1), Some(htx::Block::Eom));
        let flags = if eom_next { FL_END_STREAM } else { 0 };

        if !self.emit_frame(FT_DATA, flags, sid, &chunk) {
            return SendData::BlockedMux;
        }

        if consumed_whole {
            msg.pop();
            if eom_next {
                msg.pop();
            }
        } else if let Some(htx::Block::Data(data)) = msg.pop() {
            let remainder = data.slice(take..);
            let mut rebuilt = htx::Message::new();
            rebuilt.push(htx::Block::Data(remainder));
            while let Some(block) = msg.pop() {
                rebuilt.push(block);
            }
            *msg = rebuilt;
        }

        self.account_sent(sid, take, eom_next);
        SendData::Sent(take)
    }

    fn account_sent(&mut self, sid: i32, len: usize, end_stream: bool) {
        self.mws -= len as i32;
        if let Some(stream) = self.streams.get_mut(&sid) {
            stream.sws -= len as i32;
            stream.latch(event::OUTGOING_DATA);
            if end_stream {
                stream.on_send_es();
            }
        }
    }

    // === shutdown =======================================================

    /// The upper layer stopped reading from the stream
    pub fn shutr(&mut self, sid: i32) {
        let Some(stream) = self.streams.get_mut(&sid) else {
            return;
        };
        if stream.has_event(event::KILL_CONN) {
            self.kill_connection();
            return;
        }
        let errcode = if stream.has_event(event::HEADERS_SENT) {
            ErrorCode::Cancel
        } else {
            // nothing was answered yet: the peer may safely retry
            ErrorCode::RefusedStream
        };
        if self.emit_rst(sid, errcode) {
            if let Some(stream) = self.streams.get_mut(&sid) {
                stream.errcode = errcode;
                stream.on_send_rst();
            }
            self.release_stream(sid);
        } else if let Some(stream) = self.streams.get_mut(&sid) {
            stream.set_error(errcode);
            self.dsi = sid;
            self.state = ConnState::FrameE;
        }
    }

    /// The upper layer finished writing to the stream
    pub fn shutw(&mut self, sid: i32) {
        let Some(stream) = self.streams.get_mut(&sid) else {
            return;
        };
        if stream.has_event(event::KILL_CONN) {
            self.kill_connection();
            return;
        }
        if stream.has_event(event::HEADERS_SENT) && !stream.has_event(event::ES_SENT) {
            if self.emit_frame(FT_DATA, FL_END_STREAM, sid, &[]) {
                if let Some(stream) = self.streams.get_mut(&sid) {
                    stream.on_send_es();
                }
            }
        }
    }

    fn kill_connection(&mut self) {
        if self.emit_goaway(ErrorCode::EnhanceYourCalm, self.max_id.max(0)) {
            self.flags |= F_GOAWAY_SENT;
        } else {
            self.flags |= F_GOAWAY_FAILED;
        }
        self.errcode = ErrorCode::EnhanceYourCalm;
        self.state = ConnState::Error2;
    }

    /// Proxy stop: advertise the last id we will process
    ///
    /// A graceful stop promises to finish everything the client already
    /// sent; a hard stop refuses anything we have not processed.
    pub fn stop(&mut self, graceful: bool) {
        self.last_sid = if graceful { MAX_WINDOW_SIZE } else { self.max_id.max(0) };
        if self.emit_goaway(ErrorCode::NoError, self.last_sid) {
            self.flags |= F_GOAWAY_SENT;
        } else {
            self.flags |= F_GOAWAY_FAILED;
        }
    }

    // === timeouts =======================================================

    /// Whether an expired timer may actually release the connection
    pub fn may_expire(&self) -> bool {
        self.nb_streams == 0
            && self.mbuf.is_empty()
            && self.send_list.is_empty()
            && self.fctl_list.is_empty()
            && self.blocked_list.is_empty()
    }

    /// Fires the idle timer; returns `true` when the connection should
    /// be released
    pub fn on_timeout(&mut self) -> bool {
        if !self.may_expire() {
            // wait on the data layer; the timer is re-armed by the caller
            return false;
        }
        if self.emit_goaway(ErrorCode::NoError, self.max_id.max(0)) {
            self.flags |= F_GOAWAY_SENT;
        } else {
            self.flags |= F_GOAWAY_FAILED;
        }
        self.state = ConnState::Error2;
        true
    }

    #[cfg(test)]
    fn queue_of(&self, sid: i32) -> Queue {
        self.streams.get(&sid).map(|s| s.queue).unwrap_or(Queue::None)
    }

    #[cfg(test)]
    fn assert_list_invariants(&self) {
        for (sid, stream) in &self.streams {
            let memberships = [
                self.send_list.contains(sid),
                self.fctl_list.contains(sid),
                self.blocked_list.contains(sid),
            ]
            .iter()
            .filter(|member| **member)
            .count();
            assert!(memberships <= 1, "stream {sid} is in {memberships} lists");
            match stream.queue {
                Queue::None => assert_eq!(memberships, 0),
                _ => assert_eq!(memberships, 1),
            }
        }
        assert_eq!(self.nb_streams as usize, self.streams.len());
        let reserved = self.reserved.iter().filter(|slot| slot.is_some()).count();
        assert_eq!(self.nb_reserved as usize, reserved);
    }
}

enum SendData {
    Sent(usize),
    BlockedMux,
    BlockedConnWindow,
    BlockedStreamWindow,
}

/// Hop-by-hop headers never cross the mux; `te` survives only when it
/// asks for trailers
fn drop_hop_by_hop(header: &Header) -> bool {
    match header.name.as_slice() {
        b"connection" | b"proxy-connection" | b"keep-alive" | b"upgrade"
        | b"transfer-encoding" => true,
        b"te" => !header
            .value
            .windows(8)
            .any(|window| window.eq_ignore_ascii_case(b"trailers")),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hpack::LiteralCodec;

    fn frame_bytes(ty: u8, flags: u8, sid: i32, payload: &[u8]) -> Vec<u8> {
        let header = FrameHeader {
            len: payload.len() as u32,
            ty,
            flags,
            sid,
        };
        let mut bytes = [0u8; FRAME_HEADER_LEN];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.encode(&header);
        let mut out = bytes.to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn parse_frames(mut bytes: &[u8]) -> Vec<(FrameHeader, Vec<u8>)> {
        let mut frames = Vec::new();
        while !bytes.is_empty() {
            let (header, rest) = FrameHeader::decode(DecoderBuffer::new(bytes)).unwrap();
            let rest = rest.into_less_safe_slice();
            let (payload, rest) = rest.split_at(header.len as usize);
            frames.push((header, payload.to_vec()));
            bytes = rest;
        }
        frames
    }

    fn request_block(extra: &[Header]) -> Vec<u8> {
        let mut headers = vec![
            Header::new(":method", "GET"),
            Header::new(":scheme", "https"),
            Header::new(":authority", "proxy.example"),
            Header::new(":path", "/"),
        ];
        headers.extend_from_slice(extra);
        let mut block = Vec::new();
        LiteralCodec.encode(&headers, &mut block).unwrap();
        block
    }

    fn opened() -> MuxConn<LiteralCodec> {
        let mut conn = MuxConn::new(Config::default(), LiteralCodec);
        conn.recv(PREFACE);
        conn.recv(&frame_bytes(FT_SETTINGS, 0, 0, &[]));
        conn.process();
        assert!(!conn.is_errored());
        // drain our SETTINGS, the SETTINGS ACK and the window opening
        let output = conn.take_output();
        let kinds: Vec<u8> = parse_frames(&output).iter().map(|(h, _)| h.ty).collect();
        assert_eq!(kinds, [FT_SETTINGS, FT_SETTINGS, FT_WINDOW_UPDATE]);
        conn
    }

    fn open_stream(conn: &mut MuxConn<LiteralCodec>, sid: i32, end_stream: bool) {
        let flags = FL_END_HEADERS | if end_stream { FL_END_STREAM } else { 0 };
        let block = request_block(&[]);
        conn.recv(&frame_bytes(FT_HEADERS, flags, sid, &block));
        conn.process();
        assert!(conn.stream(sid).is_some(), "stream {sid} was not created");
        conn.assert_list_invariants();
    }

    #[test]
    fn preface_and_first_settings() {
        let _ = opened();
    }

    #[test]
    fn bad_preface_is_a_protocol_error() {
        let mut conn = MuxConn::new(Config::default(), LiteralCodec);
        conn.recv(b"GET / HTTP/1.1\r\nHost: example\r\n");
        conn.process();
        assert!(conn.is_errored());
        assert!(conn.goaway_sent());
        let output = conn.take_output();
        let frames = parse_frames(&output);
        let goaway = frames.iter().find(|(h, _)| h.ty == FT_GOAWAY).unwrap();
        assert_eq!(
            u32::from_be_bytes(goaway.1[4..8].try_into().unwrap()),
            ErrorCode::ProtocolError.to_wire()
        );
    }

    #[test]
    fn first_frame_must_be_settings() {
        let mut conn = MuxConn::new(Config::default(), LiteralCodec);
        conn.recv(PREFACE);
        conn.recv(&frame_bytes(FT_PING, 0, 0, &[0; 8]));
        conn.process();
        assert!(conn.is_errored());
    }

    #[test]
    fn headers_open_a_stream() {
        let mut conn = opened();
        open_stream(&mut conn, 1, false);
        let stream = conn.stream(1).unwrap();
        assert_eq!(stream.state, StreamState::Open);
        assert!(matches!(
            stream.rxbuf.front(),
            Some(htx::Block::ReqStart { .. })
        ));
        assert_eq!(conn.max_id(), 1);
        assert_eq!(conn.ready_streams(), [1]);
    }

    /// HEADERS + CONTINUATION fold into one header block
    #[test]
    fn continuation_folding() {
        let mut conn = opened();
        let position_before = conn.dbuf.position();

        let block = request_block(&[Header::new("x-filler", vec![b'f'; 80])]);
        assert!(block.len() > 60);
        let (first, second) = block.split_at(block.len() - 50);

        let mut wire = frame_bytes(FT_HEADERS, 0, 1, first);
        wire.extend_from_slice(&frame_bytes(FT_CONTINUATION, FL_END_HEADERS, 1, second));
        conn.recv(&wire);
        conn.process();

        assert!(!conn.is_errored());
        let expected_consumed = (FRAME_HEADER_LEN + first.len() + FRAME_HEADER_LEN + 50) as u64;
        assert_eq!(conn.dbuf.position() - position_before, expected_consumed);

        let stream = conn.stream(1).unwrap();
        assert_eq!(stream.state, StreamState::Open);
        let filler = stream
            .rxbuf
            .iter()
            .find_map(|block| match block {
                htx::Block::Header(header) if header.name == b"x-filler" => Some(header),
                _ => None,
            })
            .unwrap();
        assert_eq!(filler.value.len(), 80);

        // the demuxer must be byte-accurate after the fold
        conn.recv(&frame_bytes(FT_PING, 0, 0, &[7; 8]));
        conn.process();
        let output = conn.take_output();
        let frames = parse_frames(&output);
        let ping = frames.iter().find(|(h, _)| h.ty == FT_PING).unwrap();
        assert_eq!(ping.0.flags, FL_ACK);
        assert_eq!(ping.1, [7; 8]);
    }

    #[test]
    fn continuation_on_wrong_stream_is_a_connection_error() {
        let mut conn = opened();
        let block = request_block(&[]);
        let (first, second) = block.split_at(10);

        let mut wire = frame_bytes(FT_HEADERS, 0, 1, first);
        wire.extend_from_slice(&frame_bytes(FT_CONTINUATION, FL_END_HEADERS, 3, second));
        conn.recv(&wire);
        conn.process();
        assert!(conn.is_errored());
        assert_eq!(conn.error_code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn orphan_continuation_is_a_connection_error() {
        let mut conn = opened();
        conn.recv(&frame_bytes(FT_CONTINUATION, FL_END_HEADERS, 1, b"x"));
        conn.process();
        assert!(conn.is_errored());
        assert_eq!(conn.error_code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn settings_ack_with_payload_is_a_frame_size_error() {
        let mut conn = opened();
        conn.recv(&frame_bytes(FT_SETTINGS, FL_ACK, 0, &[0; 6]));
        conn.process();
        assert!(conn.is_errored());
        assert_eq!(conn.error_code(), ErrorCode::FrameSizeError);
    }

    #[test]
    fn settings_max_frame_size_bounds() {
        for value in [16_383u32, 16_777_216] {
            let mut conn = opened();
            let mut payload = Vec::new();
            payload.extend_from_slice(&SETTINGS_MAX_FRAME_SIZE.to_be_bytes());
            payload.extend_from_slice(&value.to_be_bytes());
            conn.recv(&frame_bytes(FT_SETTINGS, 0, 0, &payload));
            conn.process();
            assert!(conn.is_errored(), "value {value} must be rejected");
            assert_eq!(conn.error_code(), ErrorCode::ProtocolError);
        }
    }

    #[test]
    fn window_update_of_zero() {
        // connection scope: connection error
        let mut conn = opened();
        conn.recv(&frame_bytes(FT_WINDOW_UPDATE, 0, 0, &0u32.to_be_bytes()));
        conn.process();
        assert!(conn.is_errored());
        assert_eq!(conn.error_code(), ErrorCode::ProtocolError);

        // stream scope: stream error, connection survives
        let mut conn = opened();
        open_stream(&mut conn, 1, false);
        conn.take_output();
        conn.recv(&frame_bytes(FT_WINDOW_UPDATE, 0, 1, &0u32.to_be_bytes()));
        conn.process();
        assert!(!conn.is_errored());
        let output = conn.take_output();
        let frames = parse_frames(&output);
        let rst = frames.iter().find(|(h, _)| h.ty == FT_RST_STREAM).unwrap();
        assert_eq!(rst.0.sid, 1);
        assert_eq!(
            u32::from_be_bytes(rst.1[..4].try_into().unwrap()),
            ErrorCode::ProtocolError.to_wire()
        );
    }

    #[test]
    fn connection_window_overflow() {
        let mut conn = opened();
        let increment = (MAX_WINDOW_SIZE as u32).to_be_bytes();
        conn.recv(&frame_bytes(FT_WINDOW_UPDATE, 0, 0, &increment));
        conn.process();
        assert!(conn.is_errored());
        assert_eq!(conn.error_code(), ErrorCode::FlowControlError);
    }

    #[test]
    fn data_on_idle_stream_is_a_connection_error() {
        let mut conn = opened();
        conn.recv(&frame_bytes(FT_DATA, 0, 1, b"body"));
        conn.process();
        assert!(conn.is_errored());
        assert_eq!(conn.error_code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn trailers_require_end_stream() {
        let mut conn = opened();
        open_stream(&mut conn, 1, false);

        let mut block = Vec::new();
        LiteralCodec
            .encode(&[Header::new("x-checksum", "abc")], &mut block)
            .unwrap();
        conn.recv(&frame_bytes(FT_HEADERS, FL_END_HEADERS, 1, &block));
        conn.process();
        assert!(conn.is_errored());
        assert_eq!(conn.error_code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn trailers_with_end_stream_reach_the_stream() {
        let mut conn = opened();
        open_stream(&mut conn, 1, false);

        let mut block = Vec::new();
        LiteralCodec
            .encode(&[Header::new("x-checksum", "abc")], &mut block)
            .unwrap();
        conn.recv(&frame_bytes(
            FT_HEADERS,
            FL_END_HEADERS | FL_END_STREAM,
            1,
            &block,
        ));
        conn.process();
        assert!(!conn.is_errored());
        let stream = conn.stream(1).unwrap();
        assert_eq!(stream.state, StreamState::HalfClosedRemote);
        assert!(stream
            .rxbuf
            .iter()
            .any(|block| matches!(block, htx::Block::Trailer(_))));
    }

    #[test]
    fn data_respects_content_length() {
        let mut conn = opened();
        let block = request_block(&[Header::new("content-length", "4")]);
        conn.recv(&frame_bytes(FT_HEADERS, FL_END_HEADERS, 1, &block));
        conn.process();
        conn.take_output();

        conn.recv(&frame_bytes(FT_DATA, 0, 1, b"toolong"));
        conn.process();
        assert!(!conn.is_errored());
        let output = conn.take_output();
        assert!(parse_frames(&output)
            .iter()
            .any(|(h, _)| h.ty == FT_RST_STREAM));
    }

    #[test]
    fn ping_is_acknowledged() {
        let mut conn = opened();
        conn.recv(&frame_bytes(FT_PING, 0, 0, &[1, 2, 3, 4, 5, 6, 7, 8]));
        conn.process();
        let output = conn.take_output();
        let frames = parse_frames(&output);
        let ping = frames.iter().find(|(h, _)| h.ty == FT_PING).unwrap();
        assert_eq!(ping.0.flags, FL_ACK);
        assert_eq!(ping.1, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn max_concurrent_streams_refuses_excess() {
        let config = Config::builder().max_concurrent_streams(1).build();
        let mut conn = MuxConn::new(config, LiteralCodec);
        conn.recv(PREFACE);
        conn.recv(&frame_bytes(FT_SETTINGS, 0, 0, &[]));
        conn.process();
        open_stream(&mut conn, 1, false);
        conn.take_output();

        let block = request_block(&[]);
        conn.recv(&frame_bytes(FT_HEADERS, FL_END_HEADERS, 3, &block));
        conn.process();
        assert!(!conn.is_errored());
        assert!(conn.stream(3).is_none());
        let output = conn.take_output();
        let frames = parse_frames(&output);
        let rst = frames.iter().find(|(h, _)| h.ty == FT_RST_STREAM).unwrap();
        assert_eq!(rst.0.sid, 3);
        assert_eq!(
            u32::from_be_bytes(rst.1[..4].try_into().unwrap()),
            ErrorCode::RefusedStream.to_wire()
        );
    }

    /// spec scenario: response bytes pace through stream, connection and
    /// frame-size windows, with no duplication across a WINDOW_UPDATE
    #[test]
    fn flow_controlled_emission() {
        let mut conn = opened();
        open_stream(&mut conn, 1, true);
        conn.take_output();

        let body: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        let mut msg = htx::Message::new();
        msg.push(htx::Block::ResStart { status: 200 });
        msg.push(htx::Block::Data(bytes::Bytes::from(body.clone())));
        msg.push(htx::Block::Eom);

        let sent = conn.snd_response(1, &mut msg);
        assert_eq!(sent, 65_535);
        assert_eq!(conn.queue_of(1), Queue::Blocked);
        conn.assert_list_invariants();

        let mut first_burst = Vec::new();
        for (header, payload) in parse_frames(&conn.take_output()) {
            if header.ty == FT_DATA {
                first_burst.extend_from_slice(&payload);
            }
        }
        assert_eq!(first_burst.len(), 65_535);

        // the peer opens both windows
        conn.recv(&frame_bytes(FT_WINDOW_UPDATE, 0, 1, &200_000u32.to_be_bytes()));
        conn.recv(&frame_bytes(
            FT_WINDOW_UPDATE,
            0,
            0,
            &(INITIAL_WINDOW_INCREMENT).to_be_bytes(),
        ));
        conn.process();
        assert_eq!(conn.take_sendable_streams(), [1]);
        conn.assert_list_invariants();

        let sent = conn.snd_response(1, &mut msg);
        assert_eq!(sent, 100_000 - 65_535);
        assert!(msg.is_empty());

        let mut second_burst = Vec::new();
        let mut saw_end_stream = false;
        for (header, payload) in parse_frames(&conn.take_output()) {
            if header.ty == FT_DATA {
                second_burst.extend_from_slice(&payload);
                saw_end_stream |= header.flags & FL_END_STREAM != 0;
            }
        }
        assert!(saw_end_stream);

        first_burst.extend_from_slice(&second_burst);
        assert_eq!(first_burst, body, "bytes were duplicated or lost");
    }

    /// spec scenario: proxy stop advertises the watermark via GOAWAY
    #[test]
    fn goaway_on_proxy_stop() {
        let mut conn = opened();
        for sid in [1, 3, 5, 7, 9] {
            open_stream(&mut conn, sid, true);
        }
        assert_eq!(conn.max_id(), 9);
        assert_eq!(conn.last_sid(), -1);
        conn.take_output();

        conn.stop(true);
        assert_eq!(conn.last_sid(), i32::MAX);
        assert!(conn.goaway_sent());
        let output = conn.take_output();
        let frames = parse_frames(&output);
        let goaway = frames.iter().find(|(h, _)| h.ty == FT_GOAWAY).unwrap();
        assert_eq!(
            u32::from_be_bytes(goaway.1[4..8].try_into().unwrap()),
            ErrorCode::NoError.to_wire()
        );
    }

    #[test]
    fn hard_stop_refuses_new_streams() {
        let mut conn = opened();
        open_stream(&mut conn, 9, true);
        conn.stop(false);
        assert_eq!(conn.last_sid(), 9);
        conn.take_output();

        let block = request_block(&[]);
        conn.recv(&frame_bytes(FT_HEADERS, FL_END_HEADERS, 11, &block));
        conn.process();
        assert!(conn.stream(11).is_none());
        let output = conn.take_output();
        let rst = parse_frames(&output)
            .into_iter()
            .find(|(h, _)| h.ty == FT_RST_STREAM)
            .unwrap();
        assert_eq!(rst.0.sid, 11);
        assert_eq!(
            u32::from_be_bytes(rst.1[..4].try_into().unwrap()),
            ErrorCode::RefusedStream.to_wire()
        );
    }

    #[test]
    fn goaway_goes_out_at_most_once() {
        let mut conn = opened();
        conn.stop(true);
        conn.stop(true);
        conn.kill_connection();
        let output = conn.take_output();
        let goaways = parse_frames(&output)
            .iter()
            .filter(|(h, _)| h.ty == FT_GOAWAY)
            .count();
        assert_eq!(goaways, 1);
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut conn = opened();
        open_stream(&mut conn, 1, true);
        conn.take_output();

        let mut msg = htx::Message::new();
        msg.push(htx::Block::ResStart { status: 200 });
        msg.push(htx::Block::Header(Header::new("connection", "close")));
        msg.push(htx::Block::Header(Header::new("keep-alive", "timeout=5")));
        msg.push(htx::Block::Header(Header::new("te", "trailers")));
        msg.push(htx::Block::Header(Header::new("content-type", "text/plain")));
        conn.snd_response(1, &mut msg);

        let output = conn.take_output();
        let headers_frame = parse_frames(&output)
            .into_iter()
            .find(|(h, _)| h.ty == FT_HEADERS)
            .unwrap();
        let decoded = LiteralCodec.decode(&headers_frame.1).unwrap();
        let names: Vec<&[u8]> = decoded.iter().map(|h| h.name.as_slice()).collect();
        assert!(names.contains(&&b":status"[..]));
        assert!(names.contains(&&b"content-type"[..]));
        // `te: trailers` is the one hop-by-hop survivor
        assert!(names.contains(&&b"te"[..]));
        assert!(!names.contains(&&b"connection"[..]));
        assert!(!names.contains(&&b"keep-alive"[..]));
    }

    /// An oversized header block is rewritten as HEADERS without
    /// END_HEADERS plus CONTINUATION frames
    #[test]
    fn response_headers_fragment_past_max_frame_size() {
        let mut conn = opened();
        open_stream(&mut conn, 1, true);
        conn.take_output();

        let mut msg = htx::Message::new();
        msg.push(htx::Block::ResStart { status: 200 });
        msg.push(htx::Block::Header(Header::new(
            "x-giant",
            vec![b'g'; 20_000],
        )));
        conn.snd_response(1, &mut msg);

        let output = conn.take_output();
        let frames = parse_frames(&output);
        let headers: Vec<_> = frames
            .iter()
            .filter(|(h, _)| h.ty == FT_HEADERS || h.ty == FT_CONTINUATION)
            .collect();
        assert!(headers.len() >= 2);
        assert_eq!(headers[0].0.ty, FT_HEADERS);
        assert_eq!(headers[0].0.flags & FL_END_HEADERS, 0);
        for middle in &headers[1..headers.len() - 1] {
            assert_eq!(middle.0.ty, FT_CONTINUATION);
            assert_eq!(middle.0.flags & FL_END_HEADERS, 0);
        }
        let last = headers.last().unwrap();
        assert_eq!(last.0.ty, FT_CONTINUATION);
        assert_eq!(last.0.flags & FL_END_HEADERS, FL_END_HEADERS);
        for frame in &headers {
            assert_eq!(frame.0.sid, 1);
        }

        // reassembled, the block decodes to the original list
        let mut block = Vec::new();
        for (_, payload) in &headers {
            block.extend_from_slice(payload);
        }
        let decoded = LiteralCodec.decode(&block).unwrap();
        assert!(decoded.iter().any(|h| h.name == b"x-giant" && h.value.len() == 20_000));
    }

    #[test]
    fn shutr_before_response_refuses_the_stream() {
        let mut conn = opened();
        open_stream(&mut conn, 1, false);
        conn.take_output();

        conn.shutr(1);
        let output = conn.take_output();
        let rst = parse_frames(&output)
            .into_iter()
            .find(|(h, _)| h.ty == FT_RST_STREAM)
            .unwrap();
        assert_eq!(
            u32::from_be_bytes(rst.1[..4].try_into().unwrap()),
            ErrorCode::RefusedStream.to_wire()
        );
        assert!(conn.stream(1).is_none());
    }

    #[test]
    fn shutr_after_response_cancels() {
        let mut conn = opened();
        open_stream(&mut conn, 1, false);

        let mut msg = htx::Message::new();
        msg.push(htx::Block::ResStart { status: 200 });
        conn.snd_response(1, &mut msg);
        conn.take_output();

        conn.shutr(1);
        let output = conn.take_output();
        let rst = parse_frames(&output)
            .into_iter()
            .find(|(h, _)| h.ty == FT_RST_STREAM)
            .unwrap();
        assert_eq!(
            u32::from_be_bytes(rst.1[..4].try_into().unwrap()),
            ErrorCode::Cancel.to_wire()
        );
    }

    #[test]
    fn shutw_after_headers_sends_empty_end_stream() {
        let mut conn = opened();
        open_stream(&mut conn, 1, false);

        let mut msg = htx::Message::new();
        msg.push(htx::Block::ResStart { status: 200 });
        conn.snd_response(1, &mut msg);
        conn.take_output();

        conn.shutw(1);
        let output = conn.take_output();
        let data = parse_frames(&output)
            .into_iter()
            .find(|(h, _)| h.ty == FT_DATA)
            .unwrap();
        assert_eq!(data.0.len, 0);
        assert_eq!(data.0.flags & FL_END_STREAM, FL_END_STREAM);
        assert_eq!(
            conn.stream(1).unwrap().state,
            StreamState::HalfClosedLocal
        );
    }

    #[test]
    fn kill_conn_sends_enhance_your_calm() {
        let mut conn = opened();
        open_stream(&mut conn, 1, false);
        conn.take_output();
        conn.stream(1).unwrap().latch(event::KILL_CONN);

        conn.shutr(1);
        let output = conn.take_output();
        let goaway = parse_frames(&output)
            .into_iter()
            .find(|(h, _)| h.ty == FT_GOAWAY)
            .unwrap();
        assert_eq!(
            u32::from_be_bytes(goaway.1[4..8].try_into().unwrap()),
            ErrorCode::EnhanceYourCalm.to_wire()
        );
    }

    #[test]
    fn single_data_block_moves_without_copy() {
        let mut conn = opened();
        open_stream(&mut conn, 1, true);
        // headers first so the data path is isolated below
        let mut msg = htx::Message::new();
        msg.push(htx::Block::ResStart { status: 200 });
        conn.snd_response(1, &mut msg);
        conn.take_output();

        let payload = bytes::Bytes::from_static(b"exact-fit body");
        let mut msg = htx::Message::new();
        msg.push(htx::Block::Data(payload));
        msg.push(htx::Block::Eom);
        let sent = conn.snd_response(1, &mut msg);
        assert_eq!(sent, 14);
        assert!(msg.is_empty());

        let output = conn.take_output();
        let data = parse_frames(&output)
            .into_iter()
            .find(|(h, _)| h.ty == FT_DATA)
            .unwrap();
        assert_eq!(data.1, b"exact-fit body");
        assert_eq!(data.0.flags & FL_END_STREAM, FL_END_STREAM);
    }

    #[test]
    fn writes_after_connection_error_are_noops() {
        let mut conn = opened();
        open_stream(&mut conn, 1, true);
        conn.recv(&frame_bytes(FT_DATA, 0, 0, b"bad"));
        conn.process();
        assert!(conn.is_errored());

        let mut msg = htx::Message::new();
        msg.push(htx::Block::ResStart { status: 200 });
        assert_eq!(conn.snd_response(1, &mut msg), 0);
    }

    #[test]
    fn timeout_only_fires_when_idle() {
        let mut conn = opened();
        open_stream(&mut conn, 1, true);
        conn.take_output();
        assert!(!conn.may_expire());
        assert!(!conn.on_timeout());

        conn.release_stream(1);
        conn.take_output();
        assert!(conn.may_expire());
        assert!(conn.on_timeout());
        assert!(conn.goaway_sent());
    }

    #[test]
    fn settings_initial_window_unblocks_streams() {
        let mut conn = opened();
        open_stream(&mut conn, 1, true);
        conn.take_output();

        // exhaust the stream window
        let body = vec![0u8; 70_000];
        let mut msg = htx::Message::new();
        msg.push(htx::Block::ResStart { status: 200 });
        msg.push(htx::Block::Data(bytes::Bytes::from(body)));
        let sent = conn.snd_response(1, &mut msg);
        assert_eq!(sent, 65_535);
        assert_eq!(conn.queue_of(1), Queue::Blocked);

        // the peer raises its initial window: the stream must move to
        // the send list
        let mut payload = Vec::new();
        payload.extend_from_slice(&SETTINGS_INITIAL_WINDOW_SIZE.to_be_bytes());
        payload.extend_from_slice(&140_000u32.to_be_bytes());
        conn.recv(&frame_bytes(FT_SETTINGS, 0, 0, &payload));
        conn.process();
        assert_eq!(conn.take_sendable_streams(), [1]);
        conn.assert_list_invariants();
    }

    fn opened_back() -> MuxConn<LiteralCodec> {
        let mut conn = MuxConn::new_back(Config::default(), LiteralCodec);
        conn.process();
        let output = conn.take_output();
        assert!(output.starts_with(PREFACE));
        let frames = parse_frames(&output[PREFACE.len()..]);
        assert_eq!(frames[0].0.ty, FT_SETTINGS);
        // the origin answers with its own SETTINGS
        conn.recv(&frame_bytes(FT_SETTINGS, 0, 0, &[]));
        conn.process();
        assert!(!conn.is_errored());
        conn.take_output();
        conn
    }

    fn request_message() -> htx::Message {
        let mut msg = htx::Message::new();
        msg.push(htx::Block::ReqStart {
            method: b"GET".to_vec(),
            scheme: b"https".to_vec(),
            authority: b"origin.example".to_vec(),
            path: b"/".to_vec(),
        });
        msg.push(htx::Block::Eom);
        msg
    }

    #[test]
    fn outgoing_streams_take_increasing_odd_ids() {
        let mut conn = opened_back();

        let first = conn.attach().unwrap();
        assert_eq!(conn.nb_reserved(), 1);
        conn.assert_list_invariants();

        let mut msg = request_message();
        assert_eq!(conn.snd_request(first, &mut msg), Some(1));
        assert!(msg.is_empty());
        assert_eq!(conn.nb_reserved(), 0);
        conn.assert_list_invariants();

        let second = conn.attach().unwrap();
        let mut msg = request_message();
        assert_eq!(conn.snd_request(second, &mut msg), Some(3));

        let output = conn.take_output();
        let frames = parse_frames(&output);
        let sids: Vec<i32> = frames
            .iter()
            .filter(|(h, _)| h.ty == FT_HEADERS)
            .map(|(h, _)| h.sid)
            .collect();
        assert_eq!(sids, [1, 3]);
        for (header, payload) in frames.iter().filter(|(h, _)| h.ty == FT_HEADERS) {
            assert_ne!(header.flags & FL_END_STREAM, 0);
            let decoded = LiteralCodec.decode(payload).unwrap();
            assert_eq!(decoded[0].name, b":method");
        }
    }

    #[test]
    fn response_headers_surface_on_backend_streams() {
        let mut conn = opened_back();
        let handle = conn.attach().unwrap();
        let mut msg = request_message();
        let sid = conn.snd_request(handle, &mut msg).unwrap();
        conn.take_output();

        let mut block = Vec::new();
        LiteralCodec
            .encode(
                &[
                    Header::new(":status", "200"),
                    Header::new("content-type", "text/plain"),
                ],
                &mut block,
            )
            .unwrap();
        conn.recv(&frame_bytes(FT_HEADERS, FL_END_HEADERS, sid, &block));
        conn.recv(&frame_bytes(FT_DATA, FL_END_STREAM, sid, b"hi"));
        conn.process();
        assert!(!conn.is_errored());

        let stream = conn.stream(sid).unwrap();
        assert_eq!(stream.status, 200);
        assert!(matches!(
            stream.rxbuf.front(),
            Some(htx::Block::ResStart { status: 200 })
        ));
        assert_eq!(stream.state, StreamState::Closed);
    }

    #[test]
    fn goaway_blocks_new_outgoing_streams() {
        let mut conn = opened_back();
        let handle = conn.attach().unwrap();

        // peer GOAWAY with last processed id 0
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&ErrorCode::NoError.to_wire().to_be_bytes());
        conn.recv(&frame_bytes(FT_GOAWAY, 0, 0, &payload));
        conn.process();

        assert_eq!(conn.snd_request(handle, &mut request_message()), None);
        assert!(conn.attach().is_none());
    }

    #[test]
    fn origin_cannot_open_streams() {
        let mut conn = opened_back();
        let block = request_block(&[]);
        conn.recv(&frame_bytes(FT_HEADERS, FL_END_HEADERS, 1, &block));
        conn.process();
        assert!(conn.is_errored());
        assert_eq!(conn.error_code(), ErrorCode::ProtocolError);
    }
}
