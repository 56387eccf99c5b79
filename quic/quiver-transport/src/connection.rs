// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-connection engine: state machine, handshake driver, packet
//! dispatch and transmit preparation
//!
//! A connection is only ever mutated from its own tasklet turn. The
//! endpoint routes packets in with [`Connection::on_rx_packet`] and runs
//! turns with [`Connection::run`].

use crate::{
    config::Config,
    level::EncLevel,
    recovery,
    ring_buf::TxBufferRing,
    rx::{CryptoChunk, RxPacket},
    space::PacketNumberSpace,
    tls::{HandshakeStatus, Output, Session},
    tx::{self, Built, BuilderCtx, OwnedFrame},
    EncryptionLevel,
};
use quiver_core::{
    connection::{
        id::{LocalId, LOCAL_LEN},
        ConnectionId,
    },
    crypto::{initial_keys, CipherSuite},
    endpoint,
    frame::Frame,
    packet::PacketType,
    transport::{Error, TransportParameters},
};
use quiver_codec::DecoderBuffer;
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Handshake progression of a connection
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandshakeState {
    ServerInitial,
    ServerHandshake,
    ServerHandshakeDone,
    ClientInitial,
    ClientHandshake,
    ClientHandshakeDone,
    Closed,
}

impl HandshakeState {
    /// The encryption level this state processes, and the one it hands
    /// over to
    fn levels(self) -> (EncryptionLevel, EncryptionLevel) {
        match self {
            Self::ServerInitial | Self::ClientInitial => {
                (EncryptionLevel::Initial, EncryptionLevel::Handshake)
            }
            _ => (EncryptionLevel::Handshake, EncryptionLevel::Application),
        }
    }

    fn is_complete(self) -> bool {
        matches!(self, Self::ServerHandshakeDone | Self::ClientHandshakeDone)
    }

    fn to_handshake(self) -> Self {
        match self {
            Self::ServerInitial => Self::ServerHandshake,
            Self::ClientInitial => Self::ClientHandshake,
            other => other,
        }
    }

    fn to_done(self) -> Self {
        match self {
            Self::ServerInitial | Self::ServerHandshake => Self::ServerHandshakeDone,
            Self::ClientInitial | Self::ClientHandshake => Self::ClientHandshakeDone,
            other => other,
        }
    }
}

/// The single application byte stream the HTTP framing mux rides on
///
/// STREAM frames reassemble into an in-order rx byte buffer; outgoing
/// bytes queue until the tasklet wraps them into frames.
#[derive(Debug, Default)]
pub struct AppStream {
    rx_offset: u64,
    rx_pending: std::collections::BTreeMap<u64, Vec<u8>>,
    rx_buf: Vec<u8>,
    rx_fin: bool,
    tx_offset: u64,
    tx_buf: VecDeque<u8>,
}

/// Stream id of the mux channel: the first client-initiated
/// bidirectional stream
pub const MUX_STREAM_ID: u64 = 0;

/// Frame payload granularity for queued stream data
const STREAM_CHUNK: usize = 1024;

impl AppStream {
    fn on_frame(&mut self, offset: u64, data: &[u8], fin: bool) {
        if fin {
            self.rx_fin = true;
        }
        if offset > self.rx_offset {
            self.rx_pending.insert(offset, data.to_vec());
            return;
        }
        // drop the already-delivered prefix on overlap
        let skip = (self.rx_offset - offset) as usize;
        if skip < data.len() {
            self.rx_buf.extend_from_slice(&data[skip..]);
            self.rx_offset += (data.len() - skip) as u64;
        }
        // earlier gaps may now be closed
        while let Some((&offset, _)) = self.rx_pending.iter().next() {
            if offset > self.rx_offset {
                break;
            }
            let data = self.rx_pending.remove(&offset).expect("first key");
            let skip = (self.rx_offset - offset) as usize;
            if skip < data.len() {
                self.rx_buf.extend_from_slice(&data[skip..]);
                self.rx_offset += (data.len() - skip) as u64;
            }
        }
    }

    fn queue_tx(&mut self, data: &[u8]) {
        self.tx_buf.extend(data);
    }

    fn flush_tx(&mut self, frames: &mut VecDeque<OwnedFrame>) {
        while !self.tx_buf.is_empty() {
            let take = self.tx_buf.len().min(STREAM_CHUNK);
            let data: Vec<u8> = self.tx_buf.drain(..take).collect();
            frames.push_back(OwnedFrame::Stream {
                id: MUX_STREAM_ID,
                offset: self.tx_offset,
                data,
                fin: false,
            });
            self.tx_offset += take as u64;
        }
    }

    pub fn take_rx(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.rx_buf)
    }

    pub fn rx_fin(&self) -> bool {
        self.rx_fin
    }
}

/// One QUIC connection: levels, spaces, TLS session, buffers
pub struct Connection<S: Session> {
    endpoint_type: endpoint::Type,
    version: u32,
    state: HandshakeState,
    /// The DCID the peer chose for its first Initial
    odcid: ConnectionId,
    /// Where we address the peer
    dcid: ConnectionId,
    /// The id the peer addresses us with
    scid: ConnectionId,
    levels: [EncLevel; EncryptionLevel::COUNT],
    spaces: [PacketNumberSpace; crate::space::SpaceId::COUNT],
    local_params: TransportParameters,
    peer_params: Option<TransportParameters>,
    tls: S,
    tx_ring: TxBufferRing,
    frames_to_send: VecDeque<OwnedFrame>,
    pub app: AppStream,
    crypto_in_flight: usize,
    retransmit: bool,
    error: Option<Error>,
    /// Locally issued CIDs awaiting registration by the endpoint
    fresh_cids: Vec<LocalId>,
    cid_sequence: u64,
    woken: bool,
    rng: SystemRandom,
}

/// Adapter giving the TLS provider access to key installation and the
/// outbound CRYPTO streams
struct TlsSink<'a> {
    levels: &'a mut [EncLevel; EncryptionLevel::COUNT],
    alert: &'a mut Option<Error>,
}

impl Output for TlsSink<'_> {
    fn on_secrets(
        &mut self,
        level: EncryptionLevel,
        suite: CipherSuite,
        rx_secret: Option<&[u8]>,
        tx_secret: Option<&[u8]>,
    ) -> Result<(), Error> {
        let keys = &mut self.levels[level.index()].keys;
        if let Some(secret) = rx_secret {
            keys.install_rx(suite, secret)?;
        }
        if let Some(secret) = tx_secret {
            keys.install_tx(suite, secret)?;
        }
        debug!(?level, ?suite, "traffic secrets installed");
        Ok(())
    }

    fn emit_crypto(&mut self, level: EncryptionLevel, data: &[u8]) -> Result<(), Error> {
        trace!(?level, len = data.len(), "crypto bytes from provider");
        self.levels[level.index()].tx_crypto.append(data);
        Ok(())
    }

    fn send_alert(&mut self, _level: EncryptionLevel, alert: u8) {
        *self.alert = Some(Error::crypto_error(alert));
    }
}

impl<S: Session> Connection<S> {
    fn new(
        config: &Config,
        endpoint_type: endpoint::Type,
        version: u32,
        odcid: ConnectionId,
        dcid: ConnectionId,
        scid: LocalId,
        mut tls: S,
    ) -> Result<Self, Error> {
        let mut levels: [EncLevel; EncryptionLevel::COUNT] = Default::default();
        levels[EncryptionLevel::Initial.index()].keys =
            initial_keys(odcid.as_slice(), endpoint_type)?;

        let mut local_params = config.local_parameters.clone();
        if endpoint_type.is_server() {
            local_params.original_destination_connection_id = Some(odcid);
        }
        let mut encoded = [0u8; 256];
        let len = local_params.encode(&mut encoded, endpoint_type);
        tls.set_transport_parameters(&encoded[..len]);

        Ok(Self {
            endpoint_type,
            version,
            state: if endpoint_type.is_server() {
                HandshakeState::ServerInitial
            } else {
                HandshakeState::ClientInitial
            },
            odcid,
            dcid,
            scid: scid.into(),
            levels,
            spaces: Default::default(),
            local_params,
            peer_params: None,
            tls,
            tx_ring: TxBufferRing::new(config.tx_bufs),
            frames_to_send: VecDeque::new(),
            app: AppStream::default(),
            crypto_in_flight: 0,
            retransmit: false,
            error: None,
            fresh_cids: Vec::new(),
            cid_sequence: 0,
            woken: true,
            rng: SystemRandom::new(),
        })
    }

    /// Accepts a connection from a client's first Initial packet
    ///
    /// `odcid` is the client-chosen DCID (initial secrets derive from
    /// it), `peer_scid` the id the client wants to be addressed by.
    pub fn new_server(
        config: &Config,
        version: u32,
        odcid: ConnectionId,
        peer_scid: ConnectionId,
        scid: LocalId,
        tls: S,
    ) -> Result<Self, Error> {
        Self::new(
            config,
            endpoint::Type::Server,
            version,
            odcid,
            peer_scid,
            scid,
            tls,
        )
    }

    /// Opens an outgoing connection; `dcid` is freshly drawn from the
    /// CSPRNG by the caller
    pub fn new_client(
        config: &Config,
        version: u32,
        dcid: ConnectionId,
        scid: LocalId,
        tls: S,
    ) -> Result<Self, Error> {
        Self::new(config, endpoint::Type::Client, version, dcid, dcid, scid, tls)
    }

    #[inline]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    #[inline]
    pub fn is_established(&self) -> bool {
        self.state.is_complete()
    }

    #[inline]
    pub fn error(&self) -> Option<Error> {
        self.error
    }

    #[inline]
    pub fn scid(&self) -> &ConnectionId {
        &self.scid
    }

    #[inline]
    pub fn peer_parameters(&self) -> Option<&TransportParameters> {
        self.peer_params.as_ref()
    }

    /// CIDs issued since the last call; the endpoint must register them
    pub fn take_fresh_cids(&mut self) -> Vec<LocalId> {
        std::mem::take(&mut self.fresh_cids)
    }

    /// True when the tasklet asked to run (again)
    pub fn take_wake(&mut self) -> bool {
        std::mem::take(&mut self.woken)
    }

    fn wake(&mut self) {
        self.woken = true;
    }

    /// Queues application bytes for the mux stream
    pub fn app_send(&mut self, data: &[u8]) {
        if self.error.is_some() {
            // writes to an errored connection are no-ops
            return;
        }
        self.app.queue_tx(data);
        self.wake();
    }

    /// Drains prepared datagrams for the socket layer
    pub fn take_datagrams(&mut self) -> Vec<Vec<u8>> {
        let mut datagrams = Vec::new();
        while let Some(datagram) = self.tx_ring.rbuf() {
            datagrams.push(datagram.to_vec());
            self.tx_ring.release_rbuf();
        }
        datagrams
    }

    /// Routes one parsed packet into its encryption level
    pub fn on_rx_packet(&mut self, mut packet: RxPacket) {
        let level = if packet.long_header {
            match EncryptionLevel::from_packet_type(packet.packet_type) {
                Some(level) => level,
                None => return,
            }
        } else {
            EncryptionLevel::Application
        };

        // the peer's source id becomes our destination id
        if packet.long_header && packet.packet_type == PacketType::Initial {
            if self.endpoint_type.is_server() || !packet.scid.is_empty() {
                self.dcid = packet.scid;
            }
        }

        if self.state == HandshakeState::ServerInitial
            && packet.packet_type == PacketType::Handshake
            && packet.long_header
        {
            self.state = HandshakeState::ServerHandshake;
        }

        let li = level.index();
        let si = level.space().index();
        if self.levels[li].keys.has_rx() {
            let largest = self.spaces[si].largest_rx_pn();
            match self.levels[li].remove_header_protection(&mut packet, largest) {
                Ok(()) => {
                    trace!(pn = packet.pn, ?level, "rx packet unprotected");
                    self.levels[li].rx_packets.insert(packet.pn, packet);
                }
                Err(_) => {
                    trace!(?level, "header protection removal failed, packet dropped");
                }
            }
        } else {
            trace!(?level, "rx keys not ready, packet parked");
            self.levels[li].rx_pending.push_back(packet);
        }
        self.wake();
    }

    /// One cooperative turn: recv → decrypt → dispatch → build
    pub fn run(&mut self) {
        if self.state == HandshakeState::Closed {
            return;
        }
        let result = if self.state.is_complete() {
            self.application_turn()
        } else {
            self.handshake_turn()
        };
        if let Err(error) = result {
            debug!(%error, "connection failed");
            self.close(error);
        }
    }

    fn close(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
        // best effort: convey the error if 1-RTT keys exist
        if self.levels[EncryptionLevel::Application.index()].keys.has_tx() {
            self.frames_to_send.push_back(OwnedFrame::ConnectionClose {
                code: error.code,
                frame_type: Some(error.frame_type),
                reason: error.reason,
            });
            let _ = self.prep_app_packets();
        }
        self.state = HandshakeState::Closed;
    }

    fn builder_ctx(&self) -> (u32, ConnectionId, ConnectionId, endpoint::Type) {
        (self.version, self.dcid, self.scid, self.endpoint_type)
    }

    // === handshake path =================================================

    fn handshake_turn(&mut self) -> Result<(), Error> {
        let (mut tel, next_tel) = self.state.levels();

        loop {
            self.unprotect_pending(tel);
            self.treat_rx_level(tel)?;

            if self.retransmit {
                self.prep_retransmit_packets(tel, next_tel)?;
            } else {
                self.prep_handshake_packets(tel, next_tel)?;
            }

            // hand over to the next level once it can make progress
            let next = &self.levels[next_tel.index()];
            if tel != next_tel
                && next.keys.has_rx()
                && (!next.rx_pending.is_empty() || !next.rx_packets.is_empty())
            {
                tel = next_tel;
                self.state = self.state.to_handshake();
                continue;
            }
            break;
        }

        let status = {
            let Self { tls, levels, error, .. } = self;
            let mut sink = TlsSink { levels, alert: error };
            tls.do_handshake(&mut sink)?
        };
        if let Some(alert) = self.error {
            return Err(alert);
        }

        // the provider may have produced new records to flush
        let (tel, next_tel) = self.state.levels();
        self.prep_handshake_packets(tel, next_tel)?;

        match status {
            HandshakeStatus::Complete => self.on_handshake_complete(),
            HandshakeStatus::WantRead | HandshakeStatus::WantWrite => Ok(()),
        }
    }

    fn on_handshake_complete(&mut self) -> Result<(), Error> {
        self.state = self.state.to_done();
        debug!(state = ?self.state, "handshake complete");

        let peer_params = self
            .tls
            .peer_transport_parameters()
            .ok_or(Error::TRANSPORT_PARAMETER_ERROR.with_reason("peer parameters missing"))?;
        let peer_params =
            TransportParameters::decode(peer_params, self.endpoint_type.peer_type())?;

        //= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#19.20
        //# The server uses the HANDSHAKE_DONE frame (type=0x1e) to signal
        //# confirmation of the handshake to the client.
        if self.endpoint_type.is_server() {
            self.frames_to_send.push_back(OwnedFrame::HandshakeDone);

            let limit = peer_params.active_connection_id_limit.as_u64().min(8);
            for _ in 1..limit {
                let mut cid = [0u8; LOCAL_LEN];
                let mut token = [0u8; 16];
                self.rng
                    .fill(&mut cid)
                    .and_then(|()| self.rng.fill(&mut token))
                    .map_err(|_| Error::INTERNAL_ERROR.with_reason("rng failure"))?;
                self.cid_sequence += 1;
                self.fresh_cids.push(LocalId::new(cid));
                self.frames_to_send.push_back(OwnedFrame::NewConnectionId {
                    sequence: self.cid_sequence,
                    cid,
                    token,
                });
            }
        }
        self.peer_params = Some(peer_params);

        self.prep_app_packets()
    }

    // === rx processing ==================================================

    fn unprotect_pending(&mut self, level: EncryptionLevel) {
        let li = level.index();
        if !self.levels[li].keys.has_rx() || self.levels[li].rx_pending.is_empty() {
            return;
        }
        let largest = self.spaces[level.space().index()].largest_rx_pn();
        let mut pending = std::mem::take(&mut self.levels[li].rx_pending);
        for mut packet in pending.drain(..) {
            match self.levels[li].remove_header_protection(&mut packet, largest) {
                Ok(()) => {
                    self.levels[li].rx_packets.insert(packet.pn, packet);
                }
                Err(_) => {
                    trace!(?level, "header protection removal failed, packet dropped");
                }
            }
        }
    }

    /// Processes every packet of a level in packet-number order,
    /// feeding the TLS provider with in-order CRYPTO bytes
    fn treat_rx_level(&mut self, level: EncryptionLevel) -> Result<(), Error> {
        let li = level.index();
        let si = level.space().index();

        loop {
            let mut progress = false;
            let pns: Vec<u64> = self.levels[li].rx_packets.keys().copied().collect();

            for pn in pns {
                let Some(mut packet) = self.levels[li].rx_packets.remove(&pn) else {
                    continue;
                };

                if !packet.parsed {
                    if self.levels[li].decrypt_packet(&mut packet).is_err() {
                        // crypto open failure: drop silently
                        trace!(pn, ?level, "packet decryption failed, dropped");
                        continue;
                    }
                    if let Err(error) = self.parse_packet_frames(level, &mut packet) {
                        if packet.long_header {
                            // frame errors during the handshake are fatal
                            return Err(error);
                        }
                        trace!(pn, ?level, %error, "packet parsing failed, dropped");
                        continue;
                    }
                    packet.parsed = true;
                    self.spaces[si].on_rx_packet(packet.pn, packet.ack_eliciting);
                }

                if packet.crypto.is_empty() {
                    continue; // consumed
                }

                // deliver CRYPTO chunks only in strict offset order
                let mut blocked = false;
                while let Some(chunk) = packet.crypto.first() {
                    let expected = self.levels[li].rx_crypto_offset;
                    if chunk.offset + chunk.len as u64 <= expected {
                        // duplicate of already-delivered bytes
                        packet.crypto.remove(0);
                        continue;
                    }
                    if chunk.offset > expected {
                        blocked = true;
                        break;
                    }
                    let chunk = packet.crypto.remove(0);
                    let skip = (expected - chunk.offset) as usize;
                    let data =
                        packet.data[chunk.start + skip..chunk.start + chunk.len].to_vec();

                    self.levels[li].rx_crypto_offset += data.len() as u64;
                    progress = true;

                    let Self { tls, levels, error, .. } = self;
                    let mut sink = TlsSink { levels, alert: error };
                    tls.provide_data(level, &data, &mut sink)?;
                    if let Some(alert) = self.error {
                        return Err(alert);
                    }
                }

                if blocked {
                    trace!(pn, ?level, "out of order CRYPTO, packet retained");
                    packet.out_of_order = true;
                    self.levels[li].rx_packets.insert(pn, packet);
                }
            }

            if !progress {
                return Ok(());
            }
        }
    }

    /// Parses and dispatches every frame of a decrypted packet
    fn parse_packet_frames(
        &mut self,
        level: EncryptionLevel,
        packet: &mut RxPacket,
    ) -> Result<(), Error> {
        let data = std::mem::take(&mut packet.data);
        let result = self.parse_frames_inner(level, packet, &data);
        packet.data = data;
        if let Ok(()) = result {
            packet.crypto.sort_by_key(|chunk| chunk.offset);
        }
        result
    }

    fn parse_frames_inner(
        &mut self,
        level: EncryptionLevel,
        packet: &mut RxPacket,
        data: &[u8],
    ) -> Result<(), Error> {
        let payload = &data[packet.aad_len..packet.len];
        let mut buffer = DecoderBuffer::new(payload);
        let long_header = packet.long_header;

        while !buffer.is_empty() {
            let (frame, rest) = Frame::decode(buffer)?;
            if frame.is_ack_eliciting() {
                packet.ack_eliciting = true;
            }

            match frame {
                Frame::Padding(_) | Frame::Ping(_) => {}
                Frame::Crypto(crypto) => {
                    let start = crypto.data.as_ptr() as usize - data.as_ptr() as usize;
                    packet.crypto.push(CryptoChunk {
                        offset: crypto.offset.as_u64(),
                        start,
                        len: crypto.data.len(),
                    });
                }
                Frame::Ack(ack) => {
                    let li = level.index();
                    let si = level.space().index();
                    let outcome = recovery::on_ack_received(
                        &mut self.levels[li],
                        &mut self.spaces[si],
                        &ack,
                    )?;
                    self.crypto_in_flight = self
                        .crypto_in_flight
                        .saturating_sub(outcome.freed_in_flight);
                    if outcome.lost_frames {
                        self.retransmit = true;
                        self.wake();
                    }
                }
                Frame::ConnectionClose(close) => {
                    debug!(code = %close.error_code, "peer closed the connection");
                    self.error = Some(Error::new(close.error_code));
                    self.state = HandshakeState::Closed;
                }
                Frame::HandshakeDone(_) if !long_header && self.endpoint_type.is_client() => {
                    // handshake confirmation, nothing left to do here
                }
                Frame::NewConnectionId(_) if !long_header => {
                    // alternative peer ids; migration is out of scope
                }
                Frame::Stream(stream) if !long_header => {
                    if stream.stream_id.as_u64() == MUX_STREAM_ID {
                        self.app
                            .on_frame(stream.offset.as_u64(), stream.data, stream.is_fin);
                    }
                }
                _ => {
                    return Err(Error::PROTOCOL_VIOLATION
                        .with_reason("frame not permitted at this encryption level"));
                }
            }
            buffer = rest;
        }
        Ok(())
    }

    // === tx preparation =================================================

    fn prep_handshake_packets(
        &mut self,
        tel: EncryptionLevel,
        next_tel: EncryptionLevel,
    ) -> Result<(), Error> {
        let (version, dcid, scid, endpoint_type) = self.builder_ctx();
        let ctx = BuilderCtx {
            version,
            dcid: &dcid,
            scid: &scid,
            endpoint: endpoint_type,
        };

        let mut tel = tel;
        loop {
            let Some(packet_type) = tel.packet_type() else {
                break;
            };
            let li = tel.index();
            let si = tel.space().index();
            if !self.levels[li].keys.has_tx() {
                break;
            }

            let offset = self.levels[li].tx_crypto.offset();
            let avail = self.levels[li].tx_crypto.chunk_at(offset).len();

            let built = {
                let Self { levels, spaces, tx_ring, crypto_in_flight, .. } = self;
                tx::build_handshake_packet(
                    tx_ring.wbuf(),
                    &ctx,
                    packet_type,
                    &mut levels[li],
                    &mut spaces[si],
                    offset,
                    avail,
                    crypto_in_flight,
                )?
            };

            match built {
                Built::Committed { crypto_len, .. } => {
                    self.levels[li].tx_crypto.advance(crypto_len);
                    if self.levels[li].tx_crypto.is_consumed() {
                        if tel == EncryptionLevel::Initial && tel != next_tel {
                            // coalesce the next level into the same datagram
                            tel = next_tel;
                            continue;
                        }
                        break;
                    }
                    if !self.tx_ring.advance_wbuf() {
                        break;
                    }
                }
                Built::Empty => {
                    if tel == EncryptionLevel::Initial && tel != next_tel {
                        tel = next_tel;
                        continue;
                    }
                    break;
                }
                Built::Full => {
                    if !self.tx_ring.advance_wbuf() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn prep_retransmit_packets(
        &mut self,
        tel: EncryptionLevel,
        next_tel: EncryptionLevel,
    ) -> Result<(), Error> {
        let (version, dcid, scid, endpoint_type) = self.builder_ctx();
        let ctx = BuilderCtx {
            version,
            dcid: &dcid,
            scid: &scid,
            endpoint: endpoint_type,
        };

        let mut tel = tel;
        'levels: loop {
            let Some(packet_type) = tel.packet_type() else {
                break;
            };
            let li = tel.index();
            let si = tel.space().index();

            while let Some((&pn, frame)) = self.levels[li].retransmit.iter().next() {
                let offset = frame.offset;
                let avail = frame
                    .len
                    .min(self.levels[li].tx_crypto.chunk_at(offset).len());

                let built = {
                    let Self { levels, spaces, tx_ring, crypto_in_flight, .. } = self;
                    tx::build_handshake_packet(
                        tx_ring.wbuf(),
                        &ctx,
                        packet_type,
                        &mut levels[li],
                        &mut spaces[si],
                        offset,
                        avail,
                        crypto_in_flight,
                    )?
                };

                match built {
                    Built::Committed { crypto_len, .. } => {
                        recovery::consume_retransmit(&mut self.levels[li], pn, crypto_len);
                        if !self.tx_ring.advance_wbuf() {
                            break 'levels;
                        }
                    }
                    Built::Empty => break 'levels, // in-flight cap reached
                    Built::Full => {
                        if !self.tx_ring.advance_wbuf() {
                            break 'levels;
                        }
                    }
                }
            }

            if tel == EncryptionLevel::Initial && tel != next_tel {
                tel = next_tel;
                continue;
            }
            break;
        }

        if self
            .levels
            .iter()
            .all(|level| level.retransmit.is_empty())
        {
            self.retransmit = false;
        }
        Ok(())
    }

    fn prep_app_packets(&mut self) -> Result<(), Error> {
        let li = EncryptionLevel::Application.index();
        if !self.levels[li].keys.has_tx() {
            return Ok(());
        }
        self.app.flush_tx(&mut self.frames_to_send);

        let (version, dcid, scid, endpoint_type) = self.builder_ctx();
        let ctx = BuilderCtx {
            version,
            dcid: &dcid,
            scid: &scid,
            endpoint: endpoint_type,
        };
        let si = EncryptionLevel::Application.space().index();

        loop {
            let built = {
                let Self { levels, spaces, tx_ring, frames_to_send, .. } = self;
                tx::build_app_packet(
                    tx_ring.wbuf(),
                    &ctx,
                    &mut levels[li],
                    &mut spaces[si],
                    frames_to_send,
                )?
            };
            match built {
                Built::Committed { .. } => {
                    if self.frames_to_send.is_empty() {
                        break;
                    }
                    if !self.tx_ring.advance_wbuf() {
                        break;
                    }
                }
                Built::Empty => break,
                Built::Full => {
                    if !self.tx_ring.advance_wbuf() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    // === application path ===============================================

    fn application_turn(&mut self) -> Result<(), Error> {
        self.unprotect_pending(EncryptionLevel::Application);
        self.treat_rx_level(EncryptionLevel::Application)?;
        // late handshake-level packets still carry ACKs
        self.unprotect_pending(EncryptionLevel::Handshake);
        self.treat_rx_level(EncryptionLevel::Handshake)?;

        if self.retransmit {
            let (tel, next_tel) = self.state.levels();
            self.prep_retransmit_packets(tel, next_tel)?;
        }
        self.prep_app_packets()
    }
}
