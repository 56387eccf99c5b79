// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Datagram routing and the connection registry
//!
//! A listener keys the very first Initial packet of a connection by the
//! client-chosen DCID extended with the source address (`icids`); every
//! other packet is keyed by one of our fixed-length local ids (`cids`).
//! Outgoing connections use the `cids` table only, with a CSPRNG-drawn
//! Initial DCID.

use crate::{
    config::Config,
    connection::Connection,
    rx::RxPacket,
    tasklet::Scheduler,
    tls::Session,
};
use quiver_core::{
    connection::{
        id::{ExtendedId, LocalId, LOCAL_LEN},
        ConnectionId,
    },
    endpoint,
    packet::{PacketType, ProtectedHeader},
};
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{debug, trace};

pub struct Endpoint<S: Session, F: FnMut() -> S> {
    config: Config,
    version: u32,
    role: endpoint::Type,
    make_session: F,
    /// First-Initial lookup: client DCID extended by source address
    icids: HashMap<ExtendedId, usize>,
    /// Everything else: our local source connection ids
    cids: HashMap<LocalId, usize>,
    connections: Vec<Option<Connection<S>>>,
    scheduler: Scheduler,
    /// Connections being detached for thread takeover. The only state
    /// two endpoint threads ever share; see [`Self::migrate_out`].
    toremove: std::sync::Mutex<Vec<usize>>,
    rng: SystemRandom,
}

/// A connection detached from its endpoint for thread takeover,
/// together with the registry keys the target must re-seat
pub struct Detached<S: Session> {
    pub connection: Connection<S>,
    pub icids: Vec<ExtendedId>,
    pub cids: Vec<LocalId>,
}

impl<S: Session, F: FnMut() -> S> Endpoint<S, F> {
    /// A listener: accepts connections from unmatched Initial packets
    pub fn new_listener(config: Config, version: u32, make_session: F) -> Self {
        Self::new(config, version, endpoint::Type::Server, make_session)
    }

    /// A connector towards origin servers: never accepts
    pub fn new_connector(config: Config, version: u32, make_session: F) -> Self {
        Self::new(config, version, endpoint::Type::Client, make_session)
    }

    fn new(config: Config, version: u32, role: endpoint::Type, make_session: F) -> Self {
        Self {
            config,
            version,
            role,
            make_session,
            icids: HashMap::new(),
            cids: HashMap::new(),
            connections: Vec::new(),
            scheduler: Scheduler::new(),
            toremove: std::sync::Mutex::new(Vec::new()),
            rng: SystemRandom::new(),
        }
    }

    pub fn connection(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)?.as_mut()
    }

    fn local_id(&self) -> Result<LocalId, ()> {
        let mut bytes = [0u8; LOCAL_LEN];
        self.rng.fill(&mut bytes).map_err(|_| ())?;
        Ok(LocalId::new(bytes))
    }

    fn insert_connection(&mut self, connection: Connection<S>) -> usize {
        if let Some(slot) = self.connections.iter().position(Option::is_none) {
            self.connections[slot] = Some(connection);
            slot
        } else {
            self.connections.push(Some(connection));
            self.connections.len() - 1
        }
    }

    /// Opens an outgoing connection and returns its handle
    pub fn connect(&mut self, tls: S) -> Result<usize, ()> {
        let scid = self.local_id()?;
        let mut dcid_bytes = [0u8; LOCAL_LEN];
        self.rng.fill(&mut dcid_bytes).map_err(|_| ())?;
        let dcid = ConnectionId::try_from_slice(&dcid_bytes).expect("8 bytes fit");

        let connection =
            Connection::new_client(&self.config, self.version, dcid, scid, tls).map_err(|_| ())?;
        let id = self.insert_connection(connection);
        self.cids.insert(scid, id);
        self.scheduler.wake(id);
        Ok(id)
    }

    /// Parses a datagram and routes each coalesced packet
    ///
    //= https://tools.ietf.org/id/draft-ietf-quic-transport-28.txt#12.2
    //# Receivers SHOULD ignore any subsequent packets with a different
    //# Destination Connection ID than the first packet in the datagram.
    pub fn recv_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let mut remaining = datagram;
        let mut first_dcid: Option<ConnectionId> = None;

        while !remaining.is_empty() {
            let (header, consumed) = match ProtectedHeader::parse(remaining, LOCAL_LEN) {
                Ok(parsed) => parsed,
                Err(reason) => {
                    trace!(?reason, "packet dropped");
                    return;
                }
            };
            let packet_bytes = &remaining[..consumed];
            remaining = &remaining[consumed..];

            match first_dcid {
                None => first_dcid = Some(header.dcid),
                Some(first) if first != header.dcid => {
                    trace!("coalesced packet with foreign dcid ignored");
                    continue;
                }
                _ => {}
            }

            self.route_packet(header, packet_bytes, from);
        }
    }

    fn route_packet(&mut self, header: ProtectedHeader, packet_bytes: &[u8], from: SocketAddr) {
        let id = if header.long_header
            && header.packet_type == PacketType::Initial
            && self.role.is_server()
        {
            let extended = ExtendedId::new(header.dcid, from);
            match self.icids.get(&extended) {
                Some(&id) => Some(id),
                None => self.accept(&header, from),
            }
        } else {
            LocalId::try_from_slice(header.dcid.as_slice())
                .and_then(|local| self.cids.get(&local).copied())
        };

        let Some(id) = id else {
            trace!("no connection for packet, dropped");
            return;
        };

        let Ok(packet) = RxPacket::from_header(header, packet_bytes) else {
            trace!("oversized packet dropped");
            return;
        };
        if let Some(connection) = self.connections.get_mut(id).and_then(Option::as_mut) {
            connection.on_rx_packet(packet);
            self.scheduler.wake(id);
        }
    }

    /// Allocates a connection for an unmatched Initial packet
    fn accept(&mut self, header: &ProtectedHeader, from: SocketAddr) -> Option<usize> {
        if header.version != self.version {
            debug!(version = header.version, "unsupported version, packet dropped");
            return None;
        }
        let scid = self.local_id().ok()?;
        let tls = (self.make_session)();
        let connection = Connection::new_server(
            &self.config,
            self.version,
            header.dcid,
            header.scid,
            scid,
            tls,
        )
        .ok()?;

        let id = self.insert_connection(connection);
        self.icids.insert(ExtendedId::new(header.dcid, from), id);
        self.cids.insert(scid, id);
        debug!(id, "connection accepted");
        Some(id)
    }

    /// Runs every woken connection turn and registers freshly issued
    /// connection ids
    pub fn poll(&mut self) {
        // bounded by the queue drained up front: turns that re-wake
        // themselves run again on the next poll
        let mut runnable = Vec::new();
        while let Some(id) = self.scheduler.pop() {
            runnable.push(id);
        }
        for id in runnable {
            let Some(connection) = self.connections.get_mut(id).and_then(Option::as_mut) else {
                continue;
            };
            if connection.take_wake() {
                connection.run();
            }
            for cid in connection.take_fresh_cids() {
                self.cids.insert(cid, id);
            }
            if connection.take_wake() {
                self.scheduler.wake(id);
            }
        }
    }

    /// Drains prepared datagrams of one connection
    pub fn take_datagrams(&mut self, id: usize) -> Vec<Vec<u8>> {
        self.connection(id)
            .map(Connection::take_datagrams)
            .unwrap_or_default()
    }

    /// Detaches a connection for migration to another thread
    ///
    /// Lock order: the source endpoint's `toremove` lock is taken
    /// first, then the registry entries are unseated and the tasklet
    /// dequeued; [`Self::adopt`] on the target re-seats everything.
    /// Nothing else may be shared between endpoint threads.
    pub fn migrate_out(&mut self, id: usize) -> Option<Detached<S>> {
        let mut toremove = self.toremove.lock().expect("takeover lock poisoned");
        toremove.push(id);

        let connection = self.connections.get_mut(id)?.take()?;
        let icids: Vec<ExtendedId> = self
            .icids
            .iter()
            .filter(|(_, conn)| **conn == id)
            .map(|(key, _)| key.clone())
            .collect();
        let cids: Vec<LocalId> = self
            .cids
            .iter()
            .filter(|(_, conn)| **conn == id)
            .map(|(key, _)| *key)
            .collect();
        for key in &icids {
            self.icids.remove(key);
        }
        for key in &cids {
            self.cids.remove(key);
        }
        self.scheduler.forget(id);
        toremove.retain(|queued| *queued != id);
        debug!(id, "connection migrated out");

        Some(Detached {
            connection,
            icids,
            cids,
        })
    }

    /// Re-seats a migrated connection on this endpoint
    pub fn adopt(&mut self, detached: Detached<S>) -> usize {
        let id = self.insert_connection(detached.connection);
        for key in detached.icids {
            self.icids.insert(key, id);
        }
        for key in detached.cids {
            self.cids.insert(key, id);
        }
        self.scheduler.wake(id);
        debug!(id, "connection adopted");
        id
    }

    /// Removes a closed connection from every table
    pub fn release(&mut self, id: usize) {
        if let Some(slot) = self.connections.get_mut(id) {
            *slot = None;
        }
        self.icids.retain(|_, conn| *conn != id);
        self.cids.retain(|_, conn| *conn != id);
        self.scheduler.forget(id);
    }
}
