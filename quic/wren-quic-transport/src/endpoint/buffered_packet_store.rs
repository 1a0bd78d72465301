// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Holds packets for connections that do not exist yet
//!
//! A client's first flight can arrive out of order: 0-RTT and coalesced
//! packets may land before the Initial carrying the CHLO, and the CHLO
//! itself may arrive before the dispatcher creates the session. The store
//! parks those packets per connection ID, bounded in every dimension, until
//! either the CHLO shows up or the entry expires.

use bytes::Bytes;
use core::time::Duration;
use std::collections::VecDeque;
use std::net::SocketAddr;
use tracing::debug;
use wren_quic_core::{
    connection::ConnectionId,
    time::{Timer, Timestamp, K_GRANULARITY},
};

/// Store-wide cap on buffered connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Of which at most this many may still lack a CHLO
pub const DEFAULT_MAX_CONNECTIONS_WITHOUT_CHLO: usize = 50;

/// Per-connection cap on packets buffered before the CHLO arrives
pub const DEFAULT_MAX_UNDECRYPTABLE_PACKETS: usize = 32;

/// How long an entry may wait for its CHLO
pub const DEFAULT_CONNECTION_LIFE_SPAN: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueResult {
    Success,
    /// The per-connection undecryptable-packet cap was hit
    TooManyPackets,
    /// The store-wide connection caps were hit
    TooManyConnections,
}

#[derive(Clone, Debug)]
pub struct BufferedPacket {
    pub bytes: Bytes,
    pub self_address: SocketAddr,
    pub peer_address: SocketAddr,
    pub receipt_time: Timestamp,
    pub is_chlo: bool,
}

#[derive(Debug)]
pub struct BufferedPacketList {
    pub packets: VecDeque<BufferedPacket>,
    pub creation_time: Timestamp,
    pub has_chlo: bool,
    /// The client's parsed CHLO payload, once it arrived
    pub parsed_chlo: Option<Bytes>,
    pub version: u32,
}

#[derive(Debug)]
pub struct BufferedPacketStore {
    /// Entries in creation order, oldest first
    connections: VecDeque<(ConnectionId, BufferedPacketList)>,
    connections_with_chlo: usize,
    max_connections: usize,
    max_connections_without_chlo: usize,
    max_undecryptable_packets: usize,
    connection_life_span: Duration,
    expiration_timer: Timer,
}

impl Default for BufferedPacketStore {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_CONNECTIONS,
            DEFAULT_MAX_CONNECTIONS_WITHOUT_CHLO,
            DEFAULT_MAX_UNDECRYPTABLE_PACKETS,
        )
    }
}

impl BufferedPacketStore {
    pub fn new(
        max_connections: usize,
        max_connections_without_chlo: usize,
        max_undecryptable_packets: usize,
    ) -> Self {
        Self {
            connections: VecDeque::new(),
            connections_with_chlo: 0,
            max_connections,
            max_connections_without_chlo,
            max_undecryptable_packets,
            connection_life_span: DEFAULT_CONNECTION_LIFE_SPAN,
            expiration_timer: Timer::default(),
        }
    }

    #[inline]
    pub fn has_buffered_packets(&self, connection_id: &ConnectionId) -> bool {
        self.connections.iter().any(|(id, _)| id == connection_id)
    }

    #[inline]
    pub fn has_chlos_buffered(&self) -> bool {
        self.connections_with_chlo > 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Buffers one packet for a pending connection
    ///
    /// `parsed_chlo` carries the client hello when the dispatcher's
    /// extractor recognized one in this packet.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_packet(
        &mut self,
        connection_id: ConnectionId,
        bytes: Bytes,
        self_address: SocketAddr,
        peer_address: SocketAddr,
        receipt_time: Timestamp,
        version: u32,
        parsed_chlo: Option<Bytes>,
    ) -> EnqueueResult {
        let is_chlo = parsed_chlo.is_some();
        let existing = self
            .connections
            .iter_mut()
            .position(|(id, _)| *id == connection_id);

        let index = match existing {
            Some(index) => index,
            None => {
                let without_chlo = self.connections.len() - self.connections_with_chlo;
                let exceeded = if is_chlo {
                    self.connections.len() >= self.max_connections
                } else {
                    // non-CHLO connections also burn the global budget
                    self.connections.len() >= self.max_connections
                        || without_chlo >= self.max_connections_without_chlo
                };
                if exceeded {
                    debug!(
                        connections = self.connections.len(),
                        "buffered packet store is full"
                    );
                    return EnqueueResult::TooManyConnections;
                }

                self.connections.push_back((
                    connection_id,
                    BufferedPacketList {
                        packets: VecDeque::new(),
                        creation_time: receipt_time,
                        has_chlo: false,
                        parsed_chlo: None,
                        version,
                    },
                ));
                self.arm_expiration();
                self.connections.len() - 1
            }
        };

        let list = &mut self.connections[index].1;

        if !is_chlo {
            let undecryptable = list.packets.iter().filter(|packet| !packet.is_chlo).count();
            if undecryptable >= self.max_undecryptable_packets {
                return EnqueueResult::TooManyPackets;
            }
        }

        let packet = BufferedPacket {
            bytes,
            self_address,
            peer_address,
            receipt_time,
            is_chlo,
        };

        if is_chlo {
            // the CHLO must come out first when the session is created
            list.packets.push_front(packet);
            if !list.has_chlo {
                list.has_chlo = true;
                list.parsed_chlo = parsed_chlo;
                self.connections_with_chlo += 1;
            }
        } else {
            list.packets.push_back(packet);
        }

        EnqueueResult::Success
    }

    /// Removes and returns the buffered packets for a known connection
    pub fn deliver_packets(&mut self, connection_id: &ConnectionId) -> Option<BufferedPacketList> {
        let index = self
            .connections
            .iter()
            .position(|(id, _)| id == connection_id)?;
        let (_, list) = self.connections.remove(index)?;
        if list.has_chlo {
            self.connections_with_chlo -= 1;
        }
        Some(list)
    }

    /// Removes and returns the oldest CHLO-bearing entry, with its CHLO
    /// packets moved to the front
    pub fn deliver_packets_for_next_connection(
        &mut self,
    ) -> Option<(ConnectionId, BufferedPacketList)> {
        let index = self.connections.iter().position(|(_, list)| list.has_chlo)?;
        let (connection_id, mut list) = self.connections.remove(index)?;
        self.connections_with_chlo -= 1;

        // stable partition: CHLO packets first, everything else after
        let (chlo, rest): (Vec<_>, Vec<_>) =
            list.packets.drain(..).partition(|packet| packet.is_chlo);
        list.packets = chlo.into_iter().chain(rest).collect();

        Some((connection_id, list))
    }

    /// Discards a pending connection without delivering it
    pub fn discard_packets(&mut self, connection_id: &ConnectionId) {
        self.deliver_packets(connection_id);
    }

    #[inline]
    pub fn expiration_deadline(&self) -> Option<Timestamp> {
        self.expiration_timer.deadline()
    }

    /// Evicts every entry older than the life span; returns the evicted IDs
    pub fn poll_expiration(&mut self, now: Timestamp) -> Vec<ConnectionId> {
        if !self.expiration_timer.poll_expiration(now) {
            return Vec::new();
        }

        let mut expired = Vec::new();
        while let Some((connection_id, list)) = self.connections.front() {
            if (list.creation_time + self.connection_life_span).has_elapsed(now) {
                expired.push(*connection_id);
                if list.has_chlo {
                    self.connections_with_chlo -= 1;
                }
                self.connections.pop_front();
            } else {
                break;
            }
        }

        self.arm_expiration();
        expired
    }

    fn arm_expiration(&mut self) {
        match self.connections.front() {
            Some((_, list)) => {
                let deadline = list.creation_time + self.connection_life_span;
                self.expiration_timer.update(deadline, K_GRANULARITY);
            }
            None => self.expiration_timer.cancel(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wren_quic_core::time::testing::now as at;

    fn cid(value: u8) -> ConnectionId {
        ConnectionId::try_from_bytes(&[value; 8]).unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn enqueue(
        store: &mut BufferedPacketStore,
        id: u8,
        time: Timestamp,
        chlo: bool,
    ) -> EnqueueResult {
        store.enqueue_packet(
            cid(id),
            Bytes::from_static(b"packet"),
            addr(443),
            addr(1234),
            time,
            1,
            chlo.then(|| Bytes::from_static(b"chlo")),
        )
    }

    #[test]
    fn chlo_packets_are_delivered_first() {
        let mut store = BufferedPacketStore::default();

        // two 0-RTT packets land before the CHLO
        enqueue(&mut store, 1, at(0), false);
        enqueue(&mut store, 1, at(1), false);
        enqueue(&mut store, 1, at(2), true);

        let (id, list) = store.deliver_packets_for_next_connection().unwrap();
        assert_eq!(id, cid(1));
        assert!(list.has_chlo);
        assert_eq!(list.parsed_chlo.as_deref(), Some(&b"chlo"[..]));
        assert_eq!(list.packets.len(), 3);
        assert!(list.packets[0].is_chlo);
        assert!(!list.packets[1].is_chlo);
    }

    #[test]
    fn per_connection_undecryptable_cap() {
        let mut store = BufferedPacketStore::new(100, 50, 2);
        assert_eq!(enqueue(&mut store, 1, at(0), false), EnqueueResult::Success);
        assert_eq!(enqueue(&mut store, 1, at(1), false), EnqueueResult::Success);
        assert_eq!(
            enqueue(&mut store, 1, at(2), false),
            EnqueueResult::TooManyPackets
        );
        // a CHLO is still accepted for the same connection
        assert_eq!(enqueue(&mut store, 1, at(3), true), EnqueueResult::Success);
    }

    #[test]
    fn store_wide_connection_caps() {
        let mut store = BufferedPacketStore::new(100, 50, 32);

        // 50 connections with one non-CHLO packet each
        for id in 0..50u8 {
            assert_eq!(enqueue(&mut store, id, at(0), false), EnqueueResult::Success);
        }
        // the 51st without a CHLO is dropped
        assert_eq!(
            enqueue(&mut store, 50, at(1), false),
            EnqueueResult::TooManyConnections
        );

        // but a CHLO for an existing connection is accepted and delivered
        // with the CHLO at the head
        assert_eq!(enqueue(&mut store, 7, at(2), true), EnqueueResult::Success);
        let (id, list) = store.deliver_packets_for_next_connection().unwrap();
        assert_eq!(id, cid(7));
        assert!(list.packets[0].is_chlo);
    }

    #[test]
    fn total_connection_cap_applies_to_chlos_too() {
        let mut store = BufferedPacketStore::new(3, 2, 32);
        for id in 0..3u8 {
            assert_eq!(enqueue(&mut store, id, at(0), true), EnqueueResult::Success);
        }
        assert_eq!(
            enqueue(&mut store, 3, at(1), true),
            EnqueueResult::TooManyConnections
        );
    }

    #[test]
    fn expiration_evicts_strictly_older_entries() {
        let mut store = BufferedPacketStore::default();
        enqueue(&mut store, 1, at(0), false);
        enqueue(&mut store, 2, at(1500), true);

        let deadline = store.expiration_deadline().unwrap();
        assert_eq!(deadline, at(0) + DEFAULT_CONNECTION_LIFE_SPAN);

        let expired = store.poll_expiration(at(2001));
        assert_eq!(expired, vec![cid(1)]);
        assert!(store.has_buffered_packets(&cid(2)));
        assert!(store.has_chlos_buffered());

        // the timer re-arms for the survivor
        assert_eq!(
            store.expiration_deadline(),
            Some(at(1500) + DEFAULT_CONNECTION_LIFE_SPAN)
        );
    }

    #[test]
    fn delivery_removes_the_entry() {
        let mut store = BufferedPacketStore::default();
        enqueue(&mut store, 1, at(0), true);
        assert!(store.deliver_packets(&cid(1)).is_some());
        assert!(store.deliver_packets(&cid(1)).is_none());
        assert!(store.is_empty());
        assert!(!store.has_chlos_buffered());
    }
}
