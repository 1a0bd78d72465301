// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Handles packets for connections that no longer exist
//!
//! After termination a connection's IDs stay routable for a while: late
//! packets either elicit the saved termination packets, a stateless reset,
//! or nothing, throttled so a storm of stray packets cannot be amplified.
//! Entries are keyed by the canonical connection ID (the first active ID);
//! every other active ID maps back to it through an indirect map.

use crate::endpoint::{PacketWriter, WriteResult};
use bytes::Bytes;
use core::time::Duration;
use hashbrown::HashMap;
use siphasher::sip::SipHasher13;
use std::collections::VecDeque;
use std::hash::BuildHasherDefault;
use std::net::SocketAddr;
use tracing::{debug, trace};
use wren_quic_core::{
    connection::ConnectionId,
    endpoint,
    packet::Framer,
    random,
    stateless_reset,
    time::{Timer, Timestamp, K_GRANULARITY},
};

/// Stray packets are routed on attacker-controlled connection IDs, so the
/// indirect map uses a keyed hasher
type CidHasher = BuildHasherDefault<SipHasher13>;

/// How long terminated connections stay on the list; roughly twice the
/// maximum retransmission timeout
pub const DEFAULT_TIME_WAIT_PERIOD: Duration = Duration::from_secs(200);

/// Bound on packets queued while the writer is blocked
pub const DEFAULT_MAX_PENDING_PACKETS: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeWaitAction {
    /// Replay the saved termination packets for long-header packets and a
    /// stateless reset for short-header ones
    SendTerminationPackets,
    /// Replay the saved CONNECTION_CLOSE packets regardless of header form
    SendConnectionClosePackets,
    SendStatelessReset,
    /// Used only for IETF QUIC draining
    DoNothing,
}

#[derive(Debug)]
struct TimeWaitEntry {
    action: TimeWaitAction,
    termination_packets: Vec<Bytes>,
    active_connection_ids: Vec<ConnectionId>,
    ietf_quic: bool,
    #[allow(dead_code)]
    smoothed_rtt: Duration,
    time_added: Timestamp,
    num_packets_received: u64,
}

struct QueuedPacket {
    bytes: Bytes,
    peer_address: SocketAddr,
}

pub struct TimeWaitListManager {
    /// Entries in insertion order, oldest first, keyed by canonical ID
    entries: VecDeque<(ConnectionId, TimeWaitEntry)>,
    /// Every active ID of every entry points back at its canonical ID
    indirect: HashMap<ConnectionId, ConnectionId, CidHasher>,

    time_wait_period: Duration,
    max_connections: Option<usize>,
    expiration_timer: Timer,

    pending_packets: VecDeque<QueuedPacket>,
    max_pending_packets: usize,
    writer_blocked: bool,

    framer: Framer,
}

impl Default for TimeWaitListManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeWaitListManager {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            indirect: HashMap::default(),
            time_wait_period: DEFAULT_TIME_WAIT_PERIOD,
            max_connections: None,
            expiration_timer: Timer::default(),
            pending_packets: VecDeque::new(),
            max_pending_packets: DEFAULT_MAX_PENDING_PACKETS,
            writer_blocked: false,
            framer: Framer::new(endpoint::Type::Server, 8),
        }
    }

    /// Caps the number of tracked connections; the oldest entries are
    /// evicted beyond it
    pub fn set_max_connections(&mut self, max_connections: usize) {
        self.max_connections = Some(max_connections);
    }

    pub fn set_time_wait_period(&mut self, period: Duration) {
        self.time_wait_period = period;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_connection_id_in_time_wait(&self, connection_id: &ConnectionId) -> bool {
        self.indirect.contains_key(connection_id)
    }

    /// Adds a terminated connection
    ///
    /// The first entry of `active_connection_ids` is the canonical ID.
    /// Re-inserting an ID already on the list preserves its received-packet
    /// counter so the response throttle keeps its position.
    pub fn add_connection_id_to_time_wait(
        &mut self,
        action: TimeWaitAction,
        active_connection_ids: Vec<ConnectionId>,
        termination_packets: Vec<Bytes>,
        ietf_quic: bool,
        smoothed_rtt: Duration,
        now: Timestamp,
    ) {
        let Some(canonical) = active_connection_ids.first().copied() else {
            debug_assert!(false, "an entry needs at least one connection id");
            return;
        };

        let num_packets_received = self
            .remove_entry(&canonical)
            .map(|entry| entry.num_packets_received)
            .unwrap_or(0);

        for connection_id in &active_connection_ids {
            self.indirect.insert(*connection_id, canonical);
        }

        self.entries.push_back((
            canonical,
            TimeWaitEntry {
                action,
                termination_packets,
                active_connection_ids,
                ietf_quic,
                smoothed_rtt,
                time_added: now,
                num_packets_received,
            },
        ));

        if let Some(max) = self.max_connections {
            while self.entries.len() > max {
                self.evict_oldest();
            }
        }

        self.arm_expiration();
    }

    fn remove_entry(&mut self, canonical: &ConnectionId) -> Option<TimeWaitEntry> {
        let index = self.entries.iter().position(|(id, _)| id == canonical)?;
        let (_, entry) = self.entries.remove(index)?;
        for connection_id in &entry.active_connection_ids {
            self.indirect.remove(connection_id);
        }
        Some(entry)
    }

    fn evict_oldest(&mut self) {
        if let Some((canonical, _)) = self.entries.front() {
            let canonical = *canonical;
            self.remove_entry(&canonical);
        }
    }

    /// Handles a packet routed to a terminated connection
    ///
    /// Responses are throttled: only the 1st, 2nd, 4th, 8th, ... packet per
    /// entry elicits one.
    pub fn process_packet<W: PacketWriter>(
        &mut self,
        connection_id: &ConnectionId,
        long_header: bool,
        packet_len: usize,
        peer_address: SocketAddr,
        reset_secret: &stateless_reset::Secret,
        random: &mut dyn random::Generator,
        writer: &mut W,
    ) {
        let Some(canonical) = self.indirect.get(connection_id).copied() else {
            return;
        };
        let Some((_, entry)) = self
            .entries
            .iter_mut()
            .find(|(id, _)| *id == canonical)
        else {
            debug_assert!(false, "indirect map points at a missing entry");
            return;
        };

        entry.num_packets_received += 1;
        if !entry.num_packets_received.is_power_of_two() {
            trace!(
                received = entry.num_packets_received,
                "throttling time-wait response"
            );
            return;
        }

        let action = entry.action;
        let termination_packets: Vec<Bytes> = entry.termination_packets.clone();
        let ietf_quic = entry.ietf_quic;

        match action {
            TimeWaitAction::SendTerminationPackets => {
                if long_header || !ietf_quic {
                    for packet in termination_packets {
                        self.send_or_queue(packet, peer_address, writer);
                    }
                } else {
                    self.send_stateless_reset(
                        connection_id,
                        packet_len,
                        peer_address,
                        reset_secret,
                        random,
                        writer,
                    );
                }
            }
            TimeWaitAction::SendConnectionClosePackets => {
                for packet in termination_packets {
                    self.send_or_queue(packet, peer_address, writer);
                }
            }
            TimeWaitAction::SendStatelessReset => {
                if long_header {
                    // a long-header packet cannot have been routed by a
                    // token holder; nothing useful to say
                    return;
                }
                self.send_stateless_reset(
                    connection_id,
                    packet_len,
                    peer_address,
                    reset_secret,
                    random,
                    writer,
                );
            }
            TimeWaitAction::DoNothing => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn send_stateless_reset<W: PacketWriter>(
        &mut self,
        connection_id: &ConnectionId,
        triggering_packet_len: usize,
        peer_address: SocketAddr,
        reset_secret: &stateless_reset::Secret,
        random: &mut dyn random::Generator,
        writer: &mut W,
    ) {
        let token = reset_secret.token_for(connection_id);
        let mut buffer = [0u8; 1500];
        if let Some(len) =
            self.framer
                .write_stateless_reset(token, triggering_packet_len, random, &mut buffer)
        {
            let bytes = Bytes::copy_from_slice(&buffer[..len]);
            self.send_or_queue(bytes, peer_address, writer);
        }
    }

    fn send_or_queue<W: PacketWriter>(
        &mut self,
        bytes: Bytes,
        peer_address: SocketAddr,
        writer: &mut W,
    ) {
        if self.writer_blocked {
            self.queue_packet(bytes, peer_address);
            return;
        }
        match writer.write_packet(&bytes, peer_address) {
            WriteResult::Ok => {}
            WriteResult::Blocked => {
                self.writer_blocked = true;
                self.queue_packet(bytes, peer_address);
            }
            WriteResult::Error => {
                debug!("dropping time-wait response after writer error");
            }
        }
    }

    fn queue_packet(&mut self, bytes: Bytes, peer_address: SocketAddr) {
        if self.pending_packets.len() >= self.max_pending_packets {
            debug!("time-wait pending queue full, dropping packet");
            return;
        }
        self.pending_packets.push_back(QueuedPacket {
            bytes,
            peer_address,
        });
    }

    /// Drains queued packets after the writer became writable again
    pub fn on_blocked_writer_can_write<W: PacketWriter>(&mut self, writer: &mut W) {
        self.writer_blocked = false;
        while let Some(packet) = self.pending_packets.pop_front() {
            match writer.write_packet(&packet.bytes, packet.peer_address) {
                WriteResult::Ok => {}
                WriteResult::Blocked => {
                    self.writer_blocked = true;
                    self.pending_packets.push_front(packet);
                    return;
                }
                WriteResult::Error => {
                    debug!("dropping queued time-wait packet after writer error");
                }
            }
        }
    }

    #[inline]
    pub fn expiration_deadline(&self) -> Option<Timestamp> {
        self.expiration_timer.deadline()
    }

    /// Trims expired entries in FIFO order
    pub fn poll_expiration(&mut self, now: Timestamp) -> Vec<ConnectionId> {
        if !self.expiration_timer.poll_expiration(now) {
            return Vec::new();
        }

        let mut removed = Vec::new();
        while let Some((canonical, entry)) = self.entries.front() {
            if (entry.time_added + self.time_wait_period).has_elapsed(now) {
                removed.push(*canonical);
                self.evict_oldest();
            } else {
                break;
            }
        }

        self.arm_expiration();
        removed
    }

    fn arm_expiration(&mut self) {
        match self.entries.front() {
            Some((_, entry)) => {
                let deadline = entry.time_added + self.time_wait_period;
                self.expiration_timer.update(deadline, K_GRANULARITY);
            }
            None => self.expiration_timer.cancel(),
        }
    }
}

impl core::fmt::Debug for TimeWaitListManager {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("TimeWaitListManager")
            .field("entries", &self.entries.len())
            .field("pending_packets", &self.pending_packets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wren_quic_core::{random::testing::Generator as TestGenerator, time::testing::now as at};

    #[derive(Debug, Default)]
    struct RecordingWriter {
        sent: Vec<(Bytes, SocketAddr)>,
        blocked: bool,
    }

    impl PacketWriter for RecordingWriter {
        fn write_packet(&mut self, buffer: &[u8], peer_address: SocketAddr) -> WriteResult {
            if self.blocked {
                return WriteResult::Blocked;
            }
            self.sent.push((Bytes::copy_from_slice(buffer), peer_address));
            WriteResult::Ok
        }
    }

    fn cid(value: u8) -> ConnectionId {
        ConnectionId::try_from_bytes(&[value; 8]).unwrap()
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([192, 0, 2, 1], 4433))
    }

    fn manager() -> TimeWaitListManager {
        TimeWaitListManager::new()
    }

    fn secret() -> stateless_reset::Secret {
        stateless_reset::Secret::from_bytes([5; 32])
    }

    fn add(manager: &mut TimeWaitListManager, ids: &[u8], action: TimeWaitAction, now: Timestamp) {
        manager.add_connection_id_to_time_wait(
            action,
            ids.iter().map(|id| cid(*id)).collect(),
            vec![Bytes::from_static(b"termination")],
            true,
            Duration::from_millis(50),
            now,
        );
    }

    #[test]
    fn responses_are_throttled_to_powers_of_two() {
        let mut manager = manager();
        add(
            &mut manager,
            &[1],
            TimeWaitAction::SendConnectionClosePackets,
            at(0),
        );

        let mut writer = RecordingWriter::default();
        let mut random = TestGenerator::default();
        for _ in 0..7 {
            manager.process_packet(&cid(1), false, 100, peer(), &secret(), &mut random, &mut writer);
        }

        // responses at packets 1, 2 and 4 only
        assert_eq!(writer.sent.len(), 3);
    }

    #[test]
    fn every_active_id_routes_to_the_same_entry() {
        let mut manager = manager();
        add(
            &mut manager,
            &[1, 2, 3],
            TimeWaitAction::SendConnectionClosePackets,
            at(0),
        );

        assert!(manager.is_connection_id_in_time_wait(&cid(1)));
        assert!(manager.is_connection_id_in_time_wait(&cid(3)));

        let mut writer = RecordingWriter::default();
        let mut random = TestGenerator::default();
        // the counter is shared across aliases: packets 1 and 2 respond
        manager.process_packet(&cid(2), false, 100, peer(), &secret(), &mut random, &mut writer);
        manager.process_packet(&cid(3), false, 100, peer(), &secret(), &mut random, &mut writer);
        manager.process_packet(&cid(1), false, 100, peer(), &secret(), &mut random, &mut writer);
        assert_eq!(writer.sent.len(), 2);
    }

    #[test]
    fn reinsertion_preserves_the_packet_counter() {
        let mut manager = manager();
        add(
            &mut manager,
            &[1],
            TimeWaitAction::SendConnectionClosePackets,
            at(0),
        );

        let mut writer = RecordingWriter::default();
        let mut random = TestGenerator::default();
        for _ in 0..3 {
            manager.process_packet(&cid(1), false, 100, peer(), &secret(), &mut random, &mut writer);
        }
        assert_eq!(writer.sent.len(), 2);

        // re-adding the same canonical id keeps the counter at 3
        add(
            &mut manager,
            &[1],
            TimeWaitAction::SendConnectionClosePackets,
            at(10),
        );
        assert_eq!(manager.len(), 1);

        manager.process_packet(&cid(1), false, 100, peer(), &secret(), &mut random, &mut writer);
        // packet 4 is a power of two: responds
        assert_eq!(writer.sent.len(), 3);
    }

    #[test]
    fn termination_action_sends_resets_for_short_headers() {
        let mut manager = manager();
        add(
            &mut manager,
            &[1],
            TimeWaitAction::SendTerminationPackets,
            at(0),
        );

        let mut writer = RecordingWriter::default();
        let mut random = TestGenerator::default();

        // long header: replay the termination packet
        manager.process_packet(&cid(1), true, 100, peer(), &secret(), &mut random, &mut writer);
        assert_eq!(&writer.sent[0].0[..], b"termination");

        // short header: a stateless reset instead
        manager.process_packet(&cid(1), false, 100, peer(), &secret(), &mut random, &mut writer);
        let reset = &writer.sent[1].0;
        assert_ne!(&reset[..], b"termination");

        // the reset ends with the token derived from the per-process secret
        let secret = stateless_reset::Secret::from_bytes([5; 32]);
        let expected = secret.token_for(&cid(1));
        let token_start = reset.len() - stateless_reset::TOKEN_LEN;
        let mut token = [0u8; stateless_reset::TOKEN_LEN];
        token.copy_from_slice(&reset[token_start..]);
        assert_eq!(stateless_reset::Token::from(token), expected);
    }

    #[test]
    fn do_nothing_stays_silent() {
        let mut manager = manager();
        add(&mut manager, &[1], TimeWaitAction::DoNothing, at(0));

        let mut writer = RecordingWriter::default();
        let mut random = TestGenerator::default();
        manager.process_packet(&cid(1), false, 100, peer(), &secret(), &mut random, &mut writer);
        assert!(writer.sent.is_empty());
    }

    #[test]
    fn blocked_writer_queues_and_drains_in_order() {
        let mut manager = manager();
        add(
            &mut manager,
            &[1],
            TimeWaitAction::SendConnectionClosePackets,
            at(0),
        );

        let mut writer = RecordingWriter {
            blocked: true,
            ..Default::default()
        };
        let mut random = TestGenerator::default();
        manager.process_packet(&cid(1), false, 100, peer(), &secret(), &mut random, &mut writer);
        assert!(writer.sent.is_empty());

        writer.blocked = false;
        manager.on_blocked_writer_can_write(&mut writer);
        assert_eq!(writer.sent.len(), 1);
        assert_eq!(&writer.sent[0].0[..], b"termination");
    }

    #[test]
    fn expiration_trims_in_fifo_order() {
        let mut manager = manager();
        manager.set_time_wait_period(Duration::from_millis(100));
        add(
            &mut manager,
            &[1],
            TimeWaitAction::SendConnectionClosePackets,
            at(0),
        );
        add(
            &mut manager,
            &[2],
            TimeWaitAction::SendConnectionClosePackets,
            at(80),
        );

        let removed = manager.poll_expiration(at(120));
        assert_eq!(removed, vec![cid(1)]);
        assert!(!manager.is_connection_id_in_time_wait(&cid(1)));
        assert!(manager.is_connection_id_in_time_wait(&cid(2)));
        assert_eq!(manager.expiration_deadline(), Some(at(180)));
    }

    #[test]
    fn connection_cap_evicts_the_oldest() {
        let mut manager = manager();
        manager.set_max_connections(2);
        for id in 1..=3u8 {
            add(
                &mut manager,
                &[id],
                TimeWaitAction::SendStatelessReset,
                at(id as u64),
            );
        }
        assert_eq!(manager.len(), 2);
        assert!(!manager.is_connection_id_in_time_wait(&cid(1)));
        assert!(manager.is_connection_id_in_time_wait(&cid(3)));
    }
}
