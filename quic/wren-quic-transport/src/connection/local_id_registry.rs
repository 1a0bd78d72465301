// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tracks connection IDs this endpoint issued to the peer
//!
//! Retirements requested by the peer are not final immediately: packets
//! carrying the old ID may still be in flight, so retired IDs linger for
//! three probe timeouts before their routing entries are released. The
//! deadlines are coalesced onto a single timer.

use core::time::Duration;
use smallvec::SmallVec;
use tracing::debug;
use wren_quic_core::{
    connection::ConnectionId,
    frame::NewConnectionId,
    random,
    stateless_reset,
    time::{Timer, Timestamp, K_GRANULARITY},
    transport,
    varint::VarInt,
};

//= https://www.rfc-editor.org/rfc/rfc9000#section-5.1.1
//# An endpoint MAY also limit the issuance of
//# connection IDs to reduce the amount of per-path state it maintains,
//# such as path validation status, as its peer might interact with it
//# over as many paths as there are issued connection IDs.
const DEFAULT_PEER_ACTIVE_CONNECTION_ID_LIMIT: u64 = 2;

/// Retired IDs the peer can still have in flight are bounded; past this the
/// peer is forcing unbounded state and the connection fails
const MAX_IDS_WAITING_TO_RETIRE: usize = 16;

/// The peer's advertised limit is honored only up to this many concurrently
/// issued IDs; a huge advertisement must not translate into local state
const MAX_ISSUED_IDS: u64 = 8;

/// How long a retired ID keeps routing packets, in probe timeouts
const RETIREMENT_PTO_MULTIPLIER: u32 = 3;

#[derive(Clone, Copy, Debug)]
struct LocalIdEntry {
    connection_id: ConnectionId,
    sequence_number: u64,
}

#[derive(Clone, Copy, Debug)]
struct RetiringEntry {
    connection_id: ConnectionId,
    sequence_number: u64,
    removal_deadline: Timestamp,
}

/// The outcome of processing a RETIRE_CONNECTION_ID frame
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetireOutcome {
    /// The retired ID was the one the current path routes on; the caller
    /// must switch the path to this replacement
    pub path_replacement: Option<ConnectionId>,
    /// Freshly issued IDs to advertise via NEW_CONNECTION_ID frames
    pub new_ids: Vec<NewConnectionId>,
}

#[derive(Debug)]
pub struct LocalIdRegistry {
    connection_id_len: usize,
    active: SmallVec<[LocalIdEntry; 4]>,
    retiring: SmallVec<[RetiringEntry; 4]>,
    retirement_timer: Timer,
    next_sequence_number: u64,
    /// The lowest sequence number the peer is expected to keep using
    retire_prior_to: u64,
    /// The peer's advertised active_connection_id_limit
    peer_active_connection_id_limit: u64,
    /// Set once the preferred-address ID has been issued; voluntary
    /// issuance stays suppressed until the handshake is confirmed
    issued_preferred_address_id: bool,
    handshake_confirmed: bool,
}

impl LocalIdRegistry {
    /// Creates the registry with the ID the handshake established, which
    /// has sequence number 0
    pub fn new(initial_connection_id: ConnectionId) -> Self {
        let connection_id_len = initial_connection_id.len();
        Self {
            connection_id_len,
            active: SmallVec::from_elem(
                LocalIdEntry {
                    connection_id: initial_connection_id,
                    sequence_number: 0,
                },
                1,
            ),
            retiring: SmallVec::new(),
            retirement_timer: Timer::default(),
            next_sequence_number: 1,
            retire_prior_to: 0,
            peer_active_connection_id_limit: DEFAULT_PEER_ACTIVE_CONNECTION_ID_LIMIT,
            issued_preferred_address_id: false,
            handshake_confirmed: false,
        }
    }

    pub fn set_peer_active_connection_id_limit(&mut self, limit: u64) {
        self.peer_active_connection_id_limit =
            limit.max(DEFAULT_PEER_ACTIVE_CONNECTION_ID_LIMIT);
    }

    pub fn on_handshake_confirmed(&mut self) {
        self.handshake_confirmed = true;
    }

    /// Issues the connection ID carried in the preferred_address transport
    /// parameter; it has sequence number 1 and may be issued once
    pub fn issue_preferred_address_id(
        &mut self,
        random: &mut dyn random::Generator,
        secret: &stateless_reset::Secret,
    ) -> Option<(ConnectionId, stateless_reset::Token)> {
        if self.issued_preferred_address_id || self.next_sequence_number != 1 {
            return None;
        }
        self.issued_preferred_address_id = true;

        let connection_id = self.generate_id(random);
        let token = secret.token_for(&connection_id);
        self.active.push(LocalIdEntry {
            connection_id,
            sequence_number: self.next_sequence_number,
        });
        self.next_sequence_number += 1;
        Some((connection_id, token))
    }

    /// Issues new IDs until the peer's advertised limit is filled
    ///
    /// Voluntary issuance is suppressed between the preferred-address ID and
    /// handshake confirmation so the peer is not flooded with IDs it cannot
    /// yet validate.
    pub fn maybe_issue_new_ids(
        &mut self,
        random: &mut dyn random::Generator,
        secret: &stateless_reset::Secret,
    ) -> Vec<NewConnectionId> {
        if self.issued_preferred_address_id && !self.handshake_confirmed {
            return Vec::new();
        }

        let target = self.peer_active_connection_id_limit.min(MAX_ISSUED_IDS);
        let mut frames = Vec::new();
        while (self.active.len() as u64) < target {
            frames.push(self.issue_one(random, secret));
        }
        frames
    }

    fn issue_one(
        &mut self,
        random: &mut dyn random::Generator,
        secret: &stateless_reset::Secret,
    ) -> NewConnectionId {
        let connection_id = self.generate_id(random);
        let sequence_number = self.next_sequence_number;
        self.next_sequence_number += 1;
        self.active.push(LocalIdEntry {
            connection_id,
            sequence_number,
        });

        NewConnectionId {
            sequence_number: VarInt::new(sequence_number)
                .expect("sequence numbers stay within the varint range"),
            retire_prior_to: VarInt::new(self.retire_prior_to)
                .expect("retire_prior_to stays within the varint range"),
            connection_id,
            stateless_reset_token: secret.token_for(&connection_id),
        }
    }

    fn generate_id(&self, random: &mut dyn random::Generator) -> ConnectionId {
        let mut bytes = [0u8; wren_quic_core::connection::id::MAX_LEN];
        let len = self.connection_id_len.max(4);
        random.public_random_fill(&mut bytes[..len]);
        ConnectionId::try_from_bytes(&bytes[..len]).expect("length is bounded")
    }

    /// Processes a RETIRE_CONNECTION_ID frame
    ///
    /// `current_path_id` is the ID the peer's packets currently route on;
    /// retiring it forces a replacement.
    pub fn on_retire_connection_id(
        &mut self,
        sequence_number: u64,
        current_path_id: &ConnectionId,
        now: Timestamp,
        pto: Duration,
        random: &mut dyn random::Generator,
        secret: &stateless_reset::Secret,
    ) -> Result<RetireOutcome, transport::Error> {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.16
        //# Receipt of a RETIRE_CONNECTION_ID frame containing a sequence
        //# number greater than any previously sent to the peer MUST be
        //# treated as a connection error of type PROTOCOL_VIOLATION.
        if sequence_number >= self.next_sequence_number {
            return Err(transport::Error::PROTOCOL_VIOLATION
                .with_reason("retirement of an unissued connection id"));
        }

        let Some(index) = self
            .active
            .iter()
            .position(|entry| entry.sequence_number == sequence_number)
        else {
            // already retired; repeated retirement is a no-op
            return Ok(RetireOutcome::default());
        };

        let entry = self.active.remove(index);
        debug!(
            sequence_number,
            "peer retired connection id, releasing in {} ptos", RETIREMENT_PTO_MULTIPLIER
        );

        let removal_deadline = now + pto * RETIREMENT_PTO_MULTIPLIER;
        self.retiring.push(RetiringEntry {
            connection_id: entry.connection_id,
            sequence_number: entry.sequence_number,
            removal_deadline,
        });
        self.retirement_timer.update(removal_deadline, K_GRANULARITY);

        if self.retiring.len() > MAX_IDS_WAITING_TO_RETIRE {
            return Err(transport::Error::TOO_MANY_CONNECTION_ID_WAITING_TO_RETIRE
                .with_reason("peer retired connection ids faster than they drain"));
        }

        self.retire_prior_to = self.retire_prior_to.max(sequence_number + 1);

        let mut outcome = RetireOutcome::default();

        // the peer must never be left routing on a retired ID
        if entry.connection_id == *current_path_id {
            let replacement = match self.active.first() {
                Some(active) => active.connection_id,
                None => {
                    let frame = self.issue_one(random, secret);
                    let id = frame.connection_id;
                    outcome.new_ids.push(frame);
                    id
                }
            };
            outcome.path_replacement = Some(replacement);
        }

        outcome
            .new_ids
            .extend(self.maybe_issue_new_ids(random, secret));

        Ok(outcome)
    }

    /// Releases entries whose linger period expired; returns the released
    /// IDs so the dispatcher can drop their routing entries
    pub fn poll_retirements(&mut self, now: Timestamp) -> Vec<ConnectionId> {
        if !self.retirement_timer.poll_expiration(now) {
            return Vec::new();
        }

        let mut released = Vec::new();
        self.retiring.retain(|entry| {
            if entry.removal_deadline.has_elapsed(now) {
                released.push(entry.connection_id);
                false
            } else {
                true
            }
        });

        // re-arm for the next pending deadline
        if let Some(next) = self
            .retiring
            .iter()
            .map(|entry| entry.removal_deadline)
            .min()
        {
            self.retirement_timer.set(next);
        }

        released
    }

    #[inline]
    pub fn retirement_deadline(&self) -> Option<Timestamp> {
        self.retirement_timer.deadline()
    }

    /// Every ID that still routes to this connection, active and lingering
    pub fn routing_ids(&self) -> Vec<ConnectionId> {
        self.active
            .iter()
            .map(|entry| entry.connection_id)
            .chain(self.retiring.iter().map(|entry| entry.connection_id))
            .collect()
    }

    pub fn active_ids(&self) -> Vec<ConnectionId> {
        self.active.iter().map(|entry| entry.connection_id).collect()
    }

    #[inline]
    pub fn ids_waiting_to_retire(&self) -> usize {
        self.retiring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wren_quic_core::{random::testing::Generator as TestGenerator, time::testing::now as at};

    const PTO: Duration = Duration::from_millis(100);

    fn secret() -> stateless_reset::Secret {
        stateless_reset::Secret::from_bytes([9; 32])
    }

    fn registry() -> (LocalIdRegistry, TestGenerator) {
        let registry = LocalIdRegistry::new(ConnectionId::try_from_bytes(&[7; 8]).unwrap());
        (registry, TestGenerator::default())
    }

    #[test]
    fn issues_up_to_the_peer_limit() {
        let (mut registry, mut random) = registry();
        registry.set_peer_active_connection_id_limit(3);

        let frames = registry.maybe_issue_new_ids(&mut random, &secret());
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].sequence_number.as_u64(), 1);
        assert_eq!(frames[1].sequence_number.as_u64(), 2);
        assert_eq!(registry.active_ids().len(), 3);

        // tokens are derived from the per-process secret
        for frame in &frames {
            assert_eq!(
                frame.stateless_reset_token,
                secret().token_for(&frame.connection_id)
            );
        }
    }

    #[test]
    fn retiring_an_unissued_sequence_is_a_protocol_violation() {
        let (mut registry, mut random) = registry();
        let current = registry.active_ids()[0];
        let error = registry
            .on_retire_connection_id(5, &current, at(0), PTO, &mut random, &secret())
            .unwrap_err();
        assert_eq!(error.code, transport::Error::PROTOCOL_VIOLATION.code);
    }

    #[test]
    fn repeated_retirement_is_a_no_op() {
        let (mut registry, mut random) = registry();
        registry.set_peer_active_connection_id_limit(2);
        registry.maybe_issue_new_ids(&mut random, &secret());

        let current = registry.active_ids()[1];
        let outcome = registry
            .on_retire_connection_id(0, &current, at(0), PTO, &mut random, &secret())
            .unwrap();
        assert!(outcome.path_replacement.is_none());

        let outcome = registry
            .on_retire_connection_id(0, &current, at(1), PTO, &mut random, &secret())
            .unwrap();
        assert_eq!(outcome, RetireOutcome::default());
    }

    #[test]
    fn retiring_the_current_path_id_forces_a_replacement() {
        let (mut registry, mut random) = registry();
        let current = registry.active_ids()[0];

        let outcome = registry
            .on_retire_connection_id(0, &current, at(0), PTO, &mut random, &secret())
            .unwrap();

        let replacement = outcome.path_replacement.unwrap();
        assert_ne!(replacement, current);
        assert!(registry.active_ids().contains(&replacement));
        // replacements advance retire_prior_to past the retired id
        assert!(outcome
            .new_ids
            .iter()
            .all(|frame| frame.retire_prior_to.as_u64() == 1));
    }

    #[test]
    fn retired_ids_linger_for_three_ptos() {
        let (mut registry, mut random) = registry();
        registry.set_peer_active_connection_id_limit(2);
        registry.maybe_issue_new_ids(&mut random, &secret());
        let current = registry.active_ids()[1];

        let retired = registry.active_ids()[0];
        registry
            .on_retire_connection_id(0, &current, at(0), PTO, &mut random, &secret())
            .unwrap();

        // still routable during the linger period
        assert!(registry.routing_ids().contains(&retired));
        assert_eq!(registry.retirement_deadline(), Some(at(300)));

        assert!(registry.poll_retirements(at(200)).is_empty());
        let released = registry.poll_retirements(at(301));
        assert_eq!(released, vec![retired]);
        assert!(!registry.routing_ids().contains(&retired));
    }

    #[test]
    fn unbounded_retirement_pressure_fails_the_connection() {
        let (mut registry, mut random) = registry();
        registry.set_peer_active_connection_id_limit(2);
        let current = registry.active_ids()[0];

        let mut result = Ok(RetireOutcome::default());
        for seq in 0.. {
            result = registry.on_retire_connection_id(
                seq,
                &current,
                at(0),
                PTO,
                &mut random,
                &secret(),
            );
            if result.is_err() {
                break;
            }
        }
        let error = result.unwrap_err();
        assert_eq!(
            error.code,
            transport::Error::TOO_MANY_CONNECTION_ID_WAITING_TO_RETIRE.code
        );
    }

    #[test]
    fn preferred_address_id_suppresses_issuance_until_confirmation() {
        let (mut registry, mut random) = registry();
        registry.set_peer_active_connection_id_limit(4);

        let issued = registry.issue_preferred_address_id(&mut random, &secret());
        assert!(issued.is_some());
        // only once
        assert!(registry
            .issue_preferred_address_id(&mut random, &secret())
            .is_none());

        // voluntary issuance held back until the handshake confirms
        assert!(registry.maybe_issue_new_ids(&mut random, &secret()).is_empty());

        registry.on_handshake_confirmed();
        let frames = registry.maybe_issue_new_ids(&mut random, &secret());
        assert_eq!(frames.len(), 2);
    }
}
