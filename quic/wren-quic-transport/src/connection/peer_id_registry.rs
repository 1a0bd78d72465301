// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tracks connection IDs issued by the peer
//!
//! Entries move through three partitions: unused, active (in use by a path)
//! and pending retirement. The registry enforces the advertised
//! active_connection_id_limit and bounds the number of gaps it will tolerate
//! in the peer's sequence numbering.

use smallvec::SmallVec;
use tracing::debug;
use wren_quic_core::{
    connection::ConnectionId,
    frame::{NewConnectionId, RetireConnectionId},
    interval_set::IntervalSet,
    stateless_reset,
    transport,
    varint::VarInt,
};

//= https://www.rfc-editor.org/rfc/rfc9000#section-5.1.1
//# An endpoint SHOULD ensure that its peer has a sufficient number of
//# available and unused connection IDs.
const DEFAULT_ACTIVE_CONNECTION_ID_LIMIT: u64 = 2;

/// The number of gaps tolerated in the peer's sequence-number space before
/// the registry assumes a broken or malicious peer
const MAX_SEQUENCE_NUMBER_GAPS: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    /// Received but not yet used by any path
    Unused,
    /// In use by a path
    InUse,
    /// Queued for retirement; a RETIRE_CONNECTION_ID frame still has to be
    /// delivered
    PendingRetirement,
}

#[derive(Clone, Copy, Debug)]
struct PeerIdEntry {
    connection_id: ConnectionId,
    sequence_number: u64,
    stateless_reset_token: Option<stateless_reset::Token>,
    status: Status,
}

#[derive(Debug)]
pub struct PeerIdRegistry {
    entries: SmallVec<[PeerIdEntry; 4]>,
    /// Sequence numbers observed in NEW_CONNECTION_ID frames
    observed_sequence_numbers: IntervalSet<u64>,
    /// The highest retire_prior_to processed so far
    retire_prior_to: u64,
    active_connection_id_limit: u64,
}

impl PeerIdRegistry {
    /// Creates the registry with the connection ID the peer selected during
    /// the handshake, which implicitly has sequence number 0
    pub fn new(
        initial_connection_id: ConnectionId,
        initial_stateless_reset_token: Option<stateless_reset::Token>,
    ) -> Self {
        let mut registry = Self {
            entries: SmallVec::new(),
            observed_sequence_numbers: IntervalSet::new(),
            retire_prior_to: 0,
            active_connection_id_limit: DEFAULT_ACTIVE_CONNECTION_ID_LIMIT,
        };
        registry.entries.push(PeerIdEntry {
            connection_id: initial_connection_id,
            sequence_number: 0,
            stateless_reset_token: initial_stateless_reset_token,
            status: Status::InUse,
        });
        registry.observed_sequence_numbers.insert_value(0);
        registry
    }

    pub fn set_active_connection_id_limit(&mut self, limit: u64) {
        self.active_connection_id_limit = limit.max(DEFAULT_ACTIVE_CONNECTION_ID_LIMIT);
    }

    /// Processes a NEW_CONNECTION_ID frame
    pub fn on_new_connection_id(
        &mut self,
        frame: &NewConnectionId,
    ) -> Result<(), transport::Error> {
        let sequence_number = frame.sequence_number.as_u64();
        let retire_prior_to = frame.retire_prior_to.as_u64();

        for entry in &self.entries {
            let same_id = entry.connection_id == frame.connection_id;
            let same_seq = entry.sequence_number == sequence_number;
            let same_token =
                entry.stateless_reset_token == Some(frame.stateless_reset_token);

            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
            //# Receipt of the same frame multiple times MUST NOT be treated as
            //# a connection error.
            if same_id && same_seq && same_token {
                // duplicate delivery, process retire_prior_to in case the
                // earlier copy was reordered behind it
                self.process_retire_prior_to(retire_prior_to);
                return Ok(());
            }

            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
            //# If an endpoint receives a NEW_CONNECTION_ID frame that repeats a
            //# previously issued connection ID with a different Stateless Reset
            //# Token field value or a different Sequence Number field value, or
            //# if a sequence number is used for different connection IDs, the
            //# endpoint MAY treat that receipt as a connection error of type
            //# PROTOCOL_VIOLATION.
            if same_id != same_seq || (same_seq && !same_token) {
                return Err(transport::Error::PROTOCOL_VIOLATION
                    .with_reason("connection id reissued inconsistently"));
            }
        }

        self.observed_sequence_numbers.insert_value(sequence_number);
        if self.observed_sequence_numbers.interval_len() > MAX_SEQUENCE_NUMBER_GAPS {
            return Err(transport::Error::PROTOCOL_VIOLATION
                .with_reason("too many connection id sequence number gaps"));
        }

        let status = if sequence_number < self.retire_prior_to.max(retire_prior_to) {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-5.1.2
            //# An endpoint that receives a NEW_CONNECTION_ID frame with a
            //# sequence number smaller than the Retire Prior To field of a
            //# previously received NEW_CONNECTION_ID frame MUST send a
            //# corresponding RETIRE_CONNECTION_ID frame
            Status::PendingRetirement
        } else {
            Status::Unused
        };

        self.entries.push(PeerIdEntry {
            connection_id: frame.connection_id,
            sequence_number,
            stateless_reset_token: Some(frame.stateless_reset_token),
            status,
        });

        self.process_retire_prior_to(retire_prior_to);

        //= https://www.rfc-editor.org/rfc/rfc9000#section-5.1.1
        //# After processing a NEW_CONNECTION_ID frame and adding and retiring
        //# active connection IDs, if the number of active connection IDs
        //# exceeds the value advertised in its active_connection_id_limit
        //# transport parameter, an endpoint MUST close the connection with an
        //# error of type CONNECTION_ID_LIMIT_ERROR.
        let active = self
            .entries
            .iter()
            .filter(|entry| entry.status != Status::PendingRetirement)
            .count() as u64;
        if active > self.active_connection_id_limit {
            return Err(transport::Error::CONNECTION_ID_LIMIT_ERROR
                .with_reason("active connection id limit exceeded"));
        }

        Ok(())
    }

    /// Moves every unused or active entry below the threshold into the
    /// retirement queue
    fn process_retire_prior_to(&mut self, retire_prior_to: u64) {
        if retire_prior_to <= self.retire_prior_to {
            return;
        }
        self.retire_prior_to = retire_prior_to;

        for entry in &mut self.entries {
            if entry.sequence_number < retire_prior_to
                && entry.status != Status::PendingRetirement
            {
                debug!(
                    sequence_number = entry.sequence_number,
                    "peer requested connection id retirement"
                );
                entry.status = Status::PendingRetirement;
            }
        }
    }

    /// Hands out an unused connection ID, marking it in use
    pub fn consume_one_unused_connection_id(
        &mut self,
    ) -> Option<(ConnectionId, Option<stateless_reset::Token>)> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.status == Status::Unused)?;
        entry.status = Status::InUse;
        Some((entry.connection_id, entry.stateless_reset_token))
    }

    /// Queues the retirement of an ID currently in use, e.g. because the
    /// path it served is being abandoned
    pub fn prepare_to_retire_active_connection_id(&mut self, connection_id: &ConnectionId) {
        for entry in &mut self.entries {
            if entry.connection_id == *connection_id && entry.status == Status::InUse {
                entry.status = Status::PendingRetirement;
            }
        }
    }

    /// Drains the retirement queue into RETIRE_CONNECTION_ID frames
    ///
    /// Entries are removed; delivery is the session notifier's concern from
    /// here on.
    pub fn take_retirements(&mut self) -> Vec<RetireConnectionId> {
        let mut frames = Vec::new();
        self.entries.retain(|entry| {
            if entry.status == Status::PendingRetirement {
                frames.push(RetireConnectionId {
                    sequence_number: VarInt::new(entry.sequence_number)
                        .expect("sequence numbers are decoded varints"),
                });
                false
            } else {
                true
            }
        });
        frames.sort_by_key(|frame| frame.sequence_number);
        frames
    }

    /// Returns true if any entry is waiting for a RETIRE_CONNECTION_ID frame
    pub fn has_pending_retirements(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.status == Status::PendingRetirement)
    }

    /// Sequence numbers of the entries currently active or unused
    pub fn active_sequence_numbers(&self) -> Vec<u64> {
        let mut seqs: Vec<u64> = self
            .entries
            .iter()
            .filter(|entry| entry.status != Status::PendingRetirement)
            .map(|entry| entry.sequence_number)
            .collect();
        seqs.sort_unstable();
        seqs
    }

    /// The stateless-reset token associated with an in-use connection ID
    pub fn stateless_reset_token_for(
        &self,
        connection_id: &ConnectionId,
    ) -> Option<stateless_reset::Token> {
        self.entries
            .iter()
            .find(|entry| entry.connection_id == *connection_id)
            .and_then(|entry| entry.stateless_reset_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::try_from_bytes(bytes).unwrap()
    }

    fn token(value: u8) -> stateless_reset::Token {
        stateless_reset::Token::from([value; 16])
    }

    fn new_cid_frame(seq: u64, retire_prior_to: u64, id: &[u8], tok: u8) -> NewConnectionId {
        NewConnectionId {
            sequence_number: VarInt::new(seq).unwrap(),
            retire_prior_to: VarInt::new(retire_prior_to).unwrap(),
            connection_id: cid(id),
            stateless_reset_token: token(tok),
        }
    }

    fn registry() -> PeerIdRegistry {
        PeerIdRegistry::new(cid(&[0xee; 8]), None)
    }

    #[test]
    fn duplicate_frames_are_no_ops() {
        let mut registry = registry();
        let frame = new_cid_frame(1, 0, &[1; 8], 1);
        registry.on_new_connection_id(&frame).unwrap();
        registry.on_new_connection_id(&frame).unwrap();
        assert_eq!(registry.active_sequence_numbers(), vec![0, 1]);
    }

    #[test]
    fn reissued_id_with_new_sequence_is_a_protocol_violation() {
        let mut registry = registry();
        registry
            .on_new_connection_id(&new_cid_frame(1, 0, &[1; 8], 1))
            .unwrap();
        let error = registry
            .on_new_connection_id(&new_cid_frame(2, 0, &[1; 8], 1))
            .unwrap_err();
        assert_eq!(error.code, transport::Error::PROTOCOL_VIOLATION.code);
    }

    #[test]
    fn reused_sequence_with_new_id_or_token_is_a_protocol_violation() {
        let mut registry1 = registry();
        registry1
            .on_new_connection_id(&new_cid_frame(1, 0, &[1; 8], 1))
            .unwrap();

        // same sequence, different id
        let error = registry1
            .on_new_connection_id(&new_cid_frame(1, 0, &[2; 8], 1))
            .unwrap_err();
        assert_eq!(error.code, transport::Error::PROTOCOL_VIOLATION.code);

        // same everything except the token
        let mut registry2 = registry();
        registry2
            .on_new_connection_id(&new_cid_frame(1, 0, &[1; 8], 1))
            .unwrap();
        let error = registry2
            .on_new_connection_id(&new_cid_frame(1, 0, &[1; 8], 9))
            .unwrap_err();
        assert_eq!(error.code, transport::Error::PROTOCOL_VIOLATION.code);
    }

    #[test]
    fn exceeding_the_active_limit_is_an_error() {
        let mut registry = registry();
        registry.set_active_connection_id_limit(2);
        registry
            .on_new_connection_id(&new_cid_frame(1, 0, &[1; 8], 1))
            .unwrap();
        let error = registry
            .on_new_connection_id(&new_cid_frame(2, 0, &[2; 8], 2))
            .unwrap_err();
        assert_eq!(error.code, transport::Error::CONNECTION_ID_LIMIT_ERROR.code);
    }

    #[test]
    fn retire_prior_to_rotates_the_window() {
        let mut registry = registry();
        registry.set_active_connection_id_limit(2);

        registry
            .on_new_connection_id(&new_cid_frame(1, 0, &[1; 8], 1))
            .unwrap();
        registry
            .on_new_connection_id(&new_cid_frame(2, 1, &[2; 8], 2))
            .unwrap();
        registry
            .on_new_connection_id(&new_cid_frame(3, 2, &[3; 8], 3))
            .unwrap();

        // sequence 2 and 3 stay active; 0 and 1 drain to retirement
        assert_eq!(registry.active_sequence_numbers(), vec![2, 3]);
        assert!(registry.has_pending_retirements());

        let retirements = registry.take_retirements();
        let seqs: Vec<u64> = retirements
            .iter()
            .map(|frame| frame.sequence_number.as_u64())
            .collect();
        assert_eq!(seqs, vec![0, 1]);
        assert!(!registry.has_pending_retirements());
    }

    #[test]
    fn late_ids_below_the_threshold_are_retired_immediately() {
        let mut registry = registry();
        registry.set_active_connection_id_limit(4);
        registry
            .on_new_connection_id(&new_cid_frame(5, 5, &[5; 8], 5))
            .unwrap();
        // reordered frame below the active threshold
        registry
            .on_new_connection_id(&new_cid_frame(2, 0, &[2; 8], 2))
            .unwrap();

        let seqs: Vec<u64> = registry
            .take_retirements()
            .iter()
            .map(|frame| frame.sequence_number.as_u64())
            .collect();
        assert_eq!(seqs, vec![0, 2]);
    }

    #[test]
    fn too_many_sequence_gaps_fail_the_connection() {
        let mut registry = registry();
        registry.set_active_connection_id_limit(64);

        let mut result = Ok(());
        for i in 0..32u64 {
            // every other sequence number, creating a fresh gap each time
            let seq = 2 + i * 2;
            result = registry.on_new_connection_id(&new_cid_frame(
                seq,
                0,
                &[i as u8 + 1; 8],
                i as u8 + 1,
            ));
            if result.is_err() {
                break;
            }
        }
        let error = result.unwrap_err();
        assert_eq!(error.code, transport::Error::PROTOCOL_VIOLATION.code);
    }

    #[test]
    fn consume_marks_entries_in_use() {
        let mut registry = registry();
        registry.set_active_connection_id_limit(4);
        registry
            .on_new_connection_id(&new_cid_frame(1, 0, &[1; 8], 1))
            .unwrap();

        let (id, tok) = registry.consume_one_unused_connection_id().unwrap();
        assert_eq!(id, cid(&[1; 8]));
        assert_eq!(tok, Some(token(1)));
        assert!(registry.consume_one_unused_connection_id().is_none());

        registry.prepare_to_retire_active_connection_id(&id);
        assert!(registry.has_pending_retirements());
    }
}
