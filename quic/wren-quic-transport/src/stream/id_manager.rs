// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-direction stream-limit accounting
//!
//! One manager exists per stream type. Outgoing IDs are allocated
//! sequentially against the peer's advertised limit; incoming IDs are
//! validated against the locally advertised limit, with skipped IDs parked
//! in an "available" set until the peer actually uses them.

use std::collections::BTreeSet;
use tracing::debug;
use wren_quic_core::{
    endpoint,
    frame::{MaxStreams, StreamsBlocked},
    stream::{StreamId, StreamType},
    transport,
    varint::VarInt,
};

/// The advertised window is refreshed once fewer than
/// `initial_max / DIVISOR` credits remain
const WINDOW_DIVISOR: u64 = 2;

#[derive(Debug)]
pub struct StreamIdManager {
    perspective: endpoint::Type,
    stream_type: StreamType,

    // outgoing
    outgoing_max_streams: u64,
    outgoing_stream_count: u64,
    next_outgoing_stream_id: Option<StreamId>,

    // incoming
    incoming_actual_max_streams: u64,
    incoming_advertised_max_streams: u64,
    incoming_initial_max_open_streams: u64,
    incoming_stream_count: u64,
    largest_peer_created_stream_id: Option<StreamId>,
    /// IDs implicitly created by a higher ID but not yet seen on the wire
    available_streams: BTreeSet<StreamId>,
}

impl StreamIdManager {
    pub fn new(
        perspective: endpoint::Type,
        stream_type: StreamType,
        incoming_initial_max_open_streams: u64,
    ) -> Self {
        Self {
            perspective,
            stream_type,
            outgoing_max_streams: 0,
            outgoing_stream_count: 0,
            next_outgoing_stream_id: Some(StreamId::initial(perspective, stream_type)),
            incoming_actual_max_streams: incoming_initial_max_open_streams,
            incoming_advertised_max_streams: incoming_initial_max_open_streams,
            incoming_initial_max_open_streams,
            incoming_stream_count: 0,
            largest_peer_created_stream_id: None,
            available_streams: BTreeSet::new(),
        }
    }

    #[inline]
    pub fn outgoing_stream_count(&self) -> u64 {
        self.outgoing_stream_count
    }

    #[inline]
    pub fn outgoing_max_streams(&self) -> u64 {
        self.outgoing_max_streams
    }

    #[inline]
    pub fn incoming_stream_count(&self) -> u64 {
        self.incoming_stream_count
    }

    #[inline]
    pub fn incoming_advertised_max_streams(&self) -> u64 {
        self.incoming_advertised_max_streams
    }

    /// Applies the peer's limit from transport parameters or MAX_STREAMS
    pub fn maybe_allow_more_outgoing_streams(&mut self, max_streams: u64) {
        // MAX_STREAMS frames never reduce an earlier limit
        self.outgoing_max_streams = self.outgoing_max_streams.max(max_streams);
    }

    /// Returns true if a new outgoing stream may be opened now
    pub fn can_open_next_outgoing_stream(&self) -> bool {
        self.outgoing_stream_count < self.outgoing_max_streams
            && self.next_outgoing_stream_id.is_some()
    }

    /// Allocates the next outgoing stream ID
    ///
    /// Returns a STREAMS_BLOCKED frame to transmit when the peer's limit is
    /// the obstacle.
    pub fn get_next_outgoing_stream_id(
        &mut self,
    ) -> Result<StreamId, Option<StreamsBlocked>> {
        if self.outgoing_stream_count >= self.outgoing_max_streams {
            debug!(
                limit = self.outgoing_max_streams,
                "outgoing stream limit reached"
            );
            return Err(Some(StreamsBlocked {
                stream_type: self.stream_type,
                stream_limit: VarInt::new(self.outgoing_max_streams)
                    .expect("limits are validated varints"),
            }));
        }
        let id = self.next_outgoing_stream_id.ok_or(None)?;
        self.next_outgoing_stream_id = id.next_of_type();
        self.outgoing_stream_count += 1;
        Ok(id)
    }

    /// Validates a peer-created stream ID, implicitly opening skipped IDs
    pub fn maybe_increase_largest_peer_stream_id(
        &mut self,
        stream_id: StreamId,
    ) -> Result<(), transport::Error> {
        debug_assert_eq!(stream_id.stream_type(), self.stream_type);

        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.6
        //# Endpoints MUST NOT exceed the limit set by their peer.  An endpoint
        //# that receives a frame with a stream ID exceeding the limit it has
        //# sent MUST treat this as a connection error of type
        //# STREAM_LIMIT_ERROR
        if stream_id.initiator() == self.perspective {
            return Err(transport::Error::PROTOCOL_VIOLATION
                .with_reason("peer used a self-initiated stream id"));
        }

        if self.available_streams.remove(&stream_id) {
            // implicitly created earlier; already counted
            return Ok(());
        }

        if let Some(largest) = self.largest_peer_created_stream_id {
            if stream_id <= largest {
                // already created and possibly closed
                return Ok(());
            }
        }

        let least_new = match self.largest_peer_created_stream_id {
            Some(largest) => largest.next_of_type().ok_or_else(|| {
                transport::Error::STREAM_LIMIT_ERROR.with_reason("stream id space exhausted")
            })?,
            None => StreamId::initial(self.perspective.peer_type(), self.stream_type),
        };

        let delta = stream_id.ordinal() - least_new.ordinal() + 1;
        if self.incoming_stream_count + delta > self.incoming_advertised_max_streams {
            return Err(transport::Error::STREAM_LIMIT_ERROR
                .with_reason("peer exceeded the advertised stream limit"));
        }

        // park every skipped ID so later frames for them are valid
        let mut id = least_new;
        while id < stream_id {
            self.available_streams.insert(id);
            id = match id.next_of_type() {
                Some(next) => next,
                None => break,
            };
        }

        self.incoming_stream_count += delta;
        self.largest_peer_created_stream_id = Some(stream_id);
        Ok(())
    }

    /// Accounts a closed incoming stream, possibly refreshing the window
    pub fn on_stream_closed(&mut self, stream_id: StreamId) -> Option<MaxStreams> {
        if stream_id.initiator() == self.perspective {
            return None;
        }
        self.incoming_stream_count = self.incoming_stream_count.saturating_sub(1);
        self.incoming_actual_max_streams = self
            .incoming_actual_max_streams
            .saturating_add(1)
            .min(wren_quic_core::varint::MAX_VARINT_VALUE);
        self.maybe_send_max_streams_frame()
    }

    /// Advertises a fresh limit once the credit window runs low
    pub fn maybe_send_max_streams_frame(&mut self) -> Option<MaxStreams> {
        let credit = self
            .incoming_advertised_max_streams
            .saturating_sub(self.incoming_stream_count);
        if credit >= self.incoming_initial_max_open_streams / WINDOW_DIVISOR {
            return None;
        }
        self.send_max_streams_frame()
    }

    fn send_max_streams_frame(&mut self) -> Option<MaxStreams> {
        if self.incoming_actual_max_streams <= self.incoming_advertised_max_streams {
            return None;
        }
        self.incoming_advertised_max_streams = self.incoming_actual_max_streams;
        Some(MaxStreams {
            stream_type: self.stream_type,
            maximum_streams: VarInt::new(self.incoming_advertised_max_streams)
                .expect("limits stay within the varint range"),
        })
    }

    /// Handles a STREAMS_BLOCKED frame from the peer
    ///
    /// A fresh MAX_STREAMS is returned when the peer's view of the limit is
    /// stale.
    pub fn on_streams_blocked(
        &mut self,
        frame: &StreamsBlocked,
    ) -> Result<Option<MaxStreams>, transport::Error> {
        let stream_count = frame.stream_limit.as_u64();

        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.14
        //# An endpoint MUST NOT send a STREAMS_BLOCKED frame with a higher
        //# stream limit than was permitted by its peer.
        if stream_count > self.incoming_advertised_max_streams {
            return Err(transport::Error::PROTOCOL_VIOLATION
                .with_reason("streams_blocked above the advertised limit"));
        }

        if stream_count < self.incoming_actual_max_streams {
            // the peer lost our last MAX_STREAMS; resend it
            let previous = self.incoming_advertised_max_streams;
            self.incoming_advertised_max_streams = stream_count;
            let frame = self.send_max_streams_frame();
            if frame.is_none() {
                self.incoming_advertised_max_streams = previous;
            }
            return Ok(frame);
        }

        Ok(None)
    }
}
