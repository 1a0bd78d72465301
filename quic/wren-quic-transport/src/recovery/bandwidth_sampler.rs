// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-packet bandwidth sampling for congestion control
//!
//! Every retransmittable packet snapshots the connection totals at send
//! time. When it is acknowledged, the sampler computes an ack rate and a
//! send rate and takes the minimum: data cannot be delivered faster than it
//! was sent, so a faster-looking ack rate is ack compression, not capacity.
//! Samples taken while the sender was application-limited are flagged so
//! the congestion controller does not treat them as a capacity signal.

use crate::recovery::bandwidth::Bandwidth;
use core::time::Duration;
use std::collections::VecDeque;
use tracing::warn;
use wren_quic_core::time::Timestamp;

/// The snapshot of connection state taken when a packet was sent
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendTimeState {
    /// Whether the send state is valid; cleared in samples for which no
    /// packet state was found
    pub is_valid: bool,
    pub is_app_limited: bool,
    pub total_bytes_sent: u64,
    pub total_bytes_acked: u64,
    pub total_bytes_lost: u64,
    pub bytes_in_flight: u64,
}

impl Default for SendTimeState {
    fn default() -> Self {
        Self {
            is_valid: false,
            is_app_limited: false,
            total_bytes_sent: 0,
            total_bytes_acked: 0,
            total_bytes_lost: 0,
            bytes_in_flight: 0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct ConnectionStateOnSentPacket {
    packet_number: u64,
    sent_time: Timestamp,
    size: u64,
    send_time_state: SendTimeState,
    is_neutered: bool,
}

/// The sampler's verdict for one congestion event
#[derive(Clone, Copy, Debug, Default)]
pub struct CongestionEventSample {
    /// The largest bandwidth sample among the acked packets
    pub sample_max_bandwidth: Bandwidth,
    /// The smallest RTT sample among the acked packets
    pub sample_rtt: Option<Duration>,
    /// Send state of the largest acked packet
    pub last_packet_send_state: SendTimeState,
    /// The highest bytes-in-flight snapshot among the acked packets
    pub sample_max_inflight: u64,
    /// Bytes acked beyond what the current bandwidth estimate predicts
    pub extra_acked: u64,
    /// True when the max-bandwidth sample was taken in an app-limited phase
    pub sample_is_app_limited: bool,
}

//= https://www.rfc-editor.org/rfc/rfc9002#section-B.1
//# bytes newly acknowledged beyond the expected amount signal ack
//# aggregation rather than available bandwidth

/// Estimates the degree of ack aggregation on the path
///
/// An aggregation epoch runs while bytes arrive faster than
/// `threshold x bandwidth`; within it, `extra_acked` is the excess of acked
/// bytes over what the bandwidth estimate predicts for the elapsed time.
#[derive(Debug)]
struct MaxAckHeightTracker {
    /// A new epoch starts once the arrival rate drops back below
    /// `threshold x bandwidth`
    ack_aggregation_bandwidth_threshold: f64,
    aggregation_epoch_start_time: Option<Timestamp>,
    aggregation_epoch_bytes: u64,
    max_ack_height: u64,
}

impl Default for MaxAckHeightTracker {
    fn default() -> Self {
        Self {
            ack_aggregation_bandwidth_threshold: 2.0,
            aggregation_epoch_start_time: None,
            aggregation_epoch_bytes: 0,
            max_ack_height: 0,
        }
    }
}

impl MaxAckHeightTracker {
    fn update(
        &mut self,
        bandwidth_estimate: Bandwidth,
        ack_time: Timestamp,
        newly_acked_bytes: u64,
    ) -> u64 {
        let Some(epoch_start) = self.aggregation_epoch_start_time else {
            self.aggregation_epoch_start_time = Some(ack_time);
            self.aggregation_epoch_bytes = newly_acked_bytes;
            return 0;
        };

        let elapsed = ack_time.saturating_duration_since(epoch_start);
        let expected_bytes = bandwidth_estimate
            .scale(self.ack_aggregation_bandwidth_threshold)
            * elapsed;

        // the burst is over; arrival dropped back under the threshold
        if self.aggregation_epoch_bytes <= expected_bytes {
            self.aggregation_epoch_start_time = Some(ack_time);
            self.aggregation_epoch_bytes = newly_acked_bytes;
            return 0;
        }

        self.aggregation_epoch_bytes += newly_acked_bytes;
        let extra = self
            .aggregation_epoch_bytes
            .saturating_sub(bandwidth_estimate * elapsed);
        self.max_ack_height = self.max_ack_height.max(extra);
        extra
    }
}

#[derive(Debug, Default)]
pub struct BandwidthSampler {
    total_bytes_sent: u64,
    total_bytes_acked: u64,
    total_bytes_lost: u64,
    total_bytes_neutered: u64,

    /// In-flight packet state, ascending by packet number
    connection_state_map: VecDeque<ConnectionStateOnSentPacket>,
    last_sent_packet: Option<u64>,

    /// Send time and sent-total of the most recently acked packet; the
    /// baseline for send-rate samples
    last_acked_packet_sent_time: Option<Timestamp>,
    last_acked_packet_total_bytes_sent: u64,

    is_app_limited: bool,
    /// The last packet sent during the app-limited phase; acking past it
    /// ends the phase
    end_of_app_limited_phase: Option<u64>,

    max_ack_height_tracker: MaxAckHeightTracker,
}

impl BandwidthSampler {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent
    }

    #[inline]
    pub fn total_bytes_acked(&self) -> u64 {
        self.total_bytes_acked
    }

    #[inline]
    pub fn total_bytes_lost(&self) -> u64 {
        self.total_bytes_lost
    }

    #[inline]
    pub fn total_bytes_neutered(&self) -> u64 {
        self.total_bytes_neutered
    }

    #[inline]
    pub fn is_app_limited(&self) -> bool {
        self.is_app_limited
    }

    #[inline]
    pub fn tracked_packet_count(&self) -> usize {
        self.connection_state_map.len()
    }

    #[inline]
    pub fn max_ack_height(&self) -> u64 {
        self.max_ack_height_tracker.max_ack_height
    }

    /// Records a sent packet
    ///
    /// Packets without retransmittable data never produce samples and are
    /// not tracked, but still advance `total_bytes_sent`.
    pub fn on_packet_sent(
        &mut self,
        packet_number: u64,
        bytes: u64,
        bytes_in_flight: u64,
        sent_time: Timestamp,
        has_retransmittable_data: bool,
    ) {
        self.total_bytes_sent += bytes;
        self.last_sent_packet = Some(packet_number);

        if !has_retransmittable_data {
            return;
        }

        debug_assert!(
            self.connection_state_map
                .back()
                .map_or(true, |state| state.packet_number < packet_number),
            "packets must be sent in ascending order"
        );

        self.connection_state_map.push_back(ConnectionStateOnSentPacket {
            packet_number,
            sent_time,
            size: bytes,
            send_time_state: SendTimeState {
                is_valid: true,
                is_app_limited: self.is_app_limited,
                total_bytes_sent: self.total_bytes_sent,
                total_bytes_acked: self.total_bytes_acked,
                total_bytes_lost: self.total_bytes_lost,
                bytes_in_flight,
            },
            is_neutered: false,
        });
    }

    /// Marks the path application-limited until everything currently in
    /// flight has been acknowledged
    pub fn on_app_limited(&mut self) {
        self.is_app_limited = true;
        self.end_of_app_limited_phase = self.last_sent_packet;
    }

    /// Excludes a packet from sampling, e.g. after a spurious
    /// retransmission made its timing meaningless
    pub fn on_packet_neutered(&mut self, packet_number: u64) {
        for state in &mut self.connection_state_map {
            if state.packet_number == packet_number && !state.is_neutered {
                state.is_neutered = true;
                self.total_bytes_neutered += state.size;
            }
        }
    }

    /// Processes one congestion event
    ///
    /// `acked_packets` and `lost_packets` carry packet numbers in ascending
    /// order; the current `bandwidth_estimate` feeds the aggregation
    /// tracker.
    pub fn on_congestion_event(
        &mut self,
        ack_time: Timestamp,
        acked_packets: &[u64],
        lost_packets: &[u64],
        bandwidth_estimate: Bandwidth,
    ) -> CongestionEventSample {
        let mut sample = CongestionEventSample::default();
        let mut newly_acked_bytes = 0;

        for packet_number in acked_packets {
            let Some(state) = self.take_packet(*packet_number) else {
                continue;
            };
            if state.is_neutered {
                continue;
            }

            self.total_bytes_acked += state.size;
            newly_acked_bytes += state.size;

            // the app-limited phase ends once a packet sent after it is acked
            if self.is_app_limited
                && self
                    .end_of_app_limited_phase
                    .map_or(true, |end| *packet_number > end)
            {
                self.is_app_limited = false;
            }

            let ack_elapsed = ack_time.saturating_duration_since(state.sent_time);
            let ack_rate = Bandwidth::new(
                self.total_bytes_acked - state.send_time_state.total_bytes_acked,
                ack_elapsed,
            );

            let send_rate = match self.last_acked_packet_sent_time {
                Some(last_sent_time) if state.sent_time > last_sent_time => Bandwidth::new(
                    state.send_time_state.total_bytes_sent
                        - self.last_acked_packet_total_bytes_sent,
                    state.sent_time - last_sent_time,
                ),
                Some(_) => {
                    // sent before the previously acked packet; reordered in
                    // time, the send rate is unknowable
                    Bandwidth::INFINITE
                }
                None => Bandwidth::INFINITE,
            };

            // data cannot arrive faster than it was put on the wire
            let bandwidth = ack_rate.min(send_rate);

            if bandwidth > sample.sample_max_bandwidth {
                sample.sample_max_bandwidth = bandwidth;
                sample.sample_is_app_limited = state.send_time_state.is_app_limited;
            }

            let rtt = ack_time.saturating_duration_since(state.sent_time);
            sample.sample_rtt = Some(match sample.sample_rtt {
                Some(existing) => existing.min(rtt),
                None => rtt,
            });
            sample.sample_max_inflight = sample
                .sample_max_inflight
                .max(state.send_time_state.bytes_in_flight);
            sample.last_packet_send_state = state.send_time_state;

            self.last_acked_packet_sent_time = Some(state.sent_time);
            self.last_acked_packet_total_bytes_sent = state.send_time_state.total_bytes_sent;
        }

        for packet_number in lost_packets {
            let Some(state) = self.take_packet(*packet_number) else {
                continue;
            };
            if state.is_neutered {
                continue;
            }
            self.total_bytes_lost += state.size;
            sample.last_packet_send_state = state.send_time_state;
        }

        if newly_acked_bytes > 0 {
            sample.extra_acked = self.max_ack_height_tracker.update(
                bandwidth_estimate,
                ack_time,
                newly_acked_bytes,
            );
        }

        sample
    }

    /// Releases state for every packet below `threshold`
    ///
    /// Called once a packet can no longer be declared acked or lost, e.g.
    /// after its packet number space was dropped.
    pub fn remove_obsolete_packets(&mut self, threshold: u64) {
        while let Some(state) = self.connection_state_map.front() {
            if state.packet_number >= threshold {
                break;
            }
            self.connection_state_map.pop_front();
        }
    }

    fn take_packet(&mut self, packet_number: u64) -> Option<ConnectionStateOnSentPacket> {
        let index = self
            .connection_state_map
            .iter()
            .position(|state| state.packet_number == packet_number);
        match index {
            Some(index) => self.connection_state_map.remove(index),
            None => {
                warn!(packet_number, "no send state for congestion event");
                None
            }
        }
    }
}
