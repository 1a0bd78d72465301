// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tracks received packet numbers and decides when to acknowledge them
//!
//! One manager exists per packet number space. Received packet numbers live
//! in a coalescing interval set; the delayed-ACK policy implements TCP-style
//! acking, ACK decimation and decimation with reordering tolerance.

use core::time::Duration;
use tracing::warn;
use wren_quic_core::{
    ack::{AckMode, Settings},
    frame::ack::AckRangesVec,
    interval_set::IntervalSet,
    packet::number::{PacketNumber, PacketNumberSpace},
    time::{Timer, Timestamp, K_GRANULARITY},
    varint::VarInt,
};

/// The ACK frame the manager is prepared to send
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingAckFrame {
    pub largest_acked: PacketNumber,
    pub ack_delay: Duration,
    /// Acknowledged ranges, ready for encoding in descending order
    pub ranges: AckRangesVec,
    /// Receipt times, present only when timestamp collection is enabled
    pub received_packet_times: Vec<(PacketNumber, Timestamp)>,
}

#[derive(Debug)]
pub struct ReceivedPacketManager {
    settings: Settings,
    space: PacketNumberSpace,

    /// Every packet number recorded and not yet trimmed
    packets: IntervalSet<VarInt>,
    /// Packets below this are no longer awaited; the peer has seen our ACK
    /// covering them
    peer_least_packet_awaiting_ack: Option<PacketNumber>,
    /// Set when the pending ACK frame changed since it was last emitted
    ack_frame_updated: bool,

    largest_observed: Option<PacketNumber>,
    time_largest_observed: Option<Timestamp>,
    least_received_packet_number: Option<PacketNumber>,

    received_packet_times: Vec<(PacketNumber, Timestamp)>,
    time_of_previous_received_packet: Option<Timestamp>,

    /// Number of packets which arrived below the largest observed
    packets_reordered: u64,
    /// Packets rejected because they were no longer awaited
    packets_dropped: u64,

    ack_timeout: Timer,
    retransmittable_since_last_ack: u64,
    last_sent_largest_acked: Option<PacketNumber>,
    /// The last recorded packet opened a new gap below itself
    was_last_packet_missing: bool,
}

impl ReceivedPacketManager {
    pub fn new(settings: Settings, space: PacketNumberSpace) -> Self {
        Self {
            settings,
            space,
            packets: IntervalSet::new(),
            peer_least_packet_awaiting_ack: None,
            ack_frame_updated: false,
            largest_observed: None,
            time_largest_observed: None,
            least_received_packet_number: None,
            received_packet_times: Vec::new(),
            time_of_previous_received_packet: None,
            packets_reordered: 0,
            packets_dropped: 0,
            ack_timeout: Timer::default(),
            retransmittable_since_last_ack: 0,
            last_sent_largest_acked: None,
            was_last_packet_missing: false,
        }
    }

    /// Returns true if the packet number has not been seen and is still of
    /// interest
    pub fn is_awaiting_packet(&self, packet_number: PacketNumber) -> bool {
        if let Some(least) = self.peer_least_packet_awaiting_ack {
            if packet_number < least {
                return false;
            }
        }
        !self.packets.contains(&packet_number.as_varint())
    }

    /// Records a received packet; returns false if the packet was dropped
    pub fn record_packet_received(
        &mut self,
        packet_number: PacketNumber,
        receipt_time: Timestamp,
    ) -> bool {
        if !self.is_awaiting_packet(packet_number) {
            self.packets_dropped += 1;
            return false;
        }

        if !self.ack_frame_updated {
            // the previous flight was emitted; its timestamps are stale
            self.received_packet_times.clear();
        }
        self.ack_frame_updated = true;

        self.was_last_packet_missing = false;
        match self.largest_observed {
            Some(largest) if packet_number < largest => {
                self.packets_reordered += 1;
            }
            Some(largest) => {
                if packet_number.as_u64() > largest.as_u64() + 1 {
                    self.was_last_packet_missing = true;
                }
                self.largest_observed = Some(packet_number);
                self.time_largest_observed = Some(receipt_time);
            }
            None => {
                self.largest_observed = Some(packet_number);
                self.time_largest_observed = Some(receipt_time);
            }
        }

        self.packets.insert_value(packet_number.as_varint());

        if self.settings.save_timestamps {
            // reject backward time movement instead of clamping; a sample
            // from a stepped host clock is worse than no sample
            if self
                .time_of_previous_received_packet
                .map_or(false, |previous| receipt_time < previous)
            {
                warn!(
                    packet_number = packet_number.as_u64(),
                    "receipt time moved backwards, dropping timestamp"
                );
            } else {
                self.received_packet_times.push((packet_number, receipt_time));
            }
        }
        self.time_of_previous_received_packet = Some(receipt_time);

        self.least_received_packet_number = Some(match self.least_received_packet_number {
            Some(least) => least.min(packet_number),
            None => packet_number,
        });

        true
    }

    /// Produces the ACK frame for the current state
    pub fn get_updated_ack_frame(&mut self, now: Timestamp) -> Option<PendingAckFrame> {
        let largest_acked = self.largest_observed?;
        let time_largest_observed = self.time_largest_observed?;

        let ack_delay = now.saturating_duration_since(time_largest_observed);

        //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.3
        //# A receiver limits the number of ACK Ranges it remembers and sends
        //# in ACK frames, both to limit the size of ACK frames and to avoid
        //# resource exhaustion.
        while self.packets.interval_len() > self.settings.ack_ranges_limit {
            if let Some(dropped) = self.packets.pop_min() {
                let next = self
                    .space
                    .new_packet_number(dropped.end)
                    .next()
                    .unwrap_or(largest_acked);
                self.peer_least_packet_awaiting_ack = Some(
                    self.peer_least_packet_awaiting_ack
                        .map_or(next, |least| least.max(next)),
                );
            }
        }

        // timestamps whose delta from largest_acked no longer fits a small
        // integer are useless to the peer
        self.received_packet_times.retain(|(packet_number, _)| {
            largest_acked
                .checked_distance(*packet_number)
                .map_or(false, |delta| delta <= u64::from(u8::MAX))
        });

        Some(PendingAckFrame {
            largest_acked,
            ack_delay,
            ranges: AckRangesVec::from_ascending(
                self.packets.intervals().map(|i| i.start..=i.end),
            ),
            received_packet_times: self.received_packet_times.clone(),
        })
    }

    /// Implements the delayed-ACK policy for one received packet
    ///
    /// Called by the engine after every received packet, with the largest
    /// packet number acknowledged in any ACK frame this endpoint has sent.
    pub fn maybe_update_ack_timeout(
        &mut self,
        ack_eliciting: bool,
        packet_number: PacketNumber,
        receipt_time: Timestamp,
        now: Timestamp,
        min_rtt: Duration,
    ) {
        // a packet the peer has already seen acked needs no fresh ACK unless
        // it reveals reordering below our advertised threshold
        if let Some(last_sent_largest_acked) = self.last_sent_largest_acked {
            if packet_number < last_sent_largest_acked {
                self.schedule_immediate(now);
                return;
            }
        }

        if !ack_eliciting {
            return;
        }

        self.retransmittable_since_last_ack += 1;

        let decimation_started = self.settings.ack_mode != AckMode::TcpAcking
            && packet_number.as_u64() >= self.settings.min_received_before_ack_decimation;

        if decimation_started {
            if !self.settings.unlimited_ack_decimation
                && self.retransmittable_since_last_ack
                    >= self.settings.max_retransmittable_packets_before_ack
            {
                self.schedule_immediate(now);
                return;
            }

            let mut delay = min_rtt.mul_f32(self.settings.ack_decimation_delay);
            delay = delay.min(self.settings.local_max_ack_delay);
            if self.settings.use_ack_alarm_granularity {
                delay = delay.max(K_GRANULARITY);
            }

            // the first packet after a quiet period carries fresh RTT
            // information; acknowledge it quickly
            if self.settings.fast_ack_after_quiescence && self.retransmittable_since_last_ack == 1
            {
                if let Some(previous) = self.time_of_previous_received_packet {
                    if receipt_time.saturating_duration_since(previous) > min_rtt {
                        self.schedule_immediate(now);
                        return;
                    }
                }
            }

            self.ack_timeout.update(receipt_time + delay, K_GRANULARITY);
        } else {
            if self.retransmittable_since_last_ack
                >= self.settings.ack_frequency_before_ack_decimation
            {
                self.schedule_immediate(now);
                return;
            }
            self.ack_timeout
                .update(receipt_time + self.settings.local_max_ack_delay, K_GRANULARITY);
        }

        // a freshly observed gap accelerates the pending acknowledgment so
        // the sender learns about the loss quickly
        if self.was_last_packet_missing {
            match self.settings.ack_mode {
                AckMode::AckDecimationWithReordering => {
                    self.ack_timeout
                        .update(receipt_time + min_rtt / 8, K_GRANULARITY);
                }
                _ => self.schedule_immediate(now),
            }
        }
    }

    fn schedule_immediate(&mut self, now: Timestamp) {
        self.ack_timeout.set(now);
    }

    /// Clears per-flight state after an ACK frame has been written
    pub fn reset_ack_states(&mut self) {
        self.ack_frame_updated = false;
        self.ack_timeout.cancel();
        self.retransmittable_since_last_ack = 0;
        self.last_sent_largest_acked = self.largest_observed;
    }

    /// Stops tracking packets below `least_unacked`
    pub fn dont_wait_for_packets_before(&mut self, least_unacked: PacketNumber) {
        if let Some(prev) = least_unacked.prev() {
            self.packets.remove_up_to(prev.as_varint());
        }
        self.peer_least_packet_awaiting_ack = Some(
            self.peer_least_packet_awaiting_ack
                .map_or(least_unacked, |least| least.max(least_unacked)),
        );
    }

    #[inline]
    pub fn ack_frame_updated(&self) -> bool {
        self.ack_frame_updated
    }

    #[inline]
    pub fn ack_timeout(&self) -> &Timer {
        &self.ack_timeout
    }

    /// Returns true and clears the deadline if the ACK alarm fired
    pub fn poll_ack_timeout(&mut self, now: Timestamp) -> bool {
        self.ack_timeout.poll_expiration(now)
    }

    #[inline]
    pub fn ack_deadline(&self) -> Option<Timestamp> {
        self.ack_timeout.deadline()
    }

    #[inline]
    pub fn largest_observed(&self) -> Option<PacketNumber> {
        self.largest_observed
    }

    #[inline]
    pub fn least_received_packet_number(&self) -> Option<PacketNumber> {
        self.least_received_packet_number
    }

    /// Returns true if there are gaps below the largest observed packet
    pub fn has_missing_packets(&self) -> bool {
        self.packets.interval_len() > 1
    }

    #[inline]
    pub fn packets_reordered(&self) -> u64 {
        self.packets_reordered
    }

    #[inline]
    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wren_quic_core::time::testing::now as at;

    const MIN_RTT: Duration = Duration::from_millis(80);

    fn pn(value: u64) -> PacketNumber {
        PacketNumberSpace::ApplicationData.new_packet_number(VarInt::new(value).unwrap())
    }

    fn manager(settings: Settings) -> ReceivedPacketManager {
        ReceivedPacketManager::new(settings, PacketNumberSpace::ApplicationData)
    }

    fn decimation_settings(ack_mode: AckMode) -> Settings {
        Settings {
            ack_mode,
            min_received_before_ack_decimation: 100,
            local_max_ack_delay: Duration::from_millis(25),
            ack_decimation_delay: 0.25,
            ..Default::default()
        }
    }

    #[test]
    fn records_cover_every_packet() {
        let mut manager = manager(Settings::default());
        for value in [0u64, 1, 2, 5, 6, 9] {
            assert!(manager.record_packet_received(pn(value), at(value)));
        }
        // duplicates are dropped
        assert!(!manager.record_packet_received(pn(5), at(10)));
        assert_eq!(manager.packets_dropped(), 1);

        let frame = manager.get_updated_ack_frame(at(20)).unwrap();
        assert_eq!(frame.largest_acked, pn(9));
        assert!(manager.has_missing_packets());

        let covered: Vec<u64> = frame
            .ranges
            .ack_ranges_ascending()
            .flat_map(|range| range.start().as_u64()..=range.end().as_u64())
            .collect();
        assert_eq!(covered, vec![0, 1, 2, 5, 6, 9]);
    }

    #[test]
    fn every_recorded_packet_is_covered_or_below_the_waterline() {
        let settings = Settings {
            ack_ranges_limit: 2,
            ..Default::default()
        };
        let mut manager = manager(settings);
        // many isolated ranges force coalescing
        for value in [0u64, 2, 4, 6, 8, 10] {
            manager.record_packet_received(pn(value), at(value));
        }

        let frame = manager.get_updated_ack_frame(at(20)).unwrap();
        assert_eq!(frame.ranges.ack_ranges_ascending().count(), 2);

        for value in [0u64, 2, 4, 6, 8, 10] {
            let covered = frame
                .ranges
                .ack_ranges_ascending()
                .any(|range| (*range.start()..=*range.end()).contains(&VarInt::new(value).unwrap()));
            let below = !manager.is_awaiting_packet(pn(value));
            assert!(covered || below, "packet {value} lost from ack state");
        }
    }

    #[test]
    fn ack_delay_measures_from_largest_observed() {
        let mut manager = manager(Settings::default());
        manager.record_packet_received(pn(1), at(100));
        let frame = manager.get_updated_ack_frame(at(112)).unwrap();
        assert_eq!(frame.ack_delay, Duration::from_millis(12));
    }

    #[test]
    fn tcp_mode_acks_every_second_retransmittable_packet() {
        let mut manager = manager(Settings {
            ack_mode: AckMode::TcpAcking,
            ..Default::default()
        });

        manager.record_packet_received(pn(0), at(0));
        manager.maybe_update_ack_timeout(true, pn(0), at(0), at(0), MIN_RTT);
        // first packet: delayed by local_max_ack_delay
        assert_eq!(manager.ack_deadline(), Some(at(0) + Duration::from_millis(25)));

        manager.record_packet_received(pn(1), at(1));
        manager.maybe_update_ack_timeout(true, pn(1), at(1), at(1), MIN_RTT);
        // second packet: immediate
        assert_eq!(manager.ack_deadline(), Some(at(1)));
    }

    #[test]
    fn decimation_delays_by_a_fraction_of_min_rtt() {
        let mut manager = manager(decimation_settings(AckMode::AckDecimation));

        // warm-up below the decimation threshold behaves like TCP acking
        manager.record_packet_received(pn(99), at(0));
        manager.maybe_update_ack_timeout(true, pn(99), at(0), at(0), MIN_RTT);
        assert_eq!(manager.ack_deadline(), Some(at(0) + Duration::from_millis(25)));
        manager.reset_ack_states();

        // past the threshold: min(25ms, 80ms * 0.25 = 20ms) = 20ms
        for (i, value) in (100u64..110).enumerate() {
            let time = at(10 + 5 * i as u64);
            manager.record_packet_received(pn(value), time);
            manager.maybe_update_ack_timeout(true, pn(value), time, time, MIN_RTT);
            if value < 109 {
                assert_eq!(
                    manager.ack_deadline(),
                    Some(time + Duration::from_millis(20)),
                    "packet {value}"
                );
            }
        }
        // the tenth retransmittable packet forces an immediate ack
        assert_eq!(manager.ack_deadline(), Some(at(10 + 5 * 9)));
    }

    #[test]
    fn reordering_mode_accelerates_on_new_gaps() {
        let mut manager = manager(decimation_settings(AckMode::AckDecimationWithReordering));

        for value in 100u64..=104 {
            manager.record_packet_received(pn(value), at(value));
            manager.maybe_update_ack_timeout(true, pn(value), at(value), at(value), MIN_RTT);
        }
        manager.reset_ack_states();

        // 106 skips 105: alarm accelerates to min_rtt / 8 = 10ms
        manager.record_packet_received(pn(106), at(110));
        manager.maybe_update_ack_timeout(true, pn(106), at(110), at(110), MIN_RTT);
        assert_eq!(manager.ack_deadline(), Some(at(110) + Duration::from_millis(10)));
    }

    #[test]
    fn plain_decimation_acks_new_gaps_immediately() {
        let mut manager = manager(decimation_settings(AckMode::AckDecimation));

        for value in 100u64..=104 {
            manager.record_packet_received(pn(value), at(value));
        }
        manager.reset_ack_states();

        manager.record_packet_received(pn(106), at(110));
        manager.maybe_update_ack_timeout(true, pn(106), at(110), at(110), MIN_RTT);
        assert_eq!(manager.ack_deadline(), Some(at(110)));
    }

    #[test]
    fn packets_below_last_sent_largest_acked_ack_immediately() {
        let mut manager = manager(decimation_settings(AckMode::AckDecimation));
        manager.record_packet_received(pn(5), at(5));
        manager.get_updated_ack_frame(at(6));
        manager.reset_ack_states();

        // a straggler below what we already acked
        manager.record_packet_received(pn(3), at(10));
        manager.maybe_update_ack_timeout(true, pn(3), at(10), at(10), MIN_RTT);
        assert_eq!(manager.ack_deadline(), Some(at(10)));
    }

    #[test]
    fn non_eliciting_packets_do_not_arm_the_alarm() {
        let mut manager = manager(Settings::default());
        manager.record_packet_received(pn(0), at(0));
        manager.maybe_update_ack_timeout(false, pn(0), at(0), at(0), MIN_RTT);
        assert_eq!(manager.ack_deadline(), None);
    }

    #[test]
    fn reset_ack_states_clears_the_flight() {
        let mut manager = manager(Settings::default());
        manager.record_packet_received(pn(0), at(0));
        manager.maybe_update_ack_timeout(true, pn(0), at(0), at(0), MIN_RTT);
        assert!(manager.ack_frame_updated());

        manager.reset_ack_states();
        assert!(!manager.ack_frame_updated());
        assert_eq!(manager.ack_deadline(), None);
        assert_eq!(manager.last_sent_largest_acked, Some(pn(0)));
    }

    #[test]
    fn timestamps_reject_backward_clock_movement() {
        let mut manager = manager(Settings {
            save_timestamps: true,
            ..Default::default()
        });
        manager.record_packet_received(pn(0), at(10));
        // clock stepped backwards
        manager.record_packet_received(pn(1), at(5));
        manager.record_packet_received(pn(2), at(11));

        let frame = manager.get_updated_ack_frame(at(12)).unwrap();
        let recorded: Vec<u64> = frame
            .received_packet_times
            .iter()
            .map(|(packet_number, _)| packet_number.as_u64())
            .collect();
        assert_eq!(recorded, vec![0, 2]);
    }

    #[test]
    fn boundary_largest_acked() {
        let mut manager = manager(Settings::default());
        let largest = pn((1 << 62) - 1);
        assert!(manager.record_packet_received(largest, at(1)));
        let frame = manager.get_updated_ack_frame(at(2)).unwrap();
        assert_eq!(frame.largest_acked, largest);
    }
}
