// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Settings governing ACK generation

use crate::varint::VarInt;
use core::time::Duration;

/// How aggressively acknowledgments are delayed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledge every `ack_frequency_before_ack_decimation` retransmittable
    /// packets, TCP style
    TcpAcking,
    /// After a warm-up period, acknowledge on a timer scaled from min_rtt
    AckDecimation,
    /// Like `AckDecimation`, but tolerate reordering by delaying the
    /// out-of-order fast acknowledgment by `min_rtt / 8`
    AckDecimationWithReordering,
}

/// The recommended number of packet number ranges an endpoint stores
const RECOMMENDED_RANGES_LIMIT: usize = 10;

/// Settings for ACK frames
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    pub ack_mode: AckMode,

    /// The maximum amount of time by which the endpoint will delay sending
    /// acknowledgments
    pub local_max_ack_delay: Duration,

    /// An exponent used to scale the ACK Delay field in the ACK frame
    pub ack_delay_exponent: u8,

    /// Number of packets received in the space before ack decimation starts
    pub min_received_before_ack_decimation: u64,

    /// Before decimation starts, ack every n-th retransmittable packet
    pub ack_frequency_before_ack_decimation: u64,

    /// Once decimation has started, ack after this many retransmittable
    /// packets even if the delayed-ack timer has not fired
    pub max_retransmittable_packets_before_ack: u64,

    /// Fraction of min_rtt the delayed-ack timer waits during decimation
    pub ack_decimation_delay: f32,

    /// When set, decimation never acks on packet count, only on the timer
    pub unlimited_ack_decimation: bool,

    /// When set, the decimation delay is floored at the timer granularity
    pub use_ack_alarm_granularity: bool,

    /// When set, the first retransmittable packet after quiescence is acked
    /// immediately
    pub fast_ack_after_quiescence: bool,

    /// The number of packet number intervals the endpoint is willing to store
    pub ack_ranges_limit: usize,

    /// When set, receipt times are collected and emitted with ACK frames
    pub save_timestamps: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self::RECOMMENDED
    }
}

impl Settings {
    pub const RECOMMENDED: Self = Self {
        ack_mode: AckMode::AckDecimation,
        //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
        //# If this value is absent, a default of 25 milliseconds is assumed.
        local_max_ack_delay: Duration::from_millis(25),
        //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
        //# If this value is absent, a default value of 3 is assumed (indicating a
        //# multiplier of 8).
        ack_delay_exponent: 3,
        min_received_before_ack_decimation: 100,
        ack_frequency_before_ack_decimation: 2,
        max_retransmittable_packets_before_ack: 10,
        ack_decimation_delay: 0.25,
        unlimited_ack_decimation: false,
        use_ack_alarm_granularity: false,
        fast_ack_after_quiescence: false,
        ack_ranges_limit: RECOMMENDED_RANGES_LIMIT,
        save_timestamps: false,
    };

    /// Decodes the peer's `ACK Delay` field
    pub fn decode_ack_delay(&self, delay: VarInt) -> Duration {
        Duration::from_micros(delay.as_u64()) * self.scale()
    }

    /// Encodes the local `ACK Delay` field
    pub fn encode_ack_delay(&self, delay: Duration) -> VarInt {
        let micros = delay.as_micros();
        let scale = self.scale() as u128;
        (micros / scale).try_into().unwrap_or(VarInt::MAX)
    }

    fn scale(&self) -> u32 {
        2u32.pow(self.ack_delay_exponent as u32)
    }
}
