// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Maps frame-level loss and acknowledgment back onto connection state and
//! drives retransmission
//!
//! The notifier owns the retransmit queue of control frames and the
//! per-stream and per-level send state. When the engine has write budget it
//! calls [`SessionNotifier::on_can_write`], which replays lost data first
//! and new data last, labeling every write with its transmission type.

use crate::stream::SendBuffer;
use bytes::Bytes;
use std::collections::{BTreeSet, VecDeque};
use tracing::trace;
use wren_quic_core::{
    crypto::EncryptionLevel,
    frame::{
        DataBlocked, HandshakeDone, MaxData, MaxStreamData, MaxStreams, NewConnectionId,
        PathChallenge, PathResponse, Ping, ResetStream, RetireConnectionId, StopSending,
        StreamDataBlocked, StreamsBlocked,
    },
    stream::StreamId,
};

/// Why a frame is being written
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransmissionType {
    #[default]
    NotRetransmission,
    HandshakeRetransmission,
    LossRetransmission,
    PtoRetransmission,
}

/// A retransmittable control frame, owned so it can be replayed on loss
///
/// The `control_frame_id` the notifier assigns is bookkeeping only; it never
/// appears on the wire. Id 0 is reserved to mean "not a control frame".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlFrame {
    MaxData(MaxData),
    MaxStreamData(MaxStreamData),
    MaxStreams(MaxStreams),
    DataBlocked(DataBlocked),
    StreamDataBlocked(StreamDataBlocked),
    StreamsBlocked(StreamsBlocked),
    NewConnectionId(NewConnectionId),
    RetireConnectionId(RetireConnectionId),
    StopSending(StopSending),
    ResetStream(ResetStream),
    HandshakeDone(HandshakeDone),
    Ping(Ping),
    NewToken(Vec<u8>),
    PathChallenge(PathChallenge),
    PathResponse(PathResponse),
}

/// The sink the notifier writes into; implemented by the engine
///
/// Every write method returns false when the current packet budget is
/// exhausted, at which point the notifier stops and waits for the next
/// `on_can_write`.
pub trait FrameWriter {
    fn set_transmission_type(&mut self, transmission_type: TransmissionType);
    fn write_crypto(&mut self, level: EncryptionLevel, offset: u64, data: &Bytes) -> bool;
    fn write_control(&mut self, control_frame_id: u64, frame: &ControlFrame) -> bool;
    fn write_stream(&mut self, stream_id: StreamId, offset: u64, data: &Bytes, fin: bool)
        -> bool;
}

/// The largest slice handed to the writer per call; the writer may trim
/// further to fit its packet
const MAX_WRITE_CHUNK: usize = 1200;

#[derive(Debug, Default)]
struct StreamSendState {
    buffer: SendBuffer,
    fin_buffered: bool,
    fin_sent: bool,
    fin_outstanding: bool,
    fin_lost: bool,
}

impl StreamSendState {
    fn is_fully_acked(&self) -> bool {
        self.buffer.is_fully_acked() && (!self.fin_sent || !self.fin_outstanding)
    }
}

#[derive(Debug)]
pub struct SessionNotifier {
    /// Crypto send state for Initial, Handshake and 1-RTT
    crypto: [SendBuffer; 3],
    /// Streams in insertion order; new data fans out in this order
    streams: Vec<(StreamId, StreamSendState)>,

    /// Control frames, sent and unsent, ordered by control frame id
    control_queue: VecDeque<(u64, ControlFrame)>,
    /// Ids in `control_queue` that were declared lost
    lost_control_frames: BTreeSet<u64>,
    next_control_frame_id: u64,
    /// The first id which has never been written
    least_unsent_control_frame_id: u64,
    /// Everything below this id has been acked
    least_unacked_control_frame_id: u64,
}

impl Default for SessionNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionNotifier {
    pub fn new() -> Self {
        Self {
            crypto: Default::default(),
            streams: Vec::new(),
            control_queue: VecDeque::new(),
            lost_control_frames: BTreeSet::new(),
            // id 0 is the "not a control frame" sentinel
            next_control_frame_id: 1,
            least_unsent_control_frame_id: 1,
            least_unacked_control_frame_id: 1,
        }
    }

    fn crypto_index(level: EncryptionLevel) -> usize {
        match level {
            EncryptionLevel::Initial => 0,
            EncryptionLevel::Handshake => 1,
            // 0-RTT carries no crypto data
            EncryptionLevel::ZeroRtt | EncryptionLevel::OneRtt => 2,
        }
    }

    fn stream_state(&mut self, stream_id: StreamId) -> &mut StreamSendState {
        if let Some(index) = self.streams.iter().position(|(id, _)| *id == stream_id) {
            return &mut self.streams[index].1;
        }
        self.streams.push((stream_id, StreamSendState::default()));
        let last = self.streams.len() - 1;
        &mut self.streams[last].1
    }

    // === buffering ===

    /// Queues a control frame, returning its control frame id
    pub fn buffer_control_frame(&mut self, frame: ControlFrame) -> u64 {
        let id = self.next_control_frame_id;
        self.next_control_frame_id += 1;
        self.control_queue.push_back((id, frame));
        id
    }

    pub fn save_crypto_data(&mut self, level: EncryptionLevel, data: Bytes) {
        self.crypto[Self::crypto_index(level)].save_stream_data(data);
    }

    pub fn save_stream_data(&mut self, stream_id: StreamId, data: Bytes, fin: bool) {
        let state = self.stream_state(stream_id);
        state.buffer.save_stream_data(data);
        if fin {
            state.fin_buffered = true;
        }
    }

    // === acknowledgment and loss ===

    /// Returns true if the ack newly covered the frame
    pub fn on_control_frame_acked(&mut self, control_frame_id: u64) -> bool {
        if control_frame_id == 0 || control_frame_id < self.least_unacked_control_frame_id {
            return false;
        }
        let Some(index) = self
            .control_queue
            .iter()
            .position(|(id, _)| *id == control_frame_id)
        else {
            return false;
        };
        self.control_queue.remove(index);
        self.lost_control_frames.remove(&control_frame_id);

        // advance the ack waterline over the drained prefix
        while self.least_unacked_control_frame_id < self.least_unsent_control_frame_id
            && !self
                .control_queue
                .iter()
                .any(|(id, _)| *id == self.least_unacked_control_frame_id)
        {
            self.least_unacked_control_frame_id += 1;
        }
        true
    }

    pub fn on_control_frame_lost(&mut self, control_frame_id: u64) {
        if control_frame_id == 0 {
            return;
        }
        if self
            .control_queue
            .iter()
            .any(|(id, _)| *id == control_frame_id)
            && control_frame_id < self.least_unsent_control_frame_id
        {
            self.lost_control_frames.insert(control_frame_id);
        }
    }

    /// Returns the number of newly acked bytes
    pub fn on_crypto_frame_acked(&mut self, level: EncryptionLevel, offset: u64, len: u64) -> u64 {
        self.crypto[Self::crypto_index(level)].on_frame_acked(offset, len)
    }

    pub fn on_crypto_frame_lost(&mut self, level: EncryptionLevel, offset: u64, len: u64) {
        self.crypto[Self::crypto_index(level)].on_frame_lost(offset, len);
    }

    /// Returns true if the ack newly covered data or the fin
    pub fn on_stream_frame_acked(
        &mut self,
        stream_id: StreamId,
        offset: u64,
        len: u64,
        fin_acked: bool,
    ) -> bool {
        let state = self.stream_state(stream_id);
        let newly_acked_bytes = state.buffer.on_frame_acked(offset, len);
        let mut newly_acked = newly_acked_bytes > 0;
        if fin_acked && state.fin_outstanding {
            state.fin_outstanding = false;
            state.fin_lost = false;
            newly_acked = true;
        }
        newly_acked
    }

    pub fn on_stream_frame_lost(&mut self, stream_id: StreamId, offset: u64, len: u64, fin: bool) {
        let state = self.stream_state(stream_id);
        state.buffer.on_frame_lost(offset, len);
        if fin && state.fin_outstanding {
            state.fin_lost = true;
        }
    }

    // === write scheduling ===

    /// Returns true while anything remains to write or retransmit
    pub fn has_pending_data(&self) -> bool {
        self.has_lost_data() || self.has_buffered_data()
    }

    fn has_lost_data(&self) -> bool {
        !self.lost_control_frames.is_empty()
            || self.crypto.iter().any(SendBuffer::has_pending_retransmission)
            || self
                .streams
                .iter()
                .any(|(_, state)| state.buffer.has_pending_retransmission() || state.fin_lost)
    }

    fn has_buffered_data(&self) -> bool {
        self.least_unsent_control_frame_id < self.next_control_frame_id
            || self.crypto.iter().any(|buffer| buffer.bytes_pending_write() > 0)
            || self.streams.iter().any(|(_, state)| {
                state.buffer.bytes_pending_write() > 0
                    || (state.fin_buffered && !state.fin_sent)
            })
    }

    /// Drains pending data into `writer` until it reports exhaustion
    ///
    /// The order is fixed: lost crypto data per encryption level, lost
    /// control frames in id order, lost stream data, buffered control
    /// frames, then new stream data in stream-insertion order.
    pub fn on_can_write<W: FrameWriter>(&mut self, writer: &mut W) -> bool {
        if !self.retransmit_lost_crypto(writer) {
            return false;
        }
        if !self.retransmit_lost_control(writer) {
            return false;
        }
        if !self.retransmit_lost_streams(writer) {
            return false;
        }

        writer.set_transmission_type(TransmissionType::NotRetransmission);
        if !self.write_buffered_control(writer) {
            return false;
        }
        if !self.write_new_crypto(writer) {
            return false;
        }
        self.write_new_streams(writer)
    }

    fn retransmit_lost_crypto<W: FrameWriter>(&mut self, writer: &mut W) -> bool {
        writer.set_transmission_type(TransmissionType::HandshakeRetransmission);
        for (index, buffer) in self.crypto.iter_mut().enumerate() {
            let level = match index {
                0 => EncryptionLevel::Initial,
                1 => EncryptionLevel::Handshake,
                _ => EncryptionLevel::OneRtt,
            };
            while let Some((offset, data)) = buffer.next_retransmission(MAX_WRITE_CHUNK) {
                if !writer.write_crypto(level, offset, &data) {
                    return false;
                }
                buffer.on_retransmitted(offset, data.len() as u64);
                trace!(?level, offset, len = data.len(), "retransmitted crypto data");
            }
        }
        true
    }

    fn retransmit_lost_control<W: FrameWriter>(&mut self, writer: &mut W) -> bool {
        writer.set_transmission_type(TransmissionType::LossRetransmission);
        while let Some(id) = self.lost_control_frames.iter().next().copied() {
            let Some(frame) = self
                .control_queue
                .iter()
                .find(|(queued_id, _)| *queued_id == id)
                .map(|(_, frame)| frame.clone())
            else {
                self.lost_control_frames.remove(&id);
                continue;
            };
            if !writer.write_control(id, &frame) {
                return false;
            }
            self.lost_control_frames.remove(&id);
        }
        true
    }

    fn retransmit_lost_streams<W: FrameWriter>(&mut self, writer: &mut W) -> bool {
        writer.set_transmission_type(TransmissionType::LossRetransmission);
        for (stream_id, state) in &mut self.streams {
            while let Some((offset, data)) = state.buffer.next_retransmission(MAX_WRITE_CHUNK) {
                let end = offset + data.len() as u64;
                // bundle the fin when this range reaches the end of the stream
                let fin = state.fin_lost && end == state.buffer.stream_offset();
                if !writer.write_stream(*stream_id, offset, &data, fin) {
                    return false;
                }
                state.buffer.on_retransmitted(offset, data.len() as u64);
                if fin {
                    state.fin_lost = false;
                    state.fin_outstanding = true;
                }
            }
            if state.fin_lost {
                // the fin was lost in a frame whose data has since been acked
                let offset = state.buffer.stream_offset();
                if !writer.write_stream(*stream_id, offset, &Bytes::new(), true) {
                    return false;
                }
                state.fin_lost = false;
                state.fin_outstanding = true;
            }
        }
        true
    }

    fn write_buffered_control<W: FrameWriter>(&mut self, writer: &mut W) -> bool {
        while self.least_unsent_control_frame_id < self.next_control_frame_id {
            let id = self.least_unsent_control_frame_id;
            let Some(frame) = self
                .control_queue
                .iter()
                .find(|(queued_id, _)| *queued_id == id)
                .map(|(_, frame)| frame.clone())
            else {
                self.least_unsent_control_frame_id += 1;
                continue;
            };
            if !writer.write_control(id, &frame) {
                return false;
            }
            self.least_unsent_control_frame_id += 1;
        }
        true
    }

    fn write_new_crypto<W: FrameWriter>(&mut self, writer: &mut W) -> bool {
        for (index, buffer) in self.crypto.iter_mut().enumerate() {
            let level = match index {
                0 => EncryptionLevel::Initial,
                1 => EncryptionLevel::Handshake,
                _ => EncryptionLevel::OneRtt,
            };
            while let Some((offset, data)) = buffer.next_write(MAX_WRITE_CHUNK) {
                if !writer.write_crypto(level, offset, &data) {
                    return false;
                }
                buffer.on_stream_data_written(data.len() as u64);
            }
        }
        true
    }

    fn write_new_streams<W: FrameWriter>(&mut self, writer: &mut W) -> bool {
        for (stream_id, state) in &mut self.streams {
            while let Some((offset, data)) = state.buffer.next_write(MAX_WRITE_CHUNK) {
                let end = offset + data.len() as u64;
                let fin = state.fin_buffered
                    && !state.fin_sent
                    && end == state.buffer.stream_offset();
                if !writer.write_stream(*stream_id, offset, &data, fin) {
                    return false;
                }
                state.buffer.on_stream_data_written(data.len() as u64);
                if fin {
                    state.fin_sent = true;
                    state.fin_outstanding = true;
                }
            }
            if state.fin_buffered && !state.fin_sent {
                // fin-only stream or fin buffered after the data drained
                let offset = state.buffer.stream_offset();
                if state.buffer.bytes_pending_write() == 0 {
                    if !writer.write_stream(*stream_id, offset, &Bytes::new(), true) {
                        return false;
                    }
                    state.fin_sent = true;
                    state.fin_outstanding = true;
                }
            }
        }
        true
    }

    /// Returns true once every stream and control frame has been delivered
    pub fn all_data_acked(&self) -> bool {
        self.control_queue.is_empty()
            && self.crypto.iter().all(SendBuffer::is_fully_acked)
            && self.streams.iter().all(|(_, state)| state.is_fully_acked())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wren_quic_core::varint::VarInt;

    /// Records writes as readable strings; refuses writes once `budget`
    /// reaches zero
    #[derive(Debug)]
    struct Recorder {
        writes: Vec<String>,
        transmission_type: TransmissionType,
        budget: usize,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                writes: Vec::new(),
                transmission_type: TransmissionType::NotRetransmission,
                budget: usize::MAX,
            }
        }

        fn with_budget(budget: usize) -> Self {
            Self {
                budget,
                ..Self::new()
            }
        }

        fn charge(&mut self) -> bool {
            if self.budget == 0 {
                return false;
            }
            self.budget -= 1;
            true
        }
    }

    impl FrameWriter for Recorder {
        fn set_transmission_type(&mut self, transmission_type: TransmissionType) {
            self.transmission_type = transmission_type;
        }

        fn write_crypto(&mut self, level: EncryptionLevel, offset: u64, data: &Bytes) -> bool {
            if !self.charge() {
                return false;
            }
            self.writes.push(format!(
                "crypto {level:?} off={offset} len={} {:?}",
                data.len(),
                self.transmission_type
            ));
            true
        }

        fn write_control(&mut self, control_frame_id: u64, frame: &ControlFrame) -> bool {
            if !self.charge() {
                return false;
            }
            let name = match frame {
                ControlFrame::MaxData(_) => "max_data",
                ControlFrame::MaxStreams(_) => "max_streams",
                ControlFrame::Ping(_) => "ping",
                _ => "control",
            };
            self.writes.push(format!(
                "control#{control_frame_id} {name} {:?}",
                self.transmission_type
            ));
            true
        }

        fn write_stream(
            &mut self,
            stream_id: StreamId,
            offset: u64,
            data: &Bytes,
            fin: bool,
        ) -> bool {
            if !self.charge() {
                return false;
            }
            self.writes.push(format!(
                "stream {} off={offset} len={} fin={fin} {:?}",
                stream_id.as_u64(),
                data.len(),
                self.transmission_type
            ));
            true
        }
    }

    fn stream(value: u64) -> StreamId {
        StreamId::from_varint(VarInt::new(value).unwrap())
    }

    #[test]
    fn new_data_is_written_in_insertion_order_with_fins_bundled() {
        let mut notifier = SessionNotifier::new();
        notifier.save_stream_data(stream(4), Bytes::from_static(b"bbbb"), true);
        notifier.save_stream_data(stream(0), Bytes::from_static(b"aaaa"), false);
        notifier.buffer_control_frame(ControlFrame::MaxData(MaxData {
            maximum_data: VarInt::from_u32(4096),
        }));

        let mut writer = Recorder::new();
        assert!(notifier.on_can_write(&mut writer));
        assert_eq!(
            writer.writes,
            vec![
                "control#1 max_data NotRetransmission",
                "stream 4 off=0 len=4 fin=true NotRetransmission",
                "stream 0 off=0 len=4 fin=false NotRetransmission",
            ]
        );
        assert!(!notifier.has_pending_data());
    }

    #[test]
    fn lost_data_replays_before_new_data() {
        let mut notifier = SessionNotifier::new();

        // one sent control frame and one sent stream range
        let id = notifier.buffer_control_frame(ControlFrame::MaxData(MaxData {
            maximum_data: VarInt::from_u32(4096),
        }));
        notifier.save_stream_data(stream(0), Bytes::from_static(b"sent"), false);
        notifier.save_crypto_data(EncryptionLevel::Initial, Bytes::from_static(b"chlo"));
        let mut writer = Recorder::new();
        assert!(notifier.on_can_write(&mut writer));

        // losses come back
        notifier.on_control_frame_lost(id);
        notifier.on_stream_frame_lost(stream(0), 0, 4, false);
        notifier.on_crypto_frame_lost(EncryptionLevel::Initial, 0, 4);

        // plus some new data
        notifier.save_stream_data(stream(0), Bytes::from_static(b"new!"), false);

        let mut writer = Recorder::new();
        assert!(notifier.on_can_write(&mut writer));
        assert_eq!(
            writer.writes,
            vec![
                "crypto Initial off=0 len=4 HandshakeRetransmission",
                "control#1 max_data LossRetransmission",
                "stream 0 off=0 len=4 fin=false LossRetransmission",
                "stream 0 off=4 len=4 fin=false NotRetransmission",
            ]
        );
    }

    #[test]
    fn exhausted_writer_suspends_and_resumes() {
        let mut notifier = SessionNotifier::new();
        notifier.save_stream_data(stream(0), Bytes::from_static(b"aaaa"), false);
        notifier.save_stream_data(stream(4), Bytes::from_static(b"bbbb"), true);

        let mut writer = Recorder::with_budget(1);
        assert!(!notifier.on_can_write(&mut writer));
        assert_eq!(writer.writes.len(), 1);
        assert!(notifier.has_pending_data());

        let mut writer = Recorder::new();
        assert!(notifier.on_can_write(&mut writer));
        assert_eq!(
            writer.writes,
            vec!["stream 4 off=0 len=4 fin=true NotRetransmission"]
        );
        assert!(!notifier.has_pending_data());
    }

    #[test]
    fn control_frame_acks_are_idempotent() {
        let mut notifier = SessionNotifier::new();
        let id = notifier.buffer_control_frame(ControlFrame::Ping(Ping));
        let mut writer = Recorder::new();
        notifier.on_can_write(&mut writer);

        assert!(notifier.on_control_frame_acked(id));
        assert!(!notifier.on_control_frame_acked(id));
        assert!(notifier.all_data_acked());

        // a late loss signal for an acked frame is ignored
        notifier.on_control_frame_lost(id);
        assert!(!notifier.has_pending_data());
    }

    #[test]
    fn stream_acks_cover_data_and_fin() {
        let mut notifier = SessionNotifier::new();
        notifier.save_stream_data(stream(0), Bytes::from_static(b"abcd"), true);
        let mut writer = Recorder::new();
        notifier.on_can_write(&mut writer);

        assert!(notifier.on_stream_frame_acked(stream(0), 0, 4, false));
        assert!(!notifier.all_data_acked());

        assert!(notifier.on_stream_frame_acked(stream(0), 0, 0, true));
        assert!(notifier.all_data_acked());

        // duplicate ack is not newly acked
        assert!(!notifier.on_stream_frame_acked(stream(0), 0, 4, true));
    }

    #[test]
    fn a_lost_lone_fin_is_retransmitted() {
        let mut notifier = SessionNotifier::new();
        notifier.save_stream_data(stream(0), Bytes::from_static(b"abcd"), true);
        let mut writer = Recorder::new();
        notifier.on_can_write(&mut writer);

        // data acked, fin lost
        notifier.on_stream_frame_acked(stream(0), 0, 4, false);
        notifier.on_stream_frame_lost(stream(0), 0, 0, true);

        let mut writer = Recorder::new();
        assert!(notifier.on_can_write(&mut writer));
        assert_eq!(
            writer.writes,
            vec!["stream 0 off=4 len=0 fin=true LossRetransmission"]
        );
    }
}
