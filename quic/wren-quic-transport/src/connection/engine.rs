// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-connection protocol engine
//!
//! The engine binds the framer, the received-packet managers, the
//! connection-ID registries, the stream machinery and the bandwidth sampler
//! into one cooperatively scheduled state machine. It is driven by three
//! inputs: inbound datagrams, timer firings and application writes; every
//! public operation returns synchronously.

use crate::{
    ack::ReceivedPacketManager,
    connection::{LocalIdRegistry, PeerIdRegistry},
    endpoint::{DispatcherContext, PacketWriter, TimeWaitAction, WriteResult},
    recovery::{Bandwidth, BandwidthSampler},
    stream::{StreamIdManager, StreamSequencer},
    transmission::{ControlFrame, FrameWriter, SessionNotifier, TransmissionType},
};
use bytes::Bytes;
use core::time::Duration;
use s2n_codec::{DecoderBufferMut, DecoderError, EncoderValue};
use std::collections::VecDeque;
use std::net::SocketAddr;
use tracing::{debug, trace, warn};
use wren_quic_core::{
    ack::Settings as AckSettings,
    connection::ConnectionId,
    crypto::{EncryptionLevel, PacketProtection},
    endpoint,
    frame::{
        self,
        ack::AckRangesDecoder,
        ack_elicitation::AckElicitation,
        FrameDecoder,
    },
    packet::{number::{PacketNumber, PacketNumberSpace}, Framer, Header, Processed, QUIC_VERSION_1},
    stateless_reset,
    stream::{StreamId, StreamType},
    time::{Timer, Timestamp, K_GRANULARITY},
    transport,
    varint::VarInt,
};

/// The reassembly capacity of each stream
const STREAM_BUFFER_CAPACITY: usize = 64 * 1024;

/// Crypto data is bounded per encryption level; overflow is fatal
const CRYPTO_BUFFER_CAPACITY: usize = 128 * 1024;

/// Packets this far below the largest acked are declared lost
const LOSS_REORDERING_THRESHOLD: u64 = 3;

/// Probe timeouts tolerated before the network is considered blackholed
const MAX_PTOS: u32 = 5;

/// Budget of consecutive packets carrying nothing retransmittable
const MAX_CONSECUTIVE_NON_RETRANSMITTABLE_PACKETS: u64 = 19;

/// Upper bound on packets assembled per write event
const MAX_PACKETS_PER_WRITE: usize = 10;

const MAX_DATAGRAM_SIZE: usize = 1350;

/// Usable frame bytes per packet, leaving room for header and tag; sized so
/// the notifier's largest write chunk still fits with its frame header
const MAX_PACKET_PAYLOAD: usize = 1232;

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.2
//# When no previous RTT is available, the initial RTT SHOULD be set to
//# 333 milliseconds.
const INITIAL_RTT: Duration = Duration::from_millis(333);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseEvent {
    pub error: transport::Error,
    /// True when the peer initiated the close
    pub remote: bool,
}

/// Configuration for a connection
#[derive(Clone, Debug)]
pub struct Config {
    pub perspective: endpoint::Type,
    pub local_connection_id: ConnectionId,
    pub peer_connection_id: ConnectionId,
    pub peer_address: SocketAddr,
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub ack_settings: AckSettings,
    pub max_open_incoming_bidi_streams: u64,
    pub max_open_incoming_uni_streams: u64,
    /// Connection-level receive flow control limit
    pub initial_max_data: u64,
}

impl Config {
    pub fn new(
        perspective: endpoint::Type,
        local_connection_id: ConnectionId,
        peer_connection_id: ConnectionId,
        peer_address: SocketAddr,
    ) -> Self {
        Self {
            perspective,
            local_connection_id,
            peer_connection_id,
            peer_address,
            idle_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            ack_settings: AckSettings::default(),
            max_open_incoming_bidi_streams: 100,
            max_open_incoming_uni_streams: 3,
            initial_max_data: 1 << 20,
        }
    }
}

#[derive(Clone, Debug)]
enum SentFrameInfo {
    Stream {
        id: StreamId,
        offset: u64,
        len: u64,
        fin: bool,
    },
    Crypto {
        level: EncryptionLevel,
        offset: u64,
        len: u64,
    },
    Control {
        control_frame_id: u64,
    },
    Ack {
        largest_acked: PacketNumber,
    },
    Datagram,
}

#[derive(Debug)]
struct SentPacketInfo {
    packet_number: u64,
    space_index: usize,
    /// Key into the bandwidth sampler, unique across spaces
    sampler_id: u64,
    size: u64,
    ack_eliciting: bool,
    time_sent: Timestamp,
    frames: Vec<SentFrameInfo>,
}

#[derive(Debug, Default)]
struct RttState {
    smoothed: Option<Duration>,
    variance: Duration,
    min: Option<Duration>,
}

impl RttState {
    fn update(&mut self, latest: Duration) {
        self.min = Some(self.min.map_or(latest, |min| min.min(latest)));
        match self.smoothed {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
            //# smoothed_rtt = 7/8 * smoothed_rtt + 1/8 * adjusted_rtt
            Some(smoothed) => {
                let delta = if smoothed > latest {
                    smoothed - latest
                } else {
                    latest - smoothed
                };
                self.variance = (self.variance * 3 + delta) / 4;
                self.smoothed = Some((smoothed * 7 + latest) / 8);
            }
            None => {
                self.smoothed = Some(latest);
                self.variance = latest / 2;
            }
        }
    }

    fn min_rtt(&self) -> Duration {
        self.min.unwrap_or(INITIAL_RTT)
    }

    fn smoothed_rtt(&self) -> Duration {
        self.smoothed.unwrap_or(INITIAL_RTT)
    }

    fn pto(&self, max_ack_delay: Duration) -> Duration {
        self.smoothed_rtt() + (self.variance * 4).max(K_GRANULARITY) + max_ack_delay
    }
}

/// An owned record of one received frame, applied after the framer call
/// returns so nothing borrowed from the packet outlives the dispatch
#[derive(Debug)]
enum FrameAction {
    Ping,
    Ack {
        ack_delay: VarInt,
        /// Ascending (start, end) packet number ranges
        ranges: Vec<(u64, u64)>,
    },
    ResetStream(frame::ResetStream),
    StopSending(frame::StopSending),
    Crypto {
        offset: u64,
        data: Bytes,
    },
    NewToken(Vec<u8>),
    Stream {
        id: VarInt,
        offset: u64,
        fin: bool,
        data: Bytes,
    },
    MaxData(frame::MaxData),
    MaxStreamData(frame::MaxStreamData),
    MaxStreams(frame::MaxStreams),
    DataBlocked(frame::DataBlocked),
    StreamDataBlocked(frame::StreamDataBlocked),
    StreamsBlocked(frame::StreamsBlocked),
    NewConnectionId(frame::NewConnectionId),
    RetireConnectionId(frame::RetireConnectionId),
    PathChallenge([u8; 8]),
    PathResponse([u8; 8]),
    ConnectionClose {
        error_code: VarInt,
    },
    HandshakeDone,
    Datagram(Bytes),
}

/// Collects owned frame actions while the framer walks a packet
#[derive(Debug, Default)]
struct FrameCollector {
    actions: Vec<FrameAction>,
}

impl<'a> FrameDecoder<'a, AckRangesDecoder<'a>, DecoderBufferMut<'a>> for FrameCollector {
    type Output = ();

    fn handle_padding_frame(&mut self, _frame: frame::Padding) -> Result<(), DecoderError> {
        Ok(())
    }

    fn handle_ping_frame(&mut self, _frame: frame::Ping) -> Result<(), DecoderError> {
        self.actions.push(FrameAction::Ping);
        Ok(())
    }

    fn handle_ack_frame(
        &mut self,
        frame: frame::Ack<AckRangesDecoder<'a>>,
    ) -> Result<(), DecoderError> {
        let mut ranges: Vec<(u64, u64)> = frame
            .ack_ranges()
            .map(|range| (range.start().as_u64(), range.end().as_u64()))
            .collect();
        ranges.reverse();
        self.actions.push(FrameAction::Ack {
            ack_delay: frame.ack_delay,
            ranges,
        });
        Ok(())
    }

    fn handle_reset_stream_frame(&mut self, frame: frame::ResetStream) -> Result<(), DecoderError> {
        self.actions.push(FrameAction::ResetStream(frame));
        Ok(())
    }

    fn handle_stop_sending_frame(&mut self, frame: frame::StopSending) -> Result<(), DecoderError> {
        self.actions.push(FrameAction::StopSending(frame));
        Ok(())
    }

    fn handle_crypto_frame(
        &mut self,
        frame: frame::Crypto<DecoderBufferMut<'a>>,
    ) -> Result<(), DecoderError> {
        let offset = frame.offset.as_u64();
        let data = Bytes::copy_from_slice(frame.data.into_less_safe_slice());
        self.actions.push(FrameAction::Crypto { offset, data });
        Ok(())
    }

    fn handle_new_token_frame(&mut self, frame: frame::NewToken<'a>) -> Result<(), DecoderError> {
        self.actions.push(FrameAction::NewToken(frame.token.to_vec()));
        Ok(())
    }

    fn handle_stream_frame(
        &mut self,
        frame: frame::Stream<DecoderBufferMut<'a>>,
    ) -> Result<(), DecoderError> {
        let id = frame.stream_id;
        let offset = frame.offset.as_u64();
        let fin = frame.is_fin;
        let data = Bytes::copy_from_slice(frame.data.into_less_safe_slice());
        self.actions.push(FrameAction::Stream {
            id,
            offset,
            fin,
            data,
        });
        Ok(())
    }

    fn handle_max_data_frame(&mut self, frame: frame::MaxData) -> Result<(), DecoderError> {
        self.actions.push(FrameAction::MaxData(frame));
        Ok(())
    }

    fn handle_max_stream_data_frame(
        &mut self,
        frame: frame::MaxStreamData,
    ) -> Result<(), DecoderError> {
        self.actions.push(FrameAction::MaxStreamData(frame));
        Ok(())
    }

    fn handle_max_streams_frame(&mut self, frame: frame::MaxStreams) -> Result<(), DecoderError> {
        self.actions.push(FrameAction::MaxStreams(frame));
        Ok(())
    }

    fn handle_data_blocked_frame(&mut self, frame: frame::DataBlocked) -> Result<(), DecoderError> {
        self.actions.push(FrameAction::DataBlocked(frame));
        Ok(())
    }

    fn handle_stream_data_blocked_frame(
        &mut self,
        frame: frame::StreamDataBlocked,
    ) -> Result<(), DecoderError> {
        self.actions.push(FrameAction::StreamDataBlocked(frame));
        Ok(())
    }

    fn handle_streams_blocked_frame(
        &mut self,
        frame: frame::StreamsBlocked,
    ) -> Result<(), DecoderError> {
        self.actions.push(FrameAction::StreamsBlocked(frame));
        Ok(())
    }

    fn handle_new_connection_id_frame(
        &mut self,
        frame: frame::NewConnectionId,
    ) -> Result<(), DecoderError> {
        self.actions.push(FrameAction::NewConnectionId(frame));
        Ok(())
    }

    fn handle_retire_connection_id_frame(
        &mut self,
        frame: frame::RetireConnectionId,
    ) -> Result<(), DecoderError> {
        self.actions.push(FrameAction::RetireConnectionId(frame));
        Ok(())
    }

    fn handle_path_challenge_frame(
        &mut self,
        frame: frame::PathChallenge,
    ) -> Result<(), DecoderError> {
        self.actions.push(FrameAction::PathChallenge(frame.data));
        Ok(())
    }

    fn handle_path_response_frame(
        &mut self,
        frame: frame::PathResponse,
    ) -> Result<(), DecoderError> {
        self.actions.push(FrameAction::PathResponse(frame.data));
        Ok(())
    }

    fn handle_connection_close_frame(
        &mut self,
        frame: frame::ConnectionClose<'a>,
    ) -> Result<(), DecoderError> {
        self.actions.push(FrameAction::ConnectionClose {
            error_code: frame.error_code,
        });
        Ok(())
    }

    fn handle_handshake_done_frame(
        &mut self,
        _frame: frame::HandshakeDone,
    ) -> Result<(), DecoderError> {
        self.actions.push(FrameAction::HandshakeDone);
        Ok(())
    }

    fn handle_datagram_frame(
        &mut self,
        frame: frame::Datagram<DecoderBufferMut<'a>>,
    ) -> Result<(), DecoderError> {
        let data = Bytes::copy_from_slice(frame.data.into_less_safe_slice());
        self.actions.push(FrameAction::Datagram(data));
        Ok(())
    }
}

#[inline]
fn space_index(space: PacketNumberSpace) -> usize {
    match space {
        PacketNumberSpace::Initial => 0,
        PacketNumberSpace::Handshake => 1,
        PacketNumberSpace::ApplicationData => 2,
    }
}

#[inline]
fn space_for_index(index: usize) -> PacketNumberSpace {
    match index {
        0 => PacketNumberSpace::Initial,
        1 => PacketNumberSpace::Handshake,
        _ => PacketNumberSpace::ApplicationData,
    }
}

#[inline]
fn level_for_space_index(index: usize) -> EncryptionLevel {
    match index {
        0 => EncryptionLevel::Initial,
        1 => EncryptionLevel::Handshake,
        _ => EncryptionLevel::OneRtt,
    }
}

/// A packet being assembled during a write event
#[derive(Debug)]
struct PendingPacket {
    level: EncryptionLevel,
    payload: Vec<u8>,
    frames: Vec<SentFrameInfo>,
    ack_elicitation: AckElicitation,
    transmission_type: TransmissionType,
}

/// Accumulates frames into packets; implements the notifier's sink
#[derive(Debug)]
struct PacketAssembler {
    packets: Vec<PendingPacket>,
    transmission_type: TransmissionType,
}

impl PacketAssembler {
    fn new() -> Self {
        Self {
            packets: Vec::new(),
            transmission_type: TransmissionType::NotRetransmission,
        }
    }

    /// Returns the packet frames at `level` are currently appended to
    fn packet_at(&mut self, level: EncryptionLevel) -> Option<&mut PendingPacket> {
        if self.packets.len() >= MAX_PACKETS_PER_WRITE {
            let reusable = self
                .packets
                .last()
                .map_or(false, |packet| packet.level == level);
            if !reusable {
                return None;
            }
        }
        let needs_new = self
            .packets
            .last()
            .map_or(true, |packet| packet.level != level);
        if needs_new {
            self.packets.push(PendingPacket {
                level,
                payload: Vec::with_capacity(MAX_PACKET_PAYLOAD),
                frames: Vec::new(),
                ack_elicitation: AckElicitation::NonEliciting,
                transmission_type: self.transmission_type,
            });
        }
        self.packets.last_mut()
    }

    /// Appends encoded frame bytes at `level`, opening packets as needed
    fn push_frame(
        &mut self,
        level: EncryptionLevel,
        bytes: Vec<u8>,
        info: SentFrameInfo,
        ack_elicitation: AckElicitation,
    ) -> bool {
        debug_assert!(bytes.len() <= MAX_PACKET_PAYLOAD, "frame exceeds packet budget");
        let transmission_type = self.transmission_type;

        let needs_fresh = match self.packet_at(level) {
            Some(packet) => packet.payload.len() + bytes.len() > MAX_PACKET_PAYLOAD,
            None => return false,
        };
        if needs_fresh {
            if self.packets.len() >= MAX_PACKETS_PER_WRITE {
                return false;
            }
            self.packets.push(PendingPacket {
                level,
                payload: Vec::with_capacity(MAX_PACKET_PAYLOAD),
                frames: Vec::new(),
                ack_elicitation: AckElicitation::NonEliciting,
                transmission_type,
            });
        }

        let Some(packet) = self.packets.last_mut() else {
            return false;
        };
        packet.payload.extend_from_slice(&bytes);
        packet.frames.push(info);
        packet.ack_elicitation |= ack_elicitation;
        true
    }
}

impl FrameWriter for PacketAssembler {
    fn set_transmission_type(&mut self, transmission_type: TransmissionType) {
        self.transmission_type = transmission_type;
    }

    fn write_crypto(&mut self, level: EncryptionLevel, offset: u64, data: &Bytes) -> bool {
        let frame = frame::Crypto {
            offset: VarInt::new(offset).unwrap_or(VarInt::MAX),
            data: &data[..],
        };
        self.push_frame(
            level,
            frame.encode_to_vec(),
            SentFrameInfo::Crypto {
                level,
                offset,
                len: data.len() as u64,
            },
            AckElicitation::Eliciting,
        )
    }

    fn write_control(&mut self, control_frame_id: u64, control: &ControlFrame) -> bool {
        let bytes = match control {
            ControlFrame::MaxData(frame) => frame.encode_to_vec(),
            ControlFrame::MaxStreamData(frame) => frame.encode_to_vec(),
            ControlFrame::MaxStreams(frame) => frame.encode_to_vec(),
            ControlFrame::DataBlocked(frame) => frame.encode_to_vec(),
            ControlFrame::StreamDataBlocked(frame) => frame.encode_to_vec(),
            ControlFrame::StreamsBlocked(frame) => frame.encode_to_vec(),
            ControlFrame::NewConnectionId(frame) => frame.encode_to_vec(),
            ControlFrame::RetireConnectionId(frame) => frame.encode_to_vec(),
            ControlFrame::StopSending(frame) => frame.encode_to_vec(),
            ControlFrame::ResetStream(frame) => frame.encode_to_vec(),
            ControlFrame::HandshakeDone(frame) => frame.encode_to_vec(),
            ControlFrame::Ping(frame) => frame.encode_to_vec(),
            ControlFrame::NewToken(token) => frame::NewToken {
                token: token.as_slice(),
            }
            .encode_to_vec(),
            ControlFrame::PathChallenge(frame) => frame.encode_to_vec(),
            ControlFrame::PathResponse(frame) => frame.encode_to_vec(),
        };
        self.push_frame(
            EncryptionLevel::OneRtt,
            bytes,
            SentFrameInfo::Control { control_frame_id },
            AckElicitation::Eliciting,
        )
    }

    fn write_stream(
        &mut self,
        stream_id: StreamId,
        offset: u64,
        data: &Bytes,
        fin: bool,
    ) -> bool {
        let frame = frame::Stream {
            stream_id: stream_id.as_varint(),
            offset: VarInt::new(offset).unwrap_or(VarInt::MAX),
            is_last_frame: false,
            is_fin: fin,
            data: &data[..],
        };
        self.push_frame(
            EncryptionLevel::OneRtt,
            frame.encode_to_vec(),
            SentFrameInfo::Stream {
                id: stream_id,
                offset,
                len: data.len() as u64,
                fin,
            },
            AckElicitation::Eliciting,
        )
    }
}

pub struct Engine<K: PacketProtection> {
    perspective: endpoint::Type,
    framer: Framer,
    keys: K,
    version: u32,

    local_connection_id: ConnectionId,
    peer_connection_id: ConnectionId,
    peer_address: SocketAddr,

    spaces: [ReceivedPacketManager; 3],
    next_packet_number: [u64; 3],
    largest_acked_by_peer: [Option<u64>; 3],
    sent_packets: VecDeque<SentPacketInfo>,
    next_sampler_id: u64,
    bytes_in_flight: u64,

    sampler: BandwidthSampler,
    bandwidth_estimate: Bandwidth,
    rtt: RttState,

    notifier: SessionNotifier,
    peer_ids: PeerIdRegistry,
    local_ids: LocalIdRegistry,
    bidi_ids: StreamIdManager,
    uni_ids: StreamIdManager,

    recv_streams: Vec<(StreamId, StreamSequencer)>,
    crypto_recv: [StreamSequencer; 3],
    readable_streams: Vec<StreamId>,
    finished_streams: Vec<StreamId>,
    received_datagrams: VecDeque<Bytes>,
    stop_sending_received: Vec<(StreamId, u64)>,
    new_tokens_received: Vec<Vec<u8>>,
    retry_token: Vec<u8>,

    local_max_data: u64,
    ack_settings: AckSettings,

    idle_timeout: Duration,
    idle_timer: Timer,
    handshake_timer: Timer,
    pto_timer: Timer,
    pto_count: u32,

    path_challenge_outstanding: Option<[u8; 8]>,
    path_validated: bool,

    handshake_confirmed: bool,
    peer_reset_token: Option<stateless_reset::Token>,

    close_event: Option<CloseEvent>,
    close_event_taken: bool,
    pending_close_frame: Option<transport::Error>,
    closed: bool,
    termination_packets: Vec<Bytes>,

    pending_datagram_frames: VecDeque<Bytes>,
    queued_egress: VecDeque<Bytes>,
    writer_blocked: bool,
    consecutive_non_retransmittable: u64,
}

impl<K: PacketProtection> Engine<K> {
    pub fn new(config: Config, keys: K, now: Timestamp) -> Self {
        let spaces = [
            ReceivedPacketManager::new(config.ack_settings, PacketNumberSpace::Initial),
            ReceivedPacketManager::new(config.ack_settings, PacketNumberSpace::Handshake),
            ReceivedPacketManager::new(config.ack_settings, PacketNumberSpace::ApplicationData),
        ];

        let mut handshake_timer = Timer::default();
        handshake_timer.set(now + config.handshake_timeout);
        let mut idle_timer = Timer::default();
        idle_timer.set(now + config.idle_timeout);

        Self {
            perspective: config.perspective,
            framer: Framer::new(config.perspective, config.local_connection_id.len()),
            keys,
            version: QUIC_VERSION_1,
            local_connection_id: config.local_connection_id,
            peer_connection_id: config.peer_connection_id,
            peer_address: config.peer_address,
            spaces,
            next_packet_number: [0; 3],
            largest_acked_by_peer: [None; 3],
            sent_packets: VecDeque::new(),
            next_sampler_id: 1,
            bytes_in_flight: 0,
            sampler: BandwidthSampler::new(),
            bandwidth_estimate: Bandwidth::ZERO,
            rtt: RttState::default(),
            notifier: SessionNotifier::new(),
            peer_ids: PeerIdRegistry::new(config.peer_connection_id, None),
            local_ids: LocalIdRegistry::new(config.local_connection_id),
            bidi_ids: StreamIdManager::new(
                config.perspective,
                StreamType::Bidirectional,
                config.max_open_incoming_bidi_streams,
            ),
            uni_ids: StreamIdManager::new(
                config.perspective,
                StreamType::Unidirectional,
                config.max_open_incoming_uni_streams,
            ),
            recv_streams: Vec::new(),
            crypto_recv: [
                StreamSequencer::new(CRYPTO_BUFFER_CAPACITY),
                StreamSequencer::new(CRYPTO_BUFFER_CAPACITY),
                StreamSequencer::new(CRYPTO_BUFFER_CAPACITY),
            ],
            readable_streams: Vec::new(),
            finished_streams: Vec::new(),
            received_datagrams: VecDeque::new(),
            stop_sending_received: Vec::new(),
            new_tokens_received: Vec::new(),
            retry_token: Vec::new(),
            local_max_data: config.initial_max_data,
            ack_settings: config.ack_settings,
            idle_timeout: config.idle_timeout,
            idle_timer,
            handshake_timer,
            pto_timer: Timer::default(),
            pto_count: 0,
            path_challenge_outstanding: None,
            path_validated: false,
            handshake_confirmed: false,
            peer_reset_token: None,
            close_event: None,
            close_event_taken: false,
            pending_close_frame: None,
            closed: false,
            termination_packets: Vec::new(),
            pending_datagram_frames: VecDeque::new(),
            queued_egress: VecDeque::new(),
            writer_blocked: false,
            consecutive_non_retransmittable: 0,
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[inline]
    pub fn peer_connection_id(&self) -> &ConnectionId {
        &self.peer_connection_id
    }

    /// The close notification, delivered exactly once
    pub fn poll_close_event(&mut self) -> Option<CloseEvent> {
        if self.close_event_taken {
            return None;
        }
        let event = self.close_event?;
        self.close_event_taken = true;
        Some(event)
    }

    /// Installs what the peer's transport parameters advertised
    pub fn on_transport_parameters(
        &mut self,
        params: &wren_quic_core::transport::parameters::TransportParameters,
    ) {
        self.bidi_ids
            .maybe_allow_more_outgoing_streams(params.initial_max_streams_bidi.as_u64());
        self.uni_ids
            .maybe_allow_more_outgoing_streams(params.initial_max_streams_uni.as_u64());
        self.peer_ids
            .set_active_connection_id_limit(params.active_connection_id_limit.as_u64());
        self.local_ids
            .set_peer_active_connection_id_limit(params.active_connection_id_limit.as_u64());
        self.peer_reset_token = params.stateless_reset_token;
    }

    /// Marks the handshake confirmed; servers also queue HANDSHAKE_DONE
    pub fn on_handshake_confirmed(&mut self) {
        if self.handshake_confirmed {
            return;
        }
        self.handshake_confirmed = true;
        self.handshake_timer.permanent_cancel();
        self.local_ids.on_handshake_confirmed();
        if self.perspective.is_server() {
            self.notifier
                .buffer_control_frame(ControlFrame::HandshakeDone(frame::HandshakeDone));
        }
    }

    // === application surface ===

    pub fn open_stream(&mut self, stream_type: StreamType) -> Result<StreamId, transport::Error> {
        let manager = match stream_type {
            StreamType::Bidirectional => &mut self.bidi_ids,
            StreamType::Unidirectional => &mut self.uni_ids,
        };
        match manager.get_next_outgoing_stream_id() {
            Ok(id) => Ok(id),
            Err(blocked) => {
                if let Some(blocked) = blocked {
                    self.notifier
                        .buffer_control_frame(ControlFrame::StreamsBlocked(blocked));
                }
                Err(transport::Error::STREAM_LIMIT_ERROR
                    .with_reason("peer stream limit reached"))
            }
        }
    }

    pub fn write_stream(&mut self, stream_id: StreamId, data: Bytes, fin: bool) {
        self.notifier.save_stream_data(stream_id, data, fin);
    }

    pub fn write_crypto(&mut self, level: EncryptionLevel, data: Bytes) {
        self.notifier.save_crypto_data(level, data);
    }

    pub fn send_datagram(&mut self, data: Bytes) {
        if data.len() + 8 > MAX_PACKET_PAYLOAD {
            warn!(len = data.len(), "dropping oversized datagram");
            return;
        }
        self.pending_datagram_frames.push_back(data);
    }

    /// Reads reassembled bytes from a stream
    pub fn read_stream(
        &mut self,
        stream_id: StreamId,
        out: &mut [u8],
    ) -> Result<(usize, bool), transport::Error> {
        let Some((_, sequencer)) = self
            .recv_streams
            .iter_mut()
            .find(|(id, _)| *id == stream_id)
        else {
            return Ok((0, false));
        };
        let (copied, notify) = sequencer.readv(&mut [out]);
        let finished = sequencer.is_closed();
        if notify.on_data_available || finished {
            trace!(stream = stream_id.as_u64(), copied, finished, "stream read");
        }
        if finished {
            self.on_stream_finished(stream_id);
        }
        Ok((copied, finished))
    }

    pub fn poll_readable_stream(&mut self) -> Option<StreamId> {
        if self.readable_streams.is_empty() {
            None
        } else {
            Some(self.readable_streams.remove(0))
        }
    }

    pub fn poll_received_datagram(&mut self) -> Option<Bytes> {
        self.received_datagrams.pop_front()
    }

    /// STOP_SENDING requests received from the peer, for the application
    pub fn poll_stop_sending(&mut self) -> Option<(StreamId, u64)> {
        if self.stop_sending_received.is_empty() {
            None
        } else {
            Some(self.stop_sending_received.remove(0))
        }
    }

    /// Address-validation tokens received in NEW_TOKEN frames
    pub fn take_new_tokens(&mut self) -> Vec<Vec<u8>> {
        core::mem::take(&mut self.new_tokens_received)
    }

    pub fn read_crypto(&mut self, level: EncryptionLevel, out: &mut [u8]) -> usize {
        let index = space_index(PacketNumberSpace::from_encryption_level(level));
        let (copied, _) = self.crypto_recv[index].readv(&mut [out]);
        copied
    }

    /// Starts validating the current path with a PATH_CHALLENGE
    pub fn initiate_path_validation(&mut self, ctx: &mut DispatcherContext) {
        let mut data = [0u8; 8];
        ctx.random.public_random_fill(&mut data);
        self.path_challenge_outstanding = Some(data);
        self.path_validated = false;
        self.notifier
            .buffer_control_frame(ControlFrame::PathChallenge(frame::PathChallenge { data }));
    }

    #[inline]
    pub fn is_path_validated(&self) -> bool {
        self.path_validated
    }

    // === ingress ===

    /// Processes one UDP datagram, which may contain coalesced packets
    ///
    /// On a connection-fatal error the close state is recorded internally
    /// (emit it with [`Self::write_packets`]) and the error is returned.
    pub fn on_datagram(
        &mut self,
        ctx: &mut DispatcherContext,
        datagram: &mut [u8],
        now: Timestamp,
    ) -> Result<(), transport::Error> {
        if self.closed {
            return Ok(());
        }

        let mut offset = 0;
        while offset < datagram.len() {
            let chunk = &mut datagram[offset..];
            let chunk_len = chunk.len();
            let mut collector = FrameCollector::default();

            let outcome = {
                let spaces = &self.spaces;
                self.framer.process_packet(
                    chunk,
                    &self.keys,
                    |space| spaces[space_index(space)].largest_observed(),
                    self.peer_reset_token.as_ref(),
                    &mut collector,
                )
            };

            let (processed, consumed) = match outcome {
                Ok(Some(result)) => result,
                Ok(None) => {
                    // undecryptable; drop the rest of the datagram
                    debug!("dropping undecryptable packet");
                    return Ok(());
                }
                Err(error) => {
                    self.begin_close(error, false);
                    return Err(error);
                }
            };
            debug_assert!(consumed > 0 && consumed <= chunk_len);
            offset += consumed;

            match processed {
                Processed::Packet {
                    packet_number,
                    level,
                    ack_elicitation,
                    version,
                    ..
                } => {
                    if let Some(version) = version {
                        if version != self.version {
                            debug!(version, "dropping packet with unexpected version");
                            continue;
                        }
                    }

                    let index = space_index(packet_number.space());
                    if !self.spaces[index].record_packet_received(packet_number, now) {
                        // duplicate; nothing else to do
                        continue;
                    }

                    if let Err(error) = self.apply_actions(ctx, collector.actions, level, now) {
                        self.begin_close(error, false);
                        return Err(error);
                    }
                    if self.closed {
                        // a CONNECTION_CLOSE arrived; the rest of the
                        // datagram belongs to the draining state
                        return Ok(());
                    }

                    let min_rtt = self.rtt.min_rtt();
                    self.spaces[index].maybe_update_ack_timeout(
                        ack_elicitation.is_ack_eliciting(),
                        packet_number,
                        now,
                        now,
                        min_rtt,
                    );

                    self.idle_timer.set(now + self.idle_timeout);
                }
                Processed::VersionNegotiation { supported_versions } => {
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-6.2
                    //# An endpoint MUST ignore a Version Negotiation packet that
                    //# lists the QUIC version selected by the client.
                    if supported_versions.contains(&self.version) {
                        continue;
                    }
                    let error = transport::Error::HANDSHAKE_FAILED
                        .with_reason("no common protocol version");
                    self.begin_close(error, false);
                    return Err(error);
                }
                Processed::Retry {
                    source_connection_id,
                    token,
                } => {
                    self.retry_token = token;
                    self.peer_connection_id = source_connection_id;
                }
                Processed::StatelessReset => {
                    // silent close; no CONNECTION_CLOSE goes out
                    self.begin_close(transport::Error::PUBLIC_RESET, true);
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    fn apply_actions(
        &mut self,
        ctx: &mut DispatcherContext,
        actions: Vec<FrameAction>,
        level: EncryptionLevel,
        now: Timestamp,
    ) -> Result<(), transport::Error> {
        for action in actions {
            match action {
                FrameAction::Ping => {}
                FrameAction::Ack { ack_delay, ranges } => {
                    self.process_ack(level, ack_delay, &ranges, now)?;
                }
                FrameAction::Crypto { offset, data } => {
                    let index = space_index(PacketNumberSpace::from_encryption_level(level));
                    self.crypto_recv[index]
                        .on_stream_frame(offset, &data, false)
                        .map_err(|_| {
                            transport::Error::INTERNAL_ERROR
                                .with_reason("crypto buffer exceeded")
                        })?;
                }
                FrameAction::Stream {
                    id,
                    offset,
                    fin,
                    data,
                } => {
                    self.process_stream_frame(id, offset, fin, data)?;
                }
                FrameAction::ResetStream(frame) => {
                    let stream_id = StreamId::from_varint(frame.stream_id);
                    self.validate_receivable_stream(stream_id)?;
                    if let Some((_, sequencer)) = self
                        .recv_streams
                        .iter_mut()
                        .find(|(id, _)| *id == stream_id)
                    {
                        sequencer.close_at_offset(frame.final_size.as_u64())?;
                        let notify = sequencer.stop_reading();
                        if notify.on_fin_read {
                            self.on_stream_finished(stream_id);
                        }
                    }
                }
                FrameAction::StopSending(frame) => {
                    let stream_id = StreamId::from_varint(frame.stream_id);
                    self.stop_sending_received
                        .push((stream_id, frame.application_error_code.as_u64()));
                }
                FrameAction::NewToken(token) => {
                    if self.perspective.is_server() {
                        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.7
                        //# A server MUST treat receipt of a NEW_TOKEN frame as a
                        //# connection error of type PROTOCOL_VIOLATION.
                        return Err(transport::Error::PROTOCOL_VIOLATION
                            .with_reason("new token sent to a server"));
                    }
                    self.new_tokens_received.push(token);
                }
                FrameAction::MaxData(frame) => {
                    trace!(limit = frame.maximum_data.as_u64(), "peer raised max_data");
                }
                FrameAction::MaxStreamData(frame) => {
                    trace!(
                        stream = frame.stream_id.as_u64(),
                        limit = frame.maximum_stream_data.as_u64(),
                        "peer raised max_stream_data"
                    );
                }
                FrameAction::MaxStreams(frame) => {
                    let manager = match frame.stream_type {
                        StreamType::Bidirectional => &mut self.bidi_ids,
                        StreamType::Unidirectional => &mut self.uni_ids,
                    };
                    manager.maybe_allow_more_outgoing_streams(frame.maximum_streams.as_u64());
                }
                FrameAction::DataBlocked(frame) => {
                    debug!(limit = frame.data_limit.as_u64(), "peer is data blocked");
                }
                FrameAction::StreamDataBlocked(frame) => {
                    debug!(
                        stream = frame.stream_id.as_u64(),
                        "peer is stream data blocked"
                    );
                }
                FrameAction::StreamsBlocked(frame) => {
                    let manager = match frame.stream_type {
                        StreamType::Bidirectional => &mut self.bidi_ids,
                        StreamType::Unidirectional => &mut self.uni_ids,
                    };
                    if let Some(refresh) = manager.on_streams_blocked(&frame)? {
                        self.notifier
                            .buffer_control_frame(ControlFrame::MaxStreams(refresh));
                    }
                }
                FrameAction::NewConnectionId(frame) => {
                    self.peer_ids.on_new_connection_id(&frame)?;
                    for retirement in self.peer_ids.take_retirements() {
                        self.notifier
                            .buffer_control_frame(ControlFrame::RetireConnectionId(retirement));
                    }
                }
                FrameAction::RetireConnectionId(frame) => {
                    let max_ack_delay = self.ack_settings.local_max_ack_delay;
                    let pto = self.rtt.pto(max_ack_delay);
                    let current = self.local_connection_id;
                    let outcome = self.local_ids.on_retire_connection_id(
                        frame.sequence_number.as_u64(),
                        &current,
                        now,
                        pto,
                        ctx.random.as_mut(),
                        &ctx.reset_secret,
                    )?;
                    if let Some(replacement) = outcome.path_replacement {
                        self.local_connection_id = replacement;
                    }
                    for new_id in outcome.new_ids {
                        self.notifier
                            .buffer_control_frame(ControlFrame::NewConnectionId(new_id));
                    }
                }
                FrameAction::PathChallenge(data) => {
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-8.2.2
                    //# On receiving a PATH_CHALLENGE frame, an endpoint MUST
                    //# respond by echoing the data contained in the
                    //# PATH_CHALLENGE frame in a PATH_RESPONSE frame.
                    self.notifier
                        .buffer_control_frame(ControlFrame::PathResponse(frame::PathResponse {
                            data,
                        }));
                }
                FrameAction::PathResponse(data) => {
                    if self.path_challenge_outstanding == Some(data) {
                        self.path_challenge_outstanding = None;
                        self.path_validated = true;
                        debug!("path validated");
                    }
                }
                FrameAction::ConnectionClose { error_code } => {
                    let error = transport::Error::new(error_code)
                        .with_reason("closed by peer");
                    self.begin_close(error, true);
                }
                FrameAction::HandshakeDone => {
                    if self.perspective.is_server() {
                        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.20
                        //# A server MUST treat receipt of a HANDSHAKE_DONE frame
                        //# as a connection error of type PROTOCOL_VIOLATION.
                        return Err(transport::Error::PROTOCOL_VIOLATION
                            .with_reason("handshake done sent to a server"));
                    }
                    self.on_handshake_confirmed();
                }
                FrameAction::Datagram(data) => {
                    self.received_datagrams.push_back(data);
                }
            }
        }
        Ok(())
    }

    fn validate_receivable_stream(&mut self, stream_id: StreamId) -> Result<(), transport::Error> {
        if stream_id.initiator() == self.perspective {
            // data on a stream we opened; it must actually exist
            let manager = match stream_id.stream_type() {
                StreamType::Bidirectional => &self.bidi_ids,
                StreamType::Unidirectional => &self.uni_ids,
            };
            if stream_id.ordinal() >= manager.outgoing_stream_count() {
                return Err(transport::Error::PROTOCOL_VIOLATION
                    .with_reason("frame for an unopened local stream"));
            }
            return Ok(());
        }
        let manager = match stream_id.stream_type() {
            StreamType::Bidirectional => &mut self.bidi_ids,
            StreamType::Unidirectional => &mut self.uni_ids,
        };
        manager.maybe_increase_largest_peer_stream_id(stream_id)
    }

    fn process_stream_frame(
        &mut self,
        id: VarInt,
        offset: u64,
        fin: bool,
        data: Bytes,
    ) -> Result<(), transport::Error> {
        let stream_id = StreamId::from_varint(id);
        self.validate_receivable_stream(stream_id)?;

        let total_received: u64 = self
            .recv_streams
            .iter()
            .map(|(_, sequencer)| sequencer.highest_offset())
            .sum();
        let end = offset + data.len() as u64;

        let index = match self
            .recv_streams
            .iter()
            .position(|(existing, _)| *existing == stream_id)
        {
            Some(index) => index,
            None => {
                self.recv_streams
                    .push((stream_id, StreamSequencer::new(STREAM_BUFFER_CAPACITY)));
                self.recv_streams.len() - 1
            }
        };

        let previous_high = self.recv_streams[index].1.highest_offset();
        let added = end.saturating_sub(previous_high);
        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
        //# A receiver MUST close the connection with an error of type
        //# FLOW_CONTROL_ERROR if the sender violates the advertised connection
        //# or stream data limits.
        if total_received + added > self.local_max_data {
            return Err(transport::Error::FLOW_CONTROL_ERROR
                .with_reason("connection flow control exceeded"));
        }

        let notify = self.recv_streams[index].1.on_stream_frame(offset, &data, fin)?;
        if notify.on_data_available && !self.readable_streams.contains(&stream_id) {
            self.readable_streams.push(stream_id);
        }
        if notify.on_fin_read {
            self.on_stream_finished(stream_id);
        }
        Ok(())
    }

    fn on_stream_finished(&mut self, stream_id: StreamId) {
        if self.finished_streams.contains(&stream_id) {
            return;
        }
        self.finished_streams.push(stream_id);
        let manager = match stream_id.stream_type() {
            StreamType::Bidirectional => &mut self.bidi_ids,
            StreamType::Unidirectional => &mut self.uni_ids,
        };
        if let Some(max_streams) = manager.on_stream_closed(stream_id) {
            self.notifier
                .buffer_control_frame(ControlFrame::MaxStreams(max_streams));
        }
    }

    fn process_ack(
        &mut self,
        level: EncryptionLevel,
        ack_delay: VarInt,
        ranges: &[(u64, u64)],
        now: Timestamp,
    ) -> Result<(), transport::Error> {
        let space = PacketNumberSpace::from_encryption_level(level);
        let index = space_index(space);
        let Some(&(_, largest_acked)) = ranges.last() else {
            return Ok(());
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-13.1
        //# An endpoint SHOULD treat receipt of an acknowledgment for a packet
        //# it did not send as a connection error of type PROTOCOL_VIOLATION
        if largest_acked >= self.next_packet_number[index] {
            return Err(transport::Error::PROTOCOL_VIOLATION
                .with_reason("ack of an unsent packet"));
        }

        let mut acked_sampler_ids = Vec::new();
        let mut newly_acked_largest: Option<&SentPacketInfo> = None;
        let mut acked_infos = Vec::new();

        let mut kept = VecDeque::with_capacity(self.sent_packets.len());
        for packet in self.sent_packets.drain(..) {
            let in_range = packet.space_index == index
                && ranges
                    .iter()
                    .any(|(start, end)| (*start..=*end).contains(&packet.packet_number));
            if in_range {
                acked_sampler_ids.push(packet.sampler_id);
                acked_infos.push(packet);
            } else {
                kept.push_back(packet);
            }
        }
        self.sent_packets = kept;

        if acked_infos.is_empty() {
            return Ok(());
        }

        for packet in &acked_infos {
            if packet.ack_eliciting {
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.size);
            }
            if packet.packet_number == largest_acked {
                newly_acked_largest = Some(packet);
            }
        }

        // RTT sample from the largest acked packet
        if let Some(largest) = newly_acked_largest {
            let ack_delay = self.ack_settings.decode_ack_delay(ack_delay);
            let measured = now.saturating_duration_since(largest.time_sent);
            let adjusted = measured.saturating_sub(ack_delay).max(K_GRANULARITY);
            self.rtt.update(adjusted);
        }

        self.largest_acked_by_peer[index] = Some(
            self.largest_acked_by_peer[index]
                .map_or(largest_acked, |prev| prev.max(largest_acked)),
        );

        for packet in &acked_infos {
            self.on_packet_acked_frames(packet);
        }

        // loss detection: anything too far below the largest acked is gone
        let lost_threshold = largest_acked.saturating_sub(LOSS_REORDERING_THRESHOLD);
        let mut lost_sampler_ids = Vec::new();
        let mut lost_infos = Vec::new();
        let mut kept = VecDeque::with_capacity(self.sent_packets.len());
        for packet in self.sent_packets.drain(..) {
            if packet.space_index == index && packet.packet_number < lost_threshold {
                lost_sampler_ids.push(packet.sampler_id);
                lost_infos.push(packet);
            } else {
                kept.push_back(packet);
            }
        }
        self.sent_packets = kept;

        for packet in &lost_infos {
            warn!(
                packet_number = packet.packet_number,
                "declaring packet lost"
            );
            if packet.ack_eliciting {
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.size);
            }
            self.on_packet_lost_frames(packet);
        }

        let sample = self.sampler.on_congestion_event(
            now,
            &acked_sampler_ids,
            &lost_sampler_ids,
            self.bandwidth_estimate,
        );
        if !sample.sample_is_app_limited {
            self.bandwidth_estimate = self.bandwidth_estimate.max(sample.sample_max_bandwidth);
        }

        self.pto_count = 0;
        self.rearm_pto(now);
        Ok(())
    }

    fn on_packet_acked_frames(&mut self, packet: &SentPacketInfo) {
        for frame in &packet.frames {
            match frame {
                SentFrameInfo::Stream {
                    id,
                    offset,
                    len,
                    fin,
                } => {
                    self.notifier.on_stream_frame_acked(*id, *offset, *len, *fin);
                }
                SentFrameInfo::Crypto { level, offset, len } => {
                    self.notifier.on_crypto_frame_acked(*level, *offset, *len);
                }
                SentFrameInfo::Control { control_frame_id } => {
                    self.notifier.on_control_frame_acked(*control_frame_id);
                }
                SentFrameInfo::Ack { largest_acked } => {
                    // the peer saw our ACK; older received state can be
                    // trimmed
                    if let Some(least_unacked) = largest_acked.next() {
                        let index = space_index(largest_acked.space());
                        self.spaces[index].dont_wait_for_packets_before(least_unacked);
                    }
                }
                SentFrameInfo::Datagram => {}
            }
        }
    }

    fn on_packet_lost_frames(&mut self, packet: &SentPacketInfo) {
        for frame in &packet.frames {
            match frame {
                SentFrameInfo::Stream {
                    id,
                    offset,
                    len,
                    fin,
                } => {
                    self.notifier.on_stream_frame_lost(*id, *offset, *len, *fin);
                }
                SentFrameInfo::Crypto { level, offset, len } => {
                    self.notifier.on_crypto_frame_lost(*level, *offset, *len);
                }
                SentFrameInfo::Control { control_frame_id } => {
                    self.notifier.on_control_frame_lost(*control_frame_id);
                }
                // lost ACKs and DATAGRAMs are never retransmitted
                SentFrameInfo::Ack { .. } | SentFrameInfo::Datagram => {}
            }
        }
    }

    // === timers ===

    /// The earliest deadline across every armed timer
    pub fn earliest_deadline(&self) -> Option<Timestamp> {
        let mut deadline = self.idle_timer.earliest(None);
        deadline = self.handshake_timer.earliest(deadline);
        deadline = self.pto_timer.earliest(deadline);
        for space in &self.spaces {
            deadline = space.ack_timeout().earliest(deadline);
        }
        match (deadline, self.local_ids.retirement_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Dispatches every expired timer
    ///
    /// Call [`Self::write_packets`] afterwards; firings usually produce
    /// frames (acks, retransmissions, a CONNECTION_CLOSE).
    pub fn on_timeout(&mut self, _ctx: &mut DispatcherContext, now: Timestamp) {
        if self.idle_timer.poll_expiration(now) {
            debug!("idle timeout");
            self.begin_close(
                transport::Error::NETWORK_IDLE_TIMEOUT.with_reason("idle timeout"),
                false,
            );
            return;
        }

        if !self.handshake_confirmed && self.handshake_timer.poll_expiration(now) {
            self.begin_close(
                transport::Error::HANDSHAKE_TIMEOUT.with_reason("handshake timed out"),
                false,
            );
            return;
        }

        if self.pto_timer.poll_expiration(now) {
            self.on_pto(now);
        }

        self.local_ids.poll_retirements(now);
    }

    fn on_pto(&mut self, now: Timestamp) {
        self.pto_count += 1;
        if self.pto_count >= MAX_PTOS {
            self.begin_close(
                transport::Error::TOO_MANY_RTOS.with_reason("network blackholed"),
                false,
            );
            return;
        }

        // force the oldest in-flight data back into the retransmission
        // queues; the probe carries it
        let oldest = self
            .sent_packets
            .iter()
            .filter(|packet| packet.ack_eliciting)
            .min_by_key(|packet| packet.time_sent);
        if let Some(packet) = oldest {
            let packet_number = packet.packet_number;
            let space_idx = packet.space_index;
            let Some(position) = self
                .sent_packets
                .iter()
                .position(|candidate| {
                    candidate.packet_number == packet_number
                        && candidate.space_index == space_idx
                })
            else {
                return;
            };
            let Some(packet) = self.sent_packets.remove(position) else {
                return;
            };
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.size);
            self.on_packet_lost_frames(&packet);
            self.sampler
                .on_congestion_event(now, &[], &[packet.sampler_id], self.bandwidth_estimate);
        }

        self.rearm_pto(now);
    }

    fn rearm_pto(&mut self, now: Timestamp) {
        if self.bytes_in_flight == 0 {
            self.pto_timer.cancel();
            return;
        }
        let backoff = 1u32 << self.pto_count.min(6);
        let pto = self.rtt.pto(self.ack_settings.local_max_ack_delay) * backoff;
        self.pto_timer.set(now + pto);
    }

    // === egress ===

    /// Assembles and sends every pending frame
    pub fn write_packets<W: PacketWriter>(
        &mut self,
        ctx: &mut DispatcherContext,
        writer: &mut W,
        now: Timestamp,
    ) {
        let _ = ctx;
        self.flush_queued(writer);
        if self.writer_blocked {
            return;
        }

        // a pending CONNECTION_CLOSE preempts everything else
        if let Some(error) = self.pending_close_frame.take() {
            self.send_connection_close(error, writer, now);
            return;
        }
        if self.closed {
            return;
        }

        let mut assembler = PacketAssembler::new();

        // acknowledgments whose alarm fired, or with updated state worth
        // bundling into packets we are sending anyway
        let will_send_data = self.notifier.has_pending_data()
            || !self.pending_datagram_frames.is_empty();
        for index in 0..3 {
            let due = self.spaces[index]
                .ack_deadline()
                .map_or(false, |deadline| deadline.has_elapsed(now));
            let bundle = will_send_data && self.spaces[index].ack_frame_updated();
            if !(due || bundle) {
                continue;
            }
            if let Some(pending) = self.spaces[index].get_updated_ack_frame(now) {
                let ack = frame::Ack {
                    ack_delay: self.ack_settings.encode_ack_delay(pending.ack_delay),
                    ack_ranges: pending.ranges,
                    ecn_counts: None,
                };
                assembler.push_frame(
                    level_for_space_index(index),
                    ack.encode_to_vec(),
                    SentFrameInfo::Ack {
                        largest_acked: pending.largest_acked,
                    },
                    AckElicitation::NonEliciting,
                );
                self.spaces[index].reset_ack_states();
            }
        }

        self.notifier.on_can_write(&mut assembler);

        assembler.set_transmission_type(TransmissionType::NotRetransmission);
        while let Some(data) = self.pending_datagram_frames.pop_front() {
            let datagram = frame::Datagram {
                is_last_frame: false,
                data: &data[..],
            };
            if !assembler.push_frame(
                EncryptionLevel::OneRtt,
                datagram.encode_to_vec(),
                SentFrameInfo::Datagram,
                AckElicitation::Eliciting,
            ) {
                self.pending_datagram_frames.push_front(data);
                break;
            }
        }

        self.seal_and_send(assembler, writer, now);
    }

    fn seal_and_send<W: PacketWriter>(
        &mut self,
        assembler: PacketAssembler,
        writer: &mut W,
        now: Timestamp,
    ) {
        for packet in assembler.packets {
            if packet.payload.is_empty() {
                continue;
            }
            trace!(
                level = ?packet.level,
                transmission_type = ?packet.transmission_type,
                len = packet.payload.len(),
                "sealing packet"
            );

            let eliciting = packet.ack_elicitation.is_ack_eliciting();
            if !eliciting {
                // bound the run of packets carrying nothing retransmittable
                if self.consecutive_non_retransmittable
                    >= MAX_CONSECUTIVE_NON_RETRANSMITTABLE_PACKETS
                {
                    trace!("suppressing non-retransmittable packet, budget exhausted");
                    continue;
                }
                self.consecutive_non_retransmittable += 1;
            } else {
                self.consecutive_non_retransmittable = 0;
            }

            let index = space_index(PacketNumberSpace::from_encryption_level(packet.level));
            let space = space_for_index(index);
            let packet_number_value = self.next_packet_number[index];
            let Ok(packet_number_varint) = VarInt::new(packet_number_value) else {
                self.begin_close(
                    transport::Error::INTERNAL_ERROR.with_reason("packet number exhausted"),
                    false,
                );
                return;
            };
            let packet_number = space.new_packet_number(packet_number_varint);
            let largest_acked = self.largest_acked_by_peer[index]
                .and_then(|value| VarInt::new(value).ok())
                .map(|value| space.new_packet_number(value));

            let header = self.header_for_level(packet.level);
            let mut buffer = [0u8; MAX_DATAGRAM_SIZE + 300];
            let payload = packet.payload;
            let built = self.framer.build_packet(
                &self.keys,
                &header,
                packet_number,
                largest_acked,
                |encoder| {
                    use s2n_codec::Encoder as _;
                    encoder.write_slice(&payload);
                },
                &mut buffer,
            );

            let len = match built {
                Ok(len) => len,
                Err(error) => {
                    warn!(?error, "packet build failed");
                    continue;
                }
            };

            self.next_packet_number[index] += 1;
            let sampler_id = self.next_sampler_id;
            self.next_sampler_id += 1;

            if eliciting {
                self.bytes_in_flight += len as u64;
            }
            self.sampler
                .on_packet_sent(sampler_id, len as u64, self.bytes_in_flight, now, eliciting);
            self.sent_packets.push_back(SentPacketInfo {
                packet_number: packet_number_value,
                space_index: index,
                sampler_id,
                size: len as u64,
                ack_eliciting: eliciting,
                time_sent: now,
                frames: packet.frames,
            });

            self.send_datagram_bytes(Bytes::copy_from_slice(&buffer[..len]), writer);
            if eliciting {
                self.rearm_pto(now);
            }
            if self.writer_blocked {
                return;
            }
        }
    }

    fn header_for_level(&self, level: EncryptionLevel) -> Header {
        match level {
            EncryptionLevel::Initial => Header::Initial {
                version: self.version,
                destination_connection_id: self.peer_connection_id,
                source_connection_id: self.local_connection_id,
                token: self.retry_token.clone(),
            },
            EncryptionLevel::ZeroRtt => Header::ZeroRtt {
                version: self.version,
                destination_connection_id: self.peer_connection_id,
                source_connection_id: self.local_connection_id,
            },
            EncryptionLevel::Handshake => Header::Handshake {
                version: self.version,
                destination_connection_id: self.peer_connection_id,
                source_connection_id: self.local_connection_id,
            },
            EncryptionLevel::OneRtt => Header::Short {
                destination_connection_id: self.peer_connection_id,
                spin_bit: false,
                key_phase: false,
            },
        }
    }

    fn highest_usable_level(&self) -> EncryptionLevel {
        for level in [
            EncryptionLevel::OneRtt,
            EncryptionLevel::Handshake,
            EncryptionLevel::Initial,
        ] {
            if self.keys.has_keys(level) {
                return level;
            }
        }
        EncryptionLevel::Initial
    }

    fn send_connection_close<W: PacketWriter>(
        &mut self,
        error: transport::Error,
        writer: &mut W,
        now: Timestamp,
    ) {
        let level = self.highest_usable_level();
        let index = space_index(PacketNumberSpace::from_encryption_level(level));
        let space = space_for_index(index);
        let Ok(packet_number_varint) = VarInt::new(self.next_packet_number[index]) else {
            return;
        };
        let packet_number = space.new_packet_number(packet_number_varint);

        let close_frame: frame::ConnectionClose = error.into();
        let header = self.header_for_level(level);
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE + 300];
        let built = self.framer.build_packet(
            &self.keys,
            &header,
            packet_number,
            None,
            |encoder| {
                use s2n_codec::Encoder as _;
                encoder.encode(&close_frame);
            },
            &mut buffer,
        );

        if let Ok(len) = built {
            self.next_packet_number[index] += 1;
            let bytes = Bytes::copy_from_slice(&buffer[..len]);
            // saved for the time-wait list to replay
            self.termination_packets.push(bytes.clone());
            self.send_datagram_bytes(bytes, writer);
        }
        let _ = now;
    }

    fn send_datagram_bytes<W: PacketWriter>(&mut self, bytes: Bytes, writer: &mut W) {
        if self.writer_blocked {
            self.queued_egress.push_back(bytes);
            return;
        }
        match writer.write_packet(&bytes, self.peer_address) {
            WriteResult::Ok => {}
            WriteResult::Blocked => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-13
                //# An endpoint that is unable to send ... should queue the
                //# data until the path becomes writable again.
                self.writer_blocked = true;
                self.queued_egress.push_back(bytes);
            }
            WriteResult::Error => {
                self.begin_close(
                    transport::Error::INTERNAL_ERROR.with_reason("packet writer failed"),
                    false,
                );
            }
        }
    }

    fn flush_queued<W: PacketWriter>(&mut self, writer: &mut W) {
        while let Some(bytes) = self.queued_egress.pop_front() {
            match writer.write_packet(&bytes, self.peer_address) {
                WriteResult::Ok => {}
                WriteResult::Blocked => {
                    self.queued_egress.push_front(bytes);
                    self.writer_blocked = true;
                    return;
                }
                WriteResult::Error => {
                    self.begin_close(
                        transport::Error::INTERNAL_ERROR.with_reason("packet writer failed"),
                        false,
                    );
                    return;
                }
            }
        }
        self.writer_blocked = false;
    }

    /// Re-enters the send path after the platform socket became writable
    pub fn on_blocked_writer_can_write<W: PacketWriter>(
        &mut self,
        ctx: &mut DispatcherContext,
        writer: &mut W,
        now: Timestamp,
    ) {
        self.writer_blocked = false;
        self.write_packets(ctx, writer, now);
    }

    fn begin_close(&mut self, error: transport::Error, remote: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.close_event = Some(CloseEvent { error, remote });
        if !remote && !error.is_silent() {
            self.pending_close_frame = Some(error);
        }
        self.idle_timer.permanent_cancel();
        self.handshake_timer.permanent_cancel();
        self.pto_timer.permanent_cancel();
    }

    /// Closes the connection locally
    pub fn close(&mut self, error: transport::Error) {
        self.begin_close(error, false);
    }

    /// The time-wait handoff for this connection, once it is closed
    pub fn time_wait_parts(&self) -> (TimeWaitAction, Vec<ConnectionId>, Vec<Bytes>) {
        debug_assert!(self.closed);
        let action = match &self.close_event {
            Some(event) if event.remote => TimeWaitAction::DoNothing,
            Some(event) if event.error.is_silent() => TimeWaitAction::DoNothing,
            Some(_) => TimeWaitAction::SendTerminationPackets,
            None => TimeWaitAction::SendStatelessReset,
        };
        let mut ids = self.local_ids.routing_ids();
        if ids.is_empty() {
            ids.push(self.local_connection_id);
        }
        (action, ids, self.termination_packets.clone())
    }

    #[inline]
    pub fn is_handshake_confirmed(&self) -> bool {
        self.handshake_confirmed
    }

    #[cfg(test)]
    pub(crate) fn sampler(&self) -> &BandwidthSampler {
        &self.sampler
    }

    #[cfg(test)]
    pub(crate) fn bandwidth_estimate(&self) -> Bandwidth {
        self.bandwidth_estimate
    }

    #[cfg(test)]
    pub(crate) fn rtt_smoothed(&self) -> Duration {
        self.rtt.smoothed_rtt()
    }

    #[cfg(test)]
    pub(crate) fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }
}

#[cfg(test)]
mod tests;
