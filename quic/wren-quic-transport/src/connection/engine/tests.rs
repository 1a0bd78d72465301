// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use wren_quic_core::{
    crypto::testing::Protection,
    time::testing::now as at,
    transport::parameters::TransportParameters,
};

#[derive(Debug, Default)]
struct VecWriter {
    datagrams: Vec<Bytes>,
    blocked: bool,
}

impl VecWriter {
    fn drain(&mut self) -> Vec<Bytes> {
        core::mem::take(&mut self.datagrams)
    }
}

impl PacketWriter for VecWriter {
    fn write_packet(&mut self, buffer: &[u8], _peer_address: SocketAddr) -> WriteResult {
        if self.blocked {
            return WriteResult::Blocked;
        }
        self.datagrams.push(Bytes::copy_from_slice(buffer));
        WriteResult::Ok
    }
}

fn cid(value: u8) -> ConnectionId {
    ConnectionId::try_from_bytes(&[value; 8]).unwrap()
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn peer_params() -> TransportParameters {
    TransportParameters {
        initial_max_streams_bidi: VarInt::from_u8(3),
        initial_max_streams_uni: VarInt::from_u8(3),
        ..Default::default()
    }
}

fn pair(now: Timestamp) -> (Engine<Protection>, Engine<Protection>) {
    let client_config = Config::new(endpoint::Type::Client, cid(0xc1), cid(0x51), addr(443));
    let server_config = Config::new(endpoint::Type::Server, cid(0x51), cid(0xc1), addr(1234));

    let mut client = Engine::new(client_config, Protection::default(), now);
    let mut server = Engine::new(server_config, Protection::default(), now);
    client.on_transport_parameters(&peer_params());
    server.on_transport_parameters(&peer_params());
    (client, server)
}

/// Feeds every datagram in `writer` into `engine`
fn deliver(
    engine: &mut Engine<Protection>,
    ctx: &mut DispatcherContext,
    writer: &mut VecWriter,
    now: Timestamp,
) -> Result<(), transport::Error> {
    for datagram in writer.drain() {
        let mut bytes = datagram.to_vec();
        engine.on_datagram(ctx, &mut bytes, now)?;
    }
    Ok(())
}

#[test]
fn stream_round_trip_with_ack_and_bandwidth_sample() {
    let mut ctx = DispatcherContext::for_testing();
    let (mut client, mut server) = pair(at(0));
    let mut client_writer = VecWriter::default();
    let mut server_writer = VecWriter::default();

    // client sends one datagram with a 512-byte finned stream frame
    let stream_id = client.open_stream(StreamType::Bidirectional).unwrap();
    assert_eq!(stream_id.as_u64(), 0);
    client.write_stream(stream_id, Bytes::from(vec![0x42; 512]), true);
    client.write_packets(&mut ctx, &mut client_writer, at(0));
    assert_eq!(client_writer.datagrams.len(), 1);
    assert!(client.bytes_in_flight() > 0);

    // the server delivers the bytes in order and observes the fin
    deliver(&mut server, &mut ctx, &mut client_writer, at(5)).unwrap();
    assert_eq!(server.poll_readable_stream(), Some(stream_id));
    let mut out = [0u8; 1024];
    let (copied, finished) = server.read_stream(stream_id, &mut out).unwrap();
    assert_eq!(copied, 512);
    assert!(finished);
    assert!(out[..512].iter().all(|byte| *byte == 0x42));

    // the delayed-ack timer fires and the server acknowledges
    server.write_packets(&mut ctx, &mut server_writer, at(31));
    assert_eq!(server_writer.datagrams.len(), 1);

    // the client absorbs the ACK: one sample, not app limited
    deliver(&mut client, &mut ctx, &mut server_writer, at(36)).unwrap();
    assert_eq!(client.bytes_in_flight(), 0);
    assert_eq!(client.sampler().tracked_packet_count(), 0);
    assert!(client.sampler().total_bytes_acked() > 512);
    assert!(!client.sampler().is_app_limited());
    assert!(client.bandwidth_estimate() > Bandwidth::ZERO);
    // rtt = 36ms transit minus the peer-reported ack delay
    assert!(client.rtt_smoothed() <= Duration::from_millis(36));
}

#[test]
fn server_retransmits_after_acks_reveal_a_gap() {
    let mut ctx = DispatcherContext::for_testing();
    let (mut client, mut server) = pair(at(0));
    let mut client_writer = VecWriter::default();
    let mut server_writer = VecWriter::default();

    let stream_id = client.open_stream(StreamType::Bidirectional).unwrap();

    // five packets, the first of which is "lost" in transit
    let mut lost = None;
    for i in 0..5u64 {
        client.write_stream(stream_id, Bytes::from(vec![i as u8; 600]), false);
        client.write_packets(&mut ctx, &mut client_writer, at(i));
        for datagram in client_writer.drain() {
            if lost.is_none() {
                lost = Some(datagram);
                continue;
            }
            let mut bytes = datagram.to_vec();
            server.on_datagram(&mut ctx, &mut bytes, at(i + 1)).unwrap();
        }
    }
    assert!(lost.is_some());

    // server acks what it saw
    server.write_packets(&mut ctx, &mut server_writer, at(40));
    deliver(&mut client, &mut ctx, &mut server_writer, at(45)).unwrap();

    // the loss threshold declares packet 0 lost; its range is rewritten
    client.write_packets(&mut ctx, &mut client_writer, at(46));
    assert!(!client_writer.datagrams.is_empty());
    deliver(&mut server, &mut ctx, &mut client_writer, at(50)).unwrap();

    // the gap is filled: all 3000 bytes arrive
    let mut out = vec![0u8; 4096];
    let (copied, _) = server.read_stream(stream_id, &mut out).unwrap();
    assert_eq!(copied, 3000);
}

#[test]
fn path_challenge_is_echoed_and_validates_the_path() {
    let mut ctx = DispatcherContext::for_testing();
    let (mut client, mut server) = pair(at(0));
    let mut client_writer = VecWriter::default();
    let mut server_writer = VecWriter::default();

    client.initiate_path_validation(&mut ctx);
    assert!(!client.is_path_validated());
    client.write_packets(&mut ctx, &mut client_writer, at(0));

    deliver(&mut server, &mut ctx, &mut client_writer, at(5)).unwrap();
    server.write_packets(&mut ctx, &mut server_writer, at(6));

    deliver(&mut client, &mut ctx, &mut server_writer, at(10)).unwrap();
    assert!(client.is_path_validated());
}

#[test]
fn handshake_done_confirms_the_client() {
    let mut ctx = DispatcherContext::for_testing();
    let (mut client, mut server) = pair(at(0));
    let mut server_writer = VecWriter::default();

    server.on_handshake_confirmed();
    server.write_packets(&mut ctx, &mut server_writer, at(0));

    assert!(!client.is_handshake_confirmed());
    deliver(&mut client, &mut ctx, &mut server_writer, at(5)).unwrap();
    assert!(client.is_handshake_confirmed());
}

#[test]
fn local_close_emits_connection_close_and_the_peer_drains() {
    let mut ctx = DispatcherContext::for_testing();
    let (mut client, mut server) = pair(at(0));
    let mut client_writer = VecWriter::default();

    client.close(transport::Error::NO_ERROR.with_reason("done"));
    client.write_packets(&mut ctx, &mut client_writer, at(1));
    assert_eq!(client_writer.datagrams.len(), 1);

    let local_event = client.poll_close_event().unwrap();
    assert!(!local_event.remote);
    // exactly once
    assert!(client.poll_close_event().is_none());

    deliver(&mut server, &mut ctx, &mut client_writer, at(5)).unwrap();
    let event = server.poll_close_event().unwrap();
    assert!(event.remote);
    assert!(server.is_closed());

    // peer-initiated closes drain silently in time-wait
    let (action, ids, _) = server.time_wait_parts();
    assert_eq!(action, TimeWaitAction::DoNothing);
    assert!(!ids.is_empty());

    // local closes replay their termination packet
    let (action, _, packets) = client.time_wait_parts();
    assert_eq!(action, TimeWaitAction::SendTerminationPackets);
    assert_eq!(packets.len(), 1);
}

#[test]
fn idle_timeout_closes_the_connection() {
    let mut ctx = DispatcherContext::for_testing();
    let (mut client, _) = pair(at(0));

    // with the handshake confirmed, the idle detector owns the deadline
    client.on_handshake_confirmed();
    let deadline = client.earliest_deadline().unwrap();
    assert_eq!(deadline, at(0) + Duration::from_secs(30));

    client.on_timeout(&mut ctx, at(31_000));
    let event = client.poll_close_event().unwrap();
    assert_eq!(event.error.code, transport::Error::NETWORK_IDLE_TIMEOUT.code);
    assert!(!event.remote);
}

#[test]
fn handshake_timeout_closes_unconfirmed_connections() {
    let mut ctx = DispatcherContext::for_testing();
    let (mut client, _) = pair(at(0));

    client.on_timeout(&mut ctx, at(10_500));
    let event = client.poll_close_event().unwrap();
    assert_eq!(event.error.code, transport::Error::HANDSHAKE_TIMEOUT.code);
}

#[test]
fn blocked_writer_queues_and_drains() {
    let mut ctx = DispatcherContext::for_testing();
    let (mut client, _) = pair(at(0));
    let mut writer = VecWriter {
        blocked: true,
        ..Default::default()
    };

    let stream_id = client.open_stream(StreamType::Bidirectional).unwrap();
    client.write_stream(stream_id, Bytes::from_static(b"blocked data"), false);
    client.write_packets(&mut ctx, &mut writer, at(0));
    assert!(writer.datagrams.is_empty());

    writer.blocked = false;
    client.on_blocked_writer_can_write(&mut ctx, &mut writer, at(1));
    assert_eq!(writer.datagrams.len(), 1);
}

#[test]
fn datagram_frames_are_delivered_unreliably() {
    let mut ctx = DispatcherContext::for_testing();
    let (mut client, mut server) = pair(at(0));
    let mut client_writer = VecWriter::default();

    client.send_datagram(Bytes::from_static(b"fire and forget"));
    client.write_packets(&mut ctx, &mut client_writer, at(0));

    deliver(&mut server, &mut ctx, &mut client_writer, at(2)).unwrap();
    assert_eq!(
        server.poll_received_datagram().as_deref(),
        Some(&b"fire and forget"[..])
    );
    assert!(server.poll_received_datagram().is_none());
}

#[test]
fn acking_an_unsent_packet_is_a_protocol_violation() {
    let mut ctx = DispatcherContext::for_testing();
    let (mut client, mut server) = pair(at(0));
    let mut client_writer = VecWriter::default();
    let mut server_writer = VecWriter::default();

    // the server never sent anything, but the client acknowledges a packet:
    // drive this by having the client receive data and ack it, then feeding
    // the ack to a fresh server which has sent nothing
    let stream_id = server.open_stream(StreamType::Bidirectional).unwrap();
    server.write_stream(stream_id, Bytes::from_static(b"hello"), false);
    server.write_packets(&mut ctx, &mut server_writer, at(0));
    deliver(&mut client, &mut ctx, &mut server_writer, at(1)).unwrap();
    client.write_packets(&mut ctx, &mut client_writer, at(40));

    let (_, mut fresh_server) = pair(at(0));
    let mut error = None;
    for datagram in client_writer.drain() {
        let mut bytes = datagram.to_vec();
        if let Err(e) = fresh_server.on_datagram(&mut ctx, &mut bytes, at(41)) {
            error = Some(e);
        }
    }
    let error = error.unwrap();
    assert_eq!(error.code, transport::Error::PROTOCOL_VIOLATION.code);
    assert!(fresh_server.is_closed());
}

#[test]
fn stream_limit_violation_closes_the_connection() {
    let mut ctx = DispatcherContext::for_testing();
    let (mut client, _) = pair(at(0));
    // server only tolerates a single incoming bidi stream
    let server_config = Config {
        max_open_incoming_bidi_streams: 1,
        ..Config::new(endpoint::Type::Server, cid(0x51), cid(0xc1), addr(1234))
    };
    let mut server = Engine::new(server_config, Protection::default(), at(0));
    server.on_transport_parameters(&peer_params());

    let mut client_writer = VecWriter::default();
    for _ in 0..2 {
        let id = client.open_stream(StreamType::Bidirectional).unwrap();
        client.write_stream(id, Bytes::from_static(b"x"), false);
    }
    client.write_packets(&mut ctx, &mut client_writer, at(0));

    let mut failed = false;
    for datagram in client_writer.drain() {
        let mut bytes = datagram.to_vec();
        if server.on_datagram(&mut ctx, &mut bytes, at(1)).is_err() {
            failed = true;
        }
    }
    assert!(failed);
    let event = server.poll_close_event().unwrap();
    assert_eq!(event.error.code, transport::Error::STREAM_LIMIT_ERROR.code);
}
