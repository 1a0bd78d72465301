// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::{
    crypto::testing::Protection,
    frame::{self, ack::AckRangesDecoder},
    packet::{Header, QUIC_VERSION_1},
    random::testing::Generator as TestGenerator,
};
use s2n_codec::{DecoderBufferMut, DecoderError};

/// Records the tag of every dispatched frame
#[derive(Debug, Default)]
struct TagVisitor {
    tags: Vec<u8>,
    stream_data: Vec<u8>,
}

macro_rules! record {
    ($($handler:ident, $ty:ty;)*) => {
        $(
            fn $handler(&mut self, frame: $ty) -> Result<(), DecoderError> {
                self.tags.push(frame.tag());
                Ok(())
            }
        )*
    };
}

impl<'a> frame::FrameDecoder<'a, AckRangesDecoder<'a>, DecoderBufferMut<'a>> for TagVisitor {
    type Output = ();

    record!(
        handle_padding_frame, frame::Padding;
        handle_ping_frame, frame::Ping;
        handle_ack_frame, frame::Ack<AckRangesDecoder<'a>>;
        handle_reset_stream_frame, frame::ResetStream;
        handle_stop_sending_frame, frame::StopSending;
        handle_crypto_frame, frame::Crypto<DecoderBufferMut<'a>>;
        handle_new_token_frame, frame::NewToken<'a>;
        handle_max_data_frame, frame::MaxData;
        handle_max_stream_data_frame, frame::MaxStreamData;
        handle_max_streams_frame, frame::MaxStreams;
        handle_data_blocked_frame, frame::DataBlocked;
        handle_stream_data_blocked_frame, frame::StreamDataBlocked;
        handle_streams_blocked_frame, frame::StreamsBlocked;
        handle_new_connection_id_frame, frame::NewConnectionId;
        handle_retire_connection_id_frame, frame::RetireConnectionId;
        handle_path_challenge_frame, frame::PathChallenge;
        handle_path_response_frame, frame::PathResponse;
        handle_connection_close_frame, frame::ConnectionClose<'a>;
        handle_handshake_done_frame, frame::HandshakeDone;
        handle_datagram_frame, frame::Datagram<DecoderBufferMut<'a>>;
    );

    fn handle_stream_frame(
        &mut self,
        frame: frame::Stream<DecoderBufferMut<'a>>,
    ) -> Result<(), DecoderError> {
        self.tags.push(frame.tag());
        self.stream_data
            .extend_from_slice(frame.data.into_less_safe_slice());
        Ok(())
    }
}

fn cid(bytes: &[u8]) -> ConnectionId {
    ConnectionId::try_from_bytes(bytes).unwrap()
}

fn server_framer() -> Framer {
    Framer::new(endpoint::Type::Server, 8)
}

fn client_framer() -> Framer {
    Framer::new(endpoint::Type::Client, 8)
}

fn app_packet_number(value: u32) -> PacketNumber {
    PacketNumberSpace::ApplicationData.new_packet_number(VarInt::from_u32(value))
}

fn initial_packet_number(value: u32) -> PacketNumber {
    PacketNumberSpace::Initial.new_packet_number(VarInt::from_u32(value))
}

#[test]
fn initial_packet_round_trip() {
    let framer = server_framer();
    let keys = Protection::default();
    let header = Header::Initial {
        version: QUIC_VERSION_1,
        destination_connection_id: cid(&[1, 2, 3, 4, 5, 6, 7, 8]),
        source_connection_id: cid(&[9, 10, 11, 12]),
        token: b"retry-token".to_vec(),
    };

    let mut output = [0u8; 1500];
    let len = framer
        .build_packet(
            &keys,
            &header,
            initial_packet_number(0),
            None,
            |encoder| {
                encoder.encode(&frame::Crypto {
                    offset: VarInt::ZERO,
                    data: &b"client hello"[..],
                });
                encoder.encode(&frame::Padding { length: 64 });
            },
            &mut output,
        )
        .unwrap();

    let mut visitor = TagVisitor::default();
    let (processed, consumed) = framer
        .process_packet(
            &mut output[..len],
            &keys,
            |_| None,
            None,
            &mut visitor,
        )
        .unwrap()
        .unwrap();

    assert_eq!(consumed, len);
    match processed {
        Processed::Packet {
            packet_number,
            level,
            ack_elicitation,
            version,
            ..
        } => {
            assert_eq!(packet_number, initial_packet_number(0));
            assert_eq!(level, EncryptionLevel::Initial);
            assert!(ack_elicitation.is_ack_eliciting());
            assert_eq!(version, Some(QUIC_VERSION_1));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(visitor.tags, vec![0x06, 0x00]);
}

#[test]
fn short_packet_round_trip() {
    let framer = server_framer();
    let keys = Protection::default();
    let dcid = cid(&[1, 2, 3, 4, 5, 6, 7, 8]);
    let header = Header::Short {
        destination_connection_id: dcid,
        spin_bit: false,
        key_phase: false,
    };

    let mut output = [0u8; 1500];
    let len = framer
        .build_packet(
            &keys,
            &header,
            app_packet_number(1),
            Some(app_packet_number(0)),
            |encoder| {
                encoder.encode(&frame::Stream {
                    stream_id: VarInt::ZERO,
                    offset: VarInt::ZERO,
                    is_last_frame: true,
                    is_fin: true,
                    data: &[0x42u8; 512][..],
                });
            },
            &mut output,
        )
        .unwrap();

    let mut visitor = TagVisitor::default();
    let (processed, consumed) = framer
        .process_packet(
            &mut output[..len],
            &keys,
            |_| Some(app_packet_number(0)),
            None,
            &mut visitor,
        )
        .unwrap()
        .unwrap();

    assert_eq!(consumed, len);
    match processed {
        Processed::Packet {
            packet_number,
            level,
            destination_connection_id,
            ..
        } => {
            assert_eq!(packet_number, app_packet_number(1));
            assert_eq!(level, EncryptionLevel::OneRtt);
            assert_eq!(destination_connection_id, dcid);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    // STREAM with fin, no length/offset
    assert_eq!(visitor.tags, vec![0x08 | 0x01]);
    assert_eq!(visitor.stream_data.len(), 512);
}

#[test]
fn coalesced_packets_consume_their_own_length() {
    let framer = server_framer();
    let keys = Protection::default();
    let dcid = cid(&[1, 2, 3, 4, 5, 6, 7, 8]);
    let scid = cid(&[9, 10, 11, 12]);

    let mut datagram = vec![0u8; 3000];
    let initial_len = framer
        .build_packet(
            &keys,
            &Header::Initial {
                version: QUIC_VERSION_1,
                destination_connection_id: dcid,
                source_connection_id: scid,
                token: Vec::new(),
            },
            initial_packet_number(0),
            None,
            |encoder| encoder.encode(&frame::Ping),
            &mut datagram,
        )
        .unwrap();
    let handshake_len = framer
        .build_packet(
            &keys,
            &Header::Handshake {
                version: QUIC_VERSION_1,
                destination_connection_id: dcid,
                source_connection_id: scid,
            },
            PacketNumberSpace::Handshake.new_packet_number(VarInt::ZERO),
            None,
            |encoder| encoder.encode(&frame::Ping),
            &mut datagram[initial_len..],
        )
        .unwrap();
    datagram.truncate(initial_len + handshake_len);

    let mut visitor = TagVisitor::default();
    let (first, consumed) = framer
        .process_packet(&mut datagram, &keys, |_| None, None, &mut visitor)
        .unwrap()
        .unwrap();
    assert_eq!(consumed, initial_len);
    assert!(matches!(
        first,
        Processed::Packet {
            level: EncryptionLevel::Initial,
            ..
        }
    ));

    let (second, consumed) = framer
        .process_packet(&mut datagram[initial_len..], &keys, |_| None, None, &mut visitor)
        .unwrap()
        .unwrap();
    assert_eq!(consumed, handshake_len);
    assert!(matches!(
        second,
        Processed::Packet {
            level: EncryptionLevel::Handshake,
            ..
        }
    ));
}

#[test]
fn version_negotiation_is_surfaced_to_clients() {
    let framer = server_framer();
    let mut random = TestGenerator::default();
    let mut output = [0u8; 256];
    let len = framer.write_version_negotiation(
        &cid(&[1, 2, 3, 4]),
        &cid(&[5, 6, 7, 8]),
        &[QUIC_VERSION_1, 0xff00_001d],
        &mut random,
        &mut output,
    );

    let keys = Protection::default();
    let mut visitor = TagVisitor::default();
    let (processed, _) = client_framer()
        .process_packet(&mut output[..len], &keys, |_| None, None, &mut visitor)
        .unwrap()
        .unwrap();

    match processed {
        Processed::VersionNegotiation { supported_versions } => {
            assert_eq!(supported_versions, vec![QUIC_VERSION_1, 0xff00_001d]);
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    // servers fail the connection instead
    assert!(server_framer()
        .process_packet(&mut output[..len], &keys, |_| None, None, &mut visitor)
        .is_err());
}

#[test]
fn undecryptable_short_packet_with_token_match_is_a_stateless_reset() {
    let framer = client_framer();
    let keys = Protection::default();
    let token = stateless_reset::Token::from([0x5c; 16]);
    let mut random = TestGenerator::default();

    let mut output = [0u8; 128];
    let len = framer
        .write_stateless_reset(token, 100, &mut random, &mut output)
        .unwrap();
    assert_eq!(len, 99);

    let mut visitor = TagVisitor::default();
    let outcome = framer
        .process_packet(
            &mut output[..len],
            &keys,
            |_| None,
            Some(&token),
            &mut visitor,
        )
        .unwrap()
        .unwrap();
    assert!(matches!(outcome.0, Processed::StatelessReset));

    // without a token match the packet is just dropped
    let other_token = stateless_reset::Token::from([0x11; 16]);
    let outcome = framer
        .process_packet(
            &mut output[..len],
            &keys,
            |_| None,
            Some(&other_token),
            &mut visitor,
        )
        .unwrap();
    assert!(outcome.is_none());
}

#[test]
fn malformed_frame_fails_the_connection() {
    let framer = server_framer();
    let keys = Protection::default();
    let header = Header::Short {
        destination_connection_id: cid(&[1, 2, 3, 4, 5, 6, 7, 8]),
        spin_bit: false,
        key_phase: false,
    };

    let mut output = [0u8; 256];
    let len = framer
        .build_packet(
            &keys,
            &header,
            app_packet_number(1),
            None,
            |encoder| {
                // RESET_STREAM truncated after the stream id
                encoder.encode(&0x04u8);
                encoder.encode(&VarInt::from_u8(4));
            },
            &mut output,
        )
        .unwrap();

    let mut visitor = TagVisitor::default();
    let error = framer
        .process_packet(&mut output[..len], &keys, |_| None, None, &mut visitor)
        .unwrap_err();
    assert_eq!(error.code, transport::Error::FRAME_ENCODING_ERROR.code);
}

#[test]
fn retry_packets_surface_the_token() {
    // build a retry packet by hand: tag, version, cids, token, integrity tag
    let mut bytes = Vec::new();
    bytes.push(LONG_HEADER_BIT | FIXED_BIT | LongPacketType::Retry.into_tag_mask());
    bytes.extend_from_slice(&QUIC_VERSION_1.to_be_bytes());
    bytes.push(0); // empty dcid
    bytes.push(4);
    bytes.extend_from_slice(&[9, 9, 9, 9]);
    bytes.extend_from_slice(b"token-bytes");
    bytes.extend_from_slice(&[0u8; 16]);

    let keys = Protection::default();
    let mut visitor = TagVisitor::default();
    let (processed, consumed) = client_framer()
        .process_packet(&mut bytes, &keys, |_| None, None, &mut visitor)
        .unwrap()
        .unwrap();

    assert_eq!(consumed, bytes.len());
    match processed {
        Processed::Retry {
            source_connection_id,
            token,
        } => {
            assert_eq!(source_connection_id, cid(&[9, 9, 9, 9]));
            assert_eq!(token, b"token-bytes");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}
