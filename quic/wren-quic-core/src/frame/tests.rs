// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::{stateless_reset, stream::StreamType, varint::VarInt};
use s2n_codec::{DecoderBufferMut, Encoder as _, EncoderBuffer};

fn round_trip(frame: &FrameMut) -> Vec<u8> {
    let mut bytes = vec![0u8; 1500];
    let mut encoder = EncoderBuffer::new(&mut bytes);
    encoder.encode(frame);
    let len = encoder.len();
    bytes.truncate(len);
    bytes
}

fn decode(bytes: &mut [u8]) -> (FrameMut, usize) {
    let buffer = DecoderBufferMut::new(bytes);
    let (frame, remaining) = buffer.decode::<FrameMut>().unwrap();
    let remaining = remaining.len();
    (frame, remaining)
}

macro_rules! assert_round_trip {
    ($frame:expr) => {{
        let frame: FrameMut = $frame.into();
        let mut bytes = round_trip(&frame);
        let (decoded, remaining) = decode(&mut bytes);
        assert_eq!(remaining, 0);
        assert_eq!(decoded, frame);
    }};
}

#[test]
fn simple_frames_round_trip() {
    assert_round_trip!(Ping);
    assert_round_trip!(HandshakeDone);
    assert_round_trip!(ResetStream {
        stream_id: VarInt::from_u8(4),
        application_error_code: VarInt::from_u16(942),
        final_size: VarInt::from_u32(1 << 20),
    });
    assert_round_trip!(StopSending {
        stream_id: VarInt::from_u8(8),
        application_error_code: VarInt::from_u8(3),
    });
    assert_round_trip!(MaxData {
        maximum_data: VarInt::from_u32(123_456),
    });
    assert_round_trip!(MaxStreamData {
        stream_id: VarInt::from_u8(0),
        maximum_stream_data: VarInt::from_u32(65_536),
    });
    assert_round_trip!(MaxStreams {
        stream_type: StreamType::Bidirectional,
        maximum_streams: VarInt::from_u8(100),
    });
    assert_round_trip!(MaxStreams {
        stream_type: StreamType::Unidirectional,
        maximum_streams: VarInt::from_u8(3),
    });
    assert_round_trip!(DataBlocked {
        data_limit: VarInt::from_u32(4096),
    });
    assert_round_trip!(StreamDataBlocked {
        stream_id: VarInt::from_u8(4),
        stream_data_limit: VarInt::from_u32(2048),
    });
    assert_round_trip!(StreamsBlocked {
        stream_type: StreamType::Bidirectional,
        stream_limit: VarInt::from_u8(3),
    });
    assert_round_trip!(RetireConnectionId {
        sequence_number: VarInt::from_u8(7),
    });
    assert_round_trip!(PathChallenge {
        data: [1, 2, 3, 4, 5, 6, 7, 8],
    });
    assert_round_trip!(PathResponse {
        data: [8, 7, 6, 5, 4, 3, 2, 1],
    });
}

#[test]
fn new_connection_id_round_trip() {
    let connection_id = crate::connection::ConnectionId::try_from_bytes(&[1, 2, 3, 4]).unwrap();
    assert_round_trip!(NewConnectionId {
        sequence_number: VarInt::from_u8(3),
        retire_prior_to: VarInt::from_u8(1),
        connection_id,
        stateless_reset_token: stateless_reset::Token::from([0xab; 16]),
    });
}

#[test]
fn new_connection_id_rejects_inverted_thresholds() {
    // retire_prior_to > sequence_number
    let mut bytes = vec![0x18, 0x01, 0x02, 0x04, 1, 2, 3, 4];
    bytes.extend_from_slice(&[0xab; 16]);
    let buffer = DecoderBufferMut::new(&mut bytes);
    assert!(buffer.decode::<FrameMut>().is_err());
}

#[test]
fn connection_close_round_trip() {
    assert_round_trip!(ConnectionClose {
        error_code: VarInt::from_u8(0xA),
        frame_type: Some(VarInt::from_u8(0x08)),
        reason: Some(b"stream state violated".as_slice()),
    });
    assert_round_trip!(ConnectionClose {
        error_code: VarInt::from_u8(0x0),
        frame_type: None,
        reason: None,
    });
}

#[test]
fn stream_frame_round_trip() {
    let mut data = *b"hello quic";
    let frame = Stream {
        stream_id: VarInt::from_u8(4),
        offset: VarInt::from_u32(512),
        is_last_frame: false,
        is_fin: true,
        data: DecoderBufferMut::new(&mut data),
    };
    let mut bytes = round_trip(&frame.into());
    let (decoded, _) = decode(&mut bytes);
    match decoded {
        Frame::Stream(stream) => {
            assert_eq!(stream.stream_id, VarInt::from_u8(4));
            assert_eq!(stream.offset, VarInt::from_u32(512));
            assert!(stream.is_fin);
            assert_eq!(stream.data.into_less_safe_slice(), b"hello quic");
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

#[test]
fn crypto_frame_round_trip() {
    let mut data = *b"client hello";
    let frame = Crypto {
        offset: VarInt::from_u8(0),
        data: DecoderBufferMut::new(&mut data),
    };
    let mut bytes = round_trip(&frame.into());
    let (decoded, _) = decode(&mut bytes);
    match decoded {
        Frame::Crypto(crypto) => {
            assert_eq!(crypto.offset, VarInt::ZERO);
            assert_eq!(crypto.data.into_less_safe_slice(), b"client hello");
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

#[test]
fn ack_frame_round_trip() {
    use super::ack::AckRangesVec;

    let ranges = AckRangesVec::from_ascending(
        [
            VarInt::from_u8(1)..=VarInt::from_u8(3),
            VarInt::from_u8(7)..=VarInt::from_u8(9),
            VarInt::from_u8(12)..=VarInt::from_u8(12),
        ]
        .into_iter(),
    );
    let frame = Ack {
        ack_delay: VarInt::from_u16(1234),
        ack_ranges: ranges,
        ecn_counts: None,
    };

    let mut bytes = vec![0u8; 128];
    let mut encoder = EncoderBuffer::new(&mut bytes);
    encoder.encode(&frame);
    let len = encoder.len();

    let (decoded, _) = decode(&mut bytes[..len]);
    match decoded {
        Frame::Ack(ack) => {
            assert_eq!(ack.largest_acknowledged(), VarInt::from_u8(12));
            assert_eq!(ack.ack_delay, VarInt::from_u16(1234));
            let ranges: Vec<_> = ack.ack_ranges().collect();
            assert_eq!(
                ranges,
                vec![
                    VarInt::from_u8(12)..=VarInt::from_u8(12),
                    VarInt::from_u8(7)..=VarInt::from_u8(9),
                    VarInt::from_u8(1)..=VarInt::from_u8(3),
                ]
            );
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

#[test]
fn ack_frame_with_largest_possible_packet_number() {
    use super::ack::AckRangesVec;

    let largest = VarInt::MAX;
    let frame = Ack {
        ack_delay: VarInt::ZERO,
        ack_ranges: AckRangesVec::from_ascending([largest..=largest].into_iter()),
        ecn_counts: None,
    };

    let mut bytes = vec![0u8; 64];
    let mut encoder = EncoderBuffer::new(&mut bytes);
    encoder.encode(&frame);
    let len = encoder.len();

    let (decoded, _) = decode(&mut bytes[..len]);
    match decoded {
        Frame::Ack(ack) => assert_eq!(ack.largest_acknowledged(), largest),
        other => panic!("unexpected frame {other:?}"),
    }
}

#[test]
fn padding_coalesces_on_decode() {
    let mut bytes = [0u8; 7];
    let (decoded, remaining) = decode(&mut bytes);
    assert_eq!(remaining, 0);
    match decoded {
        Frame::Padding(padding) => assert_eq!(padding.length, 7),
        other => panic!("unexpected frame {other:?}"),
    }
}

#[test]
fn unknown_frame_types_are_rejected() {
    // 0x21 is unassigned in the core frame space
    let mut bytes = [0x21u8, 0, 0];
    let buffer = DecoderBufferMut::new(&mut bytes);
    assert!(buffer.decode::<FrameMut>().is_err());
}

#[test]
fn truncated_frames_are_rejected() {
    // RESET_STREAM missing its final_size field
    let mut bytes = [0x04u8, 0x04, 0x01];
    let buffer = DecoderBufferMut::new(&mut bytes);
    assert!(buffer.decode::<FrameMut>().is_err());
}
