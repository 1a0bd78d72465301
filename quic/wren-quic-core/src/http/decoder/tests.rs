// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;

/// Records decode events as readable strings
#[derive(Debug, Default)]
struct EventLog {
    events: Vec<String>,
}

impl EventLog {
    fn push(&mut self, event: String) {
        self.events.push(event);
    }
}

impl Listener for EventLog {
    fn on_data_start(&mut self, header: &FrameHeader) {
        self.push(format!("data_start stream={}", header.stream_id));
    }
    fn on_data_payload(&mut self, data: &[u8]) {
        self.push(format!("data {:?}", String::from_utf8_lossy(data)));
    }
    fn on_data_end(&mut self) {
        self.push("data_end".into());
    }
    fn on_headers_start(&mut self, header: &FrameHeader) {
        self.push(format!("headers_start stream={}", header.stream_id));
    }
    fn on_headers_priority(&mut self, priority: &PriorityFields) {
        self.push(format!(
            "headers_priority dep={} weight={}",
            priority.stream_dependency, priority.weight
        ));
    }
    fn on_header_block_fragment(&mut self, data: &[u8]) {
        self.push(format!("fragment len={}", data.len()));
    }
    fn on_headers_end(&mut self) {
        self.push("headers_end".into());
    }
    fn on_rst_stream(&mut self, stream_id: u32, error_code: u32) {
        self.push(format!("rst stream={stream_id} code={error_code}"));
    }
    fn on_settings_start(&mut self, _header: &FrameHeader) {
        self.push("settings_start".into());
    }
    fn on_setting(&mut self, id: u16, value: u32) {
        self.push(format!("setting {id}={value}"));
    }
    fn on_settings_end(&mut self) {
        self.push("settings_end".into());
    }
    fn on_settings_ack(&mut self) {
        self.push("settings_ack".into());
    }
    fn on_ping(&mut self, data: &[u8; 8], is_ack: bool) {
        self.push(format!("ping ack={is_ack} data={data:?}"));
    }
    fn on_goaway(&mut self, last_stream_id: u32, error_code: u32) {
        self.push(format!("goaway last={last_stream_id} code={error_code}"));
    }
    fn on_goaway_debug_data(&mut self, data: &[u8]) {
        self.push(format!("goaway_debug {:?}", String::from_utf8_lossy(data)));
    }
    fn on_goaway_end(&mut self) {
        self.push("goaway_end".into());
    }
    fn on_window_update(&mut self, stream_id: u32, increment: u32) {
        self.push(format!("window stream={stream_id} inc={increment}"));
    }
    fn on_push_promise_start(&mut self, _header: &FrameHeader, promised_stream_id: u32) {
        self.push(format!("push_promise promised={promised_stream_id}"));
    }
    fn on_push_promise_end(&mut self) {
        self.push("push_promise_end".into());
    }
    fn on_alt_svc_start(&mut self, _header: &FrameHeader, origin_len: u32, value_len: u32) {
        self.push(format!("altsvc origin_len={origin_len} value_len={value_len}"));
    }
    fn on_alt_svc_origin(&mut self, data: &[u8]) {
        self.push(format!("altsvc_origin {:?}", String::from_utf8_lossy(data)));
    }
    fn on_alt_svc_value(&mut self, data: &[u8]) {
        self.push(format!("altsvc_value {:?}", String::from_utf8_lossy(data)));
    }
    fn on_alt_svc_end(&mut self) {
        self.push("altsvc_end".into());
    }
    fn on_unknown_start(&mut self, header: &FrameHeader) {
        self.push(format!("unknown_start flags={:#x}", header.flags));
    }
    fn on_unknown_payload(&mut self, data: &[u8]) {
        self.push(format!("unknown len={}", data.len()));
    }
    fn on_unknown_end(&mut self) {
        self.push("unknown_end".into());
    }
    fn on_frame_size_error(&mut self, header: &FrameHeader) {
        self.push(format!("size_error len={}", header.payload_length));
    }
    fn on_frame_format_error(&mut self, _header: &FrameHeader) {
        self.push("format_error".into());
    }
    fn on_padding_too_long(&mut self, _header: &FrameHeader, missing_length: u32) {
        self.push(format!("padding_too_long missing={missing_length}"));
    }
}

fn frame(frame_type: FrameType, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader {
        payload_length: payload.len() as u32,
        frame_type,
        flags,
        stream_id,
    };
    let mut bytes = header.encode().to_vec();
    bytes.extend_from_slice(payload);
    bytes
}

fn decode_all(bytes: &[u8]) -> (Vec<String>, DecodeStatus) {
    let mut decoder = FrameDecoder::default();
    let mut log = EventLog::default();
    let status = decoder.decode(bytes, &mut log);
    (log.events, status)
}

/// Feeding one byte at a time must produce the same event sequence, modulo
/// payload chunking
fn decode_bytewise(bytes: &[u8]) -> Vec<String> {
    let mut decoder = FrameDecoder::default();
    let mut log = EventLog::default();
    for byte in bytes {
        decoder.decode(core::slice::from_ref(byte), &mut log);
    }
    assert!(decoder.is_at_frame_boundary());
    log.events
}

#[test]
fn data_frame_events() {
    let bytes = frame(FrameType::Data, flags::END_STREAM, 1, b"hello");
    let (events, status) = decode_all(&bytes);
    assert_eq!(status, DecodeStatus::Done);
    assert_eq!(
        events,
        vec!["data_start stream=1", "data \"hello\"", "data_end"]
    );
}

#[test]
fn padded_data_frame_skips_padding() {
    let mut payload = vec![3u8]; // pad length
    payload.extend_from_slice(b"abc");
    payload.extend_from_slice(&[0, 0, 0]);
    let bytes = frame(FrameType::Data, flags::PADDED, 5, &payload);

    let (events, status) = decode_all(&bytes);
    assert_eq!(status, DecodeStatus::Done);
    assert_eq!(events, vec!["data_start stream=5", "data \"abc\"", "data_end"]);
}

#[test]
fn padding_longer_than_payload_is_an_error() {
    let payload = [200u8, b'x'];
    let bytes = frame(FrameType::Data, flags::PADDED, 5, &payload);

    let (events, status) = decode_all(&bytes);
    assert_eq!(status, DecodeStatus::Error);
    assert_eq!(
        events,
        vec!["data_start stream=5", "padding_too_long missing=199"]
    );
}

#[test]
fn headers_with_priority() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0x8000_0007u32.to_be_bytes()); // exclusive, dep 7
    payload.push(15); // weight 16
    payload.extend_from_slice(b"hpack");
    let bytes = frame(
        FrameType::Headers,
        flags::PRIORITY | flags::END_HEADERS,
        9,
        &payload,
    );

    let (events, status) = decode_all(&bytes);
    assert_eq!(status, DecodeStatus::Done);
    assert_eq!(
        events,
        vec![
            "headers_start stream=9",
            "headers_priority dep=7 weight=16",
            "fragment len=5",
            "headers_end"
        ]
    );
}

#[test]
fn settings_frame_streams_entries() {
    let mut payload = Vec::new();
    for (id, value) in [(1u16, 4096u32), (4, 65535), (5, 16384)] {
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&value.to_be_bytes());
    }
    let bytes = frame(FrameType::Settings, 0, 0, &payload);

    let (events, status) = decode_all(&bytes);
    assert_eq!(status, DecodeStatus::Done);
    assert_eq!(
        events,
        vec![
            "settings_start",
            "setting 1=4096",
            "setting 4=65535",
            "setting 5=16384",
            "settings_end"
        ]
    );

    assert_eq!(decode_bytewise(&bytes), events);
}

#[test]
fn settings_ack_must_be_empty() {
    let bytes = frame(FrameType::Settings, flags::ACK, 0, &[]);
    let (events, status) = decode_all(&bytes);
    assert_eq!(status, DecodeStatus::Done);
    assert_eq!(events, vec!["settings_ack"]);

    let bytes = frame(FrameType::Settings, flags::ACK, 0, &[0; 6]);
    let (events, status) = decode_all(&bytes);
    assert_eq!(status, DecodeStatus::Error);
    assert_eq!(events, vec!["format_error"]);
}

#[test]
fn settings_length_must_be_a_multiple_of_six() {
    let bytes = frame(FrameType::Settings, 0, 0, &[0; 5]);
    let (events, status) = decode_all(&bytes);
    assert_eq!(status, DecodeStatus::Error);
    assert_eq!(events, vec!["format_error"]);
}

#[test]
fn rst_stream_and_window_update() {
    let mut bytes = frame(FrameType::RstStream, 0, 3, &8u32.to_be_bytes());
    bytes.extend_from_slice(&frame(
        FrameType::WindowUpdate,
        0,
        0,
        &0x8000_1000u32.to_be_bytes(),
    ));

    let (events, status) = decode_all(&bytes);
    assert_eq!(status, DecodeStatus::Done);
    // the reserved bit of the increment is dropped
    assert_eq!(events, vec!["rst stream=3 code=8", "window stream=0 inc=4096"]);
}

#[test]
fn ping_and_goaway() {
    let mut bytes = frame(FrameType::Ping, flags::ACK, 0, &[1, 2, 3, 4, 5, 6, 7, 8]);
    let mut goaway_payload = Vec::new();
    goaway_payload.extend_from_slice(&21u32.to_be_bytes());
    goaway_payload.extend_from_slice(&2u32.to_be_bytes());
    goaway_payload.extend_from_slice(b"bye");
    bytes.extend_from_slice(&frame(FrameType::GoAway, 0, 0, &goaway_payload));

    let (events, status) = decode_all(&bytes);
    assert_eq!(status, DecodeStatus::Done);
    assert_eq!(
        events,
        vec![
            "ping ack=true data=[1, 2, 3, 4, 5, 6, 7, 8]",
            "goaway last=21 code=2",
            "goaway_debug \"bye\"",
            "goaway_end"
        ]
    );
}

#[test]
fn push_promise_carries_the_promised_stream() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&44u32.to_be_bytes());
    payload.extend_from_slice(b"frag");
    let bytes = frame(FrameType::PushPromise, flags::END_HEADERS, 11, &payload);

    let (events, status) = decode_all(&bytes);
    assert_eq!(status, DecodeStatus::Done);
    assert_eq!(
        events,
        vec!["push_promise promised=44", "fragment len=4", "push_promise_end"]
    );
}

#[test]
fn alt_svc_splits_origin_and_value() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&4u16.to_be_bytes());
    payload.extend_from_slice(b"orig");
    payload.extend_from_slice(b"h3=\":443\"");
    let bytes = frame(FrameType::AltSvc, 0, 0, &payload);

    let (events, status) = decode_all(&bytes);
    assert_eq!(status, DecodeStatus::Done);
    assert_eq!(
        events,
        vec![
            "altsvc origin_len=4 value_len=9",
            "altsvc_origin \"orig\"",
            "altsvc_value \"h3=\\\":443\\\"\"",
            "altsvc_end"
        ]
    );
}

#[test]
fn unknown_frames_are_delivered_opaquely() {
    let header = FrameHeader {
        payload_length: 3,
        frame_type: FrameType::Unknown(0x42),
        flags: 0xa5,
        stream_id: 0,
    };
    let mut bytes = header.encode().to_vec();
    bytes.extend_from_slice(&[9, 9, 9]);

    let (events, status) = decode_all(&bytes);
    assert_eq!(status, DecodeStatus::Done);
    assert_eq!(
        events,
        vec!["unknown_start flags=0xa5", "unknown len=3", "unknown_end"]
    );
}

#[test]
fn oversized_payload_reports_size_error_and_resynchronizes() {
    let mut decoder = FrameDecoder::new(16);
    let mut log = EventLog::default();

    let mut bytes = frame(FrameType::Data, 0, 1, &[0u8; 32]);
    bytes.extend_from_slice(&frame(FrameType::Ping, 0, 0, &[0u8; 8]));

    let status = decoder.decode(&bytes, &mut log);
    assert_eq!(status, DecodeStatus::Error);
    assert_eq!(
        log.events,
        vec![
            "size_error len=32",
            "ping ack=false data=[0, 0, 0, 0, 0, 0, 0, 0]"
        ]
    );
    assert!(decoder.is_at_frame_boundary());
}

#[test]
fn bytewise_decoding_matches_whole_buffer_decoding() {
    let mut bytes = frame(FrameType::Data, flags::END_STREAM, 1, b"x");
    bytes.extend_from_slice(&frame(FrameType::RstStream, 0, 1, &4u32.to_be_bytes()));
    bytes.extend_from_slice(&frame(FrameType::Ping, 0, 0, &[7; 8]));

    let (whole, status) = decode_all(&bytes);
    assert_eq!(status, DecodeStatus::Done);
    assert_eq!(decode_bytewise(&bytes), whole);
}
