// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Streaming decoder for HTTP/2 frames
//!
//! The decoder tolerates arbitrarily small input chunks. A fixed 9-byte
//! header selects a payload sub-decoder by frame type; every sub-decoder
//! consumes a bounded slice of the input and never reads past the declared
//! payload length. On a malformed payload the driver discards the remainder
//! of the frame and resynchronizes on the next header.

use crate::http::{flags, FrameHeader, FrameType, PriorityFields, FRAME_HEADER_LEN};

/// The outcome of one `decode` call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeStatus {
    /// All input was consumed and the decoder sits at a frame boundary
    Done,
    /// All input was consumed mid-frame
    InProgress,
    /// A frame error was reported during this call; the decoder has
    /// resynchronized and can keep decoding
    Error,
}

/// Receives decode events
///
/// Every method has a no-op default so listeners implement only what they
/// observe. Payload callbacks may be invoked multiple times per frame with
/// successive chunks.
pub trait Listener {
    fn on_data_start(&mut self, _header: &FrameHeader) {}
    fn on_data_payload(&mut self, _data: &[u8]) {}
    fn on_data_end(&mut self) {}

    fn on_headers_start(&mut self, _header: &FrameHeader) {}
    fn on_headers_priority(&mut self, _priority: &PriorityFields) {}
    fn on_header_block_fragment(&mut self, _data: &[u8]) {}
    fn on_headers_end(&mut self) {}

    fn on_priority(&mut self, _header: &FrameHeader, _priority: &PriorityFields) {}
    fn on_rst_stream(&mut self, _stream_id: u32, _error_code: u32) {}

    fn on_settings_start(&mut self, _header: &FrameHeader) {}
    fn on_setting(&mut self, _id: u16, _value: u32) {}
    fn on_settings_end(&mut self) {}
    fn on_settings_ack(&mut self) {}

    fn on_push_promise_start(&mut self, _header: &FrameHeader, _promised_stream_id: u32) {}
    fn on_push_promise_end(&mut self) {}

    fn on_ping(&mut self, _data: &[u8; 8], _is_ack: bool) {}

    fn on_goaway(&mut self, _last_stream_id: u32, _error_code: u32) {}
    fn on_goaway_debug_data(&mut self, _data: &[u8]) {}
    fn on_goaway_end(&mut self) {}

    fn on_window_update(&mut self, _stream_id: u32, _increment: u32) {}

    fn on_continuation_start(&mut self, _header: &FrameHeader) {}
    fn on_continuation_end(&mut self) {}

    fn on_alt_svc_start(&mut self, _header: &FrameHeader, _origin_len: u32, _value_len: u32) {}
    fn on_alt_svc_origin(&mut self, _data: &[u8]) {}
    fn on_alt_svc_value(&mut self, _data: &[u8]) {}
    fn on_alt_svc_end(&mut self) {}

    fn on_unknown_start(&mut self, _header: &FrameHeader) {}
    fn on_unknown_payload(&mut self, _data: &[u8]) {}
    fn on_unknown_end(&mut self) {}

    /// The declared payload length exceeds the decoder's maximum
    fn on_frame_size_error(&mut self, _header: &FrameHeader) {}
    /// The payload structure is inconsistent with the frame type
    fn on_frame_format_error(&mut self, _header: &FrameHeader) {}
    /// The declared padding exceeds the remaining payload
    fn on_padding_too_long(&mut self, _header: &FrameHeader, _missing_length: u32) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    StartDecodingHeader,
    ResumeDecodingHeader,
    ResumeDecodingPayload,
    DiscardPayload,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// The pad-length byte of a PADDED frame
    PadLength,
    /// A fixed-size field group accumulated in the scratch buffer
    Fixed,
    /// The streaming region of the payload
    Body,
    /// Trailing padding
    Padding,
    /// ALTSVC origin bytes, before the value region
    AltSvcOrigin,
}

/// The default maximum payload a peer may declare, per RFC 7540's
/// SETTINGS_MAX_FRAME_SIZE initial value
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1 << 14;

#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    phase: Phase,

    header_bytes: [u8; FRAME_HEADER_LEN],
    header_filled: usize,
    header: FrameHeader,

    remaining_payload: u32,
    remaining_padding: u32,

    scratch: [u8; 8],
    scratch_filled: usize,
    fixed_needed: usize,

    /// ALTSVC origin bytes still expected
    origin_remaining: u32,

    maximum_payload_size: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_SIZE)
    }
}

impl FrameDecoder {
    pub fn new(maximum_payload_size: u32) -> Self {
        Self {
            state: State::StartDecodingHeader,
            phase: Phase::Body,
            header_bytes: [0; FRAME_HEADER_LEN],
            header_filled: 0,
            header: FrameHeader {
                payload_length: 0,
                frame_type: FrameType::Unknown(0),
                flags: 0,
                stream_id: 0,
            },
            remaining_payload: 0,
            remaining_padding: 0,
            scratch: [0; 8],
            scratch_filled: 0,
            fixed_needed: 0,
            origin_remaining: 0,
            maximum_payload_size,
        }
    }

    /// Returns true if the decoder sits between frames
    pub fn is_at_frame_boundary(&self) -> bool {
        self.state == State::StartDecodingHeader
    }

    /// Feeds a chunk of input to the decoder
    ///
    /// The chunk is always fully consumed; events are delivered to
    /// `listener` as frames complete.
    pub fn decode<L: Listener>(&mut self, mut input: &[u8], listener: &mut L) -> DecodeStatus {
        let mut had_error = false;

        if input.is_empty() && self.is_at_frame_boundary() {
            return DecodeStatus::Done;
        }

        loop {
            match self.state {
                State::StartDecodingHeader | State::ResumeDecodingHeader => {
                    let needed = FRAME_HEADER_LEN - self.header_filled;
                    let take = needed.min(input.len());
                    self.header_bytes[self.header_filled..self.header_filled + take]
                        .copy_from_slice(&input[..take]);
                    self.header_filled += take;
                    input = &input[take..];

                    if self.header_filled < FRAME_HEADER_LEN {
                        self.state = State::ResumeDecodingHeader;
                        return if had_error {
                            DecodeStatus::Error
                        } else {
                            DecodeStatus::InProgress
                        };
                    }

                    self.header_filled = 0;
                    let header = FrameHeader::decode(&self.header_bytes);
                    self.header = header;
                    self.remaining_payload = header.payload_length;
                    self.remaining_padding = 0;
                    self.scratch_filled = 0;

                    if header.payload_length > self.maximum_payload_size {
                        listener.on_frame_size_error(&header);
                        self.state = State::DiscardPayload;
                        had_error = true;
                        continue;
                    }

                    if let Err(()) = self.begin_payload(listener) {
                        self.state = State::DiscardPayload;
                        had_error = true;
                        continue;
                    }
                    self.state = State::ResumeDecodingPayload;
                }
                State::ResumeDecodingPayload => {
                    let (result, rest) = self.resume_payload(input, listener);
                    input = rest;
                    match result {
                        Ok(true) => {
                            self.state = State::StartDecodingHeader;
                        }
                        Ok(false) => {
                            // input exhausted mid-frame
                            return if had_error {
                                DecodeStatus::Error
                            } else {
                                DecodeStatus::InProgress
                            };
                        }
                        Err(()) => {
                            self.state = State::DiscardPayload;
                            had_error = true;
                        }
                    }
                }
                State::DiscardPayload => {
                    let discard = self.remaining_payload + self.remaining_padding;
                    let take = (discard as usize).min(input.len());
                    input = &input[take..];
                    let take = take as u32;
                    if take <= self.remaining_payload {
                        self.remaining_payload -= take;
                    } else {
                        self.remaining_padding -= take - self.remaining_payload;
                        self.remaining_payload = 0;
                    }

                    if self.remaining_payload + self.remaining_padding > 0 {
                        return if had_error {
                            DecodeStatus::Error
                        } else {
                            DecodeStatus::InProgress
                        };
                    }
                    self.state = State::StartDecodingHeader;
                }
            }

            if input.is_empty() && self.state == State::StartDecodingHeader {
                return if had_error {
                    DecodeStatus::Error
                } else {
                    DecodeStatus::Done
                };
            }
        }
    }

    /// Validates the header and selects the first payload phase
    fn begin_payload<L: Listener>(&mut self, listener: &mut L) -> Result<(), ()> {
        let header = self.header;
        match header.frame_type {
            FrameType::Data => {
                listener.on_data_start(&header);
                self.phase = if header.has_flag(flags::PADDED) {
                    Phase::PadLength
                } else {
                    Phase::Body
                };
            }
            FrameType::Headers => {
                listener.on_headers_start(&header);
                self.phase = if header.has_flag(flags::PADDED) {
                    Phase::PadLength
                } else if header.has_flag(flags::PRIORITY) {
                    self.set_fixed(5);
                    Phase::Fixed
                } else {
                    Phase::Body
                };
            }
            FrameType::Priority => {
                if header.payload_length != 5 {
                    listener.on_frame_format_error(&header);
                    return Err(());
                }
                self.set_fixed(5);
                self.phase = Phase::Fixed;
            }
            FrameType::RstStream => {
                if header.payload_length != 4 {
                    listener.on_frame_format_error(&header);
                    return Err(());
                }
                self.set_fixed(4);
                self.phase = Phase::Fixed;
            }
            FrameType::Settings => {
                if header.has_flag(flags::ACK) {
                    if header.payload_length != 0 {
                        listener.on_frame_format_error(&header);
                        return Err(());
                    }
                    listener.on_settings_ack();
                    self.phase = Phase::Body;
                    return Ok(());
                }
                //= https://www.rfc-editor.org/rfc/rfc7540#section-6.5
                //# A SETTINGS frame with a length other than a multiple of 6
                //# octets MUST be treated as a connection error
                if header.payload_length % 6 != 0 {
                    listener.on_frame_format_error(&header);
                    return Err(());
                }
                listener.on_settings_start(&header);
                self.set_fixed(6);
                self.phase = Phase::Fixed;
            }
            FrameType::PushPromise => {
                self.phase = if header.has_flag(flags::PADDED) {
                    Phase::PadLength
                } else {
                    self.set_fixed(4);
                    Phase::Fixed
                };
            }
            FrameType::Ping => {
                if header.payload_length != 8 {
                    listener.on_frame_format_error(&header);
                    return Err(());
                }
                self.set_fixed(8);
                self.phase = Phase::Fixed;
            }
            FrameType::GoAway => {
                if header.payload_length < 8 {
                    listener.on_frame_format_error(&header);
                    return Err(());
                }
                self.set_fixed(8);
                self.phase = Phase::Fixed;
            }
            FrameType::WindowUpdate => {
                if header.payload_length != 4 {
                    listener.on_frame_format_error(&header);
                    return Err(());
                }
                self.set_fixed(4);
                self.phase = Phase::Fixed;
            }
            FrameType::Continuation => {
                listener.on_continuation_start(&header);
                self.phase = Phase::Body;
            }
            FrameType::AltSvc => {
                if header.payload_length < 2 {
                    listener.on_frame_format_error(&header);
                    return Err(());
                }
                self.set_fixed(2);
                self.phase = Phase::Fixed;
            }
            FrameType::Unknown(_) => {
                listener.on_unknown_start(&header);
                self.phase = Phase::Body;
            }
        }
        Ok(())
    }

    fn set_fixed(&mut self, needed: usize) {
        debug_assert!(needed <= self.scratch.len());
        self.fixed_needed = needed;
        self.scratch_filled = 0;
    }

    /// Drives the payload phases; `Ok(true)` when the frame completed
    ///
    /// Returns the unconsumed remainder of `input` alongside the result.
    fn resume_payload<'a, L: Listener>(
        &mut self,
        mut input: &'a [u8],
        listener: &mut L,
    ) -> (Result<bool, ()>, &'a [u8]) {
        loop {
            match self.phase {
                Phase::PadLength => {
                    if self.remaining_payload == 0 {
                        listener.on_frame_format_error(&self.header);
                        return (Err(()), input);
                    }
                    let Some((&pad, rest)) = input.split_first() else {
                        return (Ok(false), input);
                    };
                    input = rest;
                    self.remaining_payload -= 1;

                    let pad = u32::from(pad);
                    if pad > self.remaining_payload {
                        listener.on_padding_too_long(&self.header, pad - self.remaining_payload);
                        return (Err(()), input);
                    }
                    self.remaining_padding = pad;
                    self.remaining_payload -= pad;

                    self.phase = match self.header.frame_type {
                        FrameType::Headers if self.header.has_flag(flags::PRIORITY) => {
                            self.set_fixed(5);
                            Phase::Fixed
                        }
                        FrameType::PushPromise => {
                            self.set_fixed(4);
                            Phase::Fixed
                        }
                        _ => Phase::Body,
                    };
                }
                Phase::Fixed => {
                    let (filled, rest) = self.fill_scratch(input);
                    input = rest;
                    if !filled {
                        if self.remaining_payload == 0 {
                            // the declared payload ran out mid-field
                            listener.on_frame_format_error(&self.header);
                            return (Err(()), input);
                        }
                        return (Ok(false), input);
                    }
                    if self.dispatch_fixed(listener).is_err() {
                        return (Err(()), input);
                    }
                }
                Phase::AltSvcOrigin => {
                    if self.origin_remaining == 0 {
                        self.phase = Phase::Body;
                        continue;
                    }
                    let take = (self.origin_remaining as usize).min(input.len());
                    if take == 0 {
                        return (Ok(false), input);
                    }
                    listener.on_alt_svc_origin(&input[..take]);
                    input = &input[take..];
                    self.origin_remaining -= take as u32;
                    self.remaining_payload -= take as u32;
                }
                Phase::Body => {
                    if self.remaining_payload > 0 {
                        let take = (self.remaining_payload as usize).min(input.len());
                        if take == 0 {
                            return (Ok(false), input);
                        }
                        let chunk = &input[..take];
                        match self.header.frame_type {
                            FrameType::Data => listener.on_data_payload(chunk),
                            FrameType::Headers
                            | FrameType::PushPromise
                            | FrameType::Continuation => {
                                listener.on_header_block_fragment(chunk)
                            }
                            FrameType::GoAway => listener.on_goaway_debug_data(chunk),
                            FrameType::AltSvc => listener.on_alt_svc_value(chunk),
                            FrameType::Unknown(_) => listener.on_unknown_payload(chunk),
                            // fixed-size frames have no body region
                            _ => {}
                        }
                        input = &input[take..];
                        self.remaining_payload -= take as u32;
                        if self.remaining_payload > 0 {
                            return (Ok(false), input);
                        }
                    }
                    self.phase = Phase::Padding;
                }
                Phase::Padding => {
                    if self.remaining_padding > 0 {
                        let take = (self.remaining_padding as usize).min(input.len());
                        if take == 0 {
                            return (Ok(false), input);
                        }
                        input = &input[take..];
                        self.remaining_padding -= take as u32;
                        if self.remaining_padding > 0 {
                            return (Ok(false), input);
                        }
                    }
                    self.finish_frame(listener);
                    return (Ok(true), input);
                }
            }
        }
    }

    /// Copies input into the scratch buffer; true once `fixed_needed` bytes
    /// have arrived
    fn fill_scratch<'a>(&mut self, input: &'a [u8]) -> (bool, &'a [u8]) {
        let needed = self.fixed_needed - self.scratch_filled;
        let take = needed
            .min(input.len())
            .min(self.remaining_payload as usize);
        self.scratch[self.scratch_filled..self.scratch_filled + take]
            .copy_from_slice(&input[..take]);
        self.scratch_filled += take;
        self.remaining_payload -= take as u32;
        (
            self.scratch_filled == self.fixed_needed,
            &input[take..],
        )
    }

    fn dispatch_fixed<L: Listener>(&mut self, listener: &mut L) -> Result<(), ()> {
        let header = self.header;
        match header.frame_type {
            FrameType::Headers => {
                let mut bytes = [0u8; 5];
                bytes.copy_from_slice(&self.scratch[..5]);
                listener.on_headers_priority(&PriorityFields::decode(&bytes));
                self.phase = Phase::Body;
            }
            FrameType::Priority => {
                let mut bytes = [0u8; 5];
                bytes.copy_from_slice(&self.scratch[..5]);
                listener.on_priority(&header, &PriorityFields::decode(&bytes));
                self.phase = Phase::Body;
            }
            FrameType::RstStream => {
                let error_code = u32::from_be_bytes([
                    self.scratch[0],
                    self.scratch[1],
                    self.scratch[2],
                    self.scratch[3],
                ]);
                listener.on_rst_stream(header.stream_id, error_code);
                self.phase = Phase::Body;
            }
            FrameType::Settings => {
                let id = u16::from_be_bytes([self.scratch[0], self.scratch[1]]);
                let value = u32::from_be_bytes([
                    self.scratch[2],
                    self.scratch[3],
                    self.scratch[4],
                    self.scratch[5],
                ]);
                listener.on_setting(id, value);
                if self.remaining_payload > 0 {
                    self.set_fixed(6);
                } else {
                    self.phase = Phase::Body;
                }
            }
            FrameType::PushPromise => {
                let promised = u32::from_be_bytes([
                    self.scratch[0],
                    self.scratch[1],
                    self.scratch[2],
                    self.scratch[3],
                ]) & 0x7fff_ffff;
                listener.on_push_promise_start(&header, promised);
                self.phase = Phase::Body;
            }
            FrameType::Ping => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&self.scratch[..8]);
                listener.on_ping(&bytes, header.has_flag(flags::ACK));
                self.phase = Phase::Body;
            }
            FrameType::GoAway => {
                let last_stream_id = u32::from_be_bytes([
                    self.scratch[0],
                    self.scratch[1],
                    self.scratch[2],
                    self.scratch[3],
                ]) & 0x7fff_ffff;
                let error_code = u32::from_be_bytes([
                    self.scratch[4],
                    self.scratch[5],
                    self.scratch[6],
                    self.scratch[7],
                ]);
                listener.on_goaway(last_stream_id, error_code);
                self.phase = Phase::Body;
            }
            FrameType::WindowUpdate => {
                let increment = u32::from_be_bytes([
                    self.scratch[0],
                    self.scratch[1],
                    self.scratch[2],
                    self.scratch[3],
                ]) & 0x7fff_ffff;
                listener.on_window_update(header.stream_id, increment);
                self.phase = Phase::Body;
            }
            FrameType::AltSvc => {
                let origin_len =
                    u32::from(u16::from_be_bytes([self.scratch[0], self.scratch[1]]));
                if origin_len > self.remaining_payload {
                    listener.on_frame_format_error(&header);
                    return Err(());
                }
                let value_len = self.remaining_payload - origin_len;
                listener.on_alt_svc_start(&header, origin_len, value_len);
                self.origin_remaining = origin_len;
                self.phase = Phase::AltSvcOrigin;
            }
            FrameType::Data | FrameType::Continuation | FrameType::Unknown(_) => {
                debug_assert!(false, "these types have no fixed fields");
                self.phase = Phase::Body;
            }
        }
        Ok(())
    }

    fn finish_frame<L: Listener>(&mut self, listener: &mut L) {
        match self.header.frame_type {
            FrameType::Data => listener.on_data_end(),
            FrameType::Headers => listener.on_headers_end(),
            FrameType::Settings if !self.header.has_flag(flags::ACK) => {
                listener.on_settings_end()
            }
            FrameType::PushPromise => listener.on_push_promise_end(),
            FrameType::GoAway => listener.on_goaway_end(),
            FrameType::Continuation => listener.on_continuation_end(),
            FrameType::AltSvc => listener.on_alt_svc_end(),
            FrameType::Unknown(_) => listener.on_unknown_end(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests;
