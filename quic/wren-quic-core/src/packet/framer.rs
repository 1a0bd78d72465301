// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Parses and builds QUIC packets
//!
//! Ingress: [`Framer::process_packet`] parses the public header, selects the
//! key for the derived encryption level, decrypts the payload in place and
//! dispatches every frame, in wire order, to a [`FrameDecoder`] visitor.
//! Egress: [`Framer::build_packet`] writes a header, reserves the long-header
//! length field, lets the caller write frames, seals the payload and
//! back-patches the length.

use crate::{
    connection::{self, ConnectionId},
    crypto::{EncryptionLevel, PacketProtection},
    endpoint,
    frame::{
        ack::AckRangesDecoder,
        ack_elicitation::AckElicitation,
        FrameDecoder,
    },
    packet::{
        number::{PacketNumber, PacketNumberLen, PacketNumberSpace, TruncatedPacketNumber},
        Header, LongPacketType, ParsedHeader, FIXED_BIT, KEY_PHASE_BIT, LENGTH_FIELD_RESERVATION,
        LONG_HEADER_BIT, SPIN_BIT, VERSION_NEGOTIATION,
    },
    random,
    stateless_reset,
    transport,
    varint::VarInt,
};
use s2n_codec::{DecoderBuffer, DecoderBufferMut, Encoder, EncoderBuffer, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.8
//# Retry packets (see Section 17.2.5 of [QUIC-TRANSPORT]) carry a Retry
//# Integrity Tag that provides two properties: it allows the discarding
//# of packets that have accidentally been corrupted by the network, and
//# only an entity that observes an Initial packet can send a valid Retry
//# packet.
const RETRY_INTEGRITY_TAG_LEN: usize = 16;

/// A visitor over the frames of a decrypted packet
///
/// Handlers receive frames borrowing the packet payload; nothing borrowed may
/// be retained past the handler invocation.
pub trait PacketFrameVisitor:
    for<'a> FrameDecoder<'a, AckRangesDecoder<'a>, DecoderBufferMut<'a>, Output = ()>
{
}

impl<T> PacketFrameVisitor for T where
    T: for<'a> FrameDecoder<'a, AckRangesDecoder<'a>, DecoderBufferMut<'a>, Output = ()>
{
}

/// The outcome of processing one packet out of a datagram
#[derive(Debug)]
pub enum Processed {
    /// An authenticated packet whose frames were dispatched to the visitor
    Packet {
        packet_number: PacketNumber,
        level: EncryptionLevel,
        ack_elicitation: AckElicitation,
        destination_connection_id: ConnectionId,
        source_connection_id: Option<ConnectionId>,
        /// The version field, for long headers
        version: Option<u32>,
    },
    /// A version-negotiation packet carrying the peer's supported versions
    VersionNegotiation { supported_versions: Vec<u32> },
    /// A retry packet carrying a new token and the server's connection ID
    Retry {
        source_connection_id: ConnectionId,
        token: Vec<u8>,
    },
    /// A short-header packet which failed authentication but ended in the
    /// peer's stateless-reset token
    StatelessReset,
}

#[derive(Debug)]
pub struct Framer {
    perspective: endpoint::Type,
    /// The length of connection IDs this endpoint issues; short headers are
    /// routed on it
    local_connection_id_len: usize,
}

impl Framer {
    pub fn new(perspective: endpoint::Type, local_connection_id_len: usize) -> Self {
        debug_assert!(local_connection_id_len <= connection::id::MAX_LEN);
        Self {
            perspective,
            local_connection_id_len,
        }
    }

    /// Processes the packet at the start of `datagram`
    ///
    /// Returns the outcome and the number of bytes consumed, so coalesced
    /// packets can be processed by repeated calls. `Ok(None)` means the
    /// packet could not be decrypted and should be dropped or buffered;
    /// `Err` means the connection must be closed with the carried error.
    pub fn process_packet<K, V>(
        &self,
        datagram: &mut [u8],
        keys: &K,
        largest_packet_number: impl Fn(PacketNumberSpace) -> Option<PacketNumber>,
        peer_stateless_reset_token: Option<&stateless_reset::Token>,
        visitor: &mut V,
    ) -> Result<Option<(Processed, usize)>, transport::Error>
    where
        K: PacketProtection,
        V: PacketFrameVisitor,
    {
        let header = match self.parse_header(datagram)? {
            HeaderOutcome::Parsed(header) => header,
            HeaderOutcome::VersionNegotiation(supported_versions) => {
                let len = datagram.len();
                return Ok(Some((Processed::VersionNegotiation { supported_versions }, len)));
            }
            HeaderOutcome::Retry {
                source_connection_id,
                token,
            } => {
                let len = datagram.len();
                return Ok(Some((
                    Processed::Retry {
                        source_connection_id,
                        token,
                    },
                    len,
                )));
            }
        };

        let space = PacketNumberSpace::from_encryption_level(header.level);
        let truncated = {
            let buffer = DecoderBuffer::new(&datagram[header.packet_number_offset..]);
            let (truncated, _) =
                TruncatedPacketNumber::decode(space, header.packet_number_len, buffer)
                    .map_err(transport::Error::from)?;
            truncated
        };
        let largest = largest_packet_number(space)
            .unwrap_or_else(|| space.new_packet_number(VarInt::ZERO));
        let packet_number = truncated.expand(largest);

        let packet_len = header.packet_len;
        let (aad, payload) = datagram[..packet_len].split_at_mut(header.start_of_encrypted_data);
        let plaintext_len =
            match keys.open_in_place(header.level, packet_number.as_u64(), aad, &mut *payload) {
                Ok(len) => len,
                Err(_) => {
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3.1
                    //# The endpoint identifies a received datagram as a
                    //# stateless reset by comparing the last 16 bytes of the
                    //# datagram with all stateless reset tokens associated
                    //# with the remote address on which the datagram was
                    //# received.
                    if header.level == EncryptionLevel::OneRtt {
                        if let Some(token) = peer_stateless_reset_token {
                            if self.is_stateless_reset(datagram, token) {
                                let len = datagram.len();
                                return Ok(Some((Processed::StatelessReset, len)));
                            }
                        }
                    }
                    return Ok(None);
                }
            };

        let mut ack_elicitation = AckElicitation::default();
        let mut remaining = DecoderBufferMut::new(&mut payload[..plaintext_len]);
        if remaining.is_empty() {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
            //# An endpoint MUST treat receipt of a packet containing no
            //# frames as a connection error of type PROTOCOL_VIOLATION.
            return Err(transport::Error::PROTOCOL_VIOLATION.with_reason("empty packet"));
        }
        while !remaining.is_empty() {
            let tag = remaining.peek_byte(0).map_err(transport::Error::from)?;
            ack_elicitation |= tag_ack_elicitation(tag);
            let (_, rest) = visitor
                .decode_frame(remaining)
                .map_err(transport::Error::from)?;
            remaining = rest;
        }

        Ok(Some((
            Processed::Packet {
                packet_number,
                level: header.level,
                ack_elicitation,
                destination_connection_id: header.destination_connection_id,
                source_connection_id: header.source_connection_id,
                version: header.version,
            },
            packet_len,
        )))
    }

    /// Returns the offset at which the authenticated payload begins
    pub fn start_of_encrypted_data(&self, datagram: &[u8]) -> Result<usize, transport::Error> {
        // parsing is cheap enough that the offset is not cached
        match self.parse_header(datagram)? {
            HeaderOutcome::Parsed(header) => Ok(header.start_of_encrypted_data),
            _ => Err(transport::Error::PROTOCOL_VIOLATION
                .with_reason("packet type carries no encrypted data")),
        }
    }

    fn parse_header(&self, datagram: &[u8]) -> Result<HeaderOutcome, transport::Error> {
        let total_len = datagram.len();
        let buffer = DecoderBuffer::new(datagram);
        let (tag, buffer) = buffer.decode::<u8>().map_err(transport::Error::from)?;

        if tag & LONG_HEADER_BIT == 0 {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-17.3.1
            //# Fixed Bit:  The next bit (0x40) of byte 0 is set to 1.  Packets
            //#    containing a zero value for this bit are not valid packets in
            //#    this version and MUST be discarded.
            if tag & FIXED_BIT == 0 {
                return Err(transport::Error::PROTOCOL_VIOLATION.with_reason("fixed bit is zero"));
            }

            let (dcid, buffer) = buffer
                .decode_slice(self.local_connection_id_len)
                .map_err(transport::Error::from)?;
            let destination_connection_id =
                ConnectionId::try_from_bytes(dcid.into_less_safe_slice())
                    .ok_or_else(|| transport::Error::PROTOCOL_VIOLATION)?;

            let packet_number_len = PacketNumberLen::from_packet_tag(tag);
            let packet_number_offset = total_len - buffer.len();

            return Ok(HeaderOutcome::Parsed(ParsedHeader {
                level: EncryptionLevel::OneRtt,
                destination_connection_id,
                source_connection_id: None,
                version: None,
                packet_number_len,
                packet_number_offset,
                start_of_encrypted_data: packet_number_offset + packet_number_len.bytesize(),
                packet_len: total_len,
            }));
        }

        let (version, buffer) = buffer.decode::<u32>().map_err(transport::Error::from)?;

        let (destination_connection_id, buffer) = decode_cid(buffer)?;
        let (source_connection_id, buffer) = decode_cid(buffer)?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.1
        //# A Version Negotiation packet is inherently not version specific.
        //# Upon receipt by a client, it will be identified as a Version
        //# Negotiation packet based on the Version field having a value of 0.
        if version == VERSION_NEGOTIATION {
            if self.perspective.is_server() {
                return Err(transport::Error::PROTOCOL_VIOLATION
                    .with_reason("version negotiation sent to a server"));
            }
            let mut supported_versions = Vec::with_capacity(buffer.len() / 4);
            let mut buffer = buffer;
            while !buffer.is_empty() {
                let (version, rest) = buffer.decode::<u32>().map_err(transport::Error::from)?;
                supported_versions.push(version);
                buffer = rest;
            }
            return Ok(HeaderOutcome::VersionNegotiation(supported_versions));
        }

        let long_type = LongPacketType::from_tag(tag);

        if long_type == LongPacketType::Retry {
            if self.perspective.is_server() {
                return Err(
                    transport::Error::PROTOCOL_VIOLATION.with_reason("retry sent to a server")
                );
            }
            let token_len = buffer
                .len()
                .checked_sub(RETRY_INTEGRITY_TAG_LEN)
                .ok_or_else(|| {
                    transport::Error::PROTOCOL_VIOLATION.with_reason("retry packet too short")
                })?;
            let (token, _tag) = buffer
                .decode_slice(token_len)
                .map_err(transport::Error::from)?;
            return Ok(HeaderOutcome::Retry {
                source_connection_id,
                token: token.into_less_safe_slice().to_vec(),
            });
        }

        let buffer = if long_type == LongPacketType::Initial {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.2
            //# Token Length:  A variable-length integer specifying the length of
            //#    the Token field, in bytes.
            buffer
                .skip_with_len_prefix::<VarInt>()
                .map_err(transport::Error::from)?
        } else {
            buffer
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
        //# Length:  The length of the remainder of the packet (that is, the
        //#    Packet Number and Payload fields) in bytes, encoded as a
        //#    variable-length integer (Section 16).
        let (length, buffer) = buffer.decode::<VarInt>().map_err(transport::Error::from)?;
        let length: usize = length
            .try_into()
            .map_err(|_| transport::Error::FRAME_ENCODING_ERROR)?;

        let packet_number_len = PacketNumberLen::from_packet_tag(tag);
        let packet_number_offset = total_len - buffer.len();
        let packet_len = packet_number_offset
            .checked_add(length)
            .filter(|len| *len <= total_len)
            .ok_or_else(|| {
                transport::Error::FRAME_ENCODING_ERROR.with_reason("length exceeds datagram")
            })?;
        if length < packet_number_len.bytesize() {
            return Err(
                transport::Error::FRAME_ENCODING_ERROR.with_reason("length below packet number")
            );
        }

        Ok(HeaderOutcome::Parsed(ParsedHeader {
            level: long_type.encryption_level(),
            destination_connection_id,
            source_connection_id: Some(source_connection_id),
            version: Some(version),
            packet_number_len,
            packet_number_offset,
            start_of_encrypted_data: packet_number_offset + packet_number_len.bytesize(),
            packet_len,
        }))
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3
    //# A stateless reset is designed to be indistinguishable from a regular
    //# packet with a short header.
    fn is_stateless_reset(&self, datagram: &[u8], token: &stateless_reset::Token) -> bool {
        let token_start = match datagram.len().checked_sub(stateless_reset::TOKEN_LEN) {
            // the random prefix must leave room for at least the first byte
            Some(start) if start >= 1 => start,
            _ => return false,
        };
        let mut received = [0u8; stateless_reset::TOKEN_LEN];
        received.copy_from_slice(&datagram[token_start..]);
        // constant-time comparison through Token's PartialEq
        stateless_reset::Token::from(received) == *token
    }

    /// Builds a packet into `output`, returning the encrypted length
    ///
    /// `write_payload` writes the packet's frames; the framer writes the
    /// header before and seals the payload after. For long headers the
    /// length field is reserved first and back-patched once the encrypted
    /// payload size is known.
    pub fn build_packet<K, F>(
        &self,
        keys: &K,
        header: &Header,
        packet_number: PacketNumber,
        largest_acked_packet_number: Option<PacketNumber>,
        write_payload: F,
        output: &mut [u8],
    ) -> Result<usize, transport::Error>
    where
        K: PacketProtection,
        F: FnOnce(&mut EncoderBuffer),
    {
        let level = header.encryption_level();
        let space = PacketNumberSpace::from_encryption_level(level);
        debug_assert_eq!(packet_number.space(), space);

        let largest = largest_acked_packet_number
            .unwrap_or_else(|| space.new_packet_number(VarInt::ZERO));
        let truncated = packet_number.truncate(largest).ok_or_else(|| {
            transport::Error::INTERNAL_ERROR.with_reason("packet number window exhausted")
        })?;

        let mut encoder = EncoderBuffer::new(output);
        let mut length_offset = None;

        match header {
            Header::Initial {
                version,
                destination_connection_id,
                source_connection_id,
                token,
            } => {
                let tag = LONG_HEADER_BIT
                    | FIXED_BIT
                    | LongPacketType::Initial.into_tag_mask()
                    | truncated.len().into_packet_tag_mask();
                encoder.encode(&tag);
                encoder.encode(version);
                encoder.encode_with_len_prefix::<u8, _>(destination_connection_id);
                encoder.encode_with_len_prefix::<u8, _>(source_connection_id);
                encoder.encode_with_len_prefix::<VarInt, _>(&token.as_slice());
                length_offset = Some(reserve_length_field(&mut encoder));
            }
            Header::ZeroRtt {
                version,
                destination_connection_id,
                source_connection_id,
            }
            | Header::Handshake {
                version,
                destination_connection_id,
                source_connection_id,
            } => {
                let long_type = match header {
                    Header::ZeroRtt { .. } => LongPacketType::ZeroRtt,
                    _ => LongPacketType::Handshake,
                };
                let tag = LONG_HEADER_BIT
                    | FIXED_BIT
                    | long_type.into_tag_mask()
                    | truncated.len().into_packet_tag_mask();
                encoder.encode(&tag);
                encoder.encode(version);
                encoder.encode_with_len_prefix::<u8, _>(destination_connection_id);
                encoder.encode_with_len_prefix::<u8, _>(source_connection_id);
                length_offset = Some(reserve_length_field(&mut encoder));
            }
            Header::Short {
                destination_connection_id,
                spin_bit,
                key_phase,
            } => {
                let mut tag = FIXED_BIT | truncated.len().into_packet_tag_mask();
                if *spin_bit {
                    tag |= SPIN_BIT;
                }
                if *key_phase {
                    tag |= KEY_PHASE_BIT;
                }
                encoder.encode(&tag);
                encoder.encode(destination_connection_id);
            }
        }

        encoder.encode(&truncated);
        let header_len = encoder.len();

        write_payload(&mut encoder);
        let payload_len = encoder.len() - header_len;
        debug_assert!(payload_len > 0, "packets must contain at least one frame");

        let tag_len = keys.tag_len(level);
        let total_len = header_len + payload_len + tag_len;
        if total_len > output.len() {
            return Err(transport::Error::INTERNAL_ERROR.with_reason("packet buffer too small"));
        }

        let (aad, payload) = output.split_at_mut(header_len);
        let sealed_len = keys
            .seal_in_place(
                level,
                packet_number.as_u64(),
                aad,
                &mut payload[..payload_len + tag_len],
                payload_len,
            )
            .map_err(|_| transport::Error::INTERNAL_ERROR.with_reason("seal failed"))?;
        let total_len = header_len + sealed_len;

        if let Some(length_offset) = length_offset {
            patch_length_field(
                output,
                length_offset,
                truncated.len().bytesize() + sealed_len,
            )?;
        }

        Ok(total_len)
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.1
    //# The Version Negotiation packet does not include the Packet Number and
    //# Length fields present in other packets that use the long header form.
    pub fn write_version_negotiation(
        &self,
        destination_connection_id: &ConnectionId,
        source_connection_id: &ConnectionId,
        supported_versions: &[u32],
        random: &mut dyn random::Generator,
        output: &mut [u8],
    ) -> usize {
        let mut first_byte = [0u8; 1];
        random.public_random_fill(&mut first_byte);

        let mut encoder = EncoderBuffer::new(output);
        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.1
        //# The value in the Unused field is set to an arbitrary value by the
        //# server.
        encoder.encode(&(first_byte[0] | LONG_HEADER_BIT));
        encoder.encode(&VERSION_NEGOTIATION);
        encoder.encode_with_len_prefix::<u8, _>(destination_connection_id);
        encoder.encode_with_len_prefix::<u8, _>(source_connection_id);
        for version in supported_versions {
            encoder.encode(version);
        }
        encoder.len()
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3
    //# An endpoint that sends a Stateless Reset in response to a packet that
    //# is 43 bytes or shorter SHOULD send a Stateless Reset that is one byte
    //# shorter than the packet it responds to.
    pub fn write_stateless_reset(
        &self,
        token: stateless_reset::Token,
        triggering_packet_len: usize,
        random: &mut dyn random::Generator,
        output: &mut [u8],
    ) -> Option<usize> {
        const MIN_LEN: usize = 1 + 4 + stateless_reset::TOKEN_LEN;

        let target_len = triggering_packet_len
            .saturating_sub(1)
            .clamp(MIN_LEN, output.len().min(1200));
        if output.len() < target_len {
            return None;
        }

        let prefix_len = target_len - stateless_reset::TOKEN_LEN;
        random.public_random_fill(&mut output[..prefix_len]);
        // make the datagram look like a short-header packet
        output[0] = (output[0] & !LONG_HEADER_BIT) | FIXED_BIT;
        output[prefix_len..target_len].copy_from_slice(token.as_ref());
        Some(target_len)
    }
}

enum HeaderOutcome {
    Parsed(ParsedHeader),
    VersionNegotiation(Vec<u32>),
    Retry {
        source_connection_id: ConnectionId,
        token: Vec<u8>,
    },
}

fn decode_cid(buffer: DecoderBuffer) -> Result<(ConnectionId, DecoderBuffer), transport::Error> {
    let (cid, buffer) = buffer
        .decode_slice_with_len_prefix::<u8>()
        .map_err(transport::Error::from)?;
    let cid = ConnectionId::try_from_bytes(cid.into_less_safe_slice())
        .ok_or(transport::Error::PROTOCOL_VIOLATION)?;
    Ok((cid, buffer))
}

/// The largest value representable in the reserved length width
const LENGTH_PLACEHOLDER: u64 = (1 << 30) - 1;

fn reserve_length_field(encoder: &mut EncoderBuffer) -> usize {
    let offset = encoder.len();
    let placeholder = VarInt::new(LENGTH_PLACEHOLDER).expect("placeholder is in range");
    encoder.encode(&placeholder);
    debug_assert_eq!(encoder.len() - offset, LENGTH_FIELD_RESERVATION);
    offset
}

fn patch_length_field(
    output: &mut [u8],
    length_offset: usize,
    length: usize,
) -> Result<(), transport::Error> {
    let placeholder = VarInt::new(LENGTH_PLACEHOLDER).expect("placeholder is in range");
    let length = VarInt::try_from(length)
        .ok()
        .filter(|len| len.as_u64() <= LENGTH_PLACEHOLDER)
        .ok_or_else(|| transport::Error::INTERNAL_ERROR.with_reason("packet length overflow"))?;

    let region = &mut output[length_offset..length_offset + LENGTH_FIELD_RESERVATION];
    let mut encoder = EncoderBuffer::new(region);
    placeholder.encode_updated(length, &mut encoder);
    Ok(())
}

/// Classifies a frame tag without decoding the frame
///
//= https://www.rfc-editor.org/rfc/rfc9002#section-2
//# All frames other than ACK, PADDING, and
//# CONNECTION_CLOSE are considered ack-eliciting.
fn tag_ack_elicitation(tag: u8) -> AckElicitation {
    match tag {
        0x00 | 0x02 | 0x03 | 0x1c | 0x1d => AckElicitation::NonEliciting,
        _ => AckElicitation::Eliciting,
    }
}

#[cfg(test)]
mod tests;
