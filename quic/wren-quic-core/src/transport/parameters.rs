// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The transport-parameter TLV block exchanged during the handshake
//!
//! Every parameter is serialized as `varint(id) || varint(length) || value`.
//! Integer parameters are omitted when equal to their default and must use
//! minimum-length varint encoding on the wire. Receiving the same parameter
//! twice is a protocol violation. Unknown parameters are carried opaquely so
//! extensions and GREASE values survive a round trip.

use crate::{
    connection::ConnectionId,
    endpoint,
    random,
    stateless_reset,
    transport::Error,
    varint::VarInt,
};
use std::net::{Ipv4Addr, Ipv6Addr};
use s2n_codec::{DecoderBuffer, Encoder, EncoderBuffer};

//= https://www.rfc-editor.org/rfc/rfc9000#section-18.1
//# Transport parameters with an identifier of the form "31 * N + 27" for
//# integer values of N are reserved to exercise the requirement that
//# unknown transport parameters be ignored.
const GREASE_MODULUS: u64 = 31;
const GREASE_REMAINDER: u64 = 27;

/// The maximum value of a stream-count parameter
//= https://www.rfc-editor.org/rfc/rfc9000#section-4.6
//# If a max_streams transport parameter or a MAX_STREAMS frame is
//# received with a value greater than 2^60, this would allow a maximum
//# stream ID that cannot be expressed as a variable-length integer; see
//# Section 16.  If either is received, the connection MUST be closed
//# immediately with a connection error of type TRANSPORT_PARAMETER_ERROR
const MAX_STREAMS_VALUE: u64 = 1 << 60;

/// Version prefix of the 0-RTT resumption ticket format
const TICKET_VERSION: u8 = 1;

macro_rules! integer_parameters {
    ($apply:ident) => {
        $apply! {
            // field, id, default, min, max
            max_idle_timeout, 0x01, 0, 0, crate::varint::MAX_VARINT_VALUE;
            max_udp_payload_size, 0x03, 65527, 1200, 65527;
            initial_max_data, 0x04, 0, 0, crate::varint::MAX_VARINT_VALUE;
            initial_max_stream_data_bidi_local, 0x05, 0, 0, crate::varint::MAX_VARINT_VALUE;
            initial_max_stream_data_bidi_remote, 0x06, 0, 0, crate::varint::MAX_VARINT_VALUE;
            initial_max_stream_data_uni, 0x07, 0, 0, crate::varint::MAX_VARINT_VALUE;
            initial_max_streams_bidi, 0x08, 0, 0, MAX_STREAMS_VALUE;
            initial_max_streams_uni, 0x09, 0, 0, MAX_STREAMS_VALUE;
            ack_delay_exponent, 0x0a, 3, 0, 20;
            max_ack_delay, 0x0b, 25, 0, (1 << 14) - 1;
            active_connection_id_limit, 0x0e, 2, 2, crate::varint::MAX_VARINT_VALUE;
        }
    };
}

const ORIGINAL_DESTINATION_CONNECTION_ID_ID: u64 = 0x00;
const STATELESS_RESET_TOKEN_ID: u64 = 0x02;
const DISABLE_ACTIVE_MIGRATION_ID: u64 = 0x0c;
const PREFERRED_ADDRESS_ID: u64 = 0x0d;
const INITIAL_SOURCE_CONNECTION_ID_ID: u64 = 0x0f;
const RETRY_SOURCE_CONNECTION_ID_ID: u64 = 0x10;

macro_rules! declare_struct {
    ($($field:ident, $id:expr, $default:expr, $min:expr, $max:expr;)*) => {
        /// The transport parameters advertised by one endpoint
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct TransportParameters {
            $(
                pub $field: VarInt,
            )*
            pub original_destination_connection_id: Option<ConnectionId>,
            pub stateless_reset_token: Option<stateless_reset::Token>,
            pub disable_active_migration: bool,
            pub preferred_address: Option<PreferredAddress>,
            pub initial_source_connection_id: Option<ConnectionId>,
            pub retry_source_connection_id: Option<ConnectionId>,
            /// Parameters with IDs this implementation does not recognize,
            /// carried opaquely
            pub custom: Vec<CustomParameter>,
        }

        impl Default for TransportParameters {
            fn default() -> Self {
                Self {
                    $(
                        $field: VarInt::new($default).expect("default is in range"),
                    )*
                    original_destination_connection_id: None,
                    stateless_reset_token: None,
                    disable_active_migration: false,
                    preferred_address: None,
                    initial_source_connection_id: None,
                    retry_source_connection_id: None,
                    custom: Vec::new(),
                }
            }
        }
    };
}

integer_parameters!(declare_struct);

/// An unrecognized parameter carried opaquely
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustomParameter {
    pub id: VarInt,
    pub value: Vec<u8>,
}

impl CustomParameter {
    /// Returns true if the ID is reserved for GREASE
    pub fn is_grease(&self) -> bool {
        self.id.as_u64() % GREASE_MODULUS == GREASE_REMAINDER
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
//# Preferred Address {
//#   IPv4 Address (32),
//#   IPv4 Port (16),
//#   IPv6 Address (128),
//#   IPv6 Port (16),
//#   Connection ID Length (8),
//#   Connection ID (..),
//#   Stateless Reset Token (128),
//# }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreferredAddress {
    pub ipv4_address: Ipv4Addr,
    pub ipv4_port: u16,
    pub ipv6_address: Ipv6Addr,
    pub ipv6_port: u16,
    pub connection_id: ConnectionId,
    pub stateless_reset_token: stateless_reset::Token,
}

impl PreferredAddress {
    fn decode(buffer: DecoderBuffer) -> Result<Self, Error> {
        let err = |reason| Error::TRANSPORT_PARAMETER_ERROR.with_reason(reason);

        let (v4_bytes, buffer) = buffer
            .decode_slice(4)
            .map_err(|_| err("preferred address too short"))?;
        let mut v4 = [0u8; 4];
        v4.copy_from_slice(v4_bytes.into_less_safe_slice());
        let (ipv4_port, buffer) = buffer
            .decode::<u16>()
            .map_err(|_| err("preferred address too short"))?;

        let (v6_bytes, buffer) = buffer
            .decode_slice(16)
            .map_err(|_| err("preferred address too short"))?;
        let mut v6 = [0u8; 16];
        v6.copy_from_slice(v6_bytes.into_less_safe_slice());
        let (ipv6_port, buffer) = buffer
            .decode::<u16>()
            .map_err(|_| err("preferred address too short"))?;

        let (connection_id, buffer) = buffer
            .decode_slice_with_len_prefix::<u8>()
            .map_err(|_| err("invalid preferred address connection id"))?;
        let connection_id = ConnectionId::try_from_bytes(connection_id.into_less_safe_slice())
            .ok_or_else(|| err("invalid preferred address connection id"))?;
        //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
        //# A server that chooses a zero-length connection ID MUST NOT provide
        //# a preferred address.
        if connection_id.is_empty() {
            return Err(err("empty preferred address connection id"));
        }

        let (stateless_reset_token, buffer) = buffer
            .decode::<stateless_reset::Token>()
            .map_err(|_| err("invalid preferred address token"))?;
        buffer
            .ensure_empty()
            .map_err(|_| err("trailing bytes after preferred address"))?;

        let decoded = Self {
            ipv4_address: v4.into(),
            ipv4_port,
            ipv6_address: v6.into(),
            ipv6_port,
            connection_id,
            stateless_reset_token,
        };

        // both address families are always carried; an endpoint that does
        // not have one of them fails the parse rather than inventing one
        if decoded.ipv4_address.is_unspecified() && decoded.ipv6_address.is_unspecified() {
            return Err(err("preferred address carries no usable address"));
        }

        Ok(decoded)
    }

    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(&self.ipv4_address.octets());
        encoder.encode(&self.ipv4_port);
        encoder.write_slice(&self.ipv6_address.octets());
        encoder.encode(&self.ipv6_port);
        encoder.encode_with_len_prefix::<u8, _>(&self.connection_id);
        encoder.encode(&self.stateless_reset_token);
    }

    fn encoding_size(&self) -> usize {
        4 + 2 + 16 + 2 + 1 + self.connection_id.len() + stateless_reset::TOKEN_LEN
    }
}

/// Tracks which known parameter IDs were already seen during a parse
#[derive(Default)]
struct SeenParameters {
    known: u32,
    custom: Vec<u64>,
}

impl SeenParameters {
    fn mark(&mut self, id: u64) -> Result<(), Error> {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-7.4
        //# An endpoint MUST NOT send a parameter more than once in a given
        //# transport parameters extension.  An endpoint SHOULD treat receipt
        //# of duplicate transport parameters as a connection error of type
        //# TRANSPORT_PARAMETER_ERROR.
        let duplicate = if id < 32 {
            let bit = 1u32 << id;
            let seen = self.known & bit != 0;
            self.known |= bit;
            seen
        } else {
            let seen = self.custom.contains(&id);
            if !seen {
                self.custom.push(id);
            }
            seen
        };

        if duplicate {
            Err(Error::TRANSPORT_PARAMETER_ERROR.with_reason("duplicate transport parameter"))
        } else {
            Ok(())
        }
    }
}

fn decode_varint_value(value: DecoderBuffer) -> Result<VarInt, Error> {
    let (decoded, remaining) = value
        .decode::<VarInt>()
        .map_err(|_| Error::TRANSPORT_PARAMETER_ERROR.with_reason("malformed integer parameter"))?;
    remaining
        .ensure_empty()
        .map_err(|_| Error::TRANSPORT_PARAMETER_ERROR.with_reason("trailing parameter bytes"))?;
    Ok(decoded)
}

fn decode_cid_value(value: DecoderBuffer) -> Result<ConnectionId, Error> {
    let bytes = value.into_less_safe_slice();
    ConnectionId::try_from_bytes(bytes)
        .ok_or_else(|| Error::TRANSPORT_PARAMETER_ERROR.with_reason("connection id too long"))
}

impl TransportParameters {
    /// Parses a transport-parameter block received from `sender`
    pub fn decode(buffer: DecoderBuffer, sender: endpoint::Type) -> Result<Self, Error> {
        let mut params = Self::default();
        let mut seen = SeenParameters::default();
        let mut buffer = buffer;

        macro_rules! decode_integers {
            ($($field:ident, $id:expr, $default:expr, $min:expr, $max:expr;)*) => {
                |params: &mut Self, id: u64, value: DecoderBuffer| -> Result<bool, Error> {
                    $(
                        if id == $id {
                            let decoded = decode_varint_value(value)?;
                            #[allow(clippy::manual_range_contains)]
                            if decoded.as_u64() < $min || decoded.as_u64() > $max {
                                return Err(Error::TRANSPORT_PARAMETER_ERROR
                                    .with_reason("parameter out of range"));
                            }
                            params.$field = decoded;
                            return Ok(true);
                        }
                    )*
                    Ok(false)
                }
            };
        }
        let decode_integer = integer_parameters!(decode_integers);

        while !buffer.is_empty() {
            let (id, rest) = buffer
                .decode::<VarInt>()
                .map_err(|_| Error::TRANSPORT_PARAMETER_ERROR.with_reason("malformed id"))?;
            let (value, rest) = rest
                .decode_slice_with_len_prefix::<VarInt>()
                .map_err(|_| Error::TRANSPORT_PARAMETER_ERROR.with_reason("malformed length"))?;
            buffer = rest;

            let id = id.as_u64();
            seen.mark(id)?;

            if decode_integer(&mut params, id, value)? {
                continue;
            }

            //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
            //# A client MUST NOT include any server-only transport parameter:
            //# original_destination_connection_id, preferred_address,
            //# retry_source_connection_id, or stateless_reset_token.
            let server_only = matches!(
                id,
                ORIGINAL_DESTINATION_CONNECTION_ID_ID
                    | STATELESS_RESET_TOKEN_ID
                    | PREFERRED_ADDRESS_ID
                    | RETRY_SOURCE_CONNECTION_ID_ID
            );
            if server_only && sender.is_client() {
                return Err(
                    Error::TRANSPORT_PARAMETER_ERROR.with_reason("server-only parameter")
                );
            }

            match id {
                ORIGINAL_DESTINATION_CONNECTION_ID_ID => {
                    params.original_destination_connection_id = Some(decode_cid_value(value)?);
                }
                STATELESS_RESET_TOKEN_ID => {
                    let (token, remaining) = value.decode().map_err(|_| {
                        Error::TRANSPORT_PARAMETER_ERROR.with_reason("malformed reset token")
                    })?;
                    remaining.ensure_empty().map_err(|_| {
                        Error::TRANSPORT_PARAMETER_ERROR.with_reason("malformed reset token")
                    })?;
                    params.stateless_reset_token = Some(token);
                }
                DISABLE_ACTIVE_MIGRATION_ID => {
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.2
                    //# This parameter is a zero-length value.
                    value.ensure_empty().map_err(|_| {
                        Error::TRANSPORT_PARAMETER_ERROR
                            .with_reason("disable_active_migration carries a value")
                    })?;
                    params.disable_active_migration = true;
                }
                PREFERRED_ADDRESS_ID => {
                    params.preferred_address = Some(PreferredAddress::decode(value)?);
                }
                INITIAL_SOURCE_CONNECTION_ID_ID => {
                    params.initial_source_connection_id = Some(decode_cid_value(value)?);
                }
                RETRY_SOURCE_CONNECTION_ID_ID => {
                    params.retry_source_connection_id = Some(decode_cid_value(value)?);
                }
                _ => {
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-7.4.2
                    //# An endpoint MUST ignore transport parameters that it does
                    //# not support.
                    params.custom.push(CustomParameter {
                        id: VarInt::new(id).expect("id was decoded as a varint"),
                        value: value.into_less_safe_slice().to_vec(),
                    });
                }
            }
        }

        Ok(params)
    }

    /// Serializes the parameters, appending a random GREASE entry
    ///
    /// A safe upper bound is computed first; the buffer is truncated to the
    /// written length.
    pub fn encode_to_vec(&self, random: &mut dyn random::Generator) -> Result<Vec<u8>, Error> {
        for custom in &self.custom {
            if custom.is_grease() || is_known_id(custom.id.as_u64()) {
                return Err(Error::INTERNAL_ERROR.with_reason("custom parameter id is reserved"));
            }
        }

        let grease = self.generate_grease(random);

        let mut bytes = vec![0u8; self.max_encoding_size(&grease)];
        let mut encoder = EncoderBuffer::new(&mut bytes);

        macro_rules! encode_integers {
            ($($field:ident, $id:expr, $default:expr, $min:expr, $max:expr;)*) => {
                $(
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.1
                    //# A default value of 0 ... is assumed if the transport
                    //# parameter is absent.
                    if self.$field.as_u64() != $default {
                        encoder.encode(&VarInt::from_u8($id));
                        encoder.encode_with_len_prefix::<VarInt, _>(&self.$field);
                    }
                )*
            };
        }
        integer_parameters!(encode_integers);

        if let Some(cid) = &self.original_destination_connection_id {
            encoder.encode(&VarInt::from_u8(ORIGINAL_DESTINATION_CONNECTION_ID_ID as u8));
            encoder.encode_with_len_prefix::<VarInt, _>(cid);
        }
        if let Some(token) = &self.stateless_reset_token {
            encoder.encode(&VarInt::from_u8(STATELESS_RESET_TOKEN_ID as u8));
            encoder.encode_with_len_prefix::<VarInt, _>(token);
        }
        if self.disable_active_migration {
            encoder.encode(&VarInt::from_u8(DISABLE_ACTIVE_MIGRATION_ID as u8));
            encoder.encode(&VarInt::ZERO);
        }
        if let Some(preferred_address) = &self.preferred_address {
            encoder.encode(&VarInt::from_u8(PREFERRED_ADDRESS_ID as u8));
            let len = VarInt::try_from(preferred_address.encoding_size())
                .map_err(|_| Error::INTERNAL_ERROR)?;
            encoder.encode(&len);
            preferred_address.encode(&mut encoder);
        }
        if let Some(cid) = &self.initial_source_connection_id {
            encoder.encode(&VarInt::from_u8(INITIAL_SOURCE_CONNECTION_ID_ID as u8));
            encoder.encode_with_len_prefix::<VarInt, _>(cid);
        }
        if let Some(cid) = &self.retry_source_connection_id {
            encoder.encode(&VarInt::from_u8(RETRY_SOURCE_CONNECTION_ID_ID as u8));
            encoder.encode_with_len_prefix::<VarInt, _>(cid);
        }

        for custom in &self.custom {
            encoder.encode(&custom.id);
            encoder.encode_with_len_prefix::<VarInt, _>(&custom.value.as_slice());
        }

        encoder.encode(&grease.id);
        encoder.encode_with_len_prefix::<VarInt, _>(&grease.value.as_slice());

        let len = encoder.len();
        bytes.truncate(len);
        Ok(bytes)
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-18.1
    //# Endpoints MAY advertise transport parameters of this type, and they
    //# MUST ignore them.
    fn generate_grease(&self, random: &mut dyn random::Generator) -> CustomParameter {
        let mut bytes = [0u8; 3];
        random.public_random_fill(&mut bytes);

        let n = u64::from(u16::from_be_bytes([bytes[0], bytes[1]]));
        let id = GREASE_REMAINDER + GREASE_MODULUS * n;
        let value_len = usize::from(bytes[2]) % 17;
        let mut value = vec![0u8; value_len];
        random.public_random_fill(&mut value);

        CustomParameter {
            id: VarInt::new(id).expect("grease id is in range"),
            value,
        }
    }

    fn max_encoding_size(&self, grease: &CustomParameter) -> usize {
        // 8-byte id + 8-byte length upper bound per entry
        const ENTRY_OVERHEAD: usize = 16;

        let mut size = 0;
        // integer parameters
        size += 11 * (ENTRY_OVERHEAD + 8);
        for cid in [
            &self.original_destination_connection_id,
            &self.initial_source_connection_id,
            &self.retry_source_connection_id,
        ]
        .into_iter()
        .flatten()
        {
            size += ENTRY_OVERHEAD + cid.len();
        }
        if self.stateless_reset_token.is_some() {
            size += ENTRY_OVERHEAD + stateless_reset::TOKEN_LEN;
        }
        size += ENTRY_OVERHEAD; // disable_active_migration
        if let Some(preferred_address) = &self.preferred_address {
            size += ENTRY_OVERHEAD + preferred_address.encoding_size();
        }
        for custom in &self.custom {
            size += ENTRY_OVERHEAD + custom.value.len();
        }
        size += ENTRY_OVERHEAD + grease.value.len();
        size
    }

    /// Computes the resumption-ticket digest binding these parameters
    ///
    /// `SHA-256(version || app_data_len || app_data || parameter_version ||
    /// serialized_integer_params || disable_active_migration)`; a mismatch on
    /// resumption aborts 0-RTT.
    pub fn ticket_digest(&self, application_data: &[u8]) -> [u8; 32] {
        let mut input = Vec::with_capacity(application_data.len() + 128);
        input.extend_from_slice(&crate::packet::QUIC_VERSION_1.to_be_bytes());
        input.extend_from_slice(&(application_data.len() as u64).to_be_bytes());
        input.extend_from_slice(application_data);
        input.push(TICKET_VERSION);

        macro_rules! hash_integers {
            ($($field:ident, $id:expr, $default:expr, $min:expr, $max:expr;)*) => {
                $(
                    input.extend_from_slice(&[$id]);
                    input.extend_from_slice(&self.$field.as_u64().to_be_bytes());
                )*
            };
        }
        integer_parameters!(hash_integers);

        input.push(self.disable_active_migration as u8);

        let digest = ring::digest::digest(&ring::digest::SHA256, &input);
        let mut out = [0u8; 32];
        out.copy_from_slice(digest.as_ref());
        out
    }

    /// Serializes a resumption ticket for these parameters
    pub fn serialize_for_ticket(&self, application_data: &[u8]) -> Vec<u8> {
        let mut ticket = Vec::with_capacity(1 + 32);
        ticket.push(TICKET_VERSION);
        ticket.extend_from_slice(&self.ticket_digest(application_data));
        ticket
    }

    /// Returns true if a stored ticket still matches these parameters
    pub fn validate_ticket(&self, application_data: &[u8], ticket: &[u8]) -> bool {
        if ticket.len() != 1 + 32 || ticket[0] != TICKET_VERSION {
            return false;
        }
        ticket[1..] == self.ticket_digest(application_data)
    }
}

fn is_known_id(id: u64) -> bool {
    macro_rules! known_integers {
        ($($field:ident, $id:expr, $default:expr, $min:expr, $max:expr;)*) => {
            false $(|| id == $id)*
        };
    }
    let integer = integer_parameters!(known_integers);
    integer
        || matches!(
            id,
            ORIGINAL_DESTINATION_CONNECTION_ID_ID
                | STATELESS_RESET_TOKEN_ID
                | DISABLE_ACTIVE_MIGRATION_ID
                | PREFERRED_ADDRESS_ID
                | INITIAL_SOURCE_CONNECTION_ID_ID
                | RETRY_SOURCE_CONNECTION_ID_ID
        )
}
