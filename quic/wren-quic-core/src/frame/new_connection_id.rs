// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{connection::ConnectionId, frame::Tag, stateless_reset, varint::VarInt};
use s2n_codec::{decoder_parameterized_value, DecoderError, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
//# An endpoint sends a NEW_CONNECTION_ID frame (type=0x18) to provide
//# its peer with alternative connection IDs that can be used to break
//# linkability when migrating connections.

macro_rules! new_connection_id_tag {
    () => {
        0x18u8
    };
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
//# NEW_CONNECTION_ID Frame {
//#   Type (i) = 0x18,
//#   Sequence Number (i),
//#   Retire Prior To (i),
//#   Length (8),
//#   Connection ID (8..160),
//#   Stateless Reset Token (128),
//# }

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NewConnectionId {
    /// The sequence number assigned to the connection ID by the sender
    pub sequence_number: VarInt,

    /// A variable-length integer indicating which connection IDs should be
    /// retired
    pub retire_prior_to: VarInt,

    /// The new connection ID
    pub connection_id: ConnectionId,

    /// A 128-bit value that will be used for a stateless reset when the
    /// associated connection ID is used
    pub stateless_reset_token: stateless_reset::Token,
}

impl NewConnectionId {
    pub const fn tag(self) -> u8 {
        new_connection_id_tag!()
    }
}

decoder_parameterized_value!(
    impl<'a> NewConnectionId {
        fn decode(_tag: Tag, buffer: Buffer) -> Result<Self> {
            let (sequence_number, buffer) = buffer.decode::<VarInt>()?;
            let (retire_prior_to, buffer) = buffer.decode::<VarInt>()?;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
            //# The value in the Retire Prior To field MUST be less than or
            //# equal to the value in the Sequence Number field.
            if retire_prior_to > sequence_number {
                return Err(DecoderError::InvariantViolation(
                    "retire_prior_to exceeds sequence_number",
                ));
            }

            let (connection_id, buffer) = buffer.decode_with_len_prefix::<u8, ConnectionId>()?;
            if connection_id.is_empty() {
                return Err(DecoderError::InvariantViolation("empty connection id"));
            }

            let (stateless_reset_token, buffer) = buffer.decode()?;

            let frame = NewConnectionId {
                sequence_number,
                retire_prior_to,
                connection_id,
                stateless_reset_token,
            };

            Ok((frame, buffer))
        }
    }
);

impl EncoderValue for NewConnectionId {
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&self.sequence_number);
        buffer.encode(&self.retire_prior_to);
        buffer.encode_with_len_prefix::<u8, _>(&self.connection_id);
        buffer.encode(&self.stateless_reset_token);
    }
}
