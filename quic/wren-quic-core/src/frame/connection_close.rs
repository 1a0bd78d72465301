// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, transport, varint::VarInt};
use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.19
//# An endpoint sends a CONNECTION_CLOSE frame (type=0x1c or 0x1d) to
//# notify its peer that the connection is being closed.  The
//# CONNECTION_CLOSE frame with a type of 0x1c is used to signal errors
//# at only the QUIC layer, or the absence of errors (with the NO_ERROR
//# code).  The CONNECTION_CLOSE frame with a type of 0x1d is used to
//# signal an error with the application that uses QUIC.

macro_rules! connection_close_tag {
    () => {
        0x1cu8..=0x1du8
    };
}
const QUIC_TAG: u8 = 0x1c;
const APPLICATION_TAG: u8 = 0x1d;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConnectionClose<'a> {
    /// The error code which indicates the reason for closing this connection
    pub error_code: VarInt,

    /// The type of the frame that triggered the error; `None` for
    /// application-layer closes
    pub frame_type: Option<VarInt>,

    /// A human-readable explanation for why the connection was closed
    pub reason: Option<&'a [u8]>,
}

impl ConnectionClose<'_> {
    pub const fn tag(&self) -> u8 {
        if self.frame_type.is_some() {
            QUIC_TAG
        } else {
            APPLICATION_TAG
        }
    }
}

impl<'a> From<transport::Error> for ConnectionClose<'a> {
    fn from(error: transport::Error) -> Self {
        let reason = if error.reason.is_empty() {
            None
        } else {
            Some(error.reason.as_bytes())
        };
        ConnectionClose {
            error_code: error.wire_code(),
            frame_type: error.frame_type.or(Some(VarInt::ZERO)),
            reason,
        }
    }
}

decoder_parameterized_value!(
    impl<'a> ConnectionClose<'a> {
        fn decode(tag: Tag, buffer: Buffer) -> Result<Self> {
            let (error_code, buffer) = buffer.decode()?;

            let (frame_type, buffer) = if tag == QUIC_TAG {
                let (frame_type, buffer) = buffer.decode::<VarInt>()?;
                (Some(frame_type), buffer)
            } else {
                (None, buffer)
            };

            let (reason, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;
            let reason = if reason.is_empty() {
                None
            } else {
                Some(&reason.into_less_safe_slice()[..])
            };

            let frame = ConnectionClose {
                error_code,
                frame_type,
                reason,
            };

            Ok((frame, buffer))
        }
    }
);

impl EncoderValue for ConnectionClose<'_> {
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&self.error_code);

        if let Some(frame_type) = &self.frame_type {
            buffer.encode(frame_type);
        }

        if let Some(reason) = &self.reason {
            buffer.encode_with_len_prefix::<VarInt, _>(reason);
        } else {
            buffer.encode(&VarInt::ZERO);
        }
    }
}
