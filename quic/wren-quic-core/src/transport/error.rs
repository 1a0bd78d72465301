// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::{VarInt, VarIntError};
use core::fmt;
use s2n_codec::DecoderError;

//= https://www.rfc-editor.org/rfc/rfc9000#section-20
//# QUIC transport error codes and application error codes are 62-bit
//# unsigned integers.

/// A connection-level protocol failure
///
/// The `code` is what goes on the wire in a CONNECTION_CLOSE frame; `reason`
/// carries a short diagnostic string and `frame_type` the frame which
/// triggered the failure, when known.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Error {
    pub code: VarInt,
    pub frame_type: Option<VarInt>,
    pub reason: &'static str,
}

impl Error {
    /// Creates a new `Error` with the specified code
    pub const fn new(code: VarInt) -> Self {
        Self {
            code,
            reason: "",
            frame_type: None,
        }
    }

    /// Updates the `Error` with the specified `frame_type`
    #[must_use]
    pub const fn with_frame_type(mut self, frame_type: VarInt) -> Self {
        self.frame_type = Some(frame_type);
        self
    }

    /// Updates the `Error` with the specified `reason`
    #[must_use]
    pub const fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = reason;
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "TransportError({})", self.code.as_u64())
        } else {
            f.write_str(self.reason)
        }
    }
}

impl std::error::Error for Error {}

/// Internal convenience macro for defining standard error codes
macro_rules! def_error {
    ($doc:expr, $name:ident, $code:expr) => {
        impl Error {
            #[doc = $doc]
            pub const $name: Error = Error::new(VarInt::from_u32($code));
        }
    };
}

def_error!(
    "The connection is being closed abruptly in the absence of any error.",
    NO_ERROR,
    0x0
);
def_error!(
    "The endpoint encountered an internal error and cannot continue with the connection.",
    INTERNAL_ERROR,
    0x1
);
def_error!(
    "The server refused to accept a new connection.",
    CONNECTION_REFUSED,
    0x2
);
def_error!(
    "An endpoint received more data than it permitted in its advertised data limits.",
    FLOW_CONTROL_ERROR,
    0x3
);
def_error!(
    "An endpoint received a frame for a stream identifier that exceeded its advertised stream limit for the corresponding stream type.",
    STREAM_LIMIT_ERROR,
    0x4
);
def_error!(
    "An endpoint received a frame for a stream that was not in a state that permitted that frame.",
    STREAM_STATE_ERROR,
    0x5
);
def_error!(
    "An endpoint received a STREAM frame containing data that exceeded the previously established final size.",
    FINAL_SIZE_ERROR,
    0x6
);
def_error!(
    "An endpoint received a frame that was badly formatted.",
    FRAME_ENCODING_ERROR,
    0x7
);
def_error!(
    "An endpoint received transport parameters that were badly formatted.",
    TRANSPORT_PARAMETER_ERROR,
    0x8
);
def_error!(
    "The number of connection IDs provided by the peer exceeds the advertised active_connection_id_limit.",
    CONNECTION_ID_LIMIT_ERROR,
    0x9
);
def_error!(
    "An endpoint detected an error with protocol compliance that was not covered by more specific error codes.",
    PROTOCOL_VIOLATION,
    0xA
);
def_error!(
    "A server received a client Initial that contained an invalid Token field.",
    INVALID_TOKEN,
    0xB
);
def_error!(
    "The application or application protocol caused the connection to be closed.",
    APPLICATION_ERROR,
    0xC
);
def_error!(
    "An endpoint has received more data in CRYPTO frames than it can buffer.",
    CRYPTO_BUFFER_EXCEEDED,
    0xD
);
def_error!(
    "An endpoint detected errors in performing key updates.",
    KEY_UPDATE_ERROR,
    0xE
);
def_error!(
    "An endpoint has reached the confidentiality or integrity limit for the AEAD algorithm.",
    AEAD_LIMIT_REACHED,
    0xF
);

// Implementation-local error kinds. These never appear on the wire directly;
// a kind is mapped to one of the codes above (or to silence) before a
// CONNECTION_CLOSE is emitted. The code space starting at 0x4000_0000 is well
// above every IETF-assigned transport code.
macro_rules! def_local_error {
    ($doc:expr, $name:ident, $offset:expr) => {
        impl Error {
            #[doc = $doc]
            pub const $name: Error = Error::new(VarInt::from_u32(0x4000_0000 + $offset));
        }
    };
}

def_local_error!(
    "Stream frames arrived in a combination the sequencer cannot represent, such as conflicting fin offsets.",
    STREAM_SEQUENCER_INVALID_STATE,
    0x0
);
def_local_error!("A stream frame carried out-of-bounds data.", INVALID_STREAM_DATA, 0x1);
def_local_error!(
    "A crypto message of an unexpected type was received.",
    INVALID_CRYPTO_MESSAGE_TYPE,
    0x2
);
def_local_error!(
    "The peer forced retirement of connection IDs faster than they could be drained.",
    TOO_MANY_CONNECTION_ID_WAITING_TO_RETIRE,
    0x3
);
def_local_error!("The connection was idle past the negotiated timeout.", NETWORK_IDLE_TIMEOUT, 0x4);
def_local_error!("The handshake did not complete in time.", HANDSHAKE_TIMEOUT, 0x5);
def_local_error!("The handshake failed.", HANDSHAKE_FAILED, 0x6);
def_local_error!(
    "Retransmissions were abandoned after too many probe timeouts.",
    TOO_MANY_RTOS,
    0x7
);
def_local_error!("The peer sent a valid stateless reset.", PUBLIC_RESET, 0x8);
def_local_error!(
    "An application read was inconsistent with the stream's readable bytes.",
    ERROR_PROCESSING_STREAM,
    0x9
);
def_local_error!(
    "The buffered-packet store is at its connection capacity.",
    TOO_MANY_CONNECTIONS,
    0xA
);
def_local_error!(
    "A pending connection buffered more undecryptable packets than allowed.",
    TOO_MANY_PACKETS,
    0xB
);

impl Error {
    /// Returns true if the error terminates the connection silently, with no
    /// CONNECTION_CLOSE on the wire
    #[inline]
    pub fn is_silent(&self) -> bool {
        self.code == Self::PUBLIC_RESET.code
    }

    /// Returns the wire-level transport error code for this error
    ///
    /// Implementation-local kinds collapse onto the closest IETF code.
    #[inline]
    pub fn wire_code(&self) -> VarInt {
        if self.code.as_u64() < 0x4000_0000 {
            return self.code;
        }
        if self.code == Self::STREAM_SEQUENCER_INVALID_STATE.code
            || self.code == Self::INVALID_STREAM_DATA.code
        {
            Self::FRAME_ENCODING_ERROR.code
        } else if self.code == Self::TOO_MANY_CONNECTION_ID_WAITING_TO_RETIRE.code {
            Self::CONNECTION_ID_LIMIT_ERROR.code
        } else if self.code == Self::INVALID_CRYPTO_MESSAGE_TYPE.code
            || self.code == Self::HANDSHAKE_FAILED.code
        {
            Self::PROTOCOL_VIOLATION.code
        } else if self.code == Self::ERROR_PROCESSING_STREAM.code {
            Self::INTERNAL_ERROR.code
        } else {
            Self::NO_ERROR.code
        }
    }
}

impl From<DecoderError> for Error {
    fn from(error: DecoderError) -> Self {
        match error {
            DecoderError::InvariantViolation(reason) => {
                Self::FRAME_ENCODING_ERROR.with_reason(reason)
            }
            _ => Self::FRAME_ENCODING_ERROR.with_reason("malformed input"),
        }
    }
}

impl From<VarIntError> for Error {
    fn from(_: VarIntError) -> Self {
        Self::INTERNAL_ERROR.with_reason("varint range exceeded")
    }
}
