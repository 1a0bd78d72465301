// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Defines the QUIC connection ID

use crate::transport;
use s2n_codec::{decoder_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-5.1
//# Each connection possesses a set of connection identifiers, or
//# connection IDs, each of which can identify the connection.
//# Connection IDs are independently selected by endpoints; each endpoint
//# selects the connection IDs that its peer uses.

/// The maximum size of a connection ID
pub const MAX_LEN: usize = 18;

/// An immutable sequence of 0 to 18 bytes, stored in network byte order.
///
/// Zero-length connection IDs are permitted.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId {
    bytes: [u8; MAX_LEN],
    len: u8,
}

impl core::fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ConnectionId({:?})", self.as_bytes())
    }
}

impl ConnectionId {
    pub const EMPTY: Self = Self {
        bytes: [0; MAX_LEN],
        len: 0,
    };

    /// Creates a connection ID from a byte slice.
    ///
    /// Returns `None` if the slice exceeds the maximum allowed length.
    #[inline]
    pub fn try_from_bytes(bytes: &[u8]) -> Option<Self> {
        Self::try_from(bytes).ok()
    }

    /// Returns the connection ID in byte form
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.as_ref()
    }

    /// Returns the length of the connection ID
    #[inline]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns true if this connection ID is zero-length
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A connection ID to use for testing
    #[cfg(any(test, feature = "testing"))]
    pub const TEST_ID: Self = {
        let mut bytes = [0u8; MAX_LEN];
        bytes[0] = 0xde;
        bytes[1] = 0xad;
        bytes[2] = 0xbe;
        bytes[3] = 0xef;
        Self { bytes, len: 8 }
    };
}

impl TryFrom<&[u8]> for ConnectionId {
    type Error = Error;

    #[inline]
    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        let len = slice.len();
        if len > MAX_LEN {
            return Err(Error::InvalidLength);
        }
        let mut bytes = [0; MAX_LEN];
        bytes[..len].copy_from_slice(slice);
        Ok(Self {
            bytes,
            len: len as u8,
        })
    }
}

impl AsRef<[u8]> for ConnectionId {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

decoder_value!(
    impl<'a> ConnectionId {
        fn decode(buffer: Buffer) -> Result<Self> {
            let len = buffer.len();
            let (value, buffer) = buffer.decode_slice(len)?;
            let value: &[u8] = value.into_less_safe_slice();
            let connection_id = ConnectionId::try_from(value).map_err(|_| {
                s2n_codec::DecoderError::InvariantViolation("invalid connection id")
            })?;

            Ok((connection_id, buffer))
        }
    }
);

impl EncoderValue for ConnectionId {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        self.as_ref().encode(encoder)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    InvalidLength,
}

impl Error {
    fn message(&self) -> &'static str {
        match self {
            Error::InvalidLength => "invalid connection id length",
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl From<Error> for transport::Error {
    #[inline]
    fn from(error: Error) -> Self {
        transport::Error::PROTOCOL_VIOLATION.with_reason(error.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_connection_id() {
        let id = ConnectionId::try_from_bytes(b"connection 123").unwrap();
        assert_eq!(b"connection 123", id.as_bytes());
        assert_eq!(id.len(), 14);
    }

    #[test]
    fn zero_length_is_permitted() {
        let id = ConnectionId::try_from_bytes(&[]).unwrap();
        assert!(id.is_empty());
        assert_eq!(id, ConnectionId::EMPTY);
    }

    #[test]
    fn exceed_max_connection_id_length() {
        assert!(ConnectionId::try_from_bytes(&[0u8; MAX_LEN]).is_some());
        assert!(ConnectionId::try_from_bytes(&[0u8; MAX_LEN + 1]).is_none());
    }

    #[test]
    fn ids_are_totally_ordered() {
        let a = ConnectionId::try_from_bytes(&[1, 2]).unwrap();
        let b = ConnectionId::try_from_bytes(&[1, 3]).unwrap();
        assert!(a < b);
        assert_eq!(a.cmp(&a), core::cmp::Ordering::Equal);
    }
}
