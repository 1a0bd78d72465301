// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stream identifiers and their directionality

use crate::{endpoint, varint::VarInt};

//= https://www.rfc-editor.org/rfc/rfc9000#section-2.1
//# Streams can be unidirectional or bidirectional.

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamType {
    Bidirectional,
    Unidirectional,
}

/// The amount a stream ID grows between consecutive streams of one type
/// opened by one endpoint
pub const STREAM_ID_DELTA: u64 = 4;

//= https://www.rfc-editor.org/rfc/rfc9000#section-2.1
//# The least significant bit (0x01) of the stream ID identifies the
//# initiator of the stream.  Client-initiated streams have even-numbered
//# stream IDs (with the bit set to 0), and server-initiated streams have
//# odd-numbered stream IDs (with the bit set to 1).

//= https://www.rfc-editor.org/rfc/rfc9000#section-2.1
//# The second least significant bit (0x02) of the stream ID
//# distinguishes between bidirectional streams (with the bit set to 0)
//# and unidirectional streams (with the bit set to 1).

/// The ID of a stream, tagged with initiator and directionality
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(VarInt);

impl StreamId {
    /// The first stream ID opened by `initiator` for the given type
    #[inline]
    pub fn initial(initiator: endpoint::Type, stream_type: StreamType) -> Self {
        let mut value = 0;
        if initiator.is_server() {
            value |= 0x01;
        }
        if stream_type == StreamType::Unidirectional {
            value |= 0x02;
        }
        Self(VarInt::from_u8(value))
    }

    /// The `n`th (0-based) stream ID opened by `initiator` for the given type
    #[inline]
    pub fn nth(initiator: endpoint::Type, stream_type: StreamType, n: u64) -> Option<Self> {
        let base = Self::initial(initiator, stream_type);
        let value = VarInt::new(n.checked_mul(STREAM_ID_DELTA)?).ok()?;
        Some(Self(base.0.checked_add(value)?))
    }

    #[inline]
    pub fn from_varint(value: VarInt) -> Self {
        Self(value)
    }

    #[inline]
    pub fn as_varint(self) -> VarInt {
        self.0
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    #[inline]
    pub fn initiator(self) -> endpoint::Type {
        if self.0.as_u64() & 0x01 == 0 {
            endpoint::Type::Client
        } else {
            endpoint::Type::Server
        }
    }

    #[inline]
    pub fn stream_type(self) -> StreamType {
        if self.0.as_u64() & 0x02 == 0 {
            StreamType::Bidirectional
        } else {
            StreamType::Unidirectional
        }
    }

    #[inline]
    pub fn is_bidirectional(self) -> bool {
        self.stream_type() == StreamType::Bidirectional
    }

    /// The stream ID which follows this one for the same initiator and type
    #[inline]
    pub fn next_of_type(self) -> Option<Self> {
        let value = VarInt::new(STREAM_ID_DELTA).expect("delta is in range");
        Some(Self(self.0.checked_add(value)?))
    }

    /// 0-based ordinal of this stream among streams of its initiator and type
    #[inline]
    pub fn ordinal(self) -> u64 {
        self.0.as_u64() / STREAM_ID_DELTA
    }
}

impl From<StreamId> for VarInt {
    #[inline]
    fn from(id: StreamId) -> Self {
        id.0
    }
}
