// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Full and truncated packet numbers
//!
//! A packet number is an integer in the range `0..2^62` confined to a single
//! packet number space. There is no "uninitialized" packet number; positions
//! which may not have seen a packet yet are modeled as `Option<PacketNumber>`.

use crate::{crypto::EncryptionLevel, varint::VarInt};
use core::{cmp::Ordering, fmt};
use s2n_codec::{DecoderBuffer, DecoderBufferResult, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-12.3
//# Packet numbers are divided into three spaces in QUIC:
//#
//# Initial space:  All Initial packets (Section 17.2.2) are in this
//#    space.
//#
//# Handshake space:  All Handshake packets (Section 17.2.4) are in this
//#    space.
//#
//# Application data space:  All 0-RTT (Section 17.2.3) and 1-RTT
//#    (Section 17.3) packets are in this space.

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PacketNumberSpace {
    Initial,
    Handshake,
    ApplicationData,
}

impl PacketNumberSpace {
    #[inline]
    pub fn new_packet_number(self, value: VarInt) -> PacketNumber {
        PacketNumber { space: self, value }
    }

    #[inline]
    pub fn from_encryption_level(level: EncryptionLevel) -> Self {
        match level {
            EncryptionLevel::Initial => Self::Initial,
            EncryptionLevel::Handshake => Self::Handshake,
            EncryptionLevel::ZeroRtt | EncryptionLevel::OneRtt => Self::ApplicationData,
        }
    }

    #[inline]
    pub fn is_application_data(self) -> bool {
        matches!(self, Self::ApplicationData)
    }

    #[inline]
    fn assert_eq(self, other: Self) {
        debug_assert_eq!(self, other, "packet numbers are confined to a space");
    }
}

/// A fully expanded packet number, tagged with its space
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketNumber {
    space: PacketNumberSpace,
    value: VarInt,
}

impl fmt::Debug for PacketNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}#{}", self.space, self.value)
    }
}

impl fmt::Display for PacketNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.value.fmt(f)
    }
}

impl PartialOrd for PacketNumber {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PacketNumber {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.space.assert_eq(other.space);
        self.value.cmp(&other.value)
    }
}

impl PacketNumber {
    #[inline]
    pub fn space(self) -> PacketNumberSpace {
        self.space
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.value.as_u64()
    }

    #[inline]
    pub fn as_varint(self) -> VarInt {
        self.value
    }

    /// Returns the next packet number, unless the 62-bit range is exhausted
    #[inline]
    pub fn next(self) -> Option<Self> {
        let value = self.value.checked_add(VarInt::from_u8(1))?;
        Some(self.space.new_packet_number(value))
    }

    /// Returns the previous packet number, unless `self` is zero
    #[inline]
    pub fn prev(self) -> Option<Self> {
        let value = self.value.checked_sub(VarInt::from_u8(1))?;
        Some(self.space.new_packet_number(value))
    }

    #[inline]
    pub fn checked_add(self, delta: u64) -> Option<Self> {
        let delta = VarInt::new(delta).ok()?;
        let value = self.value.checked_add(delta)?;
        Some(self.space.new_packet_number(value))
    }

    /// Returns `self - other`; defined only when `self >= other`
    #[inline]
    pub fn checked_distance(self, other: Self) -> Option<u64> {
        self.space.assert_eq(other.space);
        self.value.as_u64().checked_sub(other.value.as_u64())
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-17.1
    //# The sender MUST use a packet number size able to represent more than
    //# twice as large a range as the difference between the largest
    //# acknowledged packet and the packet number being sent.
    #[inline]
    pub fn truncate(self, largest_acknowledged: Self) -> Option<TruncatedPacketNumber> {
        self.space.assert_eq(largest_acknowledged.space);
        let delta = self
            .as_u64()
            .checked_sub(largest_acknowledged.as_u64())?
            .checked_mul(2)?;
        let len = PacketNumberLen::for_range(delta)?;
        let mask = len.max_value();
        Some(TruncatedPacketNumber {
            space: self.space,
            value: (self.as_u64() & mask) as u32,
            len,
        })
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.1
//# When present in long or short packet headers, they are encoded in 1
//# to 4 bytes.

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PacketNumberLen {
    U8,
    U16,
    U24,
    U32,
}

impl PacketNumberLen {
    /// The packet number length occupies the two least significant bits of
    /// the first packet byte
    pub const MASK: u8 = 0b11;

    #[inline]
    pub fn from_packet_tag(tag: u8) -> Self {
        match tag & Self::MASK {
            0b00 => Self::U8,
            0b01 => Self::U16,
            0b10 => Self::U24,
            _ => Self::U32,
        }
    }

    #[inline]
    pub fn into_packet_tag_mask(self) -> u8 {
        match self {
            Self::U8 => 0b00,
            Self::U16 => 0b01,
            Self::U24 => 0b10,
            Self::U32 => 0b11,
        }
    }

    #[inline]
    pub fn bytesize(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U24 => 3,
            Self::U32 => 4,
        }
    }

    #[inline]
    pub fn bitsize(self) -> usize {
        self.bytesize() * 8
    }

    #[inline]
    fn max_value(self) -> u64 {
        (1u64 << self.bitsize()) - 1
    }

    /// Returns the smallest length able to represent `range` values
    #[inline]
    fn for_range(range: u64) -> Option<Self> {
        for len in [Self::U8, Self::U16, Self::U24, Self::U32] {
            if range <= len.max_value() {
                return Some(len);
            }
        }
        None
    }
}

/// A packet number reduced to its least significant bits for transmission
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TruncatedPacketNumber {
    space: PacketNumberSpace,
    value: u32,
    len: PacketNumberLen,
}

impl fmt::Debug for TruncatedPacketNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TruncatedPacketNumber({:#x}/{})",
            self.value,
            self.len.bytesize()
        )
    }
}

impl TruncatedPacketNumber {
    #[inline]
    pub fn new(space: PacketNumberSpace, value: u32, len: PacketNumberLen) -> Self {
        debug_assert!(u64::from(value) <= len.max_value());
        Self { space, value, len }
    }

    #[inline]
    pub fn space(self) -> PacketNumberSpace {
        self.space
    }

    #[inline]
    pub fn len(self) -> PacketNumberLen {
        self.len
    }

    #[inline]
    pub fn into_u64(self) -> u64 {
        self.value.into()
    }

    #[inline]
    pub fn decode(
        space: PacketNumberSpace,
        len: PacketNumberLen,
        buffer: DecoderBuffer,
    ) -> DecoderBufferResult<Self> {
        let (value, buffer) = match len {
            PacketNumberLen::U8 => {
                let (value, buffer) = buffer.decode::<u8>()?;
                (value as u32, buffer)
            }
            PacketNumberLen::U16 => {
                let (value, buffer) = buffer.decode::<u16>()?;
                (value as u32, buffer)
            }
            PacketNumberLen::U24 => {
                let (bytes, buffer) = buffer.decode_slice(3)?;
                let bytes = bytes.as_less_safe_slice();
                let value = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
                (value, buffer)
            }
            PacketNumberLen::U32 => buffer.decode::<u32>()?,
        };

        Ok((Self::new(space, value, len), buffer))
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#appendix-A.3
    //# DecodePacketNumber(largest_pn, truncated_pn, pn_nbits):
    //#   expected_pn  = largest_pn + 1
    //#   pn_win       = 1 << pn_nbits
    //#   pn_hwin      = pn_win / 2
    //#   pn_mask      = pn_win - 1
    //#   candidate_pn = (expected_pn & ~pn_mask) | truncated_pn
    //#   if candidate_pn <= expected_pn - pn_hwin and
    //#      candidate_pn < (1 << 62) - pn_win:
    //#      return candidate_pn + pn_win
    //#   if candidate_pn > expected_pn + pn_hwin and
    //#      candidate_pn >= pn_win:
    //#      return candidate_pn - pn_win
    //#   return candidate_pn
    #[inline]
    pub fn expand(self, largest_pn: PacketNumber) -> PacketNumber {
        self.space.assert_eq(largest_pn.space);

        let expected_pn = largest_pn.as_u64() + 1;
        let pn_win = 1u64 << self.len.bitsize();
        let pn_hwin = pn_win / 2;
        let pn_mask = pn_win - 1;
        let truncated_pn = self.into_u64();

        let mut candidate_pn = (expected_pn & !pn_mask) | truncated_pn;

        let underflow_ok = expected_pn
            .checked_sub(pn_hwin)
            .map_or(false, |bound| candidate_pn <= bound);
        if underflow_ok && candidate_pn < (1u64 << 62) - pn_win {
            candidate_pn += pn_win;
        } else if candidate_pn > expected_pn + pn_hwin && candidate_pn >= pn_win {
            candidate_pn -= pn_win;
        }

        let candidate_pn = candidate_pn.min(VarInt::MAX.as_u64());
        debug_assert!(candidate_pn <= VarInt::MAX.as_u64());
        let candidate_pn = unsafe {
            // Safety: clamped to the varint range above
            VarInt::new_unchecked(candidate_pn)
        };

        self.space.new_packet_number(candidate_pn)
    }
}

impl EncoderValue for TruncatedPacketNumber {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        let bytes = self.value.to_be_bytes();
        let len = self.len.bytesize();
        encoder.write_sized(len, |buffer| {
            buffer.copy_from_slice(&bytes[4 - len..]);
        });
    }
}
