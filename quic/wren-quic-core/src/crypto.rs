// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Interfaces exposed by the cryptographic handshake collaborator
//!
//! The handshake itself (key derivation, TLS messages, header protection
//! secrets) lives outside this crate; the protocol core only needs to select
//! keys by encryption level and seal/open packet payloads in place.

use core::fmt;

//= https://www.rfc-editor.org/rfc/rfc9001#section-2.1
//# Data is protected using a number of encryption levels:
//#
//# *  Initial keys
//#
//# *  Early data (0-RTT) keys
//#
//# *  Handshake keys
//#
//# *  Application data (1-RTT) keys

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EncryptionLevel {
    Initial,
    ZeroRtt,
    Handshake,
    OneRtt,
}

impl EncryptionLevel {
    /// Delivery precedence across levels: Initial, then Handshake, then
    /// application data. 0-RTT is accepted at the application level.
    #[inline]
    pub fn delivery_order(self) -> u8 {
        match self {
            Self::Initial => 0,
            Self::Handshake => 1,
            Self::ZeroRtt | Self::OneRtt => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CryptoError {
    pub reason: &'static str,
}

impl CryptoError {
    pub const DECRYPT_ERROR: Self = Self {
        reason: "payload could not be authenticated",
    };

    pub const KEY_UNAVAILABLE: Self = Self {
        reason: "no key installed for encryption level",
    };
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.reason)
    }
}

/// Removes and applies packet protection for a connection
///
/// One value implements every level the connection currently holds keys for;
/// a level without keys reports `KEY_UNAVAILABLE` so callers can buffer or
/// drop the packet.
pub trait PacketProtection {
    /// Decrypts `payload` in place, authenticating it against `header`.
    ///
    /// Returns the plaintext length; the remainder of `payload` was the
    /// authentication tag. On failure `payload` must be left with its
    /// original contents: the caller may still need to compare the datagram
    /// against stateless-reset tokens.
    fn open_in_place(
        &self,
        level: EncryptionLevel,
        packet_number: u64,
        header: &[u8],
        payload: &mut [u8],
    ) -> Result<usize, CryptoError>;

    /// Encrypts `payload` in place, extending it with an authentication tag.
    ///
    /// `payload` must have `tag_len` spare bytes after the plaintext; the
    /// total encrypted length is returned.
    fn seal_in_place(
        &self,
        level: EncryptionLevel,
        packet_number: u64,
        header: &[u8],
        payload: &mut [u8],
        plaintext_len: usize,
    ) -> Result<usize, CryptoError>;

    /// The authentication-tag overhead for the level
    fn tag_len(&self, level: EncryptionLevel) -> usize;

    /// Returns true if keys for the level are installed
    fn has_keys(&self, level: EncryptionLevel) -> bool;
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;

    /// Packet protection which XORs payloads with a level-specific byte and
    /// appends a 16-byte checksum tag. Only suitable for tests.
    #[derive(Debug, Default)]
    pub struct Protection {
        pub missing_levels: Vec<EncryptionLevel>,
    }

    pub const TAG_LEN: usize = 16;

    fn mask(level: EncryptionLevel) -> u8 {
        match level {
            EncryptionLevel::Initial => 0xa5,
            EncryptionLevel::ZeroRtt => 0x5a,
            EncryptionLevel::Handshake => 0xc3,
            EncryptionLevel::OneRtt => 0x3c,
        }
    }

    fn tag(level: EncryptionLevel, packet_number: u64, plaintext: &[u8]) -> [u8; TAG_LEN] {
        let mut tag = [mask(level); TAG_LEN];
        tag[..8].copy_from_slice(&packet_number.to_be_bytes());
        let mut sum = 0u8;
        for byte in plaintext {
            sum = sum.wrapping_add(*byte);
        }
        tag[8] = sum;
        tag
    }

    impl PacketProtection for Protection {
        fn open_in_place(
            &self,
            level: EncryptionLevel,
            packet_number: u64,
            _header: &[u8],
            payload: &mut [u8],
        ) -> Result<usize, CryptoError> {
            if self.missing_levels.contains(&level) {
                return Err(CryptoError::KEY_UNAVAILABLE);
            }
            let plaintext_len = payload
                .len()
                .checked_sub(TAG_LEN)
                .ok_or(CryptoError::DECRYPT_ERROR)?;
            for byte in &mut payload[..plaintext_len] {
                *byte ^= mask(level);
            }
            let expected = tag(level, packet_number, &payload[..plaintext_len]);
            if payload[plaintext_len..] != expected {
                // restore the ciphertext so a stateless-reset comparison can
                // still see the original datagram bytes
                for byte in &mut payload[..plaintext_len] {
                    *byte ^= mask(level);
                }
                return Err(CryptoError::DECRYPT_ERROR);
            }
            Ok(plaintext_len)
        }

        fn seal_in_place(
            &self,
            level: EncryptionLevel,
            packet_number: u64,
            _header: &[u8],
            payload: &mut [u8],
            plaintext_len: usize,
        ) -> Result<usize, CryptoError> {
            if self.missing_levels.contains(&level) {
                return Err(CryptoError::KEY_UNAVAILABLE);
            }
            let total = plaintext_len + TAG_LEN;
            debug_assert!(payload.len() >= total);
            let tag = tag(level, packet_number, &payload[..plaintext_len]);
            payload[plaintext_len..total].copy_from_slice(&tag);
            for byte in &mut payload[..plaintext_len] {
                *byte ^= mask(level);
            }
            Ok(total)
        }

        fn tag_len(&self, _level: EncryptionLevel) -> usize {
            TAG_LEN
        }

        fn has_keys(&self, level: EncryptionLevel) -> bool {
            !self.missing_levels.contains(&level)
        }
    }
}
