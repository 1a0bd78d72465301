// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stateless-reset tokens and the per-process secret they derive from

use crate::{connection::ConnectionId, random};
use s2n_codec::{decoder_value, Encoder, EncoderValue};
use subtle::ConstantTimeEq;

//= https://www.rfc-editor.org/rfc/rfc9000#section-10.3
//# A stateless reset is provided as an option of last resort for an
//# endpoint that does not have access to the state of a connection.

/// The length of a stateless-reset token
pub const TOKEN_LEN: usize = 16;

/// A 16-byte stateless-reset token
///
/// Tokens are compared in constant time: an observer timing comparisons must
/// not learn how much of a guessed token matched.
#[derive(Clone, Copy, Debug, Eq)]
pub struct Token([u8; TOKEN_LEN]);

impl Token {
    pub const ZEROED: Self = Self([0; TOKEN_LEN]);

    #[inline]
    pub fn into_inner(self) -> [u8; TOKEN_LEN] {
        self.0
    }
}

impl PartialEq for Token {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl From<[u8; TOKEN_LEN]> for Token {
    #[inline]
    fn from(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Token {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

decoder_value!(
    impl<'a> Token {
        fn decode(buffer: Buffer) -> Result<Self> {
            let (value, buffer) = buffer.decode_slice(TOKEN_LEN)?;
            let value: &[u8] = value.into_less_safe_slice();
            let mut token = [0; TOKEN_LEN];
            token.copy_from_slice(value);
            Ok((Self(token), buffer))
        }
    }
);

impl EncoderValue for Token {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        self.0.as_ref().encode(encoder)
    }
}

/// The per-process secret from which stateless-reset tokens are derived
///
/// Confined to the dispatcher context; it never leaves the process and is
/// shared by every connection the process terminates.
pub struct Secret([u8; 32]);

impl Secret {
    pub fn generate(random: &mut dyn random::Generator) -> Self {
        let mut secret = [0; 32];
        random.private_random_fill(&mut secret);
        Self(secret)
    }

    #[cfg(any(test, feature = "testing"))]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derives the stateless-reset token for a connection ID
    ///
    /// `SHA-256(secret || connection_id)` truncated to 16 bytes.
    pub fn token_for(&self, id: &ConnectionId) -> Token {
        let mut input = Vec::with_capacity(self.0.len() + id.len());
        input.extend_from_slice(&self.0);
        input.extend_from_slice(id.as_bytes());

        let digest = ring::digest::digest(&ring::digest::SHA256, &input);
        let mut token = [0; TOKEN_LEN];
        token.copy_from_slice(&digest.as_ref()[..TOKEN_LEN]);
        Token(token)
    }
}

impl core::fmt::Debug for Secret {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        // never print secret material
        f.write_str("stateless_reset::Secret")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> Secret {
        Secret::from_bytes([0x42; 32])
    }

    #[test]
    fn tokens_are_deterministic_per_id() {
        let id_a = ConnectionId::try_from_bytes(&[1, 2, 3, 4]).unwrap();
        let id_b = ConnectionId::try_from_bytes(&[1, 2, 3, 5]).unwrap();

        assert_eq!(secret().token_for(&id_a), secret().token_for(&id_a));
        assert_ne!(secret().token_for(&id_a), secret().token_for(&id_b));
    }

    #[test]
    fn different_secrets_produce_different_tokens() {
        let id = ConnectionId::try_from_bytes(&[7; 8]).unwrap();
        let other = Secret::from_bytes([0x43; 32]);
        assert_ne!(secret().token_for(&id), other.token_for(&id));
    }
}
