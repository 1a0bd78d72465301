// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::frame::Tag;
use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.17
//# Endpoints can use PATH_CHALLENGE frames (type=0x1a) to check
//# reachability to the peer and for path validation during connection
//# migration.

macro_rules! path_challenge_tag {
    () => {
        0x1au8
    };
}

pub const DATA_LEN: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PathChallenge {
    /// This 8-byte field contains arbitrary data
    pub data: [u8; DATA_LEN],
}

impl PathChallenge {
    pub const fn tag(self) -> u8 {
        path_challenge_tag!()
    }
}

decoder_parameterized_value!(
    impl<'a> PathChallenge {
        fn decode(_tag: Tag, buffer: Buffer) -> Result<Self> {
            let (slice, buffer) = buffer.decode_slice(DATA_LEN)?;
            let mut data = [0; DATA_LEN];
            data.copy_from_slice(slice.as_less_safe_slice());

            Ok((PathChallenge { data }, buffer))
        }
    }
);

impl EncoderValue for PathChallenge {
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&&self.data[..]);
    }
}
