// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::frame::{path_challenge, Tag};
use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.18
//# A PATH_RESPONSE frame (type=0x1b) is sent in response to a
//# PATH_CHALLENGE frame.

macro_rules! path_response_tag {
    () => {
        0x1bu8
    };
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PathResponse {
    //= https://www.rfc-editor.org/rfc/rfc9000#section-19.18
    //# A PATH_RESPONSE frame contains an 8-byte Data field with the value
    //# copied from the PATH_CHALLENGE frame that is in response to.
    pub data: [u8; path_challenge::DATA_LEN],
}

impl PathResponse {
    pub const fn tag(self) -> u8 {
        path_response_tag!()
    }
}

decoder_parameterized_value!(
    impl<'a> PathResponse {
        fn decode(_tag: Tag, buffer: Buffer) -> Result<Self> {
            let (slice, buffer) = buffer.decode_slice(path_challenge::DATA_LEN)?;
            let mut data = [0; path_challenge::DATA_LEN];
            data.copy_from_slice(slice.as_less_safe_slice());

            Ok((PathResponse { data }, buffer))
        }
    }
);

impl EncoderValue for PathResponse {
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&&self.data[..]);
    }
}
