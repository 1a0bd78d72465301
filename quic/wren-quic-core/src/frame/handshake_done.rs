// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::frame::Tag;
use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.20
//# The server uses a HANDSHAKE_DONE frame (type=0x1e) to signal
//# confirmation of the handshake to the client.

macro_rules! handshake_done_tag {
    () => {
        0x1eu8
    };
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HandshakeDone;

impl HandshakeDone {
    pub const fn tag(self) -> u8 {
        handshake_done_tag!()
    }
}

decoder_parameterized_value!(
    impl<'a> HandshakeDone {
        fn decode(_tag: Tag, buffer: Buffer) -> Result<Self> {
            Ok((HandshakeDone, buffer))
        }
    }
);

impl EncoderValue for HandshakeDone {
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
    }
}
