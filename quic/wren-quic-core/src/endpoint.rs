// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// The perspective from which a connection operates
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Client,
    Server,
}

impl Type {
    #[inline]
    pub fn is_client(self) -> bool {
        matches!(self, Self::Client)
    }

    #[inline]
    pub fn is_server(self) -> bool {
        matches!(self, Self::Server)
    }

    #[inline]
    pub fn peer_type(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}
