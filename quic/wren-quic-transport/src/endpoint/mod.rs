// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide endpoint state
//!
//! The pieces in this module outlive individual connections: packets
//! buffered before a connection exists, and the post-termination time-wait
//! list. Both are owned by the dispatcher context and mutated only on its
//! event loop.

pub mod buffered_packet_store;
pub mod time_wait;

pub use buffered_packet_store::{BufferedPacketStore, EnqueueResult};
pub use time_wait::{TimeWaitAction, TimeWaitListManager};

/// The result of handing a datagram to the platform writer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteResult {
    Ok,
    /// The socket cannot accept more data; the caller must queue and wait
    /// for a writable event
    Blocked,
    Error,
}

/// The egress side of the platform socket, without any of its cmsg details
pub trait PacketWriter {
    fn write_packet(&mut self, buffer: &[u8], peer_address: std::net::SocketAddr) -> WriteResult;
}

/// Process-wide collaborators handed to every ingress call
///
/// The stateless-reset secret and the random source are singletons owned by
/// the dispatcher's event loop; connections borrow them per call instead of
/// holding global references.
pub struct DispatcherContext {
    pub reset_secret: wren_quic_core::stateless_reset::Secret,
    pub random: Box<dyn wren_quic_core::random::Generator>,
}

impl DispatcherContext {
    pub fn new(mut random: Box<dyn wren_quic_core::random::Generator>) -> Self {
        let reset_secret = wren_quic_core::stateless_reset::Secret::generate(random.as_mut());
        Self {
            reset_secret,
            random,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_testing() -> Self {
        Self {
            reset_secret: wren_quic_core::stateless_reset::Secret::from_bytes([7; 32]),
            random: Box::new(TestingGenerator::default()),
        }
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
struct TestingGenerator {
    seed: u8,
}

#[cfg(test)]
impl wren_quic_core::random::Generator for TestingGenerator {
    fn public_random_fill(&mut self, dest: &mut [u8]) {
        for (i, elem) in dest.iter_mut().enumerate() {
            *elem = self.seed ^ i as u8;
        }
        self.seed = self.seed.wrapping_add(1);
    }

    fn private_random_fill(&mut self, dest: &mut [u8]) {
        self.public_random_fill(dest);
    }
}
