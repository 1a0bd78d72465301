// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tracking of received packets and ACK generation

mod received_packet_manager;

pub use received_packet_manager::{PendingAckFrame, ReceivedPacketManager};
