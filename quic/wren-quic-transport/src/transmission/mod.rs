// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Retransmittable-data bookkeeping and write scheduling

pub mod notifier;

pub use notifier::{ControlFrame, FrameWriter, SessionNotifier, TransmissionType};
