// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Congestion-control inputs: per-packet send state and bandwidth samples

pub mod bandwidth;
pub mod bandwidth_sampler;

pub use bandwidth::Bandwidth;
pub use bandwidth_sampler::{BandwidthSampler, CongestionEventSample, SendTimeState};
