// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stream data paths: reassembly, send buffering and stream-ID accounting

pub mod id_manager;
pub mod receive_buffer;
pub mod send_buffer;
pub mod sequencer;

pub use id_manager::StreamIdManager;
pub use receive_buffer::ReceiveBuffer;
pub use send_buffer::SendBuffer;
pub use sequencer::StreamSequencer;
