// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection-level state: connection-ID lifecycles and the engine

pub mod engine;
pub mod local_id_registry;
pub mod peer_id_registry;

pub use engine::Engine;
pub use local_id_registry::LocalIdRegistry;
pub use peer_id_registry::PeerIdRegistry;
