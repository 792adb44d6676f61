// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

/// Checkpoint format
pub mod checkpoint;
/// Places checkpoints are published to
pub mod storage;

pub use checkpoint::{CheckpointBody, SourceCheckpoint};
pub use storage::{CheckpointStorage, FileStorage, MemoryStorage};
