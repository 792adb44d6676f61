// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

/// Keeps track of node frontiers and the closed frontier
pub mod progress;
/// Keeps the catalog of checkpoints of a pipeline
pub mod snapshot;
/// Polls the sources of a pipeline
pub mod source;
