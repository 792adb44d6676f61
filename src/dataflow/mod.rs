// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

/// Logical Dataflow Graph
pub mod dfg;
/// High-level Stream type that users may perform a series of transformations on
pub mod stream;
