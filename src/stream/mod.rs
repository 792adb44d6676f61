// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

/// Module containing the exchange logic between shards
pub mod channel;
/// Module containing the shard workers that drive the execution
pub mod node;
/// Module containing all available reflow operators
pub mod operator;
/// Module containing all available reflow sinks
pub mod sink;
/// Module containing all available reflow sources
pub mod source;
/// Module containing time logic within reflow
pub mod time;
