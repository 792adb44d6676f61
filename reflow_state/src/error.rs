// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

pub use snafu::{ensure, ErrorCompat, OptionExt, ResultExt};
use snafu::{Backtrace, Snafu};
use std::result::Result as StdResult;

pub type Result<T, E = StateError> = StdResult<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum StateError {
    #[snafu(display("State {} is already registered", id))]
    AlreadyRegistered { id: String, backtrace: Backtrace },
    #[snafu(display("State {} has not been registered", id))]
    UnknownState { id: String, backtrace: Backtrace },
    #[snafu(display(
        "State {} holds a {} index but a {} index was requested",
        id,
        found,
        expected
    ))]
    WrongIndexKind {
        id: String,
        found: String,
        expected: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to serialise state {}: {}", id, source))]
    Serialise {
        id: String,
        source: bincode::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to deserialise state {}: {}", id, source))]
    Deserialise {
        id: String,
        source: bincode::Error,
        backtrace: Backtrace,
    },
}
