// Copyright (c) 2021, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

/// A helper macro to indicate a reportable bug
#[macro_export]
macro_rules! reportable_error {
    ( $($arg:tt)* ) => ({
        $crate::error::ReflowResult::Err($crate::error::Error::ReportableBug { msg: format!($($arg)*) })
    })
}

pub mod source;

pub use self::source::{EvalError, SinkError, SourceError};

use crate::data::Timestamp;
use reflow_state::StateError;
use snafu::Snafu;
use std::io;

// Inspired by Sled's error management approach.
// http://sled.rs/errors.html

/// Top level Result type in reflow
pub type ReflowResult<T> = std::result::Result<T, Error>;
/// Alias for State Result
pub type StateResult<T> = std::result::Result<T, StateError>;

/// A top level Error type holding pipeline errors that cause a total system halt
#[derive(Debug, Snafu)]
pub enum Error {
    /// The system has been used in an unsupported way.
    #[snafu(display("Unsupported operation {}", msg))]
    Unsupported { msg: String },
    /// An unexpected bug has happened.
    #[snafu(display("Unexpected bug {}", msg))]
    ReportableBug { msg: String },
    /// A read or write error has happened when interacting with the file system.
    #[snafu(display("An IO error occured {}", error))]
    Io { error: io::Error },
    /// An error that indicates possible data corruption
    ///
    /// It could for example be that a checkpoint fails its checksum.
    #[snafu(display("Unexpected data corruption {}", msg))]
    Corruption { msg: String },
    /// A guarantee the engine relies on was broken, e.g., an append-only
    /// source retracted more than it inserted or a frontier moved backwards.
    #[snafu(display("Invariant violated: {}", msg))]
    InvariantViolation { msg: String },
    /// A connector failed permanently or ran out of retries
    #[snafu(display("Connector {} failed: {}", name, source))]
    Connector { name: String, source: SourceError },
    /// A sink could not accept output
    #[snafu(display("Sink {} failed: {}", name, source))]
    Sink { name: String, source: SinkError },
    /// A valid checkpoint does not belong to the pipeline that tries to restore it
    #[snafu(display("Checkpoint does not match the pipeline: {}", msg))]
    CheckpointMismatch { msg: String },
    /// An iterative scope did not reach a fixpoint within the configured round limit
    #[snafu(display(
        "Iteration {} did not reach a fixpoint within {} rounds at time {}",
        operator,
        limit,
        time
    ))]
    IterationLimit {
        operator: String,
        limit: u32,
        time: Timestamp,
    },
    /// Execution was stopped because another part of the pipeline failed
    #[snafu(display("Execution aborted: {}", msg))]
    Aborted { msg: String },
    /// Invalid configuration or pipeline description
    #[snafu(display("Invalid configuration: {}", msg))]
    Config { msg: String },
    /// Failure inside the state store
    #[snafu(display("State error: {}", source))]
    State { source: StateError },
}

impl Error {
    /// Returns true if the error was caused by a failure elsewhere in the pipeline
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Aborted { .. })
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::Io { error: io_error }
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> io::Error {
        use std::io::ErrorKind;
        match error {
            Error::Io { error } => error,
            Error::Unsupported { ref msg } | Error::Config { ref msg } => io::Error::new(
                ErrorKind::InvalidInput,
                format!("operation not supported: {:?}", msg),
            ),
            Error::Corruption { ref msg } | Error::CheckpointMismatch { ref msg } => {
                io::Error::new(
                    ErrorKind::InvalidData,
                    format!("corruption encountered: {:?}", msg),
                )
            }
            other => io::Error::new(ErrorKind::Other, other.to_string()),
        }
    }
}

// Transform StateError into top level Error
impl From<StateError> for Error {
    fn from(error: StateError) -> Self {
        match error {
            StateError::Deserialise { .. } => Error::Corruption {
                msg: error.to_string(),
            },
            StateError::WrongIndexKind { .. } => Error::CheckpointMismatch {
                msg: error.to_string(),
            },
            _ => Error::State { source: error },
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(error: bincode::Error) -> Self {
        Error::Corruption {
            msg: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_conversion_test() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(err, Error::Io { .. }));
        let back: io::Error = Error::Corruption {
            msg: "bad checksum".to_string(),
        }
        .into();
        assert_eq!(back.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn reportable_error_test() {
        let res: ReflowResult<()> = reportable_error!("shard {} vanished", 3);
        match res {
            Err(Error::ReportableBug { msg }) => assert_eq!(msg, "shard 3 vanished"),
            _ => panic!("expected a reportable bug"),
        }
    }
}
