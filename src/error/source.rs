// Copyright (c) 2021, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use snafu::Snafu;
use std::io;

/// Enum containing every type of error that a source may encounter
#[derive(Debug, Snafu)]
pub enum SourceError {
    /// A failure that is expected to go away, e.g., a dropped connection
    #[snafu(display("Transient connector failure {}", msg))]
    Transient { msg: String },
    /// A failure that retrying will not fix
    #[snafu(display("Permanent connector failure {}", msg))]
    Permanent { msg: String },
    #[snafu(display("Failed to parse data {}", msg))]
    Parse { msg: String },
    #[snafu(display("Cannot seek to the requested position {}", msg))]
    Seek { msg: String },
    #[snafu(display("An IO error occured {}", error))]
    Io { error: io::Error },
}

impl SourceError {
    /// Returns true if polling again after a backoff may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Transient { .. } => true,
            SourceError::Io { error } => matches!(
                error.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        SourceError::Transient { msg: msg.into() }
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        SourceError::Permanent { msg: msg.into() }
    }
}

impl From<io::Error> for SourceError {
    fn from(error: io::Error) -> Self {
        SourceError::Io { error }
    }
}

/// Errors raised by sinks while delivering output
#[derive(Debug, Snafu)]
pub enum SinkError {
    #[snafu(display("Failed to write output {}", error))]
    Write { error: io::Error },
    #[snafu(display("Output rejected {}", msg))]
    Rejected { msg: String },
}

impl From<io::Error> for SinkError {
    fn from(error: io::Error) -> Self {
        SinkError::Write { error }
    }
}

/// A failure to evaluate user logic on a single row.
///
/// Evaluation errors never stop a pipeline, the row is routed to the error output instead.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(display("{}", msg))]
pub struct EvalError {
    msg: String,
}

impl EvalError {
    pub fn new(msg: impl Into<String>) -> Self {
        EvalError { msg: msg.into() }
    }
    pub fn message(&self) -> &str {
        &self.msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_test() {
        assert!(SourceError::transient("broker unavailable").is_transient());
        assert!(!SourceError::permanent("topic deleted").is_transient());
        let timeout: SourceError = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert!(timeout.is_transient());
        let missing: SourceError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(!missing.is_transient());
    }
}
