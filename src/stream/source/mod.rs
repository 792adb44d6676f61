// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

/// Live input driven through an [InputHandle]
pub mod channel;
/// Bounded input from an in-memory collection
pub mod collection;

pub use channel::{ChannelSource, InputHandle};
pub use collection::CollectionSource;

use crate::{data::Change, error::SourceError, stream::time::Frontier};
use serde::{Deserialize, Serialize};

/// Whether a source may retract what it inserted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    /// The running total of every row must never become negative
    AppendOnly,
    Retractable,
}

/// An opaque position a source can resume from
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offset(pub Vec<u8>);

impl Offset {
    /// Offset of sources that count what they consumed
    pub fn from_index(index: u64) -> Offset {
        Offset(index.to_le_bytes().to_vec())
    }

    pub fn index(&self) -> Result<u64, SourceError> {
        let mut bytes = [0u8; 8];
        if self.0.len() != bytes.len() {
            return Err(SourceError::Seek {
                msg: format!("expected an 8 byte index, got {} bytes", self.0.len()),
            });
        }
        bytes.copy_from_slice(&self.0);
        Ok(u64::from_le_bytes(bytes))
    }
}

/// Defines a reflow Source and the methods it must implement.
///
/// A source is polled by the coordinator and must never block for long.
pub trait Source: Send + 'static {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind {
        SourceKind::Retractable
    }

    /// Returns the changes that are available right now, possibly none.
    ///
    /// Every returned change must be at or above the frontier reported
    /// before this call.
    fn poll(&mut self) -> Result<Vec<Change>, SourceError>;

    /// Lower bound on the timestamps of all changes not yet returned by `poll`
    fn frontier(&self) -> Frontier;

    /// Position right after the last change returned by `poll`
    fn position(&self) -> Offset;

    /// Resumes from a position previously returned by `position`
    fn seek(&mut self, offset: &Offset) -> Result<(), SourceError>;
}
