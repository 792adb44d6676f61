// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::{
    conf::logger::ReflowLogger,
    error::{Error, ReflowResult},
    persistence::{
        checkpoint::{decode_envelope, encode},
        CheckpointBody, CheckpointStorage,
    },
};
use std::time::{Duration, Instant};

/// When checkpoints are taken and how many are kept
#[derive(Clone, Copy, Debug)]
pub(crate) struct SnapshotPolicy {
    /// `None` disables the time trigger
    pub(crate) interval: Option<Duration>,
    /// 0 disables the change trigger
    pub(crate) change_threshold: u64,
    pub(crate) retained: usize,
}

/// A checkpoint that was found valid during recovery
pub(crate) struct Recovered {
    pub(crate) id: u64,
    pub(crate) body: CheckpointBody,
}

/// Keeps the catalog of published checkpoints of a pipeline
pub(crate) struct SnapshotManager {
    storage: Box<dyn CheckpointStorage>,
    policy: SnapshotPolicy,
    fingerprint: u64,
    shards: usize,
    next_id: u64,
    last: Instant,
    changes: u64,
    logger: ReflowLogger,
}

impl SnapshotManager {
    pub(crate) fn new(
        storage: Box<dyn CheckpointStorage>,
        policy: SnapshotPolicy,
        fingerprint: u64,
        shards: usize,
        logger: &ReflowLogger,
    ) -> Self {
        SnapshotManager {
            storage,
            policy,
            fingerprint,
            shards,
            next_id: 1,
            last: Instant::now(),
            changes: 0,
            logger: logger.new(slog::o!("component" => "snapshots")),
        }
    }

    /// Counts input changes towards the change trigger
    pub(crate) fn note_changes(&mut self, changes: usize) {
        self.changes += changes as u64;
    }

    /// Whether a checkpoint should be taken at the next closed timestamp
    pub(crate) fn due(&self) -> bool {
        let by_time = self
            .policy
            .interval
            .map_or(false, |interval| self.last.elapsed() >= interval);
        let by_changes =
            self.policy.change_threshold > 0 && self.changes >= self.policy.change_threshold;
        by_time || by_changes
    }

    /// Finds the newest valid checkpoint.
    ///
    /// Corrupted checkpoints are skipped in favour of older ones. A valid
    /// checkpoint of another pipeline is fatal, and so is a storage that
    /// holds checkpoints of which none is valid.
    pub(crate) fn recover(&mut self) -> ReflowResult<Option<Recovered>> {
        let ids = self.storage.list()?;
        if let Some(max) = ids.iter().max() {
            self.next_id = max + 1;
        }
        for id in ids.iter().rev().copied() {
            match self.load(id) {
                Ok(body) => {
                    slog::info!(
                        self.logger,
                        "Recovering from checkpoint";
                        "id" => id,
                        "closed" => %body.closed
                    );
                    return Ok(Some(Recovered { id, body }));
                }
                Err(error) if matches!(error, Error::Corruption { .. } | Error::Io { .. }) => {
                    slog::warn!(self.logger, "Skipping invalid checkpoint"; "id" => id, "error" => %error);
                }
                Err(error) => return Err(error),
            }
        }
        if ids.is_empty() {
            Ok(None)
        } else {
            Err(Error::Corruption {
                msg: format!("none of the {} checkpoints is valid", ids.len()),
            })
        }
    }

    fn load(&self, id: u64) -> ReflowResult<CheckpointBody> {
        let bytes = self.storage.read(id)?;
        let envelope = decode_envelope(&bytes)?;
        if envelope.id != id {
            return Err(Error::Corruption {
                msg: format!("checkpoint {} claims to be {}", id, envelope.id),
            });
        }
        if envelope.fingerprint != self.fingerprint {
            return Err(Error::CheckpointMismatch {
                msg: format!(
                    "checkpoint {} was taken from another dataflow graph ({:#x}, expected {:#x})",
                    id, envelope.fingerprint, self.fingerprint
                ),
            });
        }
        if envelope.shard_count as usize != self.shards {
            return Err(Error::CheckpointMismatch {
                msg: format!(
                    "checkpoint {} was taken with {} workers, pipeline has {}",
                    id, envelope.shard_count, self.shards
                ),
            });
        }
        envelope.body()
    }

    /// Publishes `body` under the next id and removes superseded checkpoints
    pub(crate) fn publish(&mut self, body: &CheckpointBody) -> ReflowResult<u64> {
        let id = self.next_id;
        let bytes = encode(id, self.fingerprint, body)?;
        self.storage.write(id, &bytes)?;
        self.next_id += 1;
        self.last = Instant::now();
        self.changes = 0;
        slog::info!(
            self.logger,
            "Checkpoint published";
            "id" => id,
            "closed" => %body.closed,
            "bytes" => bytes.len()
        );
        self.collect_garbage(id)?;
        Ok(id)
    }

    fn collect_garbage(&mut self, newest: u64) -> ReflowResult<()> {
        let ids = self.storage.list()?;
        let keep = self.policy.retained.max(1);
        let older: Vec<u64> = ids.into_iter().filter(|id| *id <= newest).collect();
        if older.len() > keep {
            for id in &older[..older.len() - keep] {
                self.storage.remove(*id)?;
                slog::debug!(self.logger, "Checkpoint removed"; "id" => *id);
            }
        }
        Ok(())
    }
}
