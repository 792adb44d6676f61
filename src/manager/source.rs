// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::{
    conf::{logger::ReflowLogger, ReflowConf},
    data::{consolidate, Change, Diff, Row, Timestamp},
    error::{Error, ReflowResult},
    persistence::{CheckpointBody, SourceCheckpoint},
    stream::{
        source::{Source, SourceKind},
        time::Frontier,
    },
};
use fxhash::FxHashMap;
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

/// Backoff applied to transient connector failures
#[derive(Clone, Copy, Debug)]
pub(crate) struct RetryPolicy {
    pub(crate) attempts: u32,
    pub(crate) backoff: Duration,
    pub(crate) max_backoff: Duration,
}

impl RetryPolicy {
    pub(crate) fn from_conf(conf: &ReflowConf) -> Self {
        RetryPolicy {
            attempts: conf.source_retry_attempts,
            backoff: Duration::from_millis(conf.source_retry_backoff),
            max_backoff: Duration::from_millis(conf.source_retry_backoff_max),
        }
    }

    /// Wait after the `failures`th consecutive failure
    pub(crate) fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

struct SourceSlot {
    source: Box<dyn Source>,
    frontier: Frontier,
    failures: u32,
    retry_at: Option<Instant>,
    /// Running total per row, kept for append-only sources
    totals: BTreeMap<Row, Diff>,
}

/// Polls the sources of a pipeline and buffers their changes until their
/// timestamp is processed
pub(crate) struct SourceManager {
    sources: Vec<SourceSlot>,
    pending: BTreeMap<Timestamp, Vec<(usize, Change)>>,
    retry: RetryPolicy,
    polled: u64,
    logger: ReflowLogger,
}

impl SourceManager {
    pub(crate) fn new(sources: Vec<Box<dyn Source>>, retry: RetryPolicy, logger: &ReflowLogger) -> Self {
        let sources = sources
            .into_iter()
            .map(|source| SourceSlot {
                frontier: Frontier::MIN,
                source,
                failures: 0,
                retry_at: None,
                totals: BTreeMap::new(),
            })
            .collect();
        SourceManager {
            sources,
            pending: BTreeMap::new(),
            retry,
            polled: 0,
            logger: logger.new(slog::o!("component" => "sources")),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.sources.len()
    }

    /// Polls every source that is open and not backing off.
    ///
    /// Returns the amount of changes that were polled.
    pub(crate) fn poll(&mut self) -> ReflowResult<usize> {
        let now = Instant::now();
        let mut polled = 0;
        for (index, slot) in self.sources.iter_mut().enumerate() {
            if slot.frontier.is_closed() || slot.retry_at.map_or(false, |at| now < at) {
                continue;
            }
            let changes = match slot.source.poll() {
                Ok(changes) => changes,
                Err(error) if error.is_transient() && slot.failures < self.retry.attempts => {
                    slot.failures += 1;
                    let delay = self.retry.delay(slot.failures);
                    slot.retry_at = Some(now + delay);
                    slog::warn!(
                        self.logger,
                        "Source failed, retrying";
                        "source" => slot.source.name(),
                        "attempt" => slot.failures,
                        "delay_ms" => delay.as_millis() as u64,
                        "error" => %error
                    );
                    continue;
                }
                Err(error) => {
                    return Err(Error::Connector {
                        name: slot.source.name().to_string(),
                        source: error,
                    });
                }
            };
            slot.failures = 0;
            slot.retry_at = None;

            for change in changes {
                if slot.frontier.passed(change.time) {
                    return Err(Error::InvariantViolation {
                        msg: format!(
                            "source {} produced a change at {} after its frontier passed {}",
                            slot.source.name(),
                            change.time,
                            slot.frontier
                        ),
                    });
                }
                if change.diff != 0 {
                    polled += 1;
                    self.pending
                        .entry(change.time)
                        .or_default()
                        .push((index, change));
                }
            }

            let frontier = slot.source.frontier();
            if frontier < slot.frontier {
                return Err(Error::InvariantViolation {
                    msg: format!(
                        "frontier of source {} moved back from {} to {}",
                        slot.source.name(),
                        slot.frontier,
                        frontier
                    ),
                });
            }
            slot.frontier = frontier;
        }
        self.polled += polled as u64;
        Ok(polled)
    }

    /// Frontier of all sources together
    pub(crate) fn frontier(&self) -> Frontier {
        self.sources
            .iter()
            .map(|s| s.frontier)
            .min()
            .unwrap_or_else(Frontier::closed)
    }

    pub(crate) fn frontiers(&self) -> Vec<Frontier> {
        self.sources.iter().map(|s| s.frontier).collect()
    }

    /// Earliest time with buffered changes
    pub(crate) fn next_pending(&self) -> Option<Timestamp> {
        self.pending.keys().next().copied()
    }

    /// True once every source closed and all of their changes were taken
    pub(crate) fn is_exhausted(&self) -> bool {
        self.frontier().is_closed() && self.pending.is_empty()
    }

    /// Earliest moment a backing off source may be polled again
    pub(crate) fn next_retry(&self) -> Option<Instant> {
        self.sources.iter().filter_map(|s| s.retry_at).min()
    }

    /// Total amount of changes polled so far
    pub(crate) fn polled(&self) -> u64 {
        self.polled
    }

    /// Removes the changes at `time`, per source, after checking the
    /// guarantees of append-only sources
    pub(crate) fn take(&mut self, time: Timestamp) -> ReflowResult<Vec<Vec<Change>>> {
        let mut batches: Vec<Vec<Change>> = vec![Vec::new(); self.sources.len()];
        for (index, change) in self.pending.remove(&time).unwrap_or_default() {
            batches[index].push(change);
        }
        for (slot, batch) in self.sources.iter_mut().zip(batches.iter_mut()) {
            consolidate(batch);
            if slot.source.kind() != SourceKind::AppendOnly {
                continue;
            }
            for change in batch.iter() {
                let total = slot.totals.entry(change.row.clone()).or_insert(0);
                *total += change.diff;
                if *total < 0 {
                    return Err(Error::InvariantViolation {
                        msg: format!(
                            "append-only source {} retracted {} below zero at {}",
                            slot.source.name(),
                            change.row,
                            time
                        ),
                    });
                }
                if *total == 0 {
                    slot.totals.remove(&change.row);
                }
            }
        }
        Ok(batches)
    }

    /// Adds the source part of a checkpoint to `body`
    pub(crate) fn checkpoint(&self, body: &mut CheckpointBody) {
        body.sources = self
            .sources
            .iter()
            .map(|s| SourceCheckpoint {
                name: s.source.name().to_string(),
                position: s.source.position(),
                frontier: s.frontier,
            })
            .collect();
        body.pending = self.pending.values().flatten().cloned().collect();
        body.totals = self
            .sources
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.totals.is_empty())
            .map(|(i, s)| (i, s.totals.iter().map(|(r, d)| (r.clone(), *d)).collect()))
            .collect();
    }

    /// Moves every source back to the position recorded in `body`
    pub(crate) fn restore(&mut self, body: &CheckpointBody) -> ReflowResult<()> {
        if body.sources.len() != self.sources.len() {
            return Err(Error::CheckpointMismatch {
                msg: format!(
                    "checkpoint has {} sources, pipeline has {}",
                    body.sources.len(),
                    self.sources.len()
                ),
            });
        }
        let names: FxHashMap<&str, usize> = self
            .sources
            .iter()
            .enumerate()
            .map(|(i, s)| (s.source.name(), i))
            .collect();
        for (index, recorded) in body.sources.iter().enumerate() {
            if names.get(recorded.name.as_str()) != Some(&index) {
                return Err(Error::CheckpointMismatch {
                    msg: format!("checkpoint source {} is not source {} of the pipeline", recorded.name, index),
                });
            }
        }

        for (slot, recorded) in self.sources.iter_mut().zip(&body.sources) {
            slot.source
                .seek(&recorded.position)
                .map_err(|source| Error::Connector {
                    name: recorded.name.clone(),
                    source,
                })?;
            slot.frontier = recorded.frontier;
            slot.totals.clear();
        }
        self.pending.clear();
        for (index, change) in &body.pending {
            if *index >= self.sources.len() {
                return Err(Error::Corruption {
                    msg: format!("pending change of unknown source {}", index),
                });
            }
            self.pending
                .entry(change.time)
                .or_default()
                .push((*index, change.clone()));
        }
        for (index, totals) in &body.totals {
            match self.sources.get_mut(*index) {
                Some(slot) => slot.totals = totals.iter().cloned().collect(),
                None => {
                    return Err(Error::Corruption {
                        msg: format!("running totals of unknown source {}", index),
                    })
                }
            }
        }
        slog::info!(self.logger, "Sources restored"; "pending" => body.pending.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conf::logger::discard_logger,
        error::SourceError,
        stream::source::{CollectionSource, Offset},
        values,
    };

    fn retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 2,
            backoff: Duration::from_millis(0),
            max_backoff: Duration::from_millis(0),
        }
    }

    fn change(v: i64, t: u64, diff: Diff) -> Change {
        Change::new(Row::from_values(values![v]), Timestamp(t), diff)
    }

    /// Fails a fixed amount of polls before it produces its changes
    struct FlakySource {
        failures: u32,
        permanent: bool,
        done: bool,
    }

    impl Source for FlakySource {
        fn name(&self) -> &str {
            "flaky"
        }

        fn poll(&mut self) -> Result<Vec<Change>, SourceError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(if self.permanent {
                    SourceError::permanent("gone")
                } else {
                    SourceError::transient("unavailable")
                });
            }
            self.done = true;
            Ok(vec![change(1, 1, 1)])
        }

        fn frontier(&self) -> Frontier {
            if self.done {
                Frontier::closed()
            } else {
                Frontier::MIN
            }
        }

        fn position(&self) -> Offset {
            Offset::default()
        }

        fn seek(&mut self, _offset: &Offset) -> Result<(), SourceError> {
            Ok(())
        }
    }

    #[test]
    fn retry_delay_test() {
        let policy = RetryPolicy {
            attempts: 5,
            backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(2), Duration::from_millis(20));
        assert_eq!(policy.delay(3), Duration::from_millis(40));
        assert_eq!(policy.delay(4), Duration::from_millis(50));
        assert_eq!(policy.delay(40), Duration::from_millis(50));
    }

    #[test]
    fn transient_retry_test() {
        let source = FlakySource {
            failures: 2,
            permanent: false,
            done: false,
        };
        let mut manager = SourceManager::new(vec![Box::new(source)], retry(), &discard_logger());
        assert_eq!(manager.poll().unwrap(), 0);
        assert_eq!(manager.poll().unwrap(), 0);
        assert_eq!(manager.poll().unwrap(), 1);
        assert!(manager.frontier().is_closed());
        assert_eq!(manager.take(Timestamp(1)).unwrap()[0].len(), 1);
        assert!(manager.is_exhausted());
    }

    #[test]
    fn retries_exhausted_test() {
        let source = FlakySource {
            failures: 3,
            permanent: false,
            done: false,
        };
        let mut manager = SourceManager::new(vec![Box::new(source)], retry(), &discard_logger());
        manager.poll().unwrap();
        manager.poll().unwrap();
        assert!(matches!(manager.poll(), Err(Error::Connector { .. })));

        let source = FlakySource {
            failures: 1,
            permanent: true,
            done: false,
        };
        let mut manager = SourceManager::new(vec![Box::new(source)], retry(), &discard_logger());
        assert!(matches!(manager.poll(), Err(Error::Connector { .. })));
    }

    #[test]
    fn append_only_test() {
        let source = CollectionSource::new("log", vec![change(1, 1, 1), change(1, 2, -1), change(1, 3, -1)])
            .append_only();
        let mut manager = SourceManager::new(vec![Box::new(source)], retry(), &discard_logger());
        for _ in 0..3 {
            manager.poll().unwrap();
        }
        assert_eq!(manager.next_pending(), Some(Timestamp(1)));
        manager.take(Timestamp(1)).unwrap();
        manager.take(Timestamp(2)).unwrap();
        assert!(matches!(
            manager.take(Timestamp(3)),
            Err(Error::InvariantViolation { .. })
        ));
    }

    #[test]
    fn source_checkpoint_test() {
        let source = CollectionSource::new("numbers", vec![change(1, 1, 1), change(2, 2, 1)]);
        let mut manager = SourceManager::new(vec![Box::new(source)], retry(), &discard_logger());
        manager.poll().unwrap();
        manager.poll().unwrap();
        manager.take(Timestamp(1)).unwrap();
        let mut body = CheckpointBody::default();
        manager.checkpoint(&mut body);
        assert_eq!(body.pending.len(), 1);

        let source = CollectionSource::new("numbers", vec![change(1, 1, 1), change(2, 2, 1)]);
        let mut restored = SourceManager::new(vec![Box::new(source)], retry(), &discard_logger());
        restored.restore(&body).unwrap();
        assert_eq!(restored.next_pending(), Some(Timestamp(2)));
        assert!(restored.frontier().is_closed());
        // nothing is polled twice
        assert_eq!(restored.poll().unwrap(), 0);
    }
}
