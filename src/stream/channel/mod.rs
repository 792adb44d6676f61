// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

/// Available Channel Strategies
pub mod strategy;

use crate::{
    conf::logger::ReflowLogger,
    data::Change,
    error::{Error, ReflowResult},
};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Changes tagged with the input port of the receiving node
pub type PortedChanges = Vec<(usize, Change)>;

/// How values are combined by [Exchanger::all_reduce]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reduction {
    Sum,
    Max,
}

impl Reduction {
    #[inline]
    fn apply(self, a: i64, b: i64) -> i64 {
        match self {
            Reduction::Sum => a.saturating_add(b),
            Reduction::Max => a.max(b),
        }
    }
}

/// Messages passed between shard workers.
///
/// Every exchange or reduction is a stage that all shards enter in the same
/// order, so the stage number `seq` identifies the matching messages.
#[derive(Debug)]
pub(crate) enum ExchangeMessage {
    Data {
        seq: u64,
        from: usize,
        changes: PortedChanges,
    },
    Count {
        seq: u64,
        from: usize,
        value: i64,
    },
}

impl ExchangeMessage {
    #[inline]
    fn seq(&self) -> u64 {
        match self {
            ExchangeMessage::Data { seq, .. } => *seq,
            ExchangeMessage::Count { seq, .. } => *seq,
        }
    }

    #[inline]
    fn sender(&self) -> usize {
        match self {
            ExchangeMessage::Data { from, .. } => *from,
            ExchangeMessage::Count { from, .. } => *from,
        }
    }
}

/// Timing of blocking exchange waits
#[derive(Clone, Copy, Debug)]
pub(crate) struct ExchangeTiming {
    /// How long a single wait blocks before checking the abort flag
    pub(crate) poll: Duration,
    /// How long a stage may stall before it is reported
    pub(crate) report: Duration,
}

/// The endpoint a shard uses to exchange changes with its peers
pub struct Exchanger {
    shard: usize,
    peers: Vec<Sender<ExchangeMessage>>,
    inbox: Option<Receiver<ExchangeMessage>>,
    seq: u64,
    stash: BTreeMap<u64, Vec<ExchangeMessage>>,
    abort: Arc<AtomicBool>,
    timing: ExchangeTiming,
    logger: Option<ReflowLogger>,
}

impl Exchanger {
    /// Endpoint of a single shard without peers
    pub(crate) fn local() -> Exchanger {
        Exchanger {
            shard: 0,
            peers: Vec::new(),
            inbox: None,
            seq: 0,
            stash: BTreeMap::new(),
            abort: Arc::new(AtomicBool::new(false)),
            timing: ExchangeTiming {
                poll: Duration::from_millis(10),
                report: Duration::from_secs(5),
            },
            logger: None,
        }
    }

    /// Connects `shards` endpoints with each other.
    ///
    /// A shard is at most one stage ahead of its slowest peer, so an inbox of
    /// `capacity * shards` messages never fills up when `capacity >= 2`.
    pub(crate) fn mesh(
        shards: usize,
        capacity: usize,
        abort: Arc<AtomicBool>,
        timing: ExchangeTiming,
        logger: &ReflowLogger,
    ) -> Vec<Exchanger> {
        if shards <= 1 {
            let mut local = Exchanger::local();
            local.abort = abort;
            local.timing = timing;
            return vec![local];
        }
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..shards)
            .map(|_| bounded::<ExchangeMessage>(capacity.max(2) * shards))
            .unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(shard, inbox)| Exchanger {
                shard,
                peers: senders.clone(),
                inbox: Some(inbox),
                seq: 0,
                stash: BTreeMap::new(),
                abort: abort.clone(),
                timing,
                logger: Some(logger.new(slog::o!("shard" => shard))),
            })
            .collect()
    }

    #[inline]
    pub fn shard(&self) -> usize {
        self.shard
    }

    #[inline]
    pub fn shards(&self) -> usize {
        self.peers.len().max(1)
    }

    /// Signals every shard to stop at its next wait
    pub(crate) fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub(crate) fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    #[inline]
    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Sends `outgoing[s]` to shard `s` and returns what every shard sent to
    /// this one, in the order of the sending shards
    pub(crate) fn exchange(&mut self, mut outgoing: Vec<PortedChanges>) -> ReflowResult<PortedChanges> {
        let shards = self.shards();
        if shards == 1 {
            return Ok(outgoing.pop().unwrap_or_default());
        }
        if outgoing.len() != shards {
            return crate::reportable_error!(
                "exchange expects {} partitions, got {}",
                shards,
                outgoing.len()
            );
        }
        self.seq += 1;
        let seq = self.seq;
        let own = std::mem::take(&mut outgoing[self.shard]);
        for (target, changes) in outgoing.into_iter().enumerate() {
            if target != self.shard {
                let from = self.shard;
                self.send(target, ExchangeMessage::Data { seq, from, changes })?;
            }
        }

        let mut received: Vec<Option<PortedChanges>> = (0..shards).map(|_| None).collect();
        received[self.shard] = Some(own);
        for msg in self.collect(seq)? {
            match msg {
                ExchangeMessage::Data { from, changes, .. } => received[from] = Some(changes),
                ExchangeMessage::Count { from, .. } => {
                    return crate::reportable_error!(
                        "shard {} sent a count where changes were expected at stage {}",
                        from,
                        seq
                    );
                }
            }
        }
        Ok(received.into_iter().flatten().flatten().collect())
    }

    /// Combines `value` with the values of every other shard
    pub fn all_reduce(&mut self, value: i64, reduction: Reduction) -> ReflowResult<i64> {
        let shards = self.shards();
        if shards == 1 {
            return Ok(value);
        }
        self.seq += 1;
        let seq = self.seq;
        for target in 0..shards {
            if target != self.shard {
                let from = self.shard;
                self.send(target, ExchangeMessage::Count { seq, from, value })?;
            }
        }
        let mut acc = value;
        for msg in self.collect(seq)? {
            match msg {
                ExchangeMessage::Count { value, .. } => acc = reduction.apply(acc, value),
                ExchangeMessage::Data { from, .. } => {
                    return crate::reportable_error!(
                        "shard {} sent changes where a count was expected at stage {}",
                        from,
                        seq
                    );
                }
            }
        }
        Ok(acc)
    }

    fn send(&self, target: usize, mut msg: ExchangeMessage) -> ReflowResult<()> {
        loop {
            if self.aborted() {
                return Err(Error::Aborted {
                    msg: format!("shard {} stopped while sending", self.shard),
                });
            }
            match self.peers[target].send_timeout(msg, self.timing.poll) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => msg = returned,
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(Error::Aborted {
                        msg: format!("shard {} is gone", target),
                    });
                }
            }
        }
    }

    /// Waits for the stage `seq` message of every peer
    fn collect(&mut self, seq: u64) -> ReflowResult<Vec<ExchangeMessage>> {
        let expected = self.shards() - 1;
        let mut msgs = self.stash.remove(&seq).unwrap_or_default();
        let started = Instant::now();
        let mut reported = started;
        let inbox = match &self.inbox {
            Some(inbox) => inbox,
            None => return crate::reportable_error!("shard {} has no inbox", self.shard),
        };

        while msgs.len() < expected {
            if self.abort.load(Ordering::SeqCst) {
                return Err(Error::Aborted {
                    msg: format!("shard {} stopped at stage {}", self.shard, seq),
                });
            }
            match inbox.recv_timeout(self.timing.poll) {
                Ok(msg) if msg.seq() == seq => msgs.push(msg),
                Ok(msg) if msg.seq() > seq => {
                    self.stash.entry(msg.seq()).or_insert_with(Vec::new).push(msg)
                }
                Ok(msg) => {
                    return crate::reportable_error!(
                        "shard {} received stage {} from shard {} while at stage {}",
                        self.shard,
                        msg.seq(),
                        msg.sender(),
                        seq
                    );
                }
                Err(RecvTimeoutError::Timeout) => {
                    if reported.elapsed() >= self.timing.report {
                        reported = Instant::now();
                        if let Some(logger) = &self.logger {
                            slog::warn!(
                                logger,
                                "Waiting for peers";
                                "stage" => seq,
                                "received" => msgs.len(),
                                "expected" => expected,
                                "waited_ms" => started.elapsed().as_millis() as u64
                            );
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Aborted {
                        msg: "exchange disconnected".to_string(),
                    });
                }
            }
        }
        Ok(msgs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{conf::logger::discard_logger, data::Row, values};

    fn timing() -> ExchangeTiming {
        ExchangeTiming {
            poll: Duration::from_millis(5),
            report: Duration::from_secs(1),
        }
    }

    #[test]
    fn local_exchange_test() {
        let mut exchanger = Exchanger::local();
        let change = Change::insert(Row::from_values(values![1]), 1);
        let received = exchanger.exchange(vec![vec![(0, change.clone())]]).unwrap();
        assert_eq!(received, vec![(0, change)]);
        assert_eq!(exchanger.all_reduce(7, Reduction::Max).unwrap(), 7);
    }

    #[test]
    fn mesh_exchange_test() {
        let shards = 3;
        let abort = Arc::new(AtomicBool::new(false));
        let exchangers = Exchanger::mesh(shards, 2, abort, timing(), &discard_logger());

        let results: Vec<(PortedChanges, i64, i64)> = crossbeam_utils::thread::scope(|s| {
            let handles: Vec<_> = exchangers
                .into_iter()
                .map(|mut ex| {
                    s.spawn(move |_| {
                        let me = ex.shard() as i64;
                        // every shard sends one change to every shard
                        let outgoing = (0..shards)
                            .map(|_| {
                                vec![(0, Change::insert(Row::from_values(values![me]), 1))]
                            })
                            .collect();
                        let received = ex.exchange(outgoing).unwrap();
                        let sum = ex.all_reduce(me, Reduction::Sum).unwrap();
                        let max = ex.all_reduce(me, Reduction::Max).unwrap();
                        (received, sum, max)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
        .unwrap();

        for (received, sum, max) in results {
            let senders: Vec<i64> = received
                .iter()
                .filter_map(|(_, c)| c.row.values()[0].as_int())
                .collect();
            assert_eq!(senders, vec![0, 1, 2]);
            assert_eq!(sum, 3);
            assert_eq!(max, 2);
        }
    }

    #[test]
    fn abort_test() {
        let abort = Arc::new(AtomicBool::new(false));
        let mut exchangers = Exchanger::mesh(2, 2, abort, timing(), &discard_logger());
        exchangers[1].abort();
        let err = exchangers[0].all_reduce(1, Reduction::Sum).unwrap_err();
        assert!(err.is_abort());
    }
}
