// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

/// Append-only text file output
pub mod local_file;
/// Shared in-memory output
pub mod memory;

pub use local_file::LocalFileSink;
pub use memory::{MemorySink, SinkReader};

use crate::{
    conf::logger::ReflowLogger,
    data::{Change, Timestamp},
    error::{Error, ReflowResult, SinkError},
    stream::time::Frontier,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread::JoinHandle;

/// Defines a reflow Sink and the methods it must implement
pub trait Sink: Send + 'static {
    fn name(&self) -> &str;

    /// Applies the consolidated output of the closed timestamp `time`.
    ///
    /// Recovery may deliver a timestamp again, which must have no effect.
    fn deliver(&mut self, time: Timestamp, changes: &[Change]) -> Result<(), SinkError>;

    /// Called once every output below `frontier` was delivered
    fn on_frontier(&mut self, _frontier: Frontier) -> Result<(), SinkError> {
        Ok(())
    }

    /// Makes everything delivered so far durable
    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

enum SinkCommand {
    Deliver {
        time: Timestamp,
        /// Output per sink
        batches: Vec<Vec<Change>>,
    },
    Frontier(Frontier),
    Flush(Sender<()>),
}

/// Runs the sinks of a pipeline on their own thread.
///
/// At most `max_in_flight` closed timestamps wait for delivery, after which
/// the coordinator blocks.
pub(crate) struct SinkDriver {
    commands: Option<Sender<SinkCommand>>,
    failures: Receiver<Error>,
    thread: Option<JoinHandle<()>>,
}

impl SinkDriver {
    pub(crate) fn spawn(
        mut sinks: Vec<Box<dyn Sink>>,
        max_in_flight: usize,
        logger: &ReflowLogger,
    ) -> ReflowResult<SinkDriver> {
        let (commands, inbox) = bounded::<SinkCommand>(max_in_flight.max(1));
        let (failed, failures) = bounded::<Error>(1);
        let logger = logger.new(slog::o!("component" => "sinks"));
        let thread = std::thread::Builder::new()
            .name("reflow-sinks".to_string())
            .spawn(move || {
                for command in inbox.iter() {
                    if let Err(error) = apply(&mut sinks, command) {
                        slog::error!(logger, "Sink failed"; "error" => %error);
                        let _ = failed.send(error);
                        return;
                    }
                }
                for sink in sinks.iter_mut() {
                    if let Err(error) = sink.flush() {
                        slog::warn!(logger, "Final flush failed"; "sink" => sink.name(), "error" => %error);
                    }
                }
            })?;
        Ok(SinkDriver {
            commands: Some(commands),
            failures,
            thread: Some(thread),
        })
    }

    pub(crate) fn deliver(&self, time: Timestamp, batches: Vec<Vec<Change>>) -> ReflowResult<()> {
        self.send(SinkCommand::Deliver { time, batches })
    }

    pub(crate) fn advance(&self, frontier: Frontier) -> ReflowResult<()> {
        self.send(SinkCommand::Frontier(frontier))
    }

    /// Waits until every sink made its output durable
    pub(crate) fn flush(&self) -> ReflowResult<()> {
        let (ack, done) = bounded(1);
        self.send(SinkCommand::Flush(ack))?;
        done.recv().map_err(|_| self.failure())
    }

    /// Reports a failure of the sink thread, if there is one
    pub(crate) fn check(&self) -> ReflowResult<()> {
        match self.failures.try_recv() {
            Ok(error) => Err(error),
            Err(_) => Ok(()),
        }
    }

    fn send(&self, command: SinkCommand) -> ReflowResult<()> {
        self.check()?;
        match &self.commands {
            Some(commands) => commands.send(command).map_err(|_| self.failure()),
            None => crate::reportable_error!("sink thread was shut down"),
        }
    }

    fn failure(&self) -> Error {
        match self.failures.try_recv() {
            Ok(error) => error,
            Err(_) => Error::Aborted {
                msg: "sink thread stopped".to_string(),
            },
        }
    }
}

impl Drop for SinkDriver {
    fn drop(&mut self) {
        self.commands.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn apply(sinks: &mut [Box<dyn Sink>], command: SinkCommand) -> ReflowResult<()> {
    let failed = |sink: &dyn Sink, source: SinkError| Error::Sink {
        name: sink.name().to_string(),
        source,
    };
    match command {
        SinkCommand::Deliver { time, batches } => {
            for (sink, batch) in sinks.iter_mut().zip(batches) {
                if !batch.is_empty() {
                    sink.deliver(time, &batch)
                        .map_err(|e| failed(sink.as_ref(), e))?;
                }
            }
        }
        SinkCommand::Frontier(frontier) => {
            for sink in sinks.iter_mut() {
                sink.on_frontier(frontier)
                    .map_err(|e| failed(sink.as_ref(), e))?;
            }
        }
        SinkCommand::Flush(ack) => {
            for sink in sinks.iter_mut() {
                sink.flush().map_err(|e| failed(sink.as_ref(), e))?;
            }
            let _ = ack.send(());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{conf::logger::discard_logger, data::Row, values};

    struct FailingSink;

    impl Sink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn deliver(&mut self, _time: Timestamp, _changes: &[Change]) -> Result<(), SinkError> {
            Err(SinkError::Rejected {
                msg: "read only".to_string(),
            })
        }
    }

    #[test]
    fn sink_driver_test() {
        let (sink, reader) = MemorySink::new("out");
        let driver = SinkDriver::spawn(vec![Box::new(sink)], 2, &discard_logger()).unwrap();
        let change = Change::insert(Row::from_values(values![1]), 1);
        driver.deliver(Timestamp(1), vec![vec![change.clone()]]).unwrap();
        driver.advance(Frontier::at(Timestamp(2))).unwrap();
        driver.flush().unwrap();
        assert_eq!(reader.changes(), vec![change]);
        assert_eq!(reader.frontier(), Frontier::at(Timestamp(2)));
    }

    #[test]
    fn sink_failure_test() {
        let driver = SinkDriver::spawn(vec![Box::new(FailingSink)], 2, &discard_logger()).unwrap();
        let change = Change::insert(Row::from_values(values![1]), 1);
        driver.deliver(Timestamp(1), vec![vec![change]]).unwrap();
        let err = driver.flush().unwrap_err();
        assert!(matches!(err, Error::Sink { .. }));
    }
}
