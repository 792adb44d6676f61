// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::error::{Error, ReflowResult};
use serde::Deserialize;
use slog::{o, Drain, Level, Logger};
use std::{fs::OpenOptions, path::Path};

/// Alias for logger in reflow
pub type ReflowLogger = Logger;

pub const REFLOW_LOG_NAME: &str = "reflow.log";

/// Defines a logger type
#[derive(Deserialize, Clone, Copy, Debug, PartialEq)]
pub enum LoggerType {
    /// Logs output directly to the terminal
    Terminal,
    /// Logs output to file
    File,
}

impl Default for LoggerType {
    fn default() -> Self {
        LoggerType::Terminal
    }
}

fn location() -> slog::OwnedKV<impl slog::SendSyncRefUnwindSafeKV> {
    o!(
    "location" => slog::PushFnValue(|r: &slog::Record<'_>, ser: slog::PushFnValueSerializer<'_>| {
        ser.emit(format_args!("{}:{}", r.file(), r.line()))
    }))
}

pub fn term_logger(level: Level) -> ReflowLogger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let drain = slog_async::Async::new(drain).chan_size(1024).build().fuse();

    slog::Logger::root(drain, location())
}

pub fn file_logger(log_path: &Path, level: Level) -> ReflowResult<ReflowLogger> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)
        .map_err(|e| Error::Config {
            msg: format!("Failed to open log file {} with err {}", log_path.display(), e),
        })?;

    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let drain = slog_async::Async::new(drain).chan_size(1024).build().fuse();

    Ok(slog::Logger::root(drain, location()))
}

/// A logger that drops everything
pub fn discard_logger() -> ReflowLogger {
    slog::Logger::root(slog::Discard, o!())
}
