// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

pub mod logger;

use crate::error::{Error, ReflowResult};
use hocon::HoconLoader;
use logger::{discard_logger, file_logger, term_logger, LoggerType, ReflowLogger};
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Where checkpoints are written
#[derive(Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceMode {
    /// No checkpoints are taken
    None,
    /// Checkpoints are kept in memory for the lifetime of the process
    Memory,
    /// Checkpoints are written below `checkpoint_dir`
    File,
}

/// Configuration for a reflow Pipeline
#[derive(Deserialize, Clone, Debug)]
pub struct ReflowConf {
    /// Amount of worker shards, each owning a disjoint part of the key space
    #[serde(default = "workers_default")]
    pub workers: usize,
    /// Checkpointing mode
    #[serde(default = "persistence_default")]
    pub persistence: PersistenceMode,
    /// Base directory for checkpoints
    #[serde(default = "checkpoint_dir_default")]
    pub checkpoint_dir: PathBuf,
    /// Interval in milliseconds between checkpoints, 0 disables the time trigger
    #[serde(default = "checkpoint_interval_default")]
    pub checkpoint_interval: u64,
    /// Amount of processed input changes that triggers a checkpoint, 0 disables the trigger
    #[serde(default)]
    pub checkpoint_change_threshold: u64,
    /// Amount of valid checkpoints kept around after a new one is published
    #[serde(default = "checkpoints_retained_default")]
    pub checkpoints_retained: usize,
    /// Amount of closed timestamps that may wait for sink delivery before
    /// propagation of later timestamps is throttled
    #[serde(default = "max_in_flight_default")]
    pub max_in_flight: usize,
    /// Capacity of the channels between shards, in messages per peer
    #[serde(default = "channel_capacity_default")]
    pub channel_capacity: usize,
    /// Interval in milliseconds between source polls when no source had data
    #[serde(default = "poll_interval_default")]
    pub poll_interval: u64,
    /// Interval in milliseconds after which a waiting shard or coordinator reports progress
    #[serde(default = "barrier_report_interval_default")]
    pub barrier_report_interval: u64,
    /// Amount of consecutive transient failures tolerated per source
    #[serde(default = "source_retry_attempts_default")]
    pub source_retry_attempts: u32,
    /// Initial backoff in milliseconds after a transient source failure
    #[serde(default = "source_retry_backoff_default")]
    pub source_retry_backoff: u64,
    /// Upper bound in milliseconds for the source backoff
    #[serde(default = "source_retry_backoff_max_default")]
    pub source_retry_backoff_max: u64,
    /// Max amount of rounds an iterative scope may take for one timestamp
    #[serde(default = "iteration_limit_default")]
    pub iteration_limit: u32,
    /// [LoggerType] for reflow related logging
    #[serde(default)]
    pub logger_type: LoggerType,
    /// Minimum level of log records that are kept
    #[serde(default = "log_level_default")]
    pub log_level: String,
    /// Log file used with [LoggerType::File], defaults to `reflow.log` in `checkpoint_dir`
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for ReflowConf {
    fn default() -> Self {
        ReflowConf {
            workers: workers_default(),
            persistence: persistence_default(),
            checkpoint_dir: checkpoint_dir_default(),
            checkpoint_interval: checkpoint_interval_default(),
            checkpoint_change_threshold: 0,
            checkpoints_retained: checkpoints_retained_default(),
            max_in_flight: max_in_flight_default(),
            channel_capacity: channel_capacity_default(),
            poll_interval: poll_interval_default(),
            barrier_report_interval: barrier_report_interval_default(),
            source_retry_attempts: source_retry_attempts_default(),
            source_retry_backoff: source_retry_backoff_default(),
            source_retry_backoff_max: source_retry_backoff_max_default(),
            iteration_limit: iteration_limit_default(),
            logger_type: LoggerType::default(),
            log_level: log_level_default(),
            log_file: None,
        }
    }
}

impl ReflowConf {
    /// Loads ReflowConf from a file
    pub fn from_file(path: impl AsRef<Path>) -> ReflowResult<ReflowConf> {
        let data = std::fs::read_to_string(path).map_err(|e| Error::Config {
            msg: format!("Failed to read config file with err {}", e),
        })?;

        let loader: HoconLoader = HoconLoader::new()
            .load_str(&data)
            .map_err(|e| Error::Config {
                msg: format!("Failed to load Hocon Loader with err {}", e),
            })?;

        let conf: ReflowConf = loader.resolve().map_err(|e| Error::Config {
            msg: format!("Failed to resolve ReflowConf with err {}", e),
        })?;
        conf.validate()?;
        Ok(conf)
    }

    /// Checks the values that the runtime cannot work with
    pub fn validate(&self) -> ReflowResult<()> {
        let check = |ok: bool, msg: &str| -> ReflowResult<()> {
            if ok {
                Ok(())
            } else {
                Err(Error::Config {
                    msg: msg.to_string(),
                })
            }
        };
        check(self.workers > 0, "workers must be at least 1")?;
        check(self.max_in_flight > 0, "max_in_flight must be at least 1")?;
        check(self.channel_capacity > 0, "channel_capacity must be at least 1")?;
        check(
            self.checkpoints_retained > 0,
            "checkpoints_retained must be at least 1",
        )?;
        check(self.iteration_limit > 0, "iteration_limit must be at least 1")?;
        check(
            self.barrier_report_interval > 0,
            "barrier_report_interval must be at least 1",
        )?;
        self.level()?;
        Ok(())
    }

    /// Parsed `log_level`
    pub fn level(&self) -> ReflowResult<slog::Level> {
        slog::Level::from_str(&self.log_level).map_err(|_| Error::Config {
            msg: format!("Unknown log level {}", self.log_level),
        })
    }

    /// Builds the logger described by this configuration
    pub fn logger(&self) -> ReflowResult<ReflowLogger> {
        let level = self.level()?;
        match self.logger_type {
            LoggerType::Terminal => Ok(term_logger(level)),
            LoggerType::File => {
                let path = match &self.log_file {
                    Some(path) => path.clone(),
                    None => {
                        std::fs::create_dir_all(&self.checkpoint_dir)?;
                        self.checkpoint_dir.join(logger::REFLOW_LOG_NAME)
                    }
                };
                file_logger(&path, level)
            }
        }
    }

    /// Logger that drops all records, convenient in tests
    pub fn quiet_logger() -> ReflowLogger {
        discard_logger()
    }

    #[inline]
    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }

    #[inline]
    pub(crate) fn barrier_report_interval(&self) -> Duration {
        Duration::from_millis(self.barrier_report_interval)
    }
}

// Default values

fn workers_default() -> usize {
    std::cmp::max(1, num_cpus::get())
}

fn persistence_default() -> PersistenceMode {
    PersistenceMode::None
}

fn checkpoint_dir_default() -> PathBuf {
    let mut res = std::env::temp_dir();
    res.push("reflow/checkpoints");
    res
}

fn checkpoint_interval_default() -> u64 {
    // in milliseconds
    5000
}

fn checkpoints_retained_default() -> usize {
    2
}

fn max_in_flight_default() -> usize {
    16
}

fn channel_capacity_default() -> usize {
    2
}

fn poll_interval_default() -> u64 {
    // in milliseconds
    10
}

fn barrier_report_interval_default() -> u64 {
    // in milliseconds
    5000
}

fn source_retry_attempts_default() -> u32 {
    5
}

fn source_retry_backoff_default() -> u64 {
    // in milliseconds
    50
}

fn source_retry_backoff_max_default() -> u64 {
    // in milliseconds
    5000
}

fn iteration_limit_default() -> u32 {
    1000
}

fn log_level_default() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::prelude::*;
    use tempfile::NamedTempFile;

    #[test]
    fn conf_from_file_test() {
        // Set up Config File
        let mut file = NamedTempFile::new().unwrap();
        let file_path = file.path().to_string_lossy().into_owned();
        let config_str = r#"{checkpoint_dir: /dev/null, workers: 3, persistence: file, checkpoint_change_threshold: 100}"#;
        file.write_all(config_str.as_bytes()).unwrap();

        // Load conf
        let conf: ReflowConf = ReflowConf::from_file(&file_path).unwrap();

        // Check custom values
        assert_eq!(conf.checkpoint_dir, PathBuf::from("/dev/null"));
        assert_eq!(conf.workers, 3);
        assert_eq!(conf.persistence, PersistenceMode::File);
        assert_eq!(conf.checkpoint_change_threshold, 100);
        // Check defaults
        assert_eq!(conf.checkpoint_interval, checkpoint_interval_default());
        assert_eq!(conf.checkpoints_retained, checkpoints_retained_default());
        assert_eq!(conf.max_in_flight, max_in_flight_default());
        assert_eq!(conf.iteration_limit, iteration_limit_default());
        assert_eq!(conf.logger_type, LoggerType::Terminal);
        assert_eq!(conf.log_level, log_level_default());
    }

    #[test]
    fn conf_validate_test() {
        let mut conf = ReflowConf::default();
        assert!(conf.validate().is_ok());
        conf.workers = 0;
        assert!(conf.validate().is_err());
        conf.workers = 1;
        conf.log_level = "chatty".to_string();
        assert!(conf.validate().is_err());
    }
}
