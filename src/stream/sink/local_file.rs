// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use super::Sink;
use crate::{
    data::{Change, Timestamp},
    error::SinkError,
};
use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

/// Appends every delivered change as a `time\tdiff\trow` line.
///
/// The last time in an existing file is picked up on open, so timestamps
/// delivered again after a recovery are skipped.
pub struct LocalFileSink {
    name: String,
    path: PathBuf,
    writer: BufWriter<File>,
    last: Option<Timestamp>,
}

impl LocalFileSink {
    pub fn new(file_path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = file_path.as_ref().to_path_buf();
        let last = if path.exists() {
            last_time(&path)?
        } else {
            None
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(LocalFileSink {
            name: path.display().to_string(),
            path,
            writer: BufWriter::new(file),
            last,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn last_time(path: &Path) -> Result<Option<Timestamp>, SinkError> {
    let reader = BufReader::new(File::open(path)?);
    let mut last = None;
    for line in reader.lines() {
        let line = line?;
        // torn lines from a crash have no tabs
        if let Some((time, _)) = line.split_once('\t') {
            if let Ok(time) = time.parse::<u64>() {
                last = Some(Timestamp(time));
            }
        }
    }
    Ok(last)
}

impl Sink for LocalFileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&mut self, time: Timestamp, changes: &[Change]) -> Result<(), SinkError> {
        if matches!(self.last, Some(last) if time <= last) {
            return Ok(());
        }
        for change in changes {
            writeln!(self.writer, "{}\t{}\t{}", time, change.diff, change.row)?;
        }
        self.last = Some(time);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}
