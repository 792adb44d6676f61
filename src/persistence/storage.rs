// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::error::{Error, ReflowResult};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

const CHECKPOINT_PREFIX: &str = "checkpoint-";
const CHECKPOINT_SUFFIX: &str = ".ckpt";

/// A place checkpoints are published to.
///
/// `write` must publish atomically: a checkpoint is either listed with its
/// complete contents or not at all.
pub trait CheckpointStorage: Send {
    /// Ids of all published checkpoints in ascending order
    fn list(&self) -> ReflowResult<Vec<u64>>;
    fn read(&self, id: u64) -> ReflowResult<Vec<u8>>;
    fn write(&mut self, id: u64, bytes: &[u8]) -> ReflowResult<()>;
    fn remove(&mut self, id: u64) -> ReflowResult<()>;
}

/// Checkpoints as files in a directory, published by renaming a fully
/// written temporary file
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl AsRef<Path>) -> ReflowResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(FileStorage { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: u64) -> PathBuf {
        self.dir
            .join(format!("{}{:020}{}", CHECKPOINT_PREFIX, id, CHECKPOINT_SUFFIX))
    }
}

fn parse_id(name: &str) -> Option<u64> {
    name.strip_prefix(CHECKPOINT_PREFIX)?
        .strip_suffix(CHECKPOINT_SUFFIX)?
        .parse()
        .ok()
}

impl CheckpointStorage for FileStorage {
    fn list(&self) -> ReflowResult<Vec<u64>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(parse_id) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn read(&self, id: u64) -> ReflowResult<Vec<u8>> {
        Ok(fs::read(self.path(id))?)
    }

    fn write(&mut self, id: u64, bytes: &[u8]) -> ReflowResult<()> {
        let target = self.path(id);
        let tmp = target.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &target)?;
        // make the rename durable
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    fn remove(&mut self, id: u64) -> ReflowResult<()> {
        match fs::remove_file(self.path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Checkpoints kept in memory, shared between clones.
///
/// Lets a test restart a pipeline from the checkpoints of a previous one.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    checkpoints: Arc<Mutex<BTreeMap<u64, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut BTreeMap<u64, Vec<u8>>) -> T) -> ReflowResult<T> {
        let mut checkpoints = self.checkpoints.lock().map_err(|_| Error::ReportableBug {
            msg: "checkpoint storage lock was poisoned".to_string(),
        })?;
        Ok(f(&mut checkpoints))
    }

    /// Replaces the bytes of checkpoint `id`, for corruption tests
    pub fn overwrite(&self, id: u64, bytes: Vec<u8>) -> ReflowResult<()> {
        self.with(|c| {
            c.insert(id, bytes);
        })
    }
}

impl CheckpointStorage for MemoryStorage {
    fn list(&self) -> ReflowResult<Vec<u64>> {
        self.with(|c| c.keys().copied().collect())
    }

    fn read(&self, id: u64) -> ReflowResult<Vec<u8>> {
        self.with(|c| c.get(&id).cloned())?.ok_or_else(|| Error::Corruption {
            msg: format!("checkpoint {} vanished", id),
        })
    }

    fn write(&mut self, id: u64, bytes: &[u8]) -> ReflowResult<()> {
        self.with(|c| {
            c.insert(id, bytes.to_vec());
        })
    }

    fn remove(&mut self, id: u64) -> ReflowResult<()> {
        self.with(|c| {
            c.remove(&id);
        })
    }
}
