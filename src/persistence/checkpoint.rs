// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::{
    data::{Change, Diff, Row, Timestamp},
    error::{Error, ReflowResult},
    stream::{source::Offset, time::Frontier},
};
use prost::Message;
use reflow_state::StateSnapshot;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Marks a reflow checkpoint ("RFLW")
pub const CHECKPOINT_MAGIC: u32 = 0x5246_4c57;
pub const CHECKPOINT_VERSION: u32 = 1;

/// Self-describing header of a checkpoint.
///
/// Everything needed to decide whether a checkpoint is complete and belongs
/// to the running pipeline is readable without decoding the payload.
#[derive(Clone, PartialEq, Message)]
pub struct CheckpointEnvelope {
    #[prost(uint32, tag = "1")]
    pub magic: u32,
    #[prost(uint32, tag = "2")]
    pub version: u32,
    #[prost(uint64, tag = "3")]
    pub id: u64,
    /// Closed frontier, absent once every source closed
    #[prost(uint64, optional, tag = "4")]
    pub frontier: Option<u64>,
    #[prost(uint32, tag = "5")]
    pub shard_count: u32,
    /// Fingerprint of the dataflow graph
    #[prost(uint64, tag = "6")]
    pub fingerprint: u64,
    /// xxh64 of `payload`
    #[prost(uint64, tag = "7")]
    pub checksum: u64,
    /// bincode encoded [CheckpointBody]
    #[prost(bytes, tag = "8")]
    pub payload: Vec<u8>,
}

/// Where a source resumes after recovery
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceCheckpoint {
    pub name: String,
    pub position: Offset,
    pub frontier: Frontier,
}

/// Everything a pipeline needs to continue from a closed frontier
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CheckpointBody {
    pub closed: Frontier,
    /// State of every shard, in shard order
    pub shards: Vec<StateSnapshot>,
    /// Sources in the order they were added to the pipeline
    pub sources: Vec<SourceCheckpoint>,
    /// Polled changes at or above the closed frontier, with their source
    pub pending: Vec<(usize, Change)>,
    /// Running totals of append-only sources
    pub totals: Vec<(usize, Vec<(Row, Diff)>)>,
}

fn checksum(payload: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(payload);
    hasher.finish()
}

/// Serialises a checkpoint
pub fn encode(id: u64, fingerprint: u64, body: &CheckpointBody) -> ReflowResult<Vec<u8>> {
    let payload = bincode::serialize(body)?;
    let envelope = CheckpointEnvelope {
        magic: CHECKPOINT_MAGIC,
        version: CHECKPOINT_VERSION,
        id,
        frontier: body.closed.time().map(|t| t.0),
        shard_count: body.shards.len() as u32,
        fingerprint,
        checksum: checksum(&payload),
        payload,
    };
    let mut buf = Vec::with_capacity(envelope.encoded_len());
    envelope.encode(&mut buf).map_err(|e| Error::ReportableBug {
        msg: format!("failed to encode checkpoint {}: {}", id, e),
    })?;
    Ok(buf)
}

/// Reads and verifies the envelope of a checkpoint.
///
/// Fails with `Corruption` for anything that is not a complete checkpoint.
pub fn decode_envelope(bytes: &[u8]) -> ReflowResult<CheckpointEnvelope> {
    let envelope = CheckpointEnvelope::decode(bytes).map_err(|e| Error::Corruption {
        msg: format!("unreadable checkpoint envelope: {}", e),
    })?;
    if envelope.magic != CHECKPOINT_MAGIC {
        return Err(Error::Corruption {
            msg: format!("bad checkpoint magic {:#x}", envelope.magic),
        });
    }
    if envelope.version != CHECKPOINT_VERSION {
        return Err(Error::Corruption {
            msg: format!("unknown checkpoint version {}", envelope.version),
        });
    }
    if checksum(&envelope.payload) != envelope.checksum {
        return Err(Error::Corruption {
            msg: format!("checksum mismatch in checkpoint {}", envelope.id),
        });
    }
    Ok(envelope)
}

impl CheckpointEnvelope {
    pub fn closed(&self) -> Frontier {
        match self.frontier {
            Some(t) => Frontier::at(Timestamp(t)),
            None => Frontier::closed(),
        }
    }

    /// Decodes the payload, which must agree with the header
    pub fn body(&self) -> ReflowResult<CheckpointBody> {
        let body: CheckpointBody = bincode::deserialize(&self.payload)?;
        if body.closed != self.closed() || body.shards.len() != self.shard_count as usize {
            return Err(Error::Corruption {
                msg: format!("checkpoint {} payload disagrees with its header", self.id),
            });
        }
        Ok(body)
    }
}
