/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/
//! Defines the [KVStore] trait, which specifies the required interface for the key-value store provided
//! by the user.
//!
//! Given a method to obtain the value for a given key in bytes, this module also provides methods to
//! obtain the stream variables stored in the key-value store, as laid out in [super::paths].

use std::fmt::Display;

use borsh::BorshDeserialize;

use crate::error::ReplicationError;
use crate::types::{
    basic::{CryptoHash, MiniblockNum, MiniblockRef, StreamId},
    event::Envelope,
    miniblock::Miniblock,
    records::{EphemeralStreamRecord, EphemeralUpload},
};

use super::paths::{self, combine, miniblock_key, stream_key};
use super::write_batch::WriteBatch;

pub trait KVStore: KVGet + Clone + Send + Sync + 'static {
    type WriteBatch: WriteBatch;

    /// Atomically apply every insertion and deletion in `wb`.
    fn write(&mut self, wb: Self::WriteBatch);
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /* ↓↓↓ Canonical chain ↓↓↓ */

    fn last_miniblock(&self, stream_id: &StreamId) -> Result<Option<MiniblockRef>, KVGetError> {
        read(self, &stream_key(&paths::LAST_MINIBLOCK, stream_id), || Key::LastMiniblock { stream_id: *stream_id })
    }

    fn miniblock(&self, stream_id: &StreamId, num: MiniblockNum) -> Result<Option<Miniblock>, KVGetError> {
        read(self, &miniblock_key(&paths::MINIBLOCKS, stream_id, num), || Key::Miniblock {
            stream_id: *stream_id,
            num,
        })
    }

    fn minipool(&self, stream_id: &StreamId) -> Result<Vec<Envelope>, KVGetError> {
        Ok(read(self, &stream_key(&paths::MINIPOOL, stream_id), || Key::Minipool { stream_id: *stream_id })?
            .unwrap_or_default())
    }

    /// Number of the miniblock an event was sealed into, if it was.
    fn sealed_event(&self, stream_id: &StreamId, event: &CryptoHash) -> Result<Option<MiniblockNum>, KVGetError> {
        let key = combine(&stream_key(&paths::EVENT_INDEX, stream_id), &event.bytes());
        read(self, &key, || Key::SealedEvent {
            stream_id: *stream_id,
            event: *event,
        })
    }

    fn last_snapshot(&self, stream_id: &StreamId) -> Result<MiniblockNum, KVGetError> {
        Ok(read(self, &stream_key(&paths::LAST_SNAPSHOT, stream_id), || Key::LastSnapshot { stream_id: *stream_id })?
            .unwrap_or_else(MiniblockNum::genesis))
    }

    /* ↓↓↓ Candidates ↓↓↓ */

    fn candidate(&self, stream_id: &StreamId, candidate: &MiniblockRef) -> Result<Option<Miniblock>, KVGetError> {
        let key = combine(&miniblock_key(&paths::CANDIDATES, stream_id, candidate.num), &candidate.hash.bytes());
        read(self, &key, || Key::Candidate {
            stream_id: *stream_id,
            candidate: *candidate,
        })
    }

    fn candidate_list(&self, stream_id: &StreamId) -> Result<Vec<MiniblockRef>, KVGetError> {
        Ok(read(self, &stream_key(&paths::CANDIDATE_LIST, stream_id), || Key::CandidateList { stream_id: *stream_id })?
            .unwrap_or_default())
    }

    /* ↓↓↓ Ephemeral streams ↓↓↓ */

    fn ephemeral_stream(&self, stream_id: &StreamId) -> Result<Option<EphemeralStreamRecord>, KVGetError> {
        read(self, &stream_key(&paths::EPHEMERAL_STREAMS, stream_id), || Key::EphemeralStream { stream_id: *stream_id })
    }

    fn ephemeral_miniblock(&self, stream_id: &StreamId, num: MiniblockNum) -> Result<Option<Miniblock>, KVGetError> {
        read(self, &miniblock_key(&paths::EPHEMERAL_MINIBLOCKS, stream_id, num), || Key::EphemeralMiniblock {
            stream_id: *stream_id,
            num,
        })
    }

    fn ephemeral_upload(&self, stream_id: &StreamId) -> Result<Option<EphemeralUpload>, KVGetError> {
        read(self, &stream_key(&paths::EPHEMERAL_UPLOADS, stream_id), || Key::EphemeralUpload { stream_id: *stream_id })
    }
}

fn read<T: BorshDeserialize, G: KVGet + ?Sized>(
    kv: &G,
    key_bytes: &[u8],
    key: impl FnOnce() -> Key,
) -> Result<Option<T>, KVGetError> {
    match kv.get(key_bytes) {
        Some(bytes) => T::deserialize(&mut bytes.as_slice())
            .map(Some)
            .map_err(|err| KVGetError::DeserializeValueError { key: key(), source: err }),
        None => Ok(None),
    }
}

/// Error when trying to read a value corresponding to a given key from the [key value store][KVStore].
#[derive(Debug)]
pub enum KVGetError {
    DeserializeValueError { key: Key, source: std::io::Error },
}

impl From<KVGetError> for ReplicationError {
    fn from(value: KVGetError) -> Self {
        match value {
            KVGetError::DeserializeValueError { key, source } => {
                ReplicationError::internal("failed to deserialize stored value")
                    .tag("key", key)
                    .tag("error", source)
            }
        }
    }
}

#[derive(Debug)]
pub enum Key {
    LastMiniblock { stream_id: StreamId },
    Miniblock { stream_id: StreamId, num: MiniblockNum },
    Minipool { stream_id: StreamId },
    SealedEvent { stream_id: StreamId, event: CryptoHash },
    LastSnapshot { stream_id: StreamId },
    Candidate { stream_id: StreamId, candidate: MiniblockRef },
    CandidateList { stream_id: StreamId },
    EphemeralStream { stream_id: StreamId },
    EphemeralMiniblock { stream_id: StreamId, num: MiniblockNum },
    EphemeralUpload { stream_id: StreamId },
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::LastMiniblock { stream_id } => write!(f, "Last miniblock of stream {}", stream_id),
            Key::Miniblock { stream_id, num } => write!(f, "Miniblock {} of stream {}", num, stream_id),
            Key::Minipool { stream_id } => write!(f, "Minipool of stream {}", stream_id),
            Key::SealedEvent { stream_id, event } => write!(f, "Sealed event {} of stream {}", event, stream_id),
            Key::LastSnapshot { stream_id } => write!(f, "Last snapshot of stream {}", stream_id),
            Key::Candidate { stream_id, candidate } => write!(f, "Candidate {} of stream {}", candidate, stream_id),
            Key::CandidateList { stream_id } => write!(f, "Candidate list of stream {}", stream_id),
            Key::EphemeralStream { stream_id } => write!(f, "Ephemeral record of stream {}", stream_id),
            Key::EphemeralMiniblock { stream_id, num } => {
                write!(f, "Ephemeral miniblock {} of stream {}", num, stream_id)
            }
            Key::EphemeralUpload { stream_id } => write!(f, "Upload bookkeeping of stream {}", stream_id),
        }
    }
}
