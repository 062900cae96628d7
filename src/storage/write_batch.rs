/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Typed writes into a [`WriteBatch`].

use borsh::BorshSerialize;

use crate::error::ReplicationError;
use crate::types::basic::{CryptoHash, MiniblockNum, MiniblockRef, StreamId};
use crate::types::event::Envelope;
use crate::types::miniblock::Miniblock;
use crate::types::records::{EphemeralStreamRecord, EphemeralUpload};

use super::kv_store::Key;
use super::paths::{self, combine, miniblock_key, stream_key};

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

/// Wraps a user-provided [`WriteBatch`] with setters that encode keys and values the way the
/// [`KVGet`](super::KVGet) getters expect them.
pub struct StreamWriteBatch<W: WriteBatch>(pub(super) W);

impl<W: WriteBatch> StreamWriteBatch<W> {
    pub(crate) fn new() -> StreamWriteBatch<W> {
        StreamWriteBatch(W::new())
    }

    /* ↓↓↓ Canonical chain ↓↓↓ */

    pub fn set_last_miniblock(&mut self, stream_id: &StreamId, last: &MiniblockRef) -> Result<(), KVSetError> {
        self.set_value(
            &stream_key(&paths::LAST_MINIBLOCK, stream_id),
            last,
            || Key::LastMiniblock { stream_id: *stream_id },
        )
    }

    pub fn set_miniblock(&mut self, stream_id: &StreamId, miniblock: &Miniblock) -> Result<(), KVSetError> {
        self.set_value(
            &miniblock_key(&paths::MINIBLOCKS, stream_id, miniblock.num()),
            miniblock,
            || Key::Miniblock {
                stream_id: *stream_id,
                num: miniblock.num(),
            },
        )
    }

    pub fn set_minipool(&mut self, stream_id: &StreamId, minipool: &[Envelope]) -> Result<(), KVSetError> {
        self.set_value(
            &stream_key(&paths::MINIPOOL, stream_id),
            minipool,
            || Key::Minipool { stream_id: *stream_id },
        )
    }

    pub fn set_sealed_event(
        &mut self,
        stream_id: &StreamId,
        event: &CryptoHash,
        num: MiniblockNum,
    ) -> Result<(), KVSetError> {
        self.set_value(
            &combine(&stream_key(&paths::EVENT_INDEX, stream_id), &event.bytes()),
            &num,
            || Key::SealedEvent {
                stream_id: *stream_id,
                event: *event,
            },
        )
    }

    pub fn set_last_snapshot(&mut self, stream_id: &StreamId, num: MiniblockNum) -> Result<(), KVSetError> {
        self.set_value(
            &stream_key(&paths::LAST_SNAPSHOT, stream_id),
            &num,
            || Key::LastSnapshot { stream_id: *stream_id },
        )
    }

    /* ↓↓↓ Candidates ↓↓↓ */

    pub fn set_candidate(&mut self, stream_id: &StreamId, candidate: &Miniblock) -> Result<(), KVSetError> {
        let key = combine(
            &miniblock_key(&paths::CANDIDATES, stream_id, candidate.num()),
            &candidate.hash.bytes(),
        );
        self.set_value(&key, candidate, || Key::Candidate {
            stream_id: *stream_id,
            candidate: candidate.reference(),
        })
    }

    pub fn delete_candidate(&mut self, stream_id: &StreamId, candidate: &MiniblockRef) {
        let key = combine(
            &miniblock_key(&paths::CANDIDATES, stream_id, candidate.num),
            &candidate.hash.bytes(),
        );
        self.0.delete(&key)
    }

    pub fn set_candidate_list(&mut self, stream_id: &StreamId, candidates: &[MiniblockRef]) -> Result<(), KVSetError> {
        self.set_value(
            &stream_key(&paths::CANDIDATE_LIST, stream_id),
            candidates,
            || Key::CandidateList { stream_id: *stream_id },
        )
    }

    /* ↓↓↓ Ephemeral streams ↓↓↓ */

    pub fn set_ephemeral_stream(
        &mut self,
        stream_id: &StreamId,
        record: &EphemeralStreamRecord,
    ) -> Result<(), KVSetError> {
        self.set_value(
            &stream_key(&paths::EPHEMERAL_STREAMS, stream_id),
            record,
            || Key::EphemeralStream { stream_id: *stream_id },
        )
    }

    pub fn delete_ephemeral_stream(&mut self, stream_id: &StreamId) {
        self.0.delete(&stream_key(&paths::EPHEMERAL_STREAMS, stream_id))
    }

    pub fn set_ephemeral_miniblock(&mut self, stream_id: &StreamId, miniblock: &Miniblock) -> Result<(), KVSetError> {
        self.set_value(
            &miniblock_key(&paths::EPHEMERAL_MINIBLOCKS, stream_id, miniblock.num()),
            miniblock,
            || Key::EphemeralMiniblock {
                stream_id: *stream_id,
                num: miniblock.num(),
            },
        )
    }

    pub fn delete_ephemeral_miniblock(&mut self, stream_id: &StreamId, num: MiniblockNum) {
        self.0.delete(&miniblock_key(&paths::EPHEMERAL_MINIBLOCKS, stream_id, num))
    }

    pub fn set_ephemeral_upload(&mut self, stream_id: &StreamId, upload: &EphemeralUpload) -> Result<(), KVSetError> {
        self.set_value(
            &stream_key(&paths::EPHEMERAL_UPLOADS, stream_id),
            upload,
            || Key::EphemeralUpload { stream_id: *stream_id },
        )
    }

    pub fn delete_ephemeral_upload(&mut self, stream_id: &StreamId) {
        self.0.delete(&stream_key(&paths::EPHEMERAL_UPLOADS, stream_id))
    }

    fn set_value<T: BorshSerialize + ?Sized>(
        &mut self,
        key_bytes: &[u8],
        value: &T,
        key: impl FnOnce() -> Key,
    ) -> Result<(), KVSetError> {
        let bytes = value
            .try_to_vec()
            .map_err(|err| KVSetError::SerializeValueError { key: key(), source: err })?;
        self.0.set(key_bytes, &bytes);
        Ok(())
    }
}

/// Error when trying to serialize a value before writing it into the key value store.
#[derive(Debug)]
pub enum KVSetError {
    SerializeValueError { key: Key, source: std::io::Error },
}

impl From<KVSetError> for ReplicationError {
    fn from(value: KVSetError) -> Self {
        match value {
            KVSetError::SerializeValueError { key, source } => {
                ReplicationError::internal("failed to serialize value for storage")
                    .tag("key", key)
                    .tag("error", source)
            }
        }
    }
}
