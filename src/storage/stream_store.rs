/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The local log of every stream hosted by a node, layered over the user-provided [`KVStore`].
//!
//! ## Invariants
//!
//! For every stream, the store only ever holds a hash-linked chain of miniblocks with contiguous
//! numbers starting at genesis. Every write that extends a chain checks the number and the previous
//! hash of the new block against the stored last miniblock, so concurrent writers cannot fork it.
//!
//! Events are content-addressed. Adding an event that is already in the minipool, or already sealed,
//! succeeds without doing anything, which makes replays after a partial failure harmless.
//!
//! ## Ephemeral streams
//!
//! Media streams are first written into a separate ephemeral area: a record holding the placement and
//! chunk count, plus one miniblock per chunk. [`StreamStore::normalize_ephemeral`] moves a complete
//! ephemeral stream into the canonical area in one write batch.
//!
//! ## Concurrency
//!
//! Every read-modify-write section runs under a mutex shared by all clones of a `StreamStore`. Reads
//! that are not followed by a write do not take it.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{ErrorCode, ReplicationError};
use crate::types::{
    basic::{CryptoHash, MiniblockNum, MiniblockRef, StreamId},
    event::{Envelope, Payload},
    miniblock::{verify_chain, verify_chain_from, Miniblock},
    records::{EphemeralStreamRecord, EphemeralUpload},
};

use super::kv_store::{KVGet, KVStore};
use super::view::StreamView;
use super::write_batch::StreamWriteBatch;

/// Outcome of [`StreamStore::promote_candidate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Promotion {
    Promoted(MiniblockRef),
    /// The referenced miniblock number is already part of the chain. `matches` tells whether the stored
    /// block has the referenced hash.
    AlreadyApplied { matches: bool },
    /// The local chain is more than one miniblock behind the reference.
    Gap { last: MiniblockRef },
    MissingCandidate,
}

#[derive(Clone)]
pub struct StreamStore<K: KVStore> {
    kv: K,
    write_lock: Arc<Mutex<()>>,
}

impl<K: KVStore> StreamStore<K> {
    pub fn new(kv: K) -> StreamStore<K> {
        StreamStore {
            kv,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /* ↓↓↓ Reads ↓↓↓ */

    pub fn view(&self, stream_id: &StreamId) -> Result<Option<StreamView>, ReplicationError> {
        let last_block = match self.kv.last_miniblock(stream_id)? {
            Some(last_block) => last_block,
            None => return Ok(None),
        };
        let inception = self
            .kv
            .miniblock(stream_id, MiniblockNum::genesis())?
            .and_then(|genesis| genesis.events.first().map(|event| event.payload().clone()))
            .ok_or_else(|| ReplicationError::internal("stream has no genesis event").tag("stream_id", stream_id))?;

        Ok(Some(StreamView {
            stream_id: *stream_id,
            last_block,
            minipool: self.kv.minipool(stream_id)?,
            last_snapshot_num: self.kv.last_snapshot(stream_id)?,
            inception,
        }))
    }

    /// Like [`view`](Self::view), but a missing stream is a `NOT_FOUND` error.
    pub fn get_view(&self, stream_id: &StreamId) -> Result<StreamView, ReplicationError> {
        self.view(stream_id)?
            .ok_or_else(|| ReplicationError::not_found("stream not found").tag("stream_id", stream_id))
    }

    pub fn miniblock(&self, stream_id: &StreamId, num: MiniblockNum) -> Result<Option<Miniblock>, ReplicationError> {
        Ok(self.kv.miniblock(stream_id, num)?)
    }

    /// A canonical miniblock, or an ephemeral one if the stream is not sealed yet.
    pub fn any_miniblock(&self, stream_id: &StreamId, num: MiniblockNum) -> Result<Option<Miniblock>, ReplicationError> {
        match self.kv.miniblock(stream_id, num)? {
            Some(miniblock) => Ok(Some(miniblock)),
            None => Ok(self.kv.ephemeral_miniblock(stream_id, num)?),
        }
    }

    /// The requested miniblocks that exist, in request order.
    pub fn miniblocks(&self, stream_id: &StreamId, nums: &[MiniblockNum]) -> Result<Vec<Miniblock>, ReplicationError> {
        let mut miniblocks = Vec::with_capacity(nums.len());
        for num in nums {
            if let Some(miniblock) = self.any_miniblock(stream_id, *num)? {
                miniblocks.push(miniblock);
            }
        }
        Ok(miniblocks)
    }

    pub fn has_event(&self, stream_id: &StreamId, event: &CryptoHash) -> Result<bool, ReplicationError> {
        if self.kv.sealed_event(stream_id, event)?.is_some() {
            return Ok(true);
        }
        Ok(self.kv.minipool(stream_id)?.iter().any(|pooled| pooled.hash == *event))
    }

    pub fn candidate(&self, stream_id: &StreamId, candidate: &MiniblockRef) -> Result<Option<Miniblock>, ReplicationError> {
        Ok(self.kv.candidate(stream_id, candidate)?)
    }

    /* ↓↓↓ Canonical streams ↓↓↓ */

    /// Create a stream from its genesis miniblock. Creating the same stream twice with the same genesis
    /// is a no-op; with a different genesis it is `ALREADY_EXISTS`.
    pub fn create_stream(&self, stream_id: &StreamId, genesis: &Miniblock) -> Result<StreamView, ReplicationError> {
        check_genesis(stream_id, genesis)?;
        let _guard = self.lock()?;

        if self.kv.last_miniblock(stream_id)?.is_some() {
            return match self.kv.miniblock(stream_id, MiniblockNum::genesis())? {
                Some(stored) if stored.hash == genesis.hash => self.get_view(stream_id),
                _ => Err(ReplicationError::new(ErrorCode::AlreadyExists, "stream already exists with a different genesis")
                    .tag("stream_id", stream_id)),
            };
        }
        if self.kv.ephemeral_stream(stream_id)?.is_some() {
            return Err(ReplicationError::new(ErrorCode::AlreadyExists, "ephemeral stream with the same id exists")
                .tag("stream_id", stream_id));
        }

        let mut wb = StreamWriteBatch::new();
        write_canonical_block(&mut wb, stream_id, genesis)?;
        wb.set_last_miniblock(stream_id, &genesis.reference())?;
        wb.set_minipool(stream_id, &[])?;
        self.write(wb);

        self.get_view(stream_id)
    }

    /// Append `event` to the minipool. Returns `false` if the event was already known.
    ///
    /// Fails with `BAD_BLOCK_NUMBER` if the event references a miniblock this node has not applied yet,
    /// and with `BAD_PREV_MINIBLOCK_HASH` if the referenced miniblock is not the one in the local chain.
    pub fn add_event(&self, stream_id: &StreamId, event: &Envelope) -> Result<bool, ReplicationError> {
        let prev = match (event.payload(), event.prev_miniblock()) {
            (Payload::Inception(_), _) | (Payload::MediaInception(_), _) => {
                return Err(ReplicationError::invalid_argument("inception events can only appear in genesis")
                    .tag("stream_id", stream_id))
            }
            (_, None) => {
                return Err(ReplicationError::invalid_argument("event does not reference a miniblock")
                    .tag("stream_id", stream_id)
                    .tag("event", event.hash))
            }
            (_, Some(prev)) => *prev,
        };

        let _guard = self.lock()?;
        let last = self.last_or_not_found(stream_id)?;

        let mut minipool = self.kv.minipool(stream_id)?;
        if minipool.iter().any(|pooled| pooled.hash == event.hash)
            || self.kv.sealed_event(stream_id, &event.hash)?.is_some()
        {
            return Ok(false);
        }

        if prev.num > last.num {
            return Err(ReplicationError::new(ErrorCode::BadBlockNumber, "event references a miniblock this node has not seen")
                .tag("stream_id", stream_id)
                .tag("expected", prev.num)
                .tag("observed", last.num));
        }
        let referenced = self
            .kv
            .miniblock(stream_id, prev.num)?
            .ok_or_else(|| ReplicationError::internal("miniblock missing below last miniblock").tag("num", prev.num))?;
        if referenced.hash != prev.hash {
            return Err(ReplicationError::new(ErrorCode::BadPrevMiniblockHash, "event references a different miniblock")
                .tag("stream_id", stream_id)
                .tag("num", prev.num)
                .tag("expected", referenced.hash)
                .tag("observed", prev.hash));
        }

        minipool.push(event.clone());
        let mut wb = StreamWriteBatch::new();
        wb.set_minipool(stream_id, &minipool)?;
        self.write(wb);
        Ok(true)
    }

    /* ↓↓↓ Candidates ↓↓↓ */

    /// Store `candidate` as a candidate for the next miniblock of the stream.
    pub fn write_candidate(&self, stream_id: &StreamId, candidate: &Miniblock) -> Result<(), ReplicationError> {
        if !candidate.is_correct() {
            return Err(ReplicationError::invalid_argument("candidate hash does not match its content")
                .tag("stream_id", stream_id)
                .tag("hash", candidate.hash));
        }

        let _guard = self.lock()?;
        let last = self.last_or_not_found(stream_id)?;

        if candidate.num() <= last.num {
            return match self.kv.miniblock(stream_id, candidate.num())? {
                Some(applied) if applied.hash == candidate.hash => Ok(()),
                _ => Err(ReplicationError::new(ErrorCode::MiniblockTooOld, "candidate is for an applied miniblock number")
                    .tag("stream_id", stream_id)
                    .tag("expected", last.num.next())
                    .tag("observed", candidate.num())),
            };
        }
        if candidate.num() > last.num.next() {
            return Err(ReplicationError::new(ErrorCode::MiniblockTooNew, "candidate is ahead of the local chain")
                .tag("stream_id", stream_id)
                .tag("expected", last.num.next())
                .tag("observed", candidate.num()));
        }
        if candidate.prev_hash() != last.hash {
            return Err(ReplicationError::new(ErrorCode::BadPrevMiniblockHash, "candidate does not extend the local chain")
                .tag("stream_id", stream_id)
                .tag("expected", last.hash)
                .tag("observed", candidate.prev_hash()));
        }

        let mut candidates = self.kv.candidate_list(stream_id)?;
        if !candidates.contains(&candidate.reference()) {
            candidates.push(candidate.reference());
        }
        let mut wb = StreamWriteBatch::new();
        wb.set_candidate(stream_id, candidate)?;
        wb.set_candidate_list(stream_id, &candidates)?;
        self.write(wb);
        Ok(())
    }

    /// Make the stored candidate `reference` the next miniblock of the stream.
    pub fn promote_candidate(&self, stream_id: &StreamId, reference: &MiniblockRef) -> Result<Promotion, ReplicationError> {
        let _guard = self.lock()?;
        let last = self.last_or_not_found(stream_id)?;

        if reference.num <= last.num {
            let matches = self
                .kv
                .miniblock(stream_id, reference.num)?
                .map(|applied| applied.hash == reference.hash)
                .unwrap_or(false);
            return Ok(Promotion::AlreadyApplied { matches });
        }
        if reference.num > last.num.next() {
            return Ok(Promotion::Gap { last });
        }
        let candidate = match self.kv.candidate(stream_id, reference)? {
            Some(candidate) => candidate,
            None => return Ok(Promotion::MissingCandidate),
        };
        if candidate.prev_hash() != last.hash {
            return Err(ReplicationError::new(ErrorCode::BadPrevMiniblockHash, "finalized candidate does not extend the local chain")
                .tag("stream_id", stream_id)
                .tag("expected", last.hash)
                .tag("observed", candidate.prev_hash()));
        }

        self.apply(stream_id, &candidate)?;
        Ok(Promotion::Promoted(candidate.reference()))
    }

    /// Append miniblocks fetched from a peer. Blocks the local chain already has are skipped; the rest
    /// must extend the local chain. If the stream does not exist locally, the blocks must start at
    /// genesis. Returns the number of miniblocks applied.
    pub fn import_miniblocks(&self, stream_id: &StreamId, miniblocks: &[Miniblock]) -> Result<usize, ReplicationError> {
        let _guard = self.lock()?;

        let (last, rest) = match self.kv.last_miniblock(stream_id)? {
            Some(last) => {
                let skip = miniblocks.iter().take_while(|miniblock| miniblock.num() <= last.num).count();
                (Some(last), &miniblocks[skip..])
            }
            None => (None, miniblocks),
        };
        if rest.is_empty() {
            return Ok(0);
        }
        verify_chain_from(last.as_ref(), rest)?;

        if last.is_none() {
            let genesis = &rest[0];
            check_genesis(stream_id, genesis)?;
            let mut wb = StreamWriteBatch::new();
            write_canonical_block(&mut wb, stream_id, genesis)?;
            wb.set_last_miniblock(stream_id, &genesis.reference())?;
            wb.set_minipool(stream_id, &[])?;
            self.write(wb);
        }
        let start = if last.is_none() { 1 } else { 0 };
        for miniblock in &rest[start..] {
            self.apply(stream_id, miniblock)?;
        }
        Ok(rest.len())
    }

    /* ↓↓↓ Ephemeral streams ↓↓↓ */

    /// Allocate an ephemeral stream. `ALREADY_EXISTS` if it was allocated (or sealed) before; callers
    /// that retry compare the stored genesis to recover.
    pub fn create_ephemeral(
        &self,
        stream_id: &StreamId,
        genesis: &Miniblock,
        record: &EphemeralStreamRecord,
    ) -> Result<(), ReplicationError> {
        check_genesis(stream_id, genesis)?;
        if record.chunk_count == 0 {
            return Err(ReplicationError::invalid_argument("ephemeral stream needs at least one chunk")
                .tag("stream_id", stream_id));
        }
        let _guard = self.lock()?;

        if self.kv.last_miniblock(stream_id)?.is_some() || self.kv.ephemeral_stream(stream_id)?.is_some() {
            return Err(ReplicationError::new(ErrorCode::AlreadyExists, "stream already allocated")
                .tag("stream_id", stream_id));
        }

        let mut wb = StreamWriteBatch::new();
        wb.set_ephemeral_stream(stream_id, record)?;
        wb.set_ephemeral_miniblock(stream_id, genesis)?;
        self.write(wb);
        Ok(())
    }

    pub fn ephemeral_record(&self, stream_id: &StreamId) -> Result<Option<EphemeralStreamRecord>, ReplicationError> {
        Ok(self.kv.ephemeral_stream(stream_id)?)
    }

    /// Write the miniblock of one chunk. `ALREADY_EXISTS` if a miniblock with that number is stored.
    pub fn write_ephemeral_miniblock(&self, stream_id: &StreamId, miniblock: &Miniblock) -> Result<(), ReplicationError> {
        if !miniblock.is_correct() {
            return Err(ReplicationError::invalid_argument("miniblock hash does not match its content")
                .tag("stream_id", stream_id));
        }
        let _guard = self.lock()?;

        let record = match self.kv.ephemeral_stream(stream_id)? {
            Some(record) => record,
            None if self.kv.last_miniblock(stream_id)?.is_some() => {
                return Err(ReplicationError::new(ErrorCode::AlreadyExists, "stream is already sealed")
                    .tag("stream_id", stream_id)
                    .tag("num", miniblock.num()))
            }
            None => {
                return Err(ReplicationError::not_found("ephemeral stream not found").tag("stream_id", stream_id))
            }
        };

        let num = miniblock.num().int();
        if num == 0 || num > record.chunk_count as u64 {
            return Err(ReplicationError::invalid_argument("miniblock number outside the chunk range")
                .tag("stream_id", stream_id)
                .tag("num", num)
                .tag("chunk_count", record.chunk_count));
        }
        if self.kv.ephemeral_miniblock(stream_id, miniblock.num())?.is_some() {
            return Err(ReplicationError::new(ErrorCode::AlreadyExists, "ephemeral miniblock already written")
                .tag("stream_id", stream_id)
                .tag("num", num));
        }
        let prev = self
            .kv
            .ephemeral_miniblock(stream_id, MiniblockNum::new(num - 1))?
            .ok_or_else(|| {
                ReplicationError::new(ErrorCode::BadBlockNumber, "previous ephemeral miniblock is missing")
                    .tag("stream_id", stream_id)
                    .tag("expected", num - 1)
            })?;
        if prev.hash != miniblock.prev_hash() {
            return Err(ReplicationError::new(ErrorCode::BadPrevMiniblockHash, "ephemeral miniblock does not extend its predecessor")
                .tag("stream_id", stream_id)
                .tag("expected", prev.hash)
                .tag("observed", miniblock.prev_hash()));
        }

        let mut wb = StreamWriteBatch::new();
        wb.set_ephemeral_miniblock(stream_id, miniblock)?;
        self.write(wb);
        Ok(())
    }

    /// Turn a complete ephemeral stream into a canonical one and return its genesis hash. Calling it on
    /// an already sealed stream returns the same hash.
    pub fn normalize_ephemeral(&self, stream_id: &StreamId) -> Result<CryptoHash, ReplicationError> {
        let _guard = self.lock()?;

        let record = match self.kv.ephemeral_stream(stream_id)? {
            Some(record) => record,
            None => {
                return self
                    .kv
                    .miniblock(stream_id, MiniblockNum::genesis())?
                    .map(|genesis| genesis.hash)
                    .ok_or_else(|| ReplicationError::not_found("ephemeral stream not found").tag("stream_id", stream_id))
            }
        };

        let mut miniblocks = Vec::with_capacity(record.chunk_count as usize + 1);
        for num in 0..=record.chunk_count as u64 {
            let miniblock = self
                .kv
                .ephemeral_miniblock(stream_id, MiniblockNum::new(num))?
                .ok_or_else(|| {
                    ReplicationError::not_found("ephemeral stream is missing a chunk")
                        .tag("stream_id", stream_id)
                        .tag("num", num)
                })?;
            miniblocks.push(miniblock);
        }
        verify_chain(&miniblocks)?;

        let mut wb = StreamWriteBatch::new();
        for miniblock in &miniblocks {
            write_canonical_block(&mut wb, stream_id, miniblock)?;
            wb.delete_ephemeral_miniblock(stream_id, miniblock.num());
        }
        if let Some(last) = miniblocks.last() {
            wb.set_last_miniblock(stream_id, &last.reference())?;
        }
        wb.set_minipool(stream_id, &[])?;
        wb.delete_ephemeral_stream(stream_id);
        self.write(wb);

        Ok(miniblocks[0].hash)
    }

    /* ↓↓↓ Upload bookkeeping ↓↓↓ */

    pub fn upload(&self, stream_id: &StreamId) -> Result<Option<EphemeralUpload>, ReplicationError> {
        Ok(self.kv.ephemeral_upload(stream_id)?)
    }

    pub fn put_upload(&self, stream_id: &StreamId, upload: &EphemeralUpload) -> Result<(), ReplicationError> {
        let _guard = self.lock()?;
        let mut wb = StreamWriteBatch::new();
        wb.set_ephemeral_upload(stream_id, upload)?;
        self.write(wb);
        Ok(())
    }

    pub fn delete_upload(&self, stream_id: &StreamId) -> Result<(), ReplicationError> {
        let _guard = self.lock()?;
        let mut wb = StreamWriteBatch::new();
        wb.delete_ephemeral_upload(stream_id);
        self.write(wb);
        Ok(())
    }

    /* ↓↓↓ Helpers ↓↓↓ */

    /// Append `miniblock` to the chain, drop its events from the minipool and forget candidates that can
    /// no longer be promoted. The caller holds the write lock and has checked that `miniblock` extends
    /// the chain.
    fn apply(&self, stream_id: &StreamId, miniblock: &Miniblock) -> Result<(), ReplicationError> {
        let mut wb = StreamWriteBatch::new();
        write_canonical_block(&mut wb, stream_id, miniblock)?;
        wb.set_last_miniblock(stream_id, &miniblock.reference())?;
        if miniblock.header.snapshot_hash.is_some() {
            wb.set_last_snapshot(stream_id, miniblock.num())?;
        }

        let minipool: Vec<Envelope> = self
            .kv
            .minipool(stream_id)?
            .into_iter()
            .filter(|event| !miniblock.header.event_hashes.contains(&event.hash))
            .collect();
        wb.set_minipool(stream_id, &minipool)?;

        let (stale, live): (Vec<MiniblockRef>, Vec<MiniblockRef>) = self
            .kv
            .candidate_list(stream_id)?
            .into_iter()
            .partition(|candidate| candidate.num <= miniblock.num());
        for candidate in &stale {
            wb.delete_candidate(stream_id, candidate);
        }
        wb.set_candidate_list(stream_id, &live)?;

        self.write(wb);
        Ok(())
    }

    fn last_or_not_found(&self, stream_id: &StreamId) -> Result<MiniblockRef, ReplicationError> {
        self.kv
            .last_miniblock(stream_id)?
            .ok_or_else(|| ReplicationError::not_found("stream not found").tag("stream_id", stream_id))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, ReplicationError> {
        self.write_lock
            .lock()
            .map_err(|_| ReplicationError::internal("stream store lock poisoned"))
    }

    fn write(&self, wb: StreamWriteBatch<K::WriteBatch>) {
        let mut kv = self.kv.clone();
        kv.write(wb.0)
    }
}

fn write_canonical_block<W: super::write_batch::WriteBatch>(
    wb: &mut StreamWriteBatch<W>,
    stream_id: &StreamId,
    miniblock: &Miniblock,
) -> Result<(), ReplicationError> {
    wb.set_miniblock(stream_id, miniblock)?;
    for event in &miniblock.events {
        wb.set_sealed_event(stream_id, &event.hash, miniblock.num())?;
    }
    Ok(())
}

fn check_genesis(stream_id: &StreamId, genesis: &Miniblock) -> Result<(), ReplicationError> {
    if !genesis.is_genesis() || !genesis.prev_hash().is_zero() || !genesis.is_correct() {
        return Err(ReplicationError::invalid_argument("malformed genesis miniblock")
            .tag("stream_id", stream_id)
            .tag("num", genesis.num()));
    }
    Ok(())
}
