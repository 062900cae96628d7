/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The client-facing half of a media upload.
//!
//! ## Creating
//!
//! [`create_media_stream`](MediaUploadCoordinator::create_media_stream) takes the `MediaInception`
//! event, and optionally the first chunk. The registry chooses the nodes, the genesis miniblock is
//! allocated as an ephemeral stream on the quorum nodes, and the returned
//! [`CreationCookie`] tells the client which miniblock number and previous hash its next chunk must
//! carry. Repeating the call with the same events returns the same cookie.
//!
//! ## Chunks
//!
//! [`add_media_event`](MediaUploadCoordinator::add_media_event) checks the chunk against the cookie
//! and the inception before anything is written, then saves the chunk's miniblock on the quorum nodes.
//!
//! Allocation and chunk writes wait for a majority of the quorum nodes. With an external media store
//! they wait for all of them, since each quorum node completes its own upload when sealing.
//!
//! ## Sealing
//!
//! After the last chunk, every node is asked to seal. The seal succeeds when enough nodes answer with
//! the same, non-zero genesis hash: a majority of the quorum nodes, or all of them when an external
//! media store is configured. If it fails, every node is asked to abort its external upload, and the
//! seal error is returned. If it succeeds, the sealed stream is registered and every node is told to
//! drop its upload record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::backoff::Deadline;
use crate::error::{ErrorCode, ReplicationError};
use crate::networking::{Network, RemoteClient};
use crate::pluggables::{Placement, StreamRecord, StreamRegistry};
use crate::quorum::{QuorumCheck, QuorumPolicy, QuorumPool, StreamNodeSet, TaskOrigin, Tally};
use crate::storage::{KVStore, StreamStore};
use crate::types::basic::{CryptoHash, MiniblockNum, NodeAddress, StreamId};
use crate::types::cookies::CreationCookie;
use crate::types::event::{Envelope, MediaInception, Payload};
use crate::types::miniblock::Miniblock;
use crate::types::records::EphemeralStreamRecord;

use super::upload::EphemeralUploads;

#[derive(Clone, Copy, Debug)]
pub struct MediaConfiguration {
    pub max_chunk_size: usize,
    pub operation_timeout: Duration,
}

#[derive(Clone)]
pub struct MediaUploadCoordinator<K: KVStore, N: Network> {
    config: MediaConfiguration,
    local: NodeAddress,
    store: StreamStore<K>,
    uploads: EphemeralUploads<K>,
    client: RemoteClient<N>,
    registry: Arc<dyn StreamRegistry>,
    /// Placements this node obtained from the registry for streams that are not registered yet. A
    /// retried creation through this node reuses them even if it does not host the stream.
    chosen: Arc<Mutex<HashMap<StreamId, Placement>>>,
}

impl<K: KVStore, N: Network> MediaUploadCoordinator<K, N> {
    pub(crate) fn new(
        config: MediaConfiguration,
        local: NodeAddress,
        store: StreamStore<K>,
        uploads: EphemeralUploads<K>,
        client: RemoteClient<N>,
        registry: Arc<dyn StreamRegistry>,
    ) -> MediaUploadCoordinator<K, N> {
        MediaUploadCoordinator {
            config,
            local,
            store,
            uploads,
            client,
            registry,
            chosen: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Allocate the ephemeral media stream `stream_id` from its inception event and, optionally, its
    /// first chunk.
    pub fn create_media_stream(&self, stream_id: &StreamId, events: &[Envelope]) -> Result<CreationCookie, ReplicationError> {
        let inception = validate_creation(stream_id, events)?;
        if let Some(first_chunk) = events.get(1) {
            validate_chunk(first_chunk, inception.chunk_count, MiniblockNum::new(1), inception.chunk_count == 1, self.config.max_chunk_size)?;
        }
        let chunk_count = inception.chunk_count;

        let placement = self.placement(stream_id)?;
        let nodes = StreamNodeSet::new(placement.nodes.clone(), placement.replication_factor as usize, self.local)?;
        let genesis = Miniblock::genesis(vec![events[0].clone()])?;
        let record = EphemeralStreamRecord {
            nodes: placement.nodes.clone(),
            replication_factor: placement.replication_factor,
            chunk_count,
        };

        let deadline = Deadline::after(self.config.operation_timeout);
        self.allocate_on_quorum(&nodes, stream_id, &genesis, &record, deadline)?;

        let cookie = CreationCookie {
            stream_id: *stream_id,
            nodes: placement.nodes,
            replication_factor: placement.replication_factor,
            miniblock_num: MiniblockNum::new(1),
            prev_miniblock_hash: genesis.hash,
        };
        match events.get(1) {
            Some(first_chunk) => self.ingest_chunk(&nodes, cookie, first_chunk, chunk_count == 1, chunk_count, deadline),
            None => Ok(cookie),
        }
    }

    /// Add the chunk `event` at the position given by `cookie`, and seal the stream if `is_last`.
    pub fn add_media_event(
        &self,
        cookie: &CreationCookie,
        event: &Envelope,
        is_last: bool,
    ) -> Result<CreationCookie, ReplicationError> {
        event.verify()?;
        let nodes = StreamNodeSet::new(cookie.nodes.clone(), cookie.replication_factor as usize, self.local)?;
        let chunk_count = self.chunk_count(&cookie.stream_id, &nodes)?;
        let deadline = Deadline::after(self.config.operation_timeout);
        self.ingest_chunk(&nodes, cookie.clone(), event, is_last, chunk_count, deadline)
    }

    fn ingest_chunk(
        &self,
        nodes: &StreamNodeSet,
        cookie: CreationCookie,
        event: &Envelope,
        is_last: bool,
        chunk_count: u32,
        deadline: Deadline,
    ) -> Result<CreationCookie, ReplicationError> {
        validate_chunk(event, chunk_count, cookie.miniblock_num, is_last, self.config.max_chunk_size)?;

        let miniblock = Miniblock::new(
            cookie.miniblock_num,
            cookie.prev_miniblock_hash,
            vec![event.clone()],
            event.event.created_at_ms,
            None,
        )?;
        let next = CreationCookie {
            miniblock_num: miniblock.num().next(),
            prev_miniblock_hash: miniblock.hash,
            ..cookie
        };

        if is_last && self.already_sealed(&next.stream_id, &miniblock)? {
            log::debug!("media stream {} is already sealed at {}", next.stream_id, miniblock.num());
            return Ok(next);
        }
        self.save_on_quorum(nodes, &next.stream_id, &miniblock, deadline)?;
        if is_last {
            self.seal(nodes, &next.stream_id, &miniblock, deadline)?;
        }
        Ok(next)
    }

    /// Whether the registry already holds the stream sealed with `last` as its final miniblock. A retried
    /// final chunk is answered from the registry, so it succeeds even when some nodes are unreachable.
    fn already_sealed(&self, stream_id: &StreamId, last: &Miniblock) -> Result<bool, ReplicationError> {
        match self.registry.get_stream(stream_id)? {
            None => Ok(false),
            Some(record) if record.sealed && record.last_miniblock == last.reference() => Ok(true),
            Some(record) => Err(ReplicationError::new(ErrorCode::AlreadyExists, "media stream is already sealed")
                .tag("stream_id", stream_id)
                .tag("expected", record.last_miniblock)
                .tag("observed", last.reference())),
        }
    }

    /// The nodes of a stream being created: those recorded by an earlier allocation of the same stream,
    /// those this node chose for it before, or a fresh choice by the registry.
    fn placement(&self, stream_id: &StreamId) -> Result<Placement, ReplicationError> {
        if let Some(record) = self.store.ephemeral_record(stream_id)? {
            return Ok(Placement {
                nodes: record.nodes,
                replication_factor: record.replication_factor,
            });
        }
        let mut chosen = self.chosen()?;
        if self.registry.get_stream(stream_id)?.is_some() {
            chosen.remove(stream_id);
            return Err(ReplicationError::new(ErrorCode::AlreadyExists, "media stream is already sealed")
                .tag("stream_id", stream_id));
        }
        if let Some(placement) = chosen.get(stream_id) {
            return Ok(placement.clone());
        }
        let placement = self.registry.choose_nodes(stream_id)?;
        chosen.insert(*stream_id, placement.clone());
        Ok(placement)
    }

    fn chosen(&self) -> Result<MutexGuard<'_, HashMap<StreamId, Placement>>, ReplicationError> {
        self.chosen
            .lock()
            .map_err(|_| ReplicationError::internal("media placement lock poisoned"))
    }

    /// Read the chunk count from the stream's genesis, locally if possible, else from the stream's
    /// other nodes.
    fn chunk_count(&self, stream_id: &StreamId, nodes: &StreamNodeSet) -> Result<u32, ReplicationError> {
        let genesis = match self.store.any_miniblock(stream_id, MiniblockNum::genesis())? {
            Some(genesis) => Some(genesis),
            None => nodes.remote_nodes().into_iter().find_map(|peer| {
                self.client
                    .get_miniblocks_by_ids(peer, *stream_id, vec![MiniblockNum::genesis()])
                    .ok()
                    .and_then(|mut miniblocks| miniblocks.pop())
            }),
        };
        match genesis.as_ref().and_then(|genesis| genesis.events.first()).map(|event| event.payload()) {
            Some(Payload::MediaInception(inception)) => Ok(inception.chunk_count),
            Some(_) => Err(ReplicationError::invalid_argument("stream is not a media stream").tag("stream_id", stream_id)),
            None => Err(ReplicationError::not_found("media stream not found").tag("stream_id", stream_id)),
        }
    }

    /// With external storage every quorum node completes its own upload when sealing, so each of them
    /// has to hold every part. Without it a majority is enough.
    fn write_policy(&self) -> QuorumPolicy<()> {
        if self.uploads.has_media_store() {
            QuorumPolicy::custom(all_succeeded)
        } else {
            QuorumPolicy::Majority
        }
    }

    fn allocate_on_quorum(
        &self,
        nodes: &StreamNodeSet,
        stream_id: &StreamId,
        genesis: &Miniblock,
        record: &EphemeralStreamRecord,
        deadline: Deadline,
    ) -> Result<(), ReplicationError> {
        let mut pool = QuorumPool::new(deadline, self.write_policy())
            .tag("method", "AllocateEphemeralStream")
            .tag("stream_id", stream_id);

        if nodes.local_is_replica() {
            let uploads = self.uploads.clone();
            let (stream_id, genesis, record) = (*stream_id, genesis.clone(), record.clone());
            let task = move || uploads.allocate(&stream_id, &genesis, &record);
            if nodes.local_in_quorum() {
                pool.add_local_task(task);
            } else {
                pool.add_sync_task(self.local, task);
            }
        }
        for (node, counted) in remote_targets(nodes) {
            let client = self.client.clone();
            let (stream_id, genesis, record) = (*stream_id, genesis.clone(), record.clone());
            let task = move || client.allocate_ephemeral_stream(node, stream_id, genesis, record);
            if counted {
                pool.add_remote_task(node, task);
            } else {
                pool.add_sync_task(node, task);
            }
        }

        pool.wait().map(|_| ())
    }

    fn save_on_quorum(
        &self,
        nodes: &StreamNodeSet,
        stream_id: &StreamId,
        miniblock: &Miniblock,
        deadline: Deadline,
    ) -> Result<(), ReplicationError> {
        let mut pool = QuorumPool::new(deadline, self.write_policy())
            .tag("method", "SaveEphemeralMiniblock")
            .tag("stream_id", stream_id)
            .tag("num", miniblock.num());

        if nodes.local_is_replica() {
            let uploads = self.uploads.clone();
            let (stream_id, miniblock) = (*stream_id, miniblock.clone());
            let task = move || uploads.save_chunk(&stream_id, &miniblock);
            if nodes.local_in_quorum() {
                pool.add_local_task(task);
            } else {
                pool.add_sync_task(self.local, task);
            }
        }
        for (node, counted) in remote_targets(nodes) {
            let client = self.client.clone();
            let (stream_id, miniblock) = (*stream_id, miniblock.clone());
            let task = move || client.save_ephemeral_miniblock(node, stream_id, miniblock);
            if counted {
                pool.add_remote_task(node, task);
            } else {
                pool.add_sync_task(node, task);
            }
        }

        pool.wait().map(|_| ())
    }

    fn seal(
        &self,
        nodes: &StreamNodeSet,
        stream_id: &StreamId,
        last: &Miniblock,
        deadline: Deadline,
    ) -> Result<CryptoHash, ReplicationError> {
        let required = if self.uploads.has_media_store() {
            nodes.quorum_nodes().len()
        } else {
            nodes.total_quorum_num()
        };
        let mut pool = QuorumPool::new(
            deadline,
            QuorumPolicy::custom(move |tally: &Tally<CryptoHash>| seal_check(tally, required)),
        )
        .tag("method", "SealEphemeralStream")
        .tag("stream_id", stream_id)
        .tag("required", required);

        if nodes.local_is_replica() {
            let uploads = self.uploads.clone();
            let stream_id = *stream_id;
            let task = move || uploads.seal(&stream_id);
            if nodes.local_in_quorum() {
                pool.add_local_task(task);
            } else {
                pool.add_sync_task(self.local, task);
            }
        }
        for (node, counted) in remote_targets(nodes) {
            let client = self.client.clone();
            let stream_id = *stream_id;
            let task = move || client.seal_ephemeral_stream(node, stream_id);
            if counted {
                pool.add_remote_task(node, task);
            } else {
                pool.add_sync_task(node, task);
            }
        }

        let successes = match pool.wait() {
            Ok(successes) => successes,
            Err(err) => {
                log::warn!("seal of media stream {} failed, aborting uploads: {}", stream_id, err);
                self.abort_everywhere(nodes, stream_id);
                return Err(err);
            }
        };
        let groups = agreeing_groups(&successes);
        if groups.len() > 1 {
            log::warn!("nodes sealed media stream {} with {} different genesis hashes", stream_id, groups.len());
        }
        let genesis = groups
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(hash, _)| hash)
            .ok_or_else(|| ReplicationError::internal("seal reached quorum without a genesis hash").tag("stream_id", stream_id))?;

        self.register(nodes, stream_id, genesis, last)?;
        self.chosen()?.remove(stream_id);
        self.release_everywhere(nodes, stream_id, deadline);
        Ok(genesis)
    }

    fn register(
        &self,
        nodes: &StreamNodeSet,
        stream_id: &StreamId,
        genesis: CryptoHash,
        last: &Miniblock,
    ) -> Result<(), ReplicationError> {
        let record = StreamRecord {
            stream_id: *stream_id,
            nodes: nodes.nodes().to_vec(),
            replication_factor: nodes.replication_factor() as u32,
            genesis_hash: genesis,
            last_miniblock: last.reference(),
            sealed: true,
        };
        match self.registry.allocate_stream(record) {
            Ok(()) => Ok(()),
            Err(err) if err.is_code(ErrorCode::AlreadyExists) => match self.registry.get_stream(stream_id)? {
                Some(existing) if existing.genesis_hash == genesis => Ok(()),
                _ => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// Ask every node of the stream to abort its external upload. Failures are only logged.
    fn abort_everywhere(&self, nodes: &StreamNodeSet, stream_id: &StreamId) {
        thread::scope(|scope| {
            let aborts: Vec<_> = nodes
                .nodes()
                .iter()
                .map(|node| {
                    let node = *node;
                    let handle = scope.spawn(move || {
                        if node == self.local {
                            self.uploads.abort(stream_id)
                        } else {
                            self.client.abort_ephemeral_upload(node, *stream_id)
                        }
                    });
                    (node, handle)
                })
                .collect();

            for (node, handle) in aborts {
                match handle.join() {
                    Ok(Ok(())) => (),
                    Ok(Err(err)) => log::warn!("aborting upload of stream {} on {} failed: {}", stream_id, node, err),
                    Err(_) => log::warn!("aborting upload of stream {} on {} panicked", stream_id, node),
                }
            }
        })
    }

    /// Tell every node of the stream that its upload record can go. Not awaited.
    fn release_everywhere(&self, nodes: &StreamNodeSet, stream_id: &StreamId, deadline: Deadline) {
        let pool = QuorumPool::<()>::new(deadline, QuorumPolicy::Majority)
            .tag("method", "ReleaseEphemeralUpload")
            .tag("stream_id", stream_id);
        for node in nodes.nodes().iter().copied() {
            let stream_id = *stream_id;
            if node == self.local {
                let uploads = self.uploads.clone();
                pool.add_sync_task(node, move || uploads.release(&stream_id));
            } else {
                let client = self.client.clone();
                pool.add_sync_task(node, move || client.release_ephemeral_upload(node, stream_id));
            }
        }
    }
}

/// Remote nodes of the stream, each with whether it counts towards the quorum.
fn remote_targets(nodes: &StreamNodeSet) -> Vec<(NodeAddress, bool)> {
    let quorum = nodes.remote_quorum_nodes().into_iter().map(|node| (node, true));
    let sync = nodes.sync_nodes().into_iter().map(|node| (node, false));
    quorum.chain(sync).collect()
}

fn all_succeeded(tally: &Tally<()>) -> QuorumCheck {
    if !tally.failures().is_empty() {
        QuorumCheck::Unreachable
    } else if tally.outstanding() == 0 {
        QuorumCheck::Reached
    } else {
        QuorumCheck::Pending
    }
}

fn seal_check(tally: &Tally<CryptoHash>, required: usize) -> QuorumCheck {
    let largest = agreeing_groups(tally.successes())
        .into_iter()
        .map(|(_, count)| count)
        .max()
        .unwrap_or(0);
    if largest >= required {
        QuorumCheck::Reached
    } else if largest + tally.outstanding() < required {
        QuorumCheck::Unreachable
    } else {
        QuorumCheck::Pending
    }
}

/// Non-zero genesis hashes reported by the nodes, with how many nodes reported each.
fn agreeing_groups(successes: &[(TaskOrigin, CryptoHash)]) -> Vec<(CryptoHash, usize)> {
    let mut groups: Vec<(CryptoHash, usize)> = Vec::new();
    for (_, hash) in successes.iter().filter(|(_, hash)| !hash.is_zero()) {
        match groups.iter_mut().find(|(group, _)| group == hash) {
            Some((_, count)) => *count += 1,
            None => groups.push((*hash, 1)),
        }
    }
    groups
}

fn validate_creation<'a>(stream_id: &StreamId, events: &'a [Envelope]) -> Result<&'a MediaInception, ReplicationError> {
    if !stream_id.is_media() {
        return Err(ReplicationError::invalid_argument("not a media stream id").tag("stream_id", stream_id));
    }
    if events.is_empty() || events.len() > 2 {
        return Err(ReplicationError::invalid_argument("media stream is created from an inception and at most one chunk")
            .tag("stream_id", stream_id)
            .tag("events", events.len()));
    }
    for event in events {
        event.verify()?;
    }
    match events[0].payload() {
        Payload::MediaInception(inception)
            if inception.stream_id == *stream_id && inception.chunk_count >= 1 && events[0].prev_miniblock().is_none() =>
        {
            Ok(inception)
        }
        _ => Err(ReplicationError::invalid_argument("first event must be the media inception of the stream")
            .tag("stream_id", stream_id)),
    }
}

/// Checks everything about a chunk that can be checked without touching storage.
fn validate_chunk(
    event: &Envelope,
    chunk_count: u32,
    miniblock_num: MiniblockNum,
    is_last: bool,
    max_chunk_size: usize,
) -> Result<(), ReplicationError> {
    let chunk = match event.payload() {
        Payload::MediaChunk(chunk) => chunk,
        other => {
            return Err(ReplicationError::invalid_argument("expected a media chunk").tag("payload", other.name()))
        }
    };
    if chunk.chunk_index < 0 || chunk.chunk_index as u32 >= chunk_count {
        return Err(ReplicationError::invalid_argument("chunk index out of range")
            .tag("chunk_index", chunk.chunk_index)
            .tag("chunk_count", chunk_count));
    }
    if chunk.chunk_index as u64 + 1 != miniblock_num.int() {
        return Err(ReplicationError::invalid_argument("chunk index does not match the creation cookie")
            .tag("chunk_index", chunk.chunk_index)
            .tag("miniblock_num", miniblock_num));
    }
    if chunk.data.len() > max_chunk_size {
        return Err(ReplicationError::invalid_argument("chunk is too large")
            .tag("size", chunk.data.len())
            .tag("max_chunk_size", max_chunk_size));
    }
    if is_last && chunk.chunk_index as u32 + 1 != chunk_count {
        return Err(ReplicationError::invalid_argument("only the final chunk can be marked last")
            .tag("chunk_index", chunk.chunk_index)
            .tag("chunk_count", chunk_count));
    }
    Ok(())
}
