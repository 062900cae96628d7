/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The operations a node offers, to clients and to its peers.
//!
//! [`NodeService`] ties the components together. Its client-facing methods (`create_stream`,
//! `add_event`, and the media methods it delegates to the [`MediaUploadCoordinator`]) are exposed
//! through [`Node`](crate::node::Node). Its [`RequestHandler`] implementation answers the
//! [`NodeRequest`]s that other nodes send through the user's [`Network`].
//!
//! ## Writing an event
//!
//! A node that does not host the stream forwards `add_event` to a remote quorum node, moving on to the
//! next one when the peer is unavailable. A node that hosts it first waits until its own chain has
//! the miniblock the event refers to, then asks the [`EventRules`] for a verdict, and finally writes
//! the event (and any derived events) through the [`ReplicatedEventWriter`].

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::backoff::Deadline;
use crate::consensus::proposal::{answer_proposal, save_candidate};
use crate::consensus::MiniblockProducer;
use crate::error::{ErrorCode, ReplicationError};
use crate::events::Event;
use crate::media::{EphemeralUploads, MediaUploadCoordinator};
use crate::networking::messages::{NodeRequest, NodeResponse};
use crate::networking::{Network, RemoteClient, RequestHandler};
use crate::pluggables::{EventRules, ReconcileScheduler, ReconcileTask, RuleDecision, StreamRecord, StreamRegistry};
use crate::quorum::{QuorumPolicy, QuorumPool, StreamNodeSet, TaskOrigin};
use crate::replication::event_writer::ReplicatedEventWriter;
use crate::replication::staleness::StalenessReconciler;
use crate::storage::{KVStore, StreamStore, StreamView};
use crate::types::basic::{unix_millis, CryptoHash, MiniblockNum, MiniblockRef, NodeAddress, StreamId};
use crate::types::cookies::{CreationCookie, StreamAndCookie, SyncCookie};
use crate::types::crypto_primitives::Keypair;
use crate::types::event::{Envelope, Payload, StreamEvent};
use crate::types::miniblock::Miniblock;

pub struct NodeService<K: KVStore, N: Network> {
    keypair: Keypair,
    local: NodeAddress,
    operation_timeout: Duration,
    store: StreamStore<K>,
    client: RemoteClient<N>,
    registry: Arc<dyn StreamRegistry>,
    rules: Arc<dyn EventRules>,
    scheduler: Arc<dyn ReconcileScheduler>,
    writer: ReplicatedEventWriter<K, N>,
    reconciler: StalenessReconciler<K>,
    producer: MiniblockProducer<K, N>,
    uploads: EphemeralUploads<K>,
    media: MediaUploadCoordinator<K, N>,
    event_publisher: Option<Sender<Event>>,
}

impl<K: KVStore, N: Network> NodeService<K, N> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        keypair: Keypair,
        operation_timeout: Duration,
        store: StreamStore<K>,
        client: RemoteClient<N>,
        registry: Arc<dyn StreamRegistry>,
        rules: Arc<dyn EventRules>,
        scheduler: Arc<dyn ReconcileScheduler>,
        writer: ReplicatedEventWriter<K, N>,
        reconciler: StalenessReconciler<K>,
        producer: MiniblockProducer<K, N>,
        uploads: EphemeralUploads<K>,
        media: MediaUploadCoordinator<K, N>,
        event_publisher: Option<Sender<Event>>,
    ) -> NodeService<K, N> {
        NodeService {
            local: keypair.address(),
            keypair,
            operation_timeout,
            store,
            client,
            registry,
            rules,
            scheduler,
            writer,
            reconciler,
            producer,
            uploads,
            media,
            event_publisher,
        }
    }

    pub fn local(&self) -> NodeAddress {
        self.local
    }

    pub fn store(&self) -> &StreamStore<K> {
        &self.store
    }

    pub fn producer(&self) -> &MiniblockProducer<K, N> {
        &self.producer
    }

    pub fn media(&self) -> &MediaUploadCoordinator<K, N> {
        &self.media
    }

    /* ↓↓↓ Client-facing operations ↓↓↓ */

    /// Create the stream `stream_id` from `events`, the first of which must be its inception.
    ///
    /// Creating a stream that is registered with the same genesis completes the creation again instead
    /// of failing, so a client can retry a creation that timed out.
    pub fn create_stream(
        &self,
        stream_id: &StreamId,
        events: &[Envelope],
    ) -> Result<(StreamAndCookie, Vec<CryptoHash>), ReplicationError> {
        validate_stream_creation(stream_id, events)?;
        let derived = match self.rules.can_create_stream(stream_id, events) {
            RuleDecision::Allow { derived } => derived,
            RuleDecision::Deny { error, .. } => return Err(error),
        };

        let genesis = Miniblock::genesis(events.to_vec())?;
        let record = self.register_stream(stream_id, &genesis)?;
        let nodes = StreamNodeSet::new(record.nodes, record.replication_factor as usize, self.local)?;
        let cookie = self.allocate_on_quorum(&nodes, stream_id, &genesis)?;

        // Derived events of a creation are deterministic, so that a repeated creation writes the same
        // events again instead of new ones.
        let deadline = Deadline::after(self.operation_timeout);
        let mut derived_hashes = Vec::with_capacity(derived.len());
        for (index, payload) in derived.into_iter().enumerate() {
            let salt = creation_salt(&genesis.hash, index);
            let event = self.derived_event(payload, genesis.reference(), genesis.header.timestamp_ms, salt)?;
            self.writer.write(stream_id, &nodes, &event, deadline)?;
            derived_hashes.push(event.hash);
        }

        Ok((
            StreamAndCookie {
                stream_id: *stream_id,
                miniblocks: vec![genesis],
                cookie,
            },
            derived_hashes,
        ))
    }

    /// Add `event` to the stream `stream_id`, and return the hashes of the event and of the events
    /// derived from it.
    pub fn add_event(&self, stream_id: &StreamId, event: &Envelope) -> Result<Vec<CryptoHash>, ReplicationError> {
        event.verify()?;
        if stream_id.is_media() {
            return Err(ReplicationError::invalid_argument("media streams are written with add_media_event")
                .tag("stream_id", stream_id));
        }
        let mut nodes = self.nodes_of(stream_id)?;
        if nodes.local_is_replica() {
            self.add_event_locally(stream_id, &nodes, event)
        } else {
            self.forward_event(stream_id, &mut nodes, event)
        }
    }

    pub fn create_media_stream(&self, stream_id: &StreamId, events: &[Envelope]) -> Result<CreationCookie, ReplicationError> {
        self.media.create_media_stream(stream_id, events)
    }

    pub fn add_media_event(
        &self,
        cookie: &CreationCookie,
        event: &Envelope,
        is_last: bool,
    ) -> Result<CreationCookie, ReplicationError> {
        self.media.add_media_event(cookie, event, is_last)
    }

    pub fn get_view(&self, stream_id: &StreamId) -> Result<StreamView, ReplicationError> {
        self.store.get_view(stream_id)
    }

    /* ↓↓↓ Helpers ↓↓↓ */

    fn nodes_of(&self, stream_id: &StreamId) -> Result<StreamNodeSet, ReplicationError> {
        let record = self
            .registry
            .get_stream(stream_id)?
            .ok_or_else(|| ReplicationError::not_found("stream not found in registry").tag("stream_id", stream_id))?;
        StreamNodeSet::new(record.nodes, record.replication_factor as usize, self.local)
    }

    /// Register the stream, or return its record if it is registered with the same genesis.
    fn register_stream(&self, stream_id: &StreamId, genesis: &Miniblock) -> Result<StreamRecord, ReplicationError> {
        let already_exists = || {
            ReplicationError::new(ErrorCode::AlreadyExists, "stream already exists with a different genesis")
                .tag("stream_id", stream_id)
        };
        if let Some(record) = self.registry.get_stream(stream_id)? {
            return if record.genesis_hash == genesis.hash {
                Ok(record)
            } else {
                Err(already_exists())
            };
        }

        let placement = self.registry.choose_nodes(stream_id)?;
        let record = StreamRecord {
            stream_id: *stream_id,
            nodes: placement.nodes,
            replication_factor: placement.replication_factor,
            genesis_hash: genesis.hash,
            last_miniblock: genesis.reference(),
            sealed: false,
        };
        match self.registry.allocate_stream(record.clone()) {
            Ok(()) => Ok(record),
            Err(err) if err.is_code(ErrorCode::AlreadyExists) => match self.registry.get_stream(stream_id)? {
                Some(existing) if existing.genesis_hash == genesis.hash => Ok(existing),
                _ => Err(already_exists()),
            },
            Err(err) => Err(err),
        }
    }

    fn allocate_on_quorum(
        &self,
        nodes: &StreamNodeSet,
        stream_id: &StreamId,
        genesis: &Miniblock,
    ) -> Result<SyncCookie, ReplicationError> {
        let mut pool = QuorumPool::new(Deadline::after(self.operation_timeout), QuorumPolicy::Majority)
            .tag("method", "AllocateStream")
            .tag("stream_id", stream_id);

        if nodes.local_is_replica() {
            let (store, local) = (self.store.clone(), self.local);
            let (stream_id, genesis) = (*stream_id, genesis.clone());
            let task = move || store.create_stream(&stream_id, &genesis).map(|view| view.sync_cookie(local));
            if nodes.local_in_quorum() {
                pool.add_local_task(task);
            } else {
                pool.add_sync_task(self.local, task);
            }
        }
        for node in nodes.remote_quorum_nodes() {
            let client = self.client.clone();
            let (stream_id, genesis) = (*stream_id, genesis.clone());
            pool.add_remote_task(node, move || client.allocate_stream(node, stream_id, genesis));
        }
        for node in nodes.sync_nodes() {
            let client = self.client.clone();
            let (stream_id, genesis) = (*stream_id, genesis.clone());
            pool.add_sync_task(node, move || client.allocate_stream(node, stream_id, genesis));
        }

        let mut cookies = pool.wait()?;
        let local = cookies.iter().position(|(origin, _)| *origin == TaskOrigin::Local).unwrap_or(0);
        if cookies.is_empty() {
            return Err(ReplicationError::internal("stream allocated without a sync cookie").tag("stream_id", stream_id));
        }
        Ok(cookies.swap_remove(local).1)
    }

    fn add_event_locally(
        &self,
        stream_id: &StreamId,
        nodes: &StreamNodeSet,
        event: &Envelope,
    ) -> Result<Vec<CryptoHash>, ReplicationError> {
        let prev = *event.prev_miniblock().ok_or_else(|| {
            ReplicationError::invalid_argument("event does not reference a miniblock").tag("stream_id", stream_id)
        })?;
        let view = self.reconciler.ensure_up_to_date(stream_id, &prev)?;
        let deadline = Deadline::after(self.operation_timeout);

        match self.rules.can_add_event(&view, event) {
            RuleDecision::Deny { error, on_denied } => {
                if let Some(payload) = on_denied {
                    let written = self
                        .derived_event(payload, view.last_block, unix_millis(SystemTime::now()), rand::random())
                        .and_then(|denied| self.writer.write(stream_id, nodes, &denied, deadline));
                    if let Err(err) = written {
                        log::warn!("failed to write the denial of event {} to stream {}: {}", event.hash, stream_id, err);
                    }
                }
                Err(error)
            }
            RuleDecision::Allow { derived } => {
                self.writer.write(stream_id, nodes, event, deadline)?;
                let mut hashes = vec![event.hash];
                for payload in derived {
                    let derived = self.derived_event(payload, view.last_block, unix_millis(SystemTime::now()), rand::random())?;
                    self.writer.write(stream_id, nodes, &derived, deadline)?;
                    hashes.push(derived.hash);
                }
                Ok(hashes)
            }
        }
    }

    /// Send `event` to the sticky peer of the stream, moving on to the next remote quorum node for as
    /// long as peers are unavailable.
    fn forward_event(
        &self,
        stream_id: &StreamId,
        nodes: &mut StreamNodeSet,
        event: &Envelope,
    ) -> Result<Vec<CryptoHash>, ReplicationError> {
        let mut peer = nodes.sticky_peer();
        let mut last_err = None;
        for _ in 0..nodes.remote_quorum_nodes().len() {
            let target = match peer {
                Some(target) => target,
                None => break,
            };
            match self.client.add_event(target, *stream_id, event.clone()) {
                Ok(hashes) => return Ok(hashes),
                Err(err) if err.is_code(ErrorCode::Unavailable) => {
                    log::debug!("forwarding event {} to {} failed: {}", event.hash, target, err);
                    last_err = Some(err);
                    peer = nodes.advance_sticky_peer();
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ReplicationError::new(ErrorCode::Unavailable, "no replica to forward the event to").tag("stream_id", stream_id)
        }))
    }

    fn derived_event(
        &self,
        payload: Payload,
        prev_miniblock: MiniblockRef,
        created_at_ms: u64,
        salt: u64,
    ) -> Result<Envelope, ReplicationError> {
        Envelope::new(
            &self.keypair,
            StreamEvent {
                creator: self.local,
                payload,
                prev_miniblock: Some(prev_miniblock),
                created_at_ms,
                salt,
            },
        )
    }

    fn submit_reconcile(&self, stream_id: &StreamId, target: Option<MiniblockRef>) {
        self.scheduler.submit(ReconcileTask {
            stream_id: *stream_id,
            target,
        });
    }

    /// Submit a reconciliation if `result` says that this node is behind.
    fn reconcile_if_behind<T>(
        &self,
        result: Result<T, ReplicationError>,
        stream_id: &StreamId,
        target: Option<MiniblockRef>,
        behind: &[ErrorCode],
    ) -> Result<T, ReplicationError> {
        if let Err(err) = &result {
            if behind.iter().any(|code| err.is_code(*code)) {
                self.submit_reconcile(stream_id, target);
            }
        }
        result
    }
}

impl<K: KVStore, N: Network> RequestHandler for NodeService<K, N> {
    fn handle(&self, from: NodeAddress, request: NodeRequest) -> Result<NodeResponse, ReplicationError> {
        log::trace!("{} from {}", request.method(), from);
        match request {
            NodeRequest::AllocateStream { stream_id, genesis } => {
                let view = self.store.create_stream(&stream_id, &genesis)?;
                Ok(NodeResponse::SyncCookie(view.sync_cookie(self.local)))
            }
            NodeRequest::NewEventReceived { stream_id, event } => {
                event.verify()?;
                let target = event.prev_miniblock().copied();
                let added = self.store.add_event(&stream_id, &event);
                self.reconcile_if_behind(added, &stream_id, target, &[ErrorCode::BadBlockNumber, ErrorCode::NotFound])?;
                Ok(NodeResponse::Ack)
            }
            NodeRequest::ProposeMiniblock(request) => {
                let target = block_before(request.new_miniblock_num, request.prev_miniblock_hash);
                let answer = answer_proposal(&self.store, self.producer.config().snapshot_interval, &request);
                let response = self.reconcile_if_behind(answer, &request.stream_id, target, &[ErrorCode::MiniblockTooNew])?;
                Ok(NodeResponse::Proposal(response))
            }
            NodeRequest::SaveMiniblockCandidate { stream_id, miniblock } => {
                let target = block_before(miniblock.num(), miniblock.prev_hash());
                let saved = save_candidate(&self.store, &self.event_publisher, &stream_id, &miniblock);
                self.reconcile_if_behind(saved, &stream_id, target, &[ErrorCode::MiniblockTooNew])?;
                Ok(NodeResponse::Ack)
            }
            NodeRequest::AllocateEphemeralStream { stream_id, genesis, record } => {
                self.uploads.allocate(&stream_id, &genesis, &record)?;
                Ok(NodeResponse::Ack)
            }
            NodeRequest::SaveEphemeralMiniblock { stream_id, miniblock } => {
                self.uploads.save_chunk(&stream_id, &miniblock)?;
                Ok(NodeResponse::Ack)
            }
            NodeRequest::SealEphemeralStream { stream_id } => Ok(NodeResponse::GenesisHash(self.uploads.seal(&stream_id)?)),
            NodeRequest::AbortEphemeralUpload { stream_id } => {
                self.uploads.abort(&stream_id)?;
                Ok(NodeResponse::Ack)
            }
            NodeRequest::ReleaseEphemeralUpload { stream_id } => {
                self.uploads.release(&stream_id)?;
                Ok(NodeResponse::Ack)
            }
            NodeRequest::GetMiniblocksByIds { stream_id, nums } => {
                Ok(NodeResponse::Miniblocks(self.store.miniblocks(&stream_id, &nums)?))
            }
            NodeRequest::AddEvent { stream_id, event } => {
                event.verify()?;
                let nodes = self.nodes_of(&stream_id)?;
                // A forwarded event is never forwarded again.
                if !nodes.local_is_replica() {
                    return Err(ReplicationError::not_found("stream is not hosted on this node")
                        .tag("stream_id", stream_id)
                        .tag("node", self.local));
                }
                Ok(NodeResponse::EventHashes(self.add_event_locally(&stream_id, &nodes, &event)?))
            }
        }
    }
}

/// Check the creation events of a regular stream.
fn validate_stream_creation(stream_id: &StreamId, events: &[Envelope]) -> Result<(), ReplicationError> {
    if stream_id.is_media() {
        return Err(ReplicationError::invalid_argument("media streams are created with create_media_stream")
            .tag("stream_id", stream_id));
    }
    let inception = events
        .first()
        .ok_or_else(|| ReplicationError::invalid_argument("stream needs an inception event").tag("stream_id", stream_id))?;
    match inception.payload() {
        Payload::Inception(inception) if inception.stream_id == *stream_id => (),
        _ => {
            return Err(ReplicationError::invalid_argument("first event must be the inception of the stream")
                .tag("stream_id", stream_id))
        }
    }
    for (index, event) in events.iter().enumerate() {
        event.verify()?;
        if index > 0 && matches!(event.payload(), Payload::Inception(_) | Payload::MediaInception(_)) {
            return Err(ReplicationError::invalid_argument("only the first event can be an inception")
                .tag("stream_id", stream_id)
                .tag("index", index));
        }
        if event.prev_miniblock().is_some() {
            return Err(ReplicationError::invalid_argument("creation events cannot reference a miniblock")
                .tag("stream_id", stream_id)
                .tag("index", index));
        }
    }
    Ok(())
}

fn creation_salt(genesis: &CryptoHash, index: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&genesis.bytes()[..8]);
    u64::from_le_bytes(bytes).wrapping_add(index as u64)
}

/// The miniblock a message for `num` builds on, which this node has to reach.
fn block_before(num: MiniblockNum, prev_hash: CryptoHash) -> Option<MiniblockRef> {
    num.int().checked_sub(1).map(|prev| MiniblockRef::new(prev_hash, MiniblockNum::new(prev)))
}
