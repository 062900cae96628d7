/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The producing side of miniblock consensus, and the promotion of finalized candidates.

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::backoff::Deadline;
use crate::error::{ErrorCode, ReplicationError};
use crate::events::{Event, ProposeMiniblockEvent, PromoteMiniblockEvent};
use crate::networking::messages::{MiniblockProposal, ProposeMiniblockRequest, ProposeMiniblockResponse};
use crate::networking::{Network, RemoteClient};
use crate::pluggables::{ReconcileScheduler, ReconcileTask, StreamRegistry};
use crate::quorum::{pool::majority, QuorumCheck, QuorumPolicy, QuorumPool, StreamNodeSet, Tally, TaskOrigin};
use crate::storage::{KVStore, Promotion, StreamStore};
use crate::types::basic::{unix_millis, MiniblockRef, NodeAddress, StreamId};
use crate::types::miniblock::{Miniblock, Snapshot};

use super::proposal::{answer_proposal, combine_proposals, save_candidate};

#[derive(Clone, Copy, Debug)]
pub struct ConsensusConfiguration {
    pub proposal_timeout: Duration,
    pub candidate_timeout: Duration,
    pub max_events_per_miniblock: usize,
    pub max_event_bytes_per_miniblock: usize,
    /// A replica votes for a snapshot once this many miniblocks were produced since the last one.
    pub snapshot_interval: u64,
}

/// Outcome of [`MiniblockProducer::produce`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProduceOutcome {
    /// The candidate was finalized in the registry and promoted locally.
    Produced(MiniblockRef),
    /// No event reached a quorum of proposals.
    NothingToDo,
    /// Another candidate was finalized first.
    Superseded,
}

#[derive(Clone)]
pub struct MiniblockProducer<K: KVStore, N: Network> {
    config: ConsensusConfiguration,
    local: NodeAddress,
    store: StreamStore<K>,
    client: RemoteClient<N>,
    registry: Arc<dyn StreamRegistry>,
    scheduler: Arc<dyn ReconcileScheduler>,
    event_publisher: Option<Sender<Event>>,
}

impl<K: KVStore, N: Network> MiniblockProducer<K, N> {
    pub(crate) fn new(
        config: ConsensusConfiguration,
        local: NodeAddress,
        store: StreamStore<K>,
        client: RemoteClient<N>,
        registry: Arc<dyn StreamRegistry>,
        scheduler: Arc<dyn ReconcileScheduler>,
        event_publisher: Option<Sender<Event>>,
    ) -> MiniblockProducer<K, N> {
        MiniblockProducer {
            config,
            local,
            store,
            client,
            registry,
            scheduler,
            event_publisher,
        }
    }

    pub fn config(&self) -> &ConsensusConfiguration {
        &self.config
    }

    /// Try to seal the minipool of `stream_id` into its next miniblock. The local node must be one of
    /// the stream's quorum nodes.
    pub fn produce(&self, stream_id: &StreamId, force_snapshot: bool) -> Result<ProduceOutcome, ReplicationError> {
        let record = self
            .registry
            .get_stream(stream_id)?
            .ok_or_else(|| ReplicationError::not_found("stream not found in registry").tag("stream_id", stream_id))?;
        let nodes = StreamNodeSet::new(record.nodes, record.replication_factor as usize, self.local)?;
        if !nodes.local_in_quorum() {
            return Err(ReplicationError::invalid_argument("only quorum nodes produce miniblocks")
                .tag("stream_id", stream_id)
                .tag("node", self.local));
        }

        let view = self.store.get_view(stream_id)?;
        let request = ProposeMiniblockRequest {
            stream_id: *stream_id,
            new_miniblock_num: view.minipool_generation(),
            prev_miniblock_hash: view.last_block.hash,
            local_event_hashes: view.minipool_hashes(),
            force_snapshot,
        };

        let responses = self.gather_proposals(&nodes, &request).map_err(|err| {
            if err.is_code_with_causes(ErrorCode::MiniblockTooOld) {
                self.submit_reconcile(stream_id, None);
            }
            err
        })?;

        for response in &responses {
            for event in &response.missing_events {
                if let Err(err) = event.verify().and_then(|_| self.store.add_event(stream_id, event)) {
                    log::debug!("could not add missing event {} to stream {}: {}", event.hash, stream_id, err);
                }
            }
        }

        let view = self.store.get_view(stream_id)?;
        if view.minipool_generation() != request.new_miniblock_num {
            return Err(ReplicationError::new(ErrorCode::MiniblockTooOld, "stream advanced while proposals were collected")
                .tag("stream_id", stream_id)
                .tag("expected", request.new_miniblock_num)
                .tag("observed", view.minipool_generation()));
        }

        let proposals: Vec<MiniblockProposal> = responses.into_iter().map(|response| response.proposal).collect();
        let combination = combine_proposals(
            &proposals,
            nodes.total_quorum_num(),
            &view.minipool,
            self.config.max_events_per_miniblock,
            self.config.max_event_bytes_per_miniblock,
        );
        if combination.events.is_empty() {
            return Ok(ProduceOutcome::NothingToDo);
        }

        let snapshot_hash = if combination.snapshot {
            let snapshot = Snapshot {
                stream_id: *stream_id,
                miniblock_num: request.new_miniblock_num,
                event_hashes: combination.events.iter().map(|event| event.hash).collect(),
            };
            Some(snapshot.hash()?)
        } else {
            None
        };
        let event_count = combination.events.len();
        let candidate = Miniblock::new(
            request.new_miniblock_num,
            view.last_block.hash,
            combination.events,
            unix_millis(SystemTime::now()),
            snapshot_hash,
        )?;
        Event::publish(
            &self.event_publisher,
            Event::ProposeMiniblock(ProposeMiniblockEvent {
                timestamp: SystemTime::now(),
                stream_id: *stream_id,
                miniblock: candidate.reference(),
                events: event_count,
                snapshot: snapshot_hash.is_some(),
            }),
        );

        self.save_candidate_on_quorum(&nodes, stream_id, &candidate)?;

        let reference = candidate.reference();
        if !self.registry.set_last_miniblock(stream_id, &view.last_block, &reference)? {
            log::info!("candidate {} of stream {} was superseded", reference, stream_id);
            return Ok(ProduceOutcome::Superseded);
        }
        self.on_finalized(stream_id, &reference)?;
        Ok(ProduceOutcome::Produced(reference))
    }

    /// Apply the finalized miniblock `reference` to the local chain.
    ///
    /// Miniblocks that are already applied are left alone. If the local node lacks the candidate or the
    /// miniblocks before it, a reconciliation is scheduled instead.
    pub fn on_finalized(&self, stream_id: &StreamId, reference: &MiniblockRef) -> Result<Promotion, ReplicationError> {
        let promotion = match self.store.promote_candidate(stream_id, reference) {
            Ok(promotion) => promotion,
            Err(err) => {
                if err.is_code(ErrorCode::NotFound) || err.is_code(ErrorCode::BadPrevMiniblockHash) {
                    self.submit_reconcile(stream_id, Some(*reference));
                }
                return Err(err);
            }
        };

        match &promotion {
            Promotion::Promoted(promoted) => Event::publish(
                &self.event_publisher,
                Event::PromoteMiniblock(PromoteMiniblockEvent {
                    timestamp: SystemTime::now(),
                    stream_id: *stream_id,
                    miniblock: *promoted,
                }),
            ),
            Promotion::AlreadyApplied { matches: true } => (),
            Promotion::AlreadyApplied { matches: false } => {
                log::warn!("finalized miniblock {} of stream {} differs from the local chain", reference, stream_id)
            }
            Promotion::Gap { .. } | Promotion::MissingCandidate => self.submit_reconcile(stream_id, Some(*reference)),
        }
        Ok(promotion)
    }

    fn gather_proposals(
        &self,
        nodes: &StreamNodeSet,
        request: &ProposeMiniblockRequest,
    ) -> Result<Vec<ProposeMiniblockResponse>, ReplicationError> {
        let deadline = Deadline::after(self.config.proposal_timeout);
        let mut pool = QuorumPool::new(deadline, QuorumPolicy::Majority)
            .tag("method", "ProposeMiniblock")
            .tag("stream_id", request.stream_id);

        let store = self.store.clone();
        let snapshot_interval = self.config.snapshot_interval;
        let local_request = request.clone();
        pool.add_local_task(move || answer_proposal(&store, snapshot_interval, &local_request));

        for node in nodes.remote_quorum_nodes() {
            let client = self.client.clone();
            let request = request.clone();
            pool.add_remote_task(node, move || client.propose_miniblock(node, request));
        }

        Ok(pool.wait()?.into_iter().map(|(_, response)| response).collect())
    }

    fn save_candidate_on_quorum(
        &self,
        nodes: &StreamNodeSet,
        stream_id: &StreamId,
        candidate: &Miniblock,
    ) -> Result<(), ReplicationError> {
        let deadline = Deadline::after(self.config.candidate_timeout);
        let mut pool = QuorumPool::new(deadline, QuorumPolicy::custom(majority_including_local))
            .tag("method", "SaveMiniblockCandidate")
            .tag("stream_id", stream_id);

        let store = self.store.clone();
        let event_publisher = self.event_publisher.clone();
        let (local_stream_id, local_candidate) = (*stream_id, candidate.clone());
        pool.add_local_task(move || save_candidate(&store, &event_publisher, &local_stream_id, &local_candidate));

        for node in nodes.remote_quorum_nodes() {
            let client = self.client.clone();
            let (stream_id, candidate) = (*stream_id, candidate.clone());
            pool.add_remote_task(node, move || client.save_miniblock_candidate(node, stream_id, candidate));
        }
        for node in nodes.sync_nodes() {
            let client = self.client.clone();
            let (stream_id, candidate) = (*stream_id, candidate.clone());
            pool.add_sync_task(node, move || client.save_miniblock_candidate(node, stream_id, candidate));
        }

        pool.wait().map(|_| ())
    }

    fn submit_reconcile(&self, stream_id: &StreamId, target: Option<MiniblockRef>) {
        self.scheduler.submit(ReconcileTask {
            stream_id: *stream_id,
            target,
        });
    }
}

/// A majority of the counted tasks, one of which is the local one. The producer promotes its own
/// candidate right after finalizing it, so the local copy has to be stored by then.
fn majority_including_local(tally: &Tally<()>) -> QuorumCheck {
    let local_failed = tally.failures().iter().any(|(origin, _)| *origin == TaskOrigin::Local);
    let required = majority(tally.counted());
    if local_failed || tally.failures().len() > tally.counted() - required {
        return QuorumCheck::Unreachable;
    }
    let local_done = tally.successes().iter().any(|(origin, _)| *origin == TaskOrigin::Local);
    if local_done && tally.successes().len() >= required {
        QuorumCheck::Reached
    } else {
        QuorumCheck::Pending
    }
}
