/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Replicated writes of a single event.
//!
//! One attempt adds the event to the local minipool (if the local node hosts the stream) and sends
//! `NewEventReceived` to every remote node of the stream through a [`QuorumPool`]. Quorum nodes are
//! counted towards a majority, sync nodes are sent the event fire-and-forget.
//!
//! A replica that has not applied the miniblock the event refers to answers `BAD_BLOCK_NUMBER` (and
//! schedules its own reconciliation); a replica on a different chain answers `BAD_PREV_MINIBLOCK_HASH`.
//! When either code shows up in the aggregated error, the whole attempt is repeated after a backoff.
//! Local and remote event writes are idempotent, so replicas that accepted the event in an earlier
//! attempt simply acknowledge it again.

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::backoff::{BackoffPolicy, BackoffTracker, Deadline, Sleeper};
use crate::error::{ErrorCode, ReplicationError};
use crate::events::{Event, RecoveredWriteEvent, ReplicateWriteEvent};
use crate::networking::{Network, RemoteClient};
use crate::quorum::{QuorumPolicy, QuorumPool, StreamNodeSet};
use crate::storage::{KVStore, StreamStore};
use crate::types::basic::StreamId;
use crate::types::event::Envelope;

#[derive(Clone, Copy, Debug)]
pub struct WriterConfiguration {
    pub backoff: BackoffPolicy,
    /// Default deadline of a write, retries included.
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct ReplicatedEventWriter<K: KVStore, N: Network> {
    config: WriterConfiguration,
    store: StreamStore<K>,
    client: RemoteClient<N>,
    sleeper: Arc<dyn Sleeper>,
    event_publisher: Option<Sender<Event>>,
}

impl<K: KVStore, N: Network> ReplicatedEventWriter<K, N> {
    pub(crate) fn new(
        config: WriterConfiguration,
        store: StreamStore<K>,
        client: RemoteClient<N>,
        sleeper: Arc<dyn Sleeper>,
        event_publisher: Option<Sender<Event>>,
    ) -> ReplicatedEventWriter<K, N> {
        ReplicatedEventWriter {
            config,
            store,
            client,
            sleeper,
            event_publisher,
        }
    }

    pub fn config(&self) -> &WriterConfiguration {
        &self.config
    }

    /// Write `event` to a quorum of the nodes in `nodes`, retrying while replicas are stale, until
    /// `deadline`.
    pub fn write(
        &self,
        stream_id: &StreamId,
        nodes: &StreamNodeSet,
        event: &Envelope,
        deadline: Deadline,
    ) -> Result<(), ReplicationError> {
        let mut backoff = BackoffTracker::new(self.config.backoff, Arc::clone(&self.sleeper));
        loop {
            match self.write_once(stream_id, nodes, event, deadline) {
                Ok(()) => {
                    if backoff.attempts() > 0 {
                        log::info!(
                            "write of {} to stream {} succeeded after {} failed attempts",
                            event.hash,
                            stream_id,
                            backoff.attempts()
                        );
                        Event::publish(
                            &self.event_publisher,
                            Event::RecoveredWrite(RecoveredWriteEvent {
                                timestamp: SystemTime::now(),
                                stream_id: *stream_id,
                                event: event.hash,
                                attempts: backoff.attempts(),
                            }),
                        );
                    }
                    if let Some(prev_miniblock) = event.prev_miniblock() {
                        Event::publish(
                            &self.event_publisher,
                            Event::ReplicateWrite(ReplicateWriteEvent {
                                timestamp: SystemTime::now(),
                                stream_id: *stream_id,
                                event: event.hash,
                                prev_miniblock: *prev_miniblock,
                            }),
                        );
                    }
                    return Ok(());
                }
                Err(err) if is_stale(&err) => {
                    log::debug!("write of {} to stream {} hit stale replicas: {}", event.hash, stream_id, err);
                    backoff.wait(&deadline, err)?
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn write_once(
        &self,
        stream_id: &StreamId,
        nodes: &StreamNodeSet,
        event: &Envelope,
        deadline: Deadline,
    ) -> Result<(), ReplicationError> {
        let mut pool = QuorumPool::new(deadline, QuorumPolicy::Majority)
            .tag("method", "NewEventReceived")
            .tag("stream_id", stream_id);

        if nodes.local_is_replica() {
            let store = self.store.clone();
            let (stream_id, event) = (*stream_id, event.clone());
            let local_write = move || store.add_event(&stream_id, &event).map(|_| ());
            if nodes.local_in_quorum() {
                pool.add_local_task(local_write);
            } else {
                pool.add_sync_task(nodes.local(), local_write);
            }
        }

        for node in nodes.remote_quorum_nodes() {
            let client = self.client.clone();
            let (stream_id, event) = (*stream_id, event.clone());
            pool.add_remote_task(node, move || client.new_event_received(node, stream_id, event));
        }
        for node in nodes.sync_nodes() {
            let client = self.client.clone();
            let (stream_id, event) = (*stream_id, event.clone());
            pool.add_sync_task(node, move || client.new_event_received(node, stream_id, event));
        }

        pool.wait().map(|_| ())
    }
}

/// Whether `err` means that some replica is behind or on a different chain, so that the write may
/// succeed later.
fn is_stale(err: &ReplicationError) -> bool {
    err.is_code_with_causes(ErrorCode::BadBlockNumber) || err.is_code_with_causes(ErrorCode::BadPrevMiniblockHash)
}
