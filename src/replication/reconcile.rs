/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The built-in reconciliation queue and the worker thread that drains it.
//!
//! [`ReconcileQueue`] is the [`ReconcileScheduler`] a node uses unless the user provides their own. It
//! forwards tasks over a channel to a [`ReconcileWorker`], which, for each task:
//! 1. Looks up the nodes of the stream in the registry.
//! 2. Asks the remote nodes one after another, with `GetMiniblocksByIds`, for the miniblocks that follow
//!    the local last miniblock (or, if the stream is missing locally, for the whole chain from genesis),
//!    in batches of `batch_size`.
//! 3. Appends what it receives to the local chain. Every batch is checked for contiguity and previous
//!    hashes against the local chain before it is written.
//!
//! A peer that fails, or that is itself behind the registry, is skipped in favour of the next one.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crate::error::ReplicationError;
use crate::events::{EndReconcileEvent, Event, SubmitReconcileEvent};
use crate::networking::{Network, RemoteClient};
use crate::pluggables::{ReconcileScheduler, ReconcileTask, StreamRegistry};
use crate::quorum::StreamNodeSet;
use crate::storage::{KVStore, StreamStore};
use crate::types::basic::{MiniblockNum, NodeAddress, StreamId};

#[derive(Clone, Copy, Debug)]
pub struct ReconcileWorkerConfiguration {
    /// Number of miniblocks requested from a peer in one `GetMiniblocksByIds` call.
    pub batch_size: u64,
    pub poll_interval: Duration,
}

/// A [`ReconcileScheduler`] that hands tasks to a [`ReconcileWorker`] over a channel.
pub struct ReconcileQueue {
    tasks: Sender<ReconcileTask>,
    event_publisher: Option<Sender<Event>>,
}

impl ReconcileQueue {
    pub(crate) fn new(tasks: Sender<ReconcileTask>, event_publisher: Option<Sender<Event>>) -> ReconcileQueue {
        ReconcileQueue { tasks, event_publisher }
    }
}

impl ReconcileScheduler for ReconcileQueue {
    fn submit(&self, task: ReconcileTask) {
        let (stream_id, target) = (task.stream_id, task.target);
        if self.tasks.send(task).is_err() {
            log::warn!("reconcile worker is gone, dropping task for stream {}", stream_id);
            return;
        }
        Event::publish(
            &self.event_publisher,
            Event::SubmitReconcile(SubmitReconcileEvent {
                timestamp: SystemTime::now(),
                stream_id,
                target,
            }),
        );
    }
}

pub(crate) struct ReconcileWorker<K: KVStore, N: Network> {
    config: ReconcileWorkerConfiguration,
    local: NodeAddress,
    store: StreamStore<K>,
    client: RemoteClient<N>,
    registry: Arc<dyn StreamRegistry>,
    tasks: Receiver<ReconcileTask>,
    shutdown_signal: Receiver<()>,
    event_publisher: Option<Sender<Event>>,
}

impl<K: KVStore, N: Network> ReconcileWorker<K, N> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ReconcileWorkerConfiguration,
        local: NodeAddress,
        store: StreamStore<K>,
        client: RemoteClient<N>,
        registry: Arc<dyn StreamRegistry>,
        tasks: Receiver<ReconcileTask>,
        shutdown_signal: Receiver<()>,
        event_publisher: Option<Sender<Event>>,
    ) -> ReconcileWorker<K, N> {
        ReconcileWorker {
            config,
            local,
            store,
            client,
            registry,
            tasks,
            shutdown_signal,
            event_publisher,
        }
    }

    pub(crate) fn start(self) -> JoinHandle<()> {
        thread::spawn(move || loop {
            match self.shutdown_signal.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => (),
            }

            match self.tasks.recv_timeout(self.config.poll_interval) {
                Ok(task) => self.reconcile(&task),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }
        })
    }

    fn reconcile(&self, task: &ReconcileTask) {
        let imported = match self.pull(task) {
            Ok(imported) => imported,
            Err(err) => {
                log::warn!("reconciliation of stream {} failed: {}", task.stream_id, err);
                0
            }
        };

        let last_miniblock = self
            .store
            .view(&task.stream_id)
            .ok()
            .flatten()
            .map(|view| view.last_block.num);
        Event::publish(
            &self.event_publisher,
            Event::EndReconcile(EndReconcileEvent {
                timestamp: SystemTime::now(),
                stream_id: task.stream_id,
                last_miniblock,
                miniblocks_imported: imported,
            }),
        );
    }

    /// Pull missing miniblocks from the stream's remote nodes until the local chain reaches the
    /// registry's last miniblock (or the task's target, if further). Returns the number of miniblocks
    /// applied.
    fn pull(&self, task: &ReconcileTask) -> Result<usize, ReplicationError> {
        let record = self
            .registry
            .get_stream(&task.stream_id)?
            .ok_or_else(|| ReplicationError::not_found("stream not found in registry").tag("stream_id", task.stream_id))?;
        let nodes = StreamNodeSet::new(record.nodes, record.replication_factor as usize, self.local)?;
        let target = match task.target {
            Some(target) if target.num > record.last_miniblock.num => target.num,
            _ => record.last_miniblock.num,
        };

        let mut imported = 0;
        for peer in nodes.remote_nodes() {
            if self.caught_up(&task.stream_id, target)? {
                break;
            }
            match self.pull_from(peer, &task.stream_id) {
                Ok(count) => imported += count,
                Err(err) => log::debug!("pulling stream {} from {} failed: {}", task.stream_id, peer, err),
            }
        }
        Ok(imported)
    }

    fn pull_from(&self, peer: NodeAddress, stream_id: &StreamId) -> Result<usize, ReplicationError> {
        let mut imported = 0;
        loop {
            let start = match self.store.view(stream_id)? {
                Some(view) => view.last_block.num.next(),
                None => MiniblockNum::genesis(),
            };
            let nums: Vec<MiniblockNum> = (0..self.config.batch_size).map(|offset| start + offset).collect();
            let miniblocks = self.client.get_miniblocks_by_ids(peer, *stream_id, nums)?;
            if miniblocks.is_empty() {
                return Ok(imported);
            }

            let applied = self.store.import_miniblocks(stream_id, &miniblocks)?;
            imported += applied;
            if applied == 0 || (miniblocks.len() as u64) < self.config.batch_size {
                return Ok(imported);
            }
        }
    }

    fn caught_up(&self, stream_id: &StreamId, target: MiniblockNum) -> Result<bool, ReplicationError> {
        Ok(self
            .store
            .view(stream_id)?
            .map(|view| view.last_block.num >= target)
            .unwrap_or(false))
    }
}
