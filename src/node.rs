/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a node.
//!
//! A node stores a subset of all streams, replicates the events written to them to the other nodes
//! hosting the same streams, and takes part in sealing their minipools into miniblocks. Which nodes host
//! a stream is decided by the user-provided [`StreamRegistry`].
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [description of the node](NodeSpec) with
//!   `NodeSpec::builder`, the setters of the `NodeSpecBuilder`, and `NodeSpecBuilder::build`.
//! - The function to [start](NodeSpec::start) a [Node] given its description.
//! - [The type](Node) which keeps the node's background threads alive, and offers the client-facing
//!   operations.
//!
//! ## Wiring a node into the network
//!
//! The node does not listen on anything by itself. The user's [`Network`] implementation delivers the
//! requests other nodes send to the [`RequestHandler`] returned by [`Node::handler`], and the user's
//! [`StreamRegistry`] reports the miniblocks it finalizes to the [`Node::on_miniblock_finalized`] of
//! every node that hosts the stream.
//!
//! ## Starting a node
//!
//! ```ignore
//! let node =
//!     NodeSpec::builder()
//!     .kv_store(kv_store)
//!     .network(network)
//!     .registry(registry)
//!     .configuration(configuration)
//!     .media_store(Some(media_store))
//!     .on_promote_miniblock(promote_handler)
//!     .build()
//!     .start()
//! ```
//!
//! ### Required setters
//!
//! - `.kv_store(...)`
//! - `.network(...)`
//! - `.registry(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! - `.rules(...)`: defaults to [`PermitAll`].
//! - `.media_store(...)`: without one, media chunks are only kept in the node's key-value store.
//! - `.scheduler(...)`: defaults to a [`ReconcileQueue`] served by a background
//!   [reconciliation worker](crate::replication::reconcile).
//! - `.sleeper(...)`: defaults to [`ThreadSleeper`].
//! - The handlers for the events in [`crate::events`]: `.on_replicate_write(...)`,
//!   `.on_recovered_write(...)`, `.on_propose_miniblock(...)`, `.on_save_candidate(...)`,
//!   `.on_promote_miniblock(...)`, `.on_submit_reconcile(...)`, `.on_end_reconcile(...)`,
//!   `.on_seal_ephemeral_stream(...)`, `.on_abort_upload(...)`.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use typed_builder::TypedBuilder;

use crate::backoff::{Sleeper, ThreadSleeper};
use crate::config::Configuration;
use crate::consensus::{MiniblockProducer, ProduceOutcome};
use crate::error::ReplicationError;
use crate::event_bus::*;
use crate::events::*;
use crate::media::{EphemeralUploads, MediaUploadCoordinator};
use crate::networking::{Network, RemoteClient, RequestHandler};
use crate::pluggables::{EventRules, MediaObjectStore, PermitAll, ReconcileScheduler, StreamRegistry};
use crate::replication::event_writer::ReplicatedEventWriter;
use crate::replication::reconcile::{ReconcileQueue, ReconcileWorker};
use crate::replication::staleness::StalenessReconciler;
use crate::service::NodeService;
use crate::storage::{KVStore, Promotion, StreamStore, StreamView};
use crate::types::basic::{CryptoHash, MiniblockRef, NodeAddress, StreamId};
use crate::types::cookies::{CreationCookie, StreamAndCookie};
use crate::types::event::Envelope;

/// Callback through which a [`StreamRegistry`] reports a finalized miniblock to a node.
pub type FinalizationObserver = Arc<dyn Fn(&StreamId, &MiniblockRef) + Send + Sync>;

/// Stores all necessary parameters and trait implementations required to run a [Node].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [NodeSpec]. On the builder call the following methods to construct a valid [NodeSpec].

    Required:
    - `.kv_store(...)`
    - `.network(...)`
    - `.registry(...)`
    - `.configuration(...)`

    Optional:
    - `.rules(...)`
    - `.media_store(...)`
    - `.scheduler(...)`
    - `.sleeper(...)`
    - `.on_replicate_write(...)`
    - `.on_recovered_write(...)`
    - `.on_propose_miniblock(...)`
    - `.on_save_candidate(...)`
    - `.on_promote_miniblock(...)`
    - `.on_submit_reconcile(...)`
    - `.on_end_reconcile(...)`
    - `.on_seal_ephemeral_stream(...)`
    - `.on_abort_upload(...)`
"))]
pub struct NodeSpec<K: KVStore, N: Network> {
    // Required parameters
    #[builder(setter(doc = "Set the implementation of the node's Key-Value store. The argument must implement the [KVStore](crate::storage::KVStore) trait. Required."))]
    kv_store: K,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network](crate::networking::Network) trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the node-placement registry. Required."))]
    registry: Arc<dyn StreamRegistry>,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a node. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default = Arc::new(PermitAll) as Arc<dyn EventRules>, setter(doc = "Set the rules that authorize stream creations and event writes. Optional."))]
    rules: Arc<dyn EventRules>,
    #[builder(default, setter(doc = "Set the external storage for media blobs, if any. Optional."))]
    media_store: Option<Arc<dyn MediaObjectStore>>,
    #[builder(default, setter(doc = "Replace the built-in reconciliation queue and worker, if set. Optional."))]
    scheduler: Option<Arc<dyn ReconcileScheduler>>,
    #[builder(default = Arc::new(ThreadSleeper) as Arc<dyn Sleeper>, setter(doc = "Set how retry loops sleep between attempts. Optional."))]
    sleeper: Arc<dyn Sleeper>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReplicateWriteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReplicateWriteEvent>),
    doc = "Register a handler closure to be invoked after the node wrote an event to a quorum of its replicas. Optional."))]
    on_replicate_write: Option<HandlerPtr<ReplicateWriteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RecoveredWriteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RecoveredWriteEvent>),
    doc = "Register a handler closure to be invoked after a write succeeded only after retrying. Optional."))]
    on_recovered_write: Option<HandlerPtr<RecoveredWriteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProposeMiniblockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProposeMiniblockEvent>),
    doc = "Register a handler closure to be invoked after the node built a miniblock candidate. Optional."))]
    on_propose_miniblock: Option<HandlerPtr<ProposeMiniblockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SaveCandidateEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SaveCandidateEvent>),
    doc = "Register a handler closure to be invoked after the node stored a miniblock candidate. Optional."))]
    on_save_candidate: Option<HandlerPtr<SaveCandidateEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PromoteMiniblockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PromoteMiniblockEvent>),
    doc = "Register a handler closure to be invoked after a finalized candidate became the node's next miniblock. Optional."))]
    on_promote_miniblock: Option<HandlerPtr<PromoteMiniblockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SubmitReconcileEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SubmitReconcileEvent>),
    doc = "Register a handler closure to be invoked after the node queued a reconciliation. Optional."))]
    on_submit_reconcile: Option<HandlerPtr<SubmitReconcileEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&EndReconcileEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<EndReconcileEvent>),
    doc = "Register a handler closure to be invoked after the reconciliation worker finished a task. Optional."))]
    on_end_reconcile: Option<HandlerPtr<EndReconcileEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SealEphemeralStreamEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SealEphemeralStreamEvent>),
    doc = "Register a handler closure to be invoked after the node sealed an ephemeral media stream. Optional."))]
    on_seal_ephemeral_stream: Option<HandlerPtr<SealEphemeralStreamEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&AbortUploadEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<AbortUploadEvent>),
    doc = "Register a handler closure to be invoked after the node aborted an external media upload. Optional."))]
    on_abort_upload: Option<HandlerPtr<AbortUploadEvent>>,
}

impl<K: KVStore, N: Network> NodeSpec<K, N> {
    /// Starts all threads and channels associated with running a node, and returns the handles to them in a [Node] struct.
    pub fn start(self) -> Node<K, N> {
        let log_events = self.configuration.log_events;
        let operation_timeout = self.configuration.operation_timeout;
        let (keypair, writer_config, reconciler_config, reconcile_worker_config, consensus_config, media_config) =
            self.configuration.into();
        let local = keypair.address();

        let event_handlers = EventHandlers::new(
            log_events,
            self.on_replicate_write,
            self.on_recovered_write,
            self.on_propose_miniblock,
            self.on_save_candidate,
            self.on_promote_miniblock,
            self.on_submit_reconcile,
            self.on_end_reconcile,
            self.on_seal_ephemeral_stream,
            self.on_abort_upload,
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let store = StreamStore::new(self.kv_store);
        let client = RemoteClient::new(self.network);

        let (scheduler, reconcile_worker, reconcile_worker_shutdown) = match self.scheduler {
            Some(scheduler) => (scheduler, None, None),
            None => {
                let (tasks, task_receiver) = mpsc::channel();
                let (reconcile_worker_shutdown, reconcile_worker_shutdown_receiver) = mpsc::channel();
                let reconcile_worker = ReconcileWorker::new(
                    reconcile_worker_config,
                    local,
                    store.clone(),
                    client.clone(),
                    Arc::clone(&self.registry),
                    task_receiver,
                    reconcile_worker_shutdown_receiver,
                    event_publisher.clone(),
                )
                .start();
                let queue: Arc<dyn ReconcileScheduler> = Arc::new(ReconcileQueue::new(tasks, event_publisher.clone()));
                (queue, Some(reconcile_worker), Some(reconcile_worker_shutdown))
            }
        };

        let writer = ReplicatedEventWriter::new(
            writer_config,
            store.clone(),
            client.clone(),
            Arc::clone(&self.sleeper),
            event_publisher.clone(),
        );
        let reconciler = StalenessReconciler::new(
            reconciler_config,
            store.clone(),
            Arc::clone(&scheduler),
            Arc::clone(&self.sleeper),
        );
        let producer = MiniblockProducer::new(
            consensus_config,
            local,
            store.clone(),
            client.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&scheduler),
            event_publisher.clone(),
        );
        let uploads = EphemeralUploads::new(local, store.clone(), self.media_store, event_publisher.clone());
        let media = MediaUploadCoordinator::new(
            media_config,
            local,
            store.clone(),
            uploads.clone(),
            client.clone(),
            Arc::clone(&self.registry),
        );

        let service = NodeService::new(
            keypair,
            operation_timeout,
            store,
            client,
            self.registry,
            self.rules,
            scheduler,
            writer,
            reconciler,
            producer,
            uploads,
            media,
            event_publisher,
        );

        let (event_bus, event_bus_shutdown) = match event_subscriber {
            Some(event_subscriber) => {
                let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
                let event_bus = start_event_bus(event_handlers, event_subscriber, event_bus_shutdown_receiver);
                (Some(event_bus), Some(event_bus_shutdown))
            }
            None => (None, None),
        };

        Node {
            service: Arc::new(service),
            reconcile_worker,
            reconcile_worker_shutdown,
            event_bus,
            event_bus_shutdown,
        }
    }
}

/// A handle to a running node. When this value is dropped, all background threads are gracefully shut
/// down.
pub struct Node<K: KVStore, N: Network> {
    service: Arc<NodeService<K, N>>,
    reconcile_worker: Option<JoinHandle<()>>,
    reconcile_worker_shutdown: Option<Sender<()>>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl<K: KVStore, N: Network> Node<K, N> {
    /// The node's address, derived from its keypair.
    pub fn address(&self) -> NodeAddress {
        self.service.local()
    }

    /// The handler to deliver requests from other nodes to.
    pub fn handler(&self) -> Arc<dyn RequestHandler> {
        Arc::clone(&self.service) as Arc<dyn RequestHandler>
    }

    /// A callback for the registry to report finalized miniblocks with. Failures are logged.
    pub fn finalization_observer(&self) -> FinalizationObserver {
        let service = Arc::clone(&self.service);
        Arc::new(move |stream_id: &StreamId, reference: &MiniblockRef| {
            if let Err(err) = service.producer().on_finalized(stream_id, reference) {
                log::warn!("promotion of {} in stream {} failed: {}", reference, stream_id, err);
            }
        })
    }

    pub fn create_stream(
        &self,
        stream_id: &StreamId,
        events: &[Envelope],
    ) -> Result<(StreamAndCookie, Vec<CryptoHash>), ReplicationError> {
        self.service.create_stream(stream_id, events)
    }

    pub fn add_event(&self, stream_id: &StreamId, event: &Envelope) -> Result<Vec<CryptoHash>, ReplicationError> {
        self.service.add_event(stream_id, event)
    }

    pub fn create_media_stream(&self, stream_id: &StreamId, events: &[Envelope]) -> Result<CreationCookie, ReplicationError> {
        self.service.create_media_stream(stream_id, events)
    }

    pub fn add_media_event(
        &self,
        cookie: &CreationCookie,
        event: &Envelope,
        is_last: bool,
    ) -> Result<CreationCookie, ReplicationError> {
        self.service.add_media_event(cookie, event, is_last)
    }

    /// Try to seal the minipool of `stream_id` into its next miniblock. Deciding when to call this is
    /// up to the user.
    pub fn produce_miniblock(&self, stream_id: &StreamId, force_snapshot: bool) -> Result<ProduceOutcome, ReplicationError> {
        self.service.producer().produce(stream_id, force_snapshot)
    }

    /// Apply the candidate `reference` that the registry finalized for `stream_id`.
    pub fn on_miniblock_finalized(&self, stream_id: &StreamId, reference: &MiniblockRef) -> Result<Promotion, ReplicationError> {
        self.service.producer().on_finalized(stream_id, reference)
    }

    pub fn get_view(&self, stream_id: &StreamId) -> Result<StreamView, ReplicationError> {
        self.service.get_view(stream_id)
    }

    /// Read access to the node's local copy of its streams.
    pub fn store(&self) -> &StreamStore<K> {
        self.service.store()
    }
}

impl<K: KVStore, N: Network> Drop for Node<K, N> {
    fn drop(&mut self) {
        // The worker publishes events, so it stops before the event bus.
        if let Some(shutdown) = self.reconcile_worker_shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(reconcile_worker) = self.reconcile_worker.take() {
            if reconcile_worker.join().is_err() {
                log::error!("reconciliation worker of node {} panicked", self.address());
            }
        }

        if let Some(shutdown) = self.event_bus_shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            if event_bus.join().is_err() {
                log::error!("event bus of node {} panicked", self.address());
            }
        }
    }
}
