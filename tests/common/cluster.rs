//! A set of nodes wired together through a [`Hub`] and a [`RegistryStub`].

use std::{
    sync::{mpsc::Sender, Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use stream_replication::{
    config::Configuration,
    node::{Node, NodeSpec},
    pluggables::{EventRules, MediaObjectStore, PermitAll, ReconcileScheduler, ReconcileTask, StreamRegistry},
    types::basic::{CryptoHash, NodeAddress},
};

use super::{
    media::MemMediaStore,
    mem_db::MemDB,
    network::{Hub, NetworkStub},
    registry::RegistryStub,
};

pub(crate) type TestNode = Node<MemDB, NetworkStub>;

/// Records submitted reconciliations instead of running them.
#[derive(Default)]
pub(crate) struct RecordingScheduler {
    tasks: Mutex<Vec<ReconcileTask>>,
}

impl RecordingScheduler {
    pub(crate) fn tasks(&self) -> Vec<ReconcileTask> {
        self.tasks.lock().unwrap().clone()
    }
}

impl ReconcileScheduler for RecordingScheduler {
    fn submit(&self, task: ReconcileTask) {
        self.tasks.lock().unwrap().push(task);
    }
}

pub(crate) struct ClusterBuilder {
    size: usize,
    replicas: usize,
    replication_factor: u32,
    media_stores: bool,
    recording_schedulers: bool,
    rules: Arc<dyn EventRules>,
    recovered_writes: Option<Sender<(usize, CryptoHash, u32)>>,
}

impl ClusterBuilder {
    /// Streams are placed on the first `replicas` of `size` nodes.
    pub(crate) fn new(size: usize, replicas: usize, replication_factor: u32) -> ClusterBuilder {
        ClusterBuilder {
            size,
            replicas,
            replication_factor,
            media_stores: false,
            recording_schedulers: false,
            rules: Arc::new(PermitAll),
            recovered_writes: None,
        }
    }

    pub(crate) fn media_stores(mut self) -> ClusterBuilder {
        self.media_stores = true;
        self
    }

    pub(crate) fn recording_schedulers(mut self) -> ClusterBuilder {
        self.recording_schedulers = true;
        self
    }

    /// Report every write that succeeded after retrying as (node index, event hash, failed attempts).
    pub(crate) fn recovered_writes(mut self, recovered_writes: Sender<(usize, CryptoHash, u32)>) -> ClusterBuilder {
        self.recovered_writes = Some(recovered_writes);
        self
    }

    pub(crate) fn rules(mut self, rules: Arc<dyn EventRules>) -> ClusterBuilder {
        self.rules = rules;
        self
    }

    pub(crate) fn build(self) -> Cluster {
        let keys: Vec<SigningKey> = (0..self.size).map(|_| SigningKey::generate(&mut OsRng)).collect();
        let addresses: Vec<NodeAddress> = keys.iter().map(|key| NodeAddress::from(&key.verifying_key())).collect();

        let hub = Hub::new();
        let registry = Arc::new(RegistryStub::new(
            addresses[..self.replicas].to_vec(),
            self.replication_factor,
        ));

        let mut nodes = Vec::new();
        let mut media_stores = Vec::new();
        let mut schedulers = Vec::new();
        for (index, (key, address)) in keys.into_iter().zip(addresses).enumerate() {
            let media_store = Arc::new(MemMediaStore::new());
            let scheduler = Arc::new(RecordingScheduler::default());
            let recovered_writes = self.recovered_writes.clone();

            let node = NodeSpec::builder()
                .kv_store(MemDB::new())
                .network(hub.stub(address))
                .registry(Arc::clone(&registry) as Arc<dyn StreamRegistry>)
                .configuration(test_configuration(key))
                .rules(Arc::clone(&self.rules))
                .media_store(
                    self.media_stores
                        .then(|| Arc::clone(&media_store) as Arc<dyn MediaObjectStore>),
                )
                .scheduler(
                    self.recording_schedulers
                        .then(|| Arc::clone(&scheduler) as Arc<dyn ReconcileScheduler>),
                )
                .on_recovered_write(move |event| {
                    if let Some(recovered_writes) = &recovered_writes {
                        let _ = recovered_writes.send((index, event.event, event.attempts));
                    }
                })
                .build()
                .start();

            hub.register(address, node.handler());
            registry.subscribe(address, node.finalization_observer());
            nodes.push(node);
            media_stores.push(media_store);
            schedulers.push(scheduler);
        }

        Cluster {
            hub,
            registry,
            nodes,
            media_stores,
            schedulers,
        }
    }
}

pub(crate) struct Cluster {
    pub(crate) hub: Arc<Hub>,
    pub(crate) registry: Arc<RegistryStub>,
    pub(crate) nodes: Vec<TestNode>,
    pub(crate) media_stores: Vec<Arc<MemMediaStore>>,
    /// Only used by nodes built with `recording_schedulers`.
    pub(crate) schedulers: Vec<Arc<RecordingScheduler>>,
}

impl Cluster {
    pub(crate) fn address(&self, index: usize) -> NodeAddress {
        self.nodes[index].address()
    }
}

pub(crate) fn test_configuration(key: SigningKey) -> Configuration {
    Configuration::builder()
        .me(key)
        .operation_timeout(Duration::from_secs(5))
        .write_start_delay(Duration::from_millis(10))
        .reconcile_start_delay(Duration::from_millis(20))
        .reconcile_timeout(Duration::from_secs(3))
        .reconcile_after_attempts(2)
        .proposal_timeout(Duration::from_secs(2))
        .candidate_timeout(Duration::from_secs(2))
        .reconcile_poll_interval(Duration::from_millis(10))
        .log_events(false)
        .build()
}

/// Poll `condition` until it holds or `timeout` passes. Returns whether it held.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}
