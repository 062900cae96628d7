//! An in-memory node-placement registry.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use stream_replication::{
    error::{ErrorCode, ReplicationError},
    node::FinalizationObserver,
    pluggables::{Placement, StreamRecord, StreamRegistry},
    types::basic::{MiniblockRef, NodeAddress, StreamId},
};

/// Places every stream on the same nodes, and reports finalized miniblocks to the nodes that
/// subscribed, outside of its lock.
pub(crate) struct RegistryStub {
    placement: Placement,
    streams: Mutex<HashMap<StreamId, StreamRecord>>,
    observers: Mutex<Vec<(NodeAddress, FinalizationObserver)>>,
    muted: Mutex<HashSet<NodeAddress>>,
    shifting: AtomicBool,
    choices: AtomicUsize,
}

impl RegistryStub {
    pub(crate) fn new(nodes: Vec<NodeAddress>, replication_factor: u32) -> RegistryStub {
        RegistryStub {
            placement: Placement {
                nodes,
                replication_factor,
            },
            streams: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
            muted: Mutex::new(HashSet::new()),
            shifting: AtomicBool::new(false),
            choices: AtomicUsize::new(0),
        }
    }

    pub(crate) fn subscribe(&self, node: NodeAddress, observer: FinalizationObserver) {
        self.observers.lock().unwrap().push((node, observer));
    }

    /// Stop reporting finalized miniblocks to `node`.
    pub(crate) fn mute(&self, node: NodeAddress) {
        self.muted.lock().unwrap().insert(node);
    }

    pub(crate) fn unmute(&self, node: NodeAddress) {
        self.muted.lock().unwrap().remove(&node);
    }

    /// Rotate the node list by one on every `choose_nodes`, like a load-aware chooser that never
    /// answers twice the same way.
    pub(crate) fn shift_choices(&self) {
        self.shifting.store(true, Ordering::SeqCst);
    }

    pub(crate) fn record(&self, stream_id: &StreamId) -> Option<StreamRecord> {
        self.streams.lock().unwrap().get(stream_id).cloned()
    }
}

impl StreamRegistry for RegistryStub {
    fn get_stream(&self, stream_id: &StreamId) -> Result<Option<StreamRecord>, ReplicationError> {
        Ok(self.record(stream_id))
    }

    fn choose_nodes(&self, _stream_id: &StreamId) -> Result<Placement, ReplicationError> {
        let mut placement = self.placement.clone();
        if self.shifting.load(Ordering::SeqCst) {
            let shift = self.choices.fetch_add(1, Ordering::SeqCst) % placement.nodes.len();
            placement.nodes.rotate_left(shift);
        }
        Ok(placement)
    }

    fn allocate_stream(&self, record: StreamRecord) -> Result<(), ReplicationError> {
        let mut streams = self.streams.lock().unwrap();
        if streams.contains_key(&record.stream_id) {
            return Err(ReplicationError::new(ErrorCode::AlreadyExists, "stream is already registered"));
        }
        streams.insert(record.stream_id, record);
        Ok(())
    }

    fn set_last_miniblock(
        &self,
        stream_id: &StreamId,
        prev: &MiniblockRef,
        next: &MiniblockRef,
    ) -> Result<bool, ReplicationError> {
        {
            let mut streams = self.streams.lock().unwrap();
            let record = match streams.get_mut(stream_id) {
                Some(record) => record,
                None => return Err(ReplicationError::new(ErrorCode::NotFound, "stream is not registered")),
            };
            if record.last_miniblock != *prev {
                return Ok(false);
            }
            record.last_miniblock = *next;
        }

        let observers: Vec<FinalizationObserver> = {
            let muted = self.muted.lock().unwrap();
            self.observers
                .lock()
                .unwrap()
                .iter()
                .filter(|(node, _)| !muted.contains(node))
                .map(|(_, observer)| observer.clone())
                .collect()
        };
        for observer in observers {
            observer(stream_id, next);
        }
        Ok(true)
    }
}
