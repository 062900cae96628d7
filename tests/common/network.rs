//! An in-process network: calls are delivered directly to the handler of the target node.
//!
//! Requests, responses and errors are Borsh-encoded and decoded on the way, like a real transport would.
//! Faults can be injected per (node, method).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use borsh::{BorshDeserialize, BorshSerialize};
use stream_replication::{
    error::{ErrorCode, ReplicationError},
    networking::{
        messages::{NodeRequest, NodeResponse},
        Network, RequestHandler,
    },
    types::basic::NodeAddress,
};

/// State shared by all the stubs of one test network.
#[derive(Default)]
pub(crate) struct Hub {
    handlers: Mutex<HashMap<NodeAddress, Arc<dyn RequestHandler>>>,
    faults: Mutex<HashMap<(NodeAddress, &'static str), ReplicationError>>,
    calls: Mutex<Vec<(NodeAddress, &'static str)>>,
}

impl Hub {
    pub(crate) fn new() -> Arc<Hub> {
        Arc::new(Hub::default())
    }

    pub(crate) fn register(&self, node: NodeAddress, handler: Arc<dyn RequestHandler>) {
        self.handlers.lock().unwrap().insert(node, handler);
    }

    /// Make every `method` call to `node` fail with `err`.
    pub(crate) fn fail(&self, node: NodeAddress, method: &'static str, err: ReplicationError) {
        self.faults.lock().unwrap().insert((node, method), err);
    }

    pub(crate) fn heal(&self, node: NodeAddress, method: &'static str) {
        self.faults.lock().unwrap().remove(&(node, method));
    }

    /// Number of `method` calls that were sent to `node`, failed or not.
    pub(crate) fn calls(&self, node: NodeAddress, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(callee, called)| *callee == node && *called == method)
            .count()
    }

    pub(crate) fn stub(self: &Arc<Self>, me: NodeAddress) -> NetworkStub {
        NetworkStub {
            me,
            hub: Arc::clone(self),
        }
    }
}

#[derive(Clone)]
pub(crate) struct NetworkStub {
    me: NodeAddress,
    hub: Arc<Hub>,
}

impl Network for NetworkStub {
    fn call(&self, peer: NodeAddress, request: NodeRequest) -> Result<NodeResponse, ReplicationError> {
        let method = request.method();
        self.hub.calls.lock().unwrap().push((peer, method));

        if let Some(err) = self.hub.faults.lock().unwrap().get(&(peer, method)) {
            return Err(err.clone());
        }
        let handler = self.hub.handlers.lock().unwrap().get(&peer).cloned();
        let handler = match handler {
            Some(handler) => handler,
            None => return Err(ReplicationError::new(ErrorCode::Unavailable, "peer is not connected").tag("node", peer)),
        };

        let request = wire(&request);
        match handler.handle(self.me, request) {
            Ok(response) => Ok(wire(&response)),
            Err(err) => Err(wire(&err)),
        }
    }
}

fn wire<T: BorshSerialize + BorshDeserialize>(value: &T) -> T {
    T::try_from_slice(&value.try_to_vec().unwrap()).unwrap()
}
