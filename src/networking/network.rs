/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use crate::error::ReplicationError;
use crate::types::basic::NodeAddress;

use super::messages::{NodeRequest, NodeResponse};

/// The peer-to-peer transport, provided by the user.
///
/// `call` sends `request` to `peer` and blocks until it answers. An unreachable peer should be reported
/// as `UNAVAILABLE`; an error returned by the peer's handler should be passed through unchanged, since
/// callers branch on its code.
pub trait Network: Clone + Send + Sync + 'static {
    fn call(&self, peer: NodeAddress, request: NodeRequest) -> Result<NodeResponse, ReplicationError>;
}

/// Serves requests from peers. Implemented by [`Node`](crate::node::Node)'s service; the user's
/// [`Network`] implementation delivers incoming requests to it.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, from: NodeAddress, request: NodeRequest) -> Result<NodeResponse, ReplicationError>;
}
