/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits for the collaborators a node relies on but does not implement itself.
//!
//! - [`StreamRegistry`]: the node-placement registry. It is the source of truth for which nodes host a
//!   stream, and the tie-breaker that decides which candidate becomes a stream's next miniblock.
//! - [`MediaObjectStore`]: optional external storage for media blobs, written through multipart uploads.
//! - [`EventRules`]: the authorization and entitlement evaluator.
//! - [`ReconcileScheduler`]: a queue for background reconciliation of lagging streams. The node ships
//!   one implementation, [`ReconcileQueue`](crate::replication::reconcile::ReconcileQueue).
//!
//! The key-value store and the peer-to-peer transport are pluggable too; see
//! [`storage::KVStore`](crate::storage::KVStore) and [`networking::Network`](crate::networking::Network).

use borsh::{BorshDeserialize, BorshSerialize};

use crate::error::ReplicationError;
use crate::storage::StreamView;
use crate::types::{
    basic::{CryptoHash, MiniblockRef, NodeAddress, StreamId},
    event::{Envelope, Payload},
    records::PartReceipt,
};

/// A stream as recorded in the registry.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StreamRecord {
    pub stream_id: StreamId,
    pub nodes: Vec<NodeAddress>,
    pub replication_factor: u32,
    pub genesis_hash: CryptoHash,
    pub last_miniblock: MiniblockRef,
    /// Set for media streams registered after their upload was sealed.
    pub sealed: bool,
}

/// Where the registry decided to place a new stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    pub nodes: Vec<NodeAddress>,
    pub replication_factor: u32,
}

pub trait StreamRegistry: Send + Sync {
    fn get_stream(&self, stream_id: &StreamId) -> Result<Option<StreamRecord>, ReplicationError>;

    fn choose_nodes(&self, stream_id: &StreamId) -> Result<Placement, ReplicationError>;

    /// Register a new stream. Fails with `ALREADY_EXISTS` if the stream is registered.
    fn allocate_stream(&self, record: StreamRecord) -> Result<(), ReplicationError>;

    /// Compare-and-set the last miniblock of a stream from `prev` to `next`. Returns whether this call
    /// won; a lost race is not an error.
    fn set_last_miniblock(
        &self,
        stream_id: &StreamId,
        prev: &MiniblockRef,
        next: &MiniblockRef,
    ) -> Result<bool, ReplicationError>;
}

pub trait MediaObjectStore: Send + Sync {
    /// Start a multipart upload for the blob of `stream_id` and return its upload id.
    fn start_upload(&self, stream_id: &StreamId) -> Result<String, ReplicationError>;

    /// Upload one part and return the tag confirming it. Positions start at 1.
    fn upload_part(
        &self,
        stream_id: &StreamId,
        upload_id: &str,
        position: u32,
        data: &[u8],
    ) -> Result<String, ReplicationError>;

    fn complete_upload(&self, stream_id: &StreamId, upload_id: &str, parts: &[PartReceipt]) -> Result<(), ReplicationError>;

    fn abort_upload(&self, stream_id: &StreamId, upload_id: &str) -> Result<(), ReplicationError>;
}

/// Verdict of the [`EventRules`].
#[derive(Clone, Debug)]
pub enum RuleDecision {
    /// Go ahead. `derived` payloads are added to the stream by the node after the event itself.
    Allow { derived: Vec<Payload> },
    /// Reject with `error`. If `on_denied` is set, the node adds it to the stream before returning the
    /// error.
    Deny {
        error: ReplicationError,
        on_denied: Option<Payload>,
    },
}

impl RuleDecision {
    pub fn allow() -> RuleDecision {
        RuleDecision::Allow { derived: Vec::new() }
    }
}

pub trait EventRules: Send + Sync {
    fn can_create_stream(&self, stream_id: &StreamId, events: &[Envelope]) -> RuleDecision;

    fn can_add_event(&self, view: &StreamView, event: &Envelope) -> RuleDecision;
}

/// Rules that allow everything and derive nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct PermitAll;

impl EventRules for PermitAll {
    fn can_create_stream(&self, _stream_id: &StreamId, _events: &[Envelope]) -> RuleDecision {
        RuleDecision::allow()
    }

    fn can_add_event(&self, _view: &StreamView, _event: &Envelope) -> RuleDecision {
        RuleDecision::allow()
    }
}

/// A request to bring a local stream up to date with its peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileTask {
    pub stream_id: StreamId,
    /// The miniblock that revealed the lag, if known.
    pub target: Option<MiniblockRef>,
}

pub trait ReconcileScheduler: Send + Sync {
    /// Queue `task`. Must not block.
    fn submit(&self, task: ReconcileTask);
}
