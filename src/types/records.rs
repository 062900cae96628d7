/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-node bookkeeping records for ephemeral (not yet sealed) media streams.

use borsh::{BorshDeserialize, BorshSerialize};

use super::basic::NodeAddress;

/// Written on every node when an ephemeral stream is allocated. Lets a node validate incoming chunks
/// and answer a repeated allocation with the original placement.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct EphemeralStreamRecord {
    pub nodes: Vec<NodeAddress>,
    pub replication_factor: u32,
    pub chunk_count: u32,
}

/// Confirmation of one uploaded part, as returned by the external object store.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PartReceipt {
    pub position: u32,
    pub tag: String,
}

/// State of the multipart upload a node runs against the external object store for one stream.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct EphemeralUpload {
    pub upload_id: String,
    pub parts: Vec<PartReceipt>,
    /// Set once the node completed the multipart upload. The record is kept until the coordinator
    /// either releases it (seal succeeded everywhere) or aborts it.
    pub completed: bool,
}

impl EphemeralUpload {
    pub fn new(upload_id: String) -> EphemeralUpload {
        EphemeralUpload {
            upload_id,
            parts: Vec::new(),
            completed: false,
        }
    }

    pub fn has_part(&self, position: u32) -> bool {
        self.parts.iter().any(|part| part.position == position)
    }
}
