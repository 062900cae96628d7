/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Exhaustive enumerations of every request and response exchanged between nodes.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    basic::{CryptoHash, MiniblockNum, StreamId},
    cookies::SyncCookie,
    event::Envelope,
    miniblock::Miniblock,
    records::EphemeralStreamRecord,
};

/// All requests a node serves to its peers.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum NodeRequest {
    /// Create a stream from its genesis miniblock. Idempotent. Answered with [`NodeResponse::SyncCookie`].
    AllocateStream { stream_id: StreamId, genesis: Miniblock },

    /// Add an event that was accepted by another replica to the local minipool.
    NewEventReceived { stream_id: StreamId, event: Envelope },

    /// Answered with [`NodeResponse::Proposal`].
    ProposeMiniblock(ProposeMiniblockRequest),

    SaveMiniblockCandidate { stream_id: StreamId, miniblock: Miniblock },

    AllocateEphemeralStream {
        stream_id: StreamId,
        genesis: Miniblock,
        record: EphemeralStreamRecord,
    },

    SaveEphemeralMiniblock { stream_id: StreamId, miniblock: Miniblock },

    /// Answered with [`NodeResponse::GenesisHash`].
    SealEphemeralStream { stream_id: StreamId },

    /// Abort the external multipart upload of a stream whose seal failed.
    AbortEphemeralUpload { stream_id: StreamId },

    /// Forget the upload bookkeeping of a stream whose seal succeeded.
    ReleaseEphemeralUpload { stream_id: StreamId },

    /// Answered with [`NodeResponse::Miniblocks`], containing the requested miniblocks that exist.
    GetMiniblocksByIds { stream_id: StreamId, nums: Vec<MiniblockNum> },

    /// A client event forwarded by a node that does not host the stream. Answered with
    /// [`NodeResponse::EventHashes`].
    AddEvent { stream_id: StreamId, event: Envelope },
}

impl NodeRequest {
    /// Name of the request, for logs and error tags.
    pub fn method(&self) -> &'static str {
        match self {
            NodeRequest::AllocateStream { .. } => "AllocateStream",
            NodeRequest::NewEventReceived { .. } => "NewEventReceived",
            NodeRequest::ProposeMiniblock(_) => "ProposeMiniblock",
            NodeRequest::SaveMiniblockCandidate { .. } => "SaveMiniblockCandidate",
            NodeRequest::AllocateEphemeralStream { .. } => "AllocateEphemeralStream",
            NodeRequest::SaveEphemeralMiniblock { .. } => "SaveEphemeralMiniblock",
            NodeRequest::SealEphemeralStream { .. } => "SealEphemeralStream",
            NodeRequest::AbortEphemeralUpload { .. } => "AbortEphemeralUpload",
            NodeRequest::ReleaseEphemeralUpload { .. } => "ReleaseEphemeralUpload",
            NodeRequest::GetMiniblocksByIds { .. } => "GetMiniblocksByIds",
            NodeRequest::AddEvent { .. } => "AddEvent",
        }
    }
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum NodeResponse {
    Ack,
    SyncCookie(SyncCookie),
    Proposal(ProposeMiniblockResponse),
    GenesisHash(CryptoHash),
    Miniblocks(Vec<Miniblock>),
    EventHashes(Vec<CryptoHash>),
}

/// Asks a replica what it would put into the next miniblock of a stream.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ProposeMiniblockRequest {
    pub stream_id: StreamId,
    pub new_miniblock_num: MiniblockNum,
    pub prev_miniblock_hash: CryptoHash,
    /// Hashes of the events in the proposer's minipool. The replica returns the events it has that are not
    /// in this list.
    pub local_event_hashes: Vec<CryptoHash>,
    pub force_snapshot: bool,
}

/// One node's view of what the next miniblock should contain.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MiniblockProposal {
    pub new_miniblock_num: MiniblockNum,
    pub prev_miniblock_hash: CryptoHash,
    pub event_hashes: Vec<CryptoHash>,
    pub should_snapshot: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ProposeMiniblockResponse {
    pub proposal: MiniblockProposal,
    pub missing_events: Vec<Envelope>,
}
