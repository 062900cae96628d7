/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Typed wrappers over [`Network::call`], one per request.

use crate::error::ReplicationError;
use crate::types::{
    basic::{CryptoHash, MiniblockNum, NodeAddress, StreamId},
    cookies::SyncCookie,
    event::Envelope,
    miniblock::Miniblock,
    records::EphemeralStreamRecord,
};

use super::messages::{NodeRequest, NodeResponse, ProposeMiniblockRequest, ProposeMiniblockResponse};
use super::network::Network;

#[derive(Clone)]
pub struct RemoteClient<N: Network> {
    network: N,
}

impl<N: Network> RemoteClient<N> {
    pub fn new(network: N) -> RemoteClient<N> {
        RemoteClient { network }
    }

    pub fn allocate_stream(
        &self,
        peer: NodeAddress,
        stream_id: StreamId,
        genesis: Miniblock,
    ) -> Result<SyncCookie, ReplicationError> {
        match self.call(peer, NodeRequest::AllocateStream { stream_id, genesis })? {
            NodeResponse::SyncCookie(cookie) => Ok(cookie),
            other => Err(unexpected(peer, "AllocateStream", &other)),
        }
    }

    pub fn new_event_received(&self, peer: NodeAddress, stream_id: StreamId, event: Envelope) -> Result<(), ReplicationError> {
        self.ack(peer, NodeRequest::NewEventReceived { stream_id, event })
    }

    pub fn propose_miniblock(
        &self,
        peer: NodeAddress,
        request: ProposeMiniblockRequest,
    ) -> Result<ProposeMiniblockResponse, ReplicationError> {
        match self.call(peer, NodeRequest::ProposeMiniblock(request))? {
            NodeResponse::Proposal(response) => Ok(response),
            other => Err(unexpected(peer, "ProposeMiniblock", &other)),
        }
    }

    pub fn save_miniblock_candidate(
        &self,
        peer: NodeAddress,
        stream_id: StreamId,
        miniblock: Miniblock,
    ) -> Result<(), ReplicationError> {
        self.ack(peer, NodeRequest::SaveMiniblockCandidate { stream_id, miniblock })
    }

    pub fn allocate_ephemeral_stream(
        &self,
        peer: NodeAddress,
        stream_id: StreamId,
        genesis: Miniblock,
        record: EphemeralStreamRecord,
    ) -> Result<(), ReplicationError> {
        self.ack(
            peer,
            NodeRequest::AllocateEphemeralStream {
                stream_id,
                genesis,
                record,
            },
        )
    }

    pub fn save_ephemeral_miniblock(
        &self,
        peer: NodeAddress,
        stream_id: StreamId,
        miniblock: Miniblock,
    ) -> Result<(), ReplicationError> {
        self.ack(peer, NodeRequest::SaveEphemeralMiniblock { stream_id, miniblock })
    }

    pub fn seal_ephemeral_stream(&self, peer: NodeAddress, stream_id: StreamId) -> Result<CryptoHash, ReplicationError> {
        match self.call(peer, NodeRequest::SealEphemeralStream { stream_id })? {
            NodeResponse::GenesisHash(hash) => Ok(hash),
            other => Err(unexpected(peer, "SealEphemeralStream", &other)),
        }
    }

    pub fn abort_ephemeral_upload(&self, peer: NodeAddress, stream_id: StreamId) -> Result<(), ReplicationError> {
        self.ack(peer, NodeRequest::AbortEphemeralUpload { stream_id })
    }

    pub fn release_ephemeral_upload(&self, peer: NodeAddress, stream_id: StreamId) -> Result<(), ReplicationError> {
        self.ack(peer, NodeRequest::ReleaseEphemeralUpload { stream_id })
    }

    pub fn get_miniblocks_by_ids(
        &self,
        peer: NodeAddress,
        stream_id: StreamId,
        nums: Vec<MiniblockNum>,
    ) -> Result<Vec<Miniblock>, ReplicationError> {
        match self.call(peer, NodeRequest::GetMiniblocksByIds { stream_id, nums })? {
            NodeResponse::Miniblocks(miniblocks) => Ok(miniblocks),
            other => Err(unexpected(peer, "GetMiniblocksByIds", &other)),
        }
    }

    pub fn add_event(&self, peer: NodeAddress, stream_id: StreamId, event: Envelope) -> Result<Vec<CryptoHash>, ReplicationError> {
        match self.call(peer, NodeRequest::AddEvent { stream_id, event })? {
            NodeResponse::EventHashes(hashes) => Ok(hashes),
            other => Err(unexpected(peer, "AddEvent", &other)),
        }
    }

    fn ack(&self, peer: NodeAddress, request: NodeRequest) -> Result<(), ReplicationError> {
        let method = request.method();
        match self.call(peer, request)? {
            NodeResponse::Ack => Ok(()),
            other => Err(unexpected(peer, method, &other)),
        }
    }

    fn call(&self, peer: NodeAddress, request: NodeRequest) -> Result<NodeResponse, ReplicationError> {
        let method = request.method();
        log::trace!("calling {} on {}", method, peer);
        self.network.call(peer, request)
    }
}

fn unexpected(peer: NodeAddress, method: &str, response: &NodeResponse) -> ReplicationError {
    ReplicationError::internal("unexpected response from peer")
        .tag("node", peer)
        .tag("method", method)
        .tag("response", response_name(response))
}

fn response_name(response: &NodeResponse) -> &'static str {
    match response {
        NodeResponse::Ack => "Ack",
        NodeResponse::SyncCookie(_) => "SyncCookie",
        NodeResponse::Proposal(_) => "Proposal",
        NodeResponse::GenesisHash(_) => "GenesisHash",
        NodeResponse::Miniblocks(_) => "Miniblocks",
        NodeResponse::EventHashes(_) => "EventHashes",
    }
}
