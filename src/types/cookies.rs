/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cookies handed back to clients so that they can continue from where an operation left off.

use borsh::{BorshDeserialize, BorshSerialize};

use super::basic::{CryptoHash, MiniblockNum, NodeAddress, StreamId};
use super::miniblock::Miniblock;

/// Position from which a client can start syncing a stream on a given node.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SyncCookie {
    pub node: NodeAddress,
    pub stream_id: StreamId,
    pub minipool_gen: MiniblockNum,
    pub prev_miniblock_hash: CryptoHash,
}

/// Returned by stream creation: the miniblocks of the new stream and where to sync from.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StreamAndCookie {
    pub stream_id: StreamId,
    pub miniblocks: Vec<Miniblock>,
    pub cookie: SyncCookie,
}

/// Tracks the progress of a media upload: which nodes hold the ephemeral stream, and the number and
/// previous hash of the next miniblock the upload must write.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CreationCookie {
    pub stream_id: StreamId,
    pub nodes: Vec<NodeAddress>,
    pub replication_factor: u32,
    pub miniblock_num: MiniblockNum,
    pub prev_miniblock_hash: CryptoHash,
}
