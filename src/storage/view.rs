/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A request-scoped, read-only picture of a stream as stored on the local node.

use crate::types::{
    basic::{CryptoHash, MiniblockNum, MiniblockRef, NodeAddress, StreamId},
    cookies::SyncCookie,
    event::{Envelope, Payload},
};

#[derive(Clone, Debug)]
pub struct StreamView {
    pub stream_id: StreamId,
    pub last_block: MiniblockRef,
    /// Events accepted locally that are not sealed into a miniblock yet, in acceptance order.
    pub minipool: Vec<Envelope>,
    pub last_snapshot_num: MiniblockNum,
    /// Payload of the first event of the genesis miniblock.
    pub inception: Payload,
}

impl StreamView {
    /// Number of the miniblock the minipool events will be sealed into.
    pub fn minipool_generation(&self) -> MiniblockNum {
        self.last_block.num.next()
    }

    pub fn minipool_hashes(&self) -> Vec<CryptoHash> {
        self.minipool.iter().map(|event| event.hash).collect()
    }

    pub fn minipool_event(&self, hash: &CryptoHash) -> Option<&Envelope> {
        self.minipool.iter().find(|event| event.hash == *hash)
    }

    pub fn sync_cookie(&self, node: NodeAddress) -> SyncCookie {
        SyncCookie {
            node,
            stream_id: self.stream_id,
            minipool_gen: self.minipool_generation(),
            prev_miniblock_hash: self.last_block.hash,
        }
    }
}
