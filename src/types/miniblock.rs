/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the [`Miniblock`] type and its associated methods.
//!
//! Miniblocks form a hash-linked chain per stream: for every `n > 0`,
//! `miniblock[n].header.prev_hash == miniblock[n - 1].hash`, and numbers are contiguous starting at the
//! genesis miniblock (number 0, zero previous hash). [`verify_chain`] checks exactly this.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::error::{ErrorCode, ReplicationError};

use super::basic::{CryptoHash, MiniblockNum, MiniblockRef, StreamId};
use super::crypto_primitives::hash_borsh;
use super::event::Envelope;

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MiniblockHeader {
    pub num: MiniblockNum,
    pub prev_hash: CryptoHash,
    pub event_hashes: Vec<CryptoHash>,
    pub timestamp_ms: u64,
    pub snapshot_hash: Option<CryptoHash>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Miniblock {
    pub hash: CryptoHash,
    pub header: MiniblockHeader,
    pub events: Vec<Envelope>,
}

impl Miniblock {
    pub fn new(
        num: MiniblockNum,
        prev_hash: CryptoHash,
        events: Vec<Envelope>,
        timestamp_ms: u64,
        snapshot_hash: Option<CryptoHash>,
    ) -> Result<Miniblock, ReplicationError> {
        let header = MiniblockHeader {
            num,
            prev_hash,
            event_hashes: events.iter().map(|event| event.hash).collect(),
            timestamp_ms,
            snapshot_hash,
        };
        Ok(Miniblock {
            hash: Miniblock::hash(&header)?,
            header,
            events,
        })
    }

    /// Build the genesis miniblock from the stream's creation events. The timestamp is taken from the first
    /// event, so that every node builds a byte-identical genesis from the same events.
    pub fn genesis(events: Vec<Envelope>) -> Result<Miniblock, ReplicationError> {
        let timestamp_ms = events
            .first()
            .map(|event| event.event.created_at_ms)
            .ok_or_else(|| ReplicationError::invalid_argument("genesis miniblock needs at least one event"))?;
        Miniblock::new(MiniblockNum::genesis(), CryptoHash::zero(), events, timestamp_ms, None)
    }

    pub fn hash(header: &MiniblockHeader) -> Result<CryptoHash, ReplicationError> {
        hash_borsh(header)
    }

    /// Checks that the hash matches the header, and that the header lists exactly the hashes of the
    /// events carried.
    pub fn is_correct(&self) -> bool {
        let hash_ok = Miniblock::hash(&self.header)
            .map(|hash| hash == self.hash)
            .unwrap_or(false);
        hash_ok
            && self.header.event_hashes.len() == self.events.len()
            && self
                .header
                .event_hashes
                .iter()
                .zip(self.events.iter())
                .all(|(hash, event)| *hash == event.hash)
    }

    pub fn num(&self) -> MiniblockNum {
        self.header.num
    }

    pub fn prev_hash(&self) -> CryptoHash {
        self.header.prev_hash
    }

    pub fn reference(&self) -> MiniblockRef {
        MiniblockRef::new(self.hash, self.header.num)
    }

    pub fn is_genesis(&self) -> bool {
        self.header.num == MiniblockNum::genesis()
    }
}

/// State digest recorded in a miniblock header when the replicas vote to snapshot.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Snapshot {
    pub stream_id: StreamId,
    pub miniblock_num: MiniblockNum,
    pub event_hashes: Vec<CryptoHash>,
}

impl Snapshot {
    pub fn hash(&self) -> Result<CryptoHash, ReplicationError> {
        hash_borsh(self)
    }
}

/// Checks the chain integrity invariant over `blocks`, which must start at genesis.
pub fn verify_chain(blocks: &[Miniblock]) -> Result<(), ReplicationError> {
    verify_chain_from(None, blocks)
}

/// Checks that `blocks` is a well-formed chain segment that extends `prev`. If `prev` is `None` the
/// segment must start with a genesis miniblock.
pub fn verify_chain_from(prev: Option<&MiniblockRef>, blocks: &[Miniblock]) -> Result<(), ReplicationError> {
    let mut expected = match prev {
        Some(prev) => MiniblockRef::new(prev.hash, prev.num.next()),
        None => MiniblockRef::new(CryptoHash::zero(), MiniblockNum::genesis()),
    };

    for block in blocks {
        if !block.is_correct() {
            return Err(ReplicationError::new(ErrorCode::InvalidArgument, "miniblock hash does not match its content")
                .tag("num", block.num())
                .tag("hash", block.hash));
        }
        if block.num() != expected.num {
            return Err(ReplicationError::new(ErrorCode::BadBlockNumber, "miniblock numbers are not contiguous")
                .tag("expected", expected.num)
                .tag("observed", block.num()));
        }
        if block.prev_hash() != expected.hash {
            return Err(ReplicationError::new(ErrorCode::BadPrevMiniblockHash, "miniblock does not extend its predecessor")
                .tag("num", block.num())
                .tag("expected", expected.hash)
                .tag("observed", block.prev_hash()));
        }
        expected = MiniblockRef::new(block.hash, block.num().next());
    }
    Ok(())
}
