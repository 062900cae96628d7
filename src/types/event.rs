/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for stream events and the signed [`Envelope`] they travel in.
//!
//! Events are content-addressed: the hash of an envelope is the SHA-256 of the Borsh encoding of the
//! [`StreamEvent`] it wraps, and the creator signs that hash. Two envelopes with the same hash are the
//! same event, which is what makes re-delivery after a retry harmless.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::error::{ErrorCode, ReplicationError};

use super::basic::{CryptoHash, Datum, MiniblockRef, NodeAddress, SignatureBytes, StreamId};
use super::crypto_primitives::{hash_borsh, verify_signature, Keypair};

/// First event of every non-media stream.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StreamInception {
    pub stream_id: StreamId,
}

/// First event of a media stream. Declares how many chunks the upload consists of.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MediaInception {
    pub stream_id: StreamId,
    pub channel_id: Option<StreamId>,
    pub chunk_count: u32,
    pub per_chunk_encryption: bool,
}

/// One chunk of a media upload.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MediaChunk {
    pub data: Datum,
    pub chunk_index: i32,
    pub iv: Datum,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum MembershipOp {
    Join,
    Leave,
    /// Recorded when a member's event was rejected by the entitlement rules.
    Denied,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Membership {
    pub member: NodeAddress,
    pub op: MembershipOp,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Payload {
    Inception(StreamInception),
    Message(Datum),
    MediaInception(MediaInception),
    MediaChunk(MediaChunk),
    Membership(Membership),
}

impl Payload {
    pub fn name(&self) -> &'static str {
        match self {
            Payload::Inception(_) => "Inception",
            Payload::Message(_) => "Message",
            Payload::MediaInception(_) => "MediaInception",
            Payload::MediaChunk(_) => "MediaChunk",
            Payload::Membership(_) => "Membership",
        }
    }
}

/// The unsigned content of an event.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StreamEvent {
    pub creator: NodeAddress,
    pub payload: Payload,
    /// The miniblock the creator observed when creating the event. `None` for inception events.
    pub prev_miniblock: Option<MiniblockRef>,
    pub created_at_ms: u64,
    pub salt: u64,
}

/// A signed, content-addressed [`StreamEvent`].
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Envelope {
    pub hash: CryptoHash,
    pub signature: SignatureBytes,
    pub event: StreamEvent,
}

impl Envelope {
    /// Hash and sign `event`. The keypair must belong to `event.creator`.
    pub fn new(keypair: &Keypair, event: StreamEvent) -> Result<Envelope, ReplicationError> {
        if keypair.address() != event.creator {
            return Err(ReplicationError::invalid_argument("event creator does not match the signing key")
                .tag("creator", event.creator)
                .tag("signer", keypair.address()));
        }
        let hash = hash_borsh(&event)?;
        let signature = keypair.sign(&hash.bytes());
        Ok(Envelope { hash, signature, event })
    }

    /// Check that the hash matches the content and that the creator signed it.
    pub fn verify(&self) -> Result<(), ReplicationError> {
        let expected = hash_borsh(&self.event)?;
        if expected != self.hash {
            return Err(ReplicationError::new(ErrorCode::InvalidArgument, "event hash does not match its content")
                .tag("hash", self.hash)
                .tag("expected", expected));
        }
        verify_signature(&self.event.creator, &self.hash.bytes(), &self.signature)
    }

    pub fn prev_miniblock(&self) -> Option<&MiniblockRef> {
        self.event.prev_miniblock.as_ref()
    }

    pub fn payload(&self) -> &Payload {
        &self.event.payload
    }

    /// Number of bytes the event occupies on the wire. Used to bound the size of a miniblock.
    pub fn encoded_len(&self) -> usize {
        self.try_to_vec().map(|bytes| bytes.len()).unwrap_or(0)
    }
}
