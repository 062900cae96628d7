/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events a node emits, for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed. Events are published on a
//! channel and dispatched to user handlers by the [event bus](crate::event_bus) thread, so handlers never
//! run on the threads doing replication work.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::types::basic::{CryptoHash, MiniblockNum, MiniblockRef, NodeAddress, StreamId};

pub enum Event {
    // Replicated writes.
    ReplicateWrite(ReplicateWriteEvent),
    RecoveredWrite(RecoveredWriteEvent),
    // Miniblock production.
    ProposeMiniblock(ProposeMiniblockEvent),
    SaveCandidate(SaveCandidateEvent),
    PromoteMiniblock(PromoteMiniblockEvent),
    // Reconciliation.
    SubmitReconcile(SubmitReconcileEvent),
    EndReconcile(EndReconcileEvent),
    // Media uploads.
    SealEphemeralStream(SealEphemeralStreamEvent),
    AbortUpload(AbortUploadEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // Fails only once the event bus has shut down.
            let _ = event_publisher.send(event);
        }
    }
}

/// An event was accepted by a quorum of the stream's replicas.
pub struct ReplicateWriteEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
    pub event: CryptoHash,
    pub prev_miniblock: MiniblockRef,
}

/// A replicated write succeeded after failing at least once because replicas were behind.
pub struct RecoveredWriteEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
    pub event: CryptoHash,
    pub attempts: u32,
}

pub struct ProposeMiniblockEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
    pub miniblock: MiniblockRef,
    pub events: usize,
    pub snapshot: bool,
}

pub struct SaveCandidateEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
    pub candidate: MiniblockRef,
}

pub struct PromoteMiniblockEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
    pub miniblock: MiniblockRef,
}

pub struct SubmitReconcileEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
    pub target: Option<MiniblockRef>,
}

pub struct EndReconcileEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
    pub last_miniblock: Option<MiniblockNum>,
    pub miniblocks_imported: usize,
}

pub struct SealEphemeralStreamEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
    pub genesis: CryptoHash,
}

pub struct AbortUploadEvent {
    pub timestamp: SystemTime,
    pub stream_id: StreamId,
    pub node: NodeAddress,
}
