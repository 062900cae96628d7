/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The replica side of miniblock production, and the combination of proposals into a candidate.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::error::{ErrorCode, ReplicationError};
use crate::events::{Event, SaveCandidateEvent};
use crate::networking::messages::{MiniblockProposal, ProposeMiniblockRequest, ProposeMiniblockResponse};
use crate::storage::{KVStore, StreamStore};
use crate::types::basic::{CryptoHash, StreamId};
use crate::types::event::Envelope;
use crate::types::miniblock::Miniblock;

/// Answer a `ProposeMiniblock` request with this replica's proposal.
///
/// The request must be for the replica's current minipool generation and reference the replica's last
/// miniblock. `MINIBLOCK_TOO_NEW` means this replica is behind the proposer, `MINIBLOCK_TOO_OLD` that
/// the proposer is behind this replica.
pub fn answer_proposal<K: KVStore>(
    store: &StreamStore<K>,
    snapshot_interval: u64,
    request: &ProposeMiniblockRequest,
) -> Result<ProposeMiniblockResponse, ReplicationError> {
    let view = store.get_view(&request.stream_id)?;
    let generation = view.minipool_generation();

    if request.new_miniblock_num > generation {
        return Err(ReplicationError::new(ErrorCode::MiniblockTooNew, "proposal is ahead of the local minipool")
            .tag("stream_id", request.stream_id)
            .tag("expected", generation)
            .tag("observed", request.new_miniblock_num));
    }
    if request.new_miniblock_num < generation {
        return Err(ReplicationError::new(ErrorCode::MiniblockTooOld, "proposal is for a sealed generation")
            .tag("stream_id", request.stream_id)
            .tag("expected", generation)
            .tag("observed", request.new_miniblock_num));
    }
    if request.prev_miniblock_hash != view.last_block.hash {
        return Err(ReplicationError::new(ErrorCode::BadPrevMiniblockHash, "proposal does not extend the local chain")
            .tag("stream_id", request.stream_id)
            .tag("expected", view.last_block.hash)
            .tag("observed", request.prev_miniblock_hash));
    }

    let known: HashSet<&CryptoHash> = request.local_event_hashes.iter().collect();
    let missing_events = view
        .minipool
        .iter()
        .filter(|event| !known.contains(&event.hash))
        .cloned()
        .collect();
    let should_snapshot =
        request.force_snapshot || generation - view.last_snapshot_num >= snapshot_interval;

    Ok(ProposeMiniblockResponse {
        proposal: MiniblockProposal {
            new_miniblock_num: generation,
            prev_miniblock_hash: view.last_block.hash,
            event_hashes: view.minipool_hashes(),
            should_snapshot,
        },
        missing_events,
    })
}

/// Store `candidate` on this replica.
pub fn save_candidate<K: KVStore>(
    store: &StreamStore<K>,
    event_publisher: &Option<Sender<Event>>,
    stream_id: &StreamId,
    candidate: &Miniblock,
) -> Result<(), ReplicationError> {
    store.write_candidate(stream_id, candidate)?;
    Event::publish(
        event_publisher,
        Event::SaveCandidate(SaveCandidateEvent {
            timestamp: SystemTime::now(),
            stream_id: *stream_id,
            candidate: candidate.reference(),
        }),
    );
    Ok(())
}

/// What goes into a candidate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Combination {
    pub events: Vec<Envelope>,
    pub snapshot: bool,
}

/// Combine `proposals` into the content of a candidate.
///
/// An event is included if at least `quorum` proposals contain it. Events keep the order in which they
/// first appear across the proposals, and are taken from `minipool`; events the caller does not have are
/// skipped. The result holds at most `max_events` events, and stops before the total encoded size
/// exceeds `max_bytes` (a single oversized event is still taken on its own). A snapshot is taken if at
/// least `quorum` proposals vote for one.
pub fn combine_proposals(
    proposals: &[MiniblockProposal],
    quorum: usize,
    minipool: &[Envelope],
    max_events: usize,
    max_bytes: usize,
) -> Combination {
    let mut first_seen: Vec<CryptoHash> = Vec::new();
    let mut votes: HashMap<CryptoHash, usize> = HashMap::new();
    for proposal in proposals {
        let mut seen = HashSet::new();
        for hash in proposal.event_hashes.iter().filter(|hash| seen.insert(**hash)) {
            let count = votes.entry(*hash).or_insert(0);
            if *count == 0 {
                first_seen.push(*hash);
            }
            *count += 1;
        }
    }

    let mut events = Vec::new();
    let mut bytes = 0;
    for hash in first_seen {
        if votes.get(&hash).copied().unwrap_or(0) < quorum {
            continue;
        }
        let event = match minipool.iter().find(|event| event.hash == hash) {
            Some(event) => event,
            None => {
                log::debug!("event {} reached quorum but is not in the local minipool", hash);
                continue;
            }
        };
        if events.len() >= max_events {
            break;
        }
        let size = event.encoded_len();
        if !events.is_empty() && bytes + size > max_bytes {
            break;
        }
        bytes += size;
        events.push(event.clone());
    }

    let snapshot_votes = proposals.iter().filter(|proposal| proposal.should_snapshot).count();
    Combination {
        events,
        snapshot: snapshot_votes >= quorum,
    }
}
