/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Byte-prefixes that specify where each stream variable is stored in the user-provided key-value
//! store.
//!
//! Every variable is stored as a **Borsh-serialized value** under a key formed by concatenating a
//! one-byte prefix from this module, the 32 bytes of the stream id, and (for per-miniblock variables)
//! the little-endian bytes of the miniblock number:
//!
//! | Variable | Key |
//! |---|---|
//! | Last miniblock of a stream | `LAST_MINIBLOCK ++ stream_id` |
//! | Miniblock | `MINIBLOCKS ++ stream_id ++ num` |
//! | Minipool | `MINIPOOL ++ stream_id` |
//! | Sealed event index | `EVENT_INDEX ++ stream_id ++ event_hash` |
//! | Last snapshot | `LAST_SNAPSHOT ++ stream_id` |
//! | Candidate | `CANDIDATES ++ stream_id ++ num ++ hash` |
//! | Candidate list | `CANDIDATE_LIST ++ stream_id` |
//! | Ephemeral stream record | `EPHEMERAL_STREAMS ++ stream_id` |
//! | Ephemeral miniblock | `EPHEMERAL_MINIBLOCKS ++ stream_id ++ num` |
//! | Upload bookkeeping | `EPHEMERAL_UPLOADS ++ stream_id` |
//!
//! To form keys, use [`combine`].

use crate::types::basic::{MiniblockNum, StreamId};

pub(super) const LAST_MINIBLOCK: [u8; 1] = [0];
pub(super) const MINIBLOCKS: [u8; 1] = [1];
pub(super) const MINIPOOL: [u8; 1] = [2];
pub(super) const EVENT_INDEX: [u8; 1] = [3];
pub(super) const LAST_SNAPSHOT: [u8; 1] = [4];
pub(super) const CANDIDATES: [u8; 1] = [5];
pub(super) const CANDIDATE_LIST: [u8; 1] = [6];
pub(super) const EPHEMERAL_STREAMS: [u8; 1] = [7];
pub(super) const EPHEMERAL_MINIBLOCKS: [u8; 1] = [8];
pub(super) const EPHEMERAL_UPLOADS: [u8; 1] = [9];

/// Takes references to two byteslices and returns a vector containing the bytes of the first one, and
/// then the bytes of the second one.
pub fn combine(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(a.len() + b.len());
    res.extend_from_slice(a);
    res.extend_from_slice(b);
    res
}

/// Key of a per-stream variable.
pub(super) fn stream_key(prefix: &[u8], stream_id: &StreamId) -> Vec<u8> {
    combine(prefix, &stream_id.bytes())
}

/// Key of a per-miniblock variable.
pub(super) fn miniblock_key(prefix: &[u8], stream_id: &StreamId, num: MiniblockNum) -> Vec<u8> {
    combine(&stream_key(prefix, stream_id), &num.int().to_le_bytes())
}
