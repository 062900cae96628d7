/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the node's
//! [configuration](crate::config::Configuration).
//!
//! The node logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages printed
//! onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet is
//! how a [PromoteMiniblock](crate::events::PromoteMiniblockEvent) is printed:
//!
//! ```text
//! PromoteMiniblock, 1701329264, IAECAwQ, fNGCJyk, 12
//! ```
//!
//! In the snippet:
//! - The third value is the first seven characters of the Base64 encoding of the stream id.
//! - The fourth value is the first seven characters of the Base64 encoding of the hash of the promoted
//!   miniblock.
//! - The fifth value is the number of the promoted miniblock.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const REPLICATE_WRITE: &str = "ReplicateWrite";
pub const RECOVERED_WRITE: &str = "RecoveredWrite";

pub const PROPOSE_MINIBLOCK: &str = "ProposeMiniblock";
pub const SAVE_CANDIDATE: &str = "SaveCandidate";
pub const PROMOTE_MINIBLOCK: &str = "PromoteMiniblock";

pub const SUBMIT_RECONCILE: &str = "SubmitReconcile";
pub const END_RECONCILE: &str = "EndReconcile";

pub const SEAL_EPHEMERAL_STREAM: &str = "SealEphemeralStream";
pub const ABORT_UPLOAD: &str = "AbortUpload";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for ReplicateWriteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |replicate_write_event: &ReplicateWriteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                REPLICATE_WRITE,
                secs_since_unix_epoch(replicate_write_event.timestamp),
                first_seven_base64_chars(&replicate_write_event.stream_id.bytes()),
                first_seven_base64_chars(&replicate_write_event.event.bytes()),
                replicate_write_event.prev_miniblock.num
            )
        };
        Box::new(logger)
    }
}

impl Logger for RecoveredWriteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |recovered_write_event: &RecoveredWriteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECOVERED_WRITE,
                secs_since_unix_epoch(recovered_write_event.timestamp),
                first_seven_base64_chars(&recovered_write_event.stream_id.bytes()),
                first_seven_base64_chars(&recovered_write_event.event.bytes()),
                recovered_write_event.attempts
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProposeMiniblockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |propose_miniblock_event: &ProposeMiniblockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                PROPOSE_MINIBLOCK,
                secs_since_unix_epoch(propose_miniblock_event.timestamp),
                first_seven_base64_chars(&propose_miniblock_event.stream_id.bytes()),
                first_seven_base64_chars(&propose_miniblock_event.miniblock.hash.bytes()),
                propose_miniblock_event.miniblock.num,
                propose_miniblock_event.events,
                propose_miniblock_event.snapshot
            )
        };
        Box::new(logger)
    }
}

impl Logger for SaveCandidateEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |save_candidate_event: &SaveCandidateEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                SAVE_CANDIDATE,
                secs_since_unix_epoch(save_candidate_event.timestamp),
                first_seven_base64_chars(&save_candidate_event.stream_id.bytes()),
                first_seven_base64_chars(&save_candidate_event.candidate.hash.bytes()),
                save_candidate_event.candidate.num
            )
        };
        Box::new(logger)
    }
}

impl Logger for PromoteMiniblockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |promote_miniblock_event: &PromoteMiniblockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PROMOTE_MINIBLOCK,
                secs_since_unix_epoch(promote_miniblock_event.timestamp),
                first_seven_base64_chars(&promote_miniblock_event.stream_id.bytes()),
                first_seven_base64_chars(&promote_miniblock_event.miniblock.hash.bytes()),
                promote_miniblock_event.miniblock.num
            )
        };
        Box::new(logger)
    }
}

impl Logger for SubmitReconcileEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |submit_reconcile_event: &SubmitReconcileEvent| {
            log::info!(
                "{}, {}, {}, {}",
                SUBMIT_RECONCILE,
                secs_since_unix_epoch(submit_reconcile_event.timestamp),
                first_seven_base64_chars(&submit_reconcile_event.stream_id.bytes()),
                match &submit_reconcile_event.target {
                    Some(target) => target.num.to_string(),
                    None => String::from("None"),
                }
            )
        };
        Box::new(logger)
    }
}

impl Logger for EndReconcileEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |end_reconcile_event: &EndReconcileEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                END_RECONCILE,
                secs_since_unix_epoch(end_reconcile_event.timestamp),
                first_seven_base64_chars(&end_reconcile_event.stream_id.bytes()),
                match &end_reconcile_event.last_miniblock {
                    Some(num) => num.to_string(),
                    None => String::from("None"),
                },
                end_reconcile_event.miniblocks_imported
            )
        };
        Box::new(logger)
    }
}

impl Logger for SealEphemeralStreamEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |seal_ephemeral_stream_event: &SealEphemeralStreamEvent| {
            log::info!(
                "{}, {}, {}, {}",
                SEAL_EPHEMERAL_STREAM,
                secs_since_unix_epoch(seal_ephemeral_stream_event.timestamp),
                first_seven_base64_chars(&seal_ephemeral_stream_event.stream_id.bytes()),
                first_seven_base64_chars(&seal_ephemeral_stream_event.genesis.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for AbortUploadEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |abort_upload_event: &AbortUploadEvent| {
            log::info!(
                "{}, {}, {}, {}",
                ABORT_UPLOAD,
                secs_since_unix_epoch(abort_upload_event.timestamp),
                first_seven_base64_chars(&abort_upload_event.stream_id.bytes()),
                first_seven_base64_chars(&abort_upload_event.node.bytes())
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
