/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The single error type surfaced by every component of the crate, and the codes that classify it.
//!
//! ## Error codes
//!
//! Every [`ReplicationError`] carries an [`ErrorCode`]. Codes are what callers (and client SDKs on the other
//! side of the wire) branch on: [`ErrorCode::is_retryable`] separates conditions that may clear up on their own
//! (staleness, quorum failures, deadlines) from terminal ones (bad arguments, permission denials).
//!
//! ## Structured context
//!
//! Errors carry a list of tags (e.g. `stream_id`, `expected`, `observed`, `node`) so that a failure can be
//! diagnosed from the log line alone. Errors produced by a [`QuorumPool`](crate::quorum::QuorumPool) additionally
//! carry the individual task failures as `causes`; [`ReplicationError::is_code_with_causes`] looks through them.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

/// Classification of a [`ReplicationError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub enum ErrorCode {
    /// The replica has not yet observed the miniblock an event refers to.
    BadBlockNumber,
    /// A miniblock proposal or candidate refers to a block the replica has not reached.
    MiniblockTooNew,
    /// A miniblock proposal or candidate is for a generation the replica has already passed.
    MiniblockTooOld,
    /// The previous-miniblock hash does not match the replica's chain.
    BadPrevMiniblockHash,
    /// Not enough replicas acknowledged an operation.
    QuorumFailed,
    AlreadyExists,
    PermissionDenied,
    InvalidArgument,
    NotFound,
    DeadlineExceeded,
    /// A peer could not be reached.
    Unavailable,
    Internal,
}

impl ErrorCode {
    /// Whether a caller may reasonably retry the operation that failed with this code.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::BadBlockNumber
                | ErrorCode::MiniblockTooNew
                | ErrorCode::MiniblockTooOld
                | ErrorCode::BadPrevMiniblockHash
                | ErrorCode::QuorumFailed
                | ErrorCode::DeadlineExceeded
                | ErrorCode::Unavailable
        )
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadBlockNumber => "BAD_BLOCK_NUMBER",
            ErrorCode::MiniblockTooNew => "MINIBLOCK_TOO_NEW",
            ErrorCode::MiniblockTooOld => "MINIBLOCK_TOO_OLD",
            ErrorCode::BadPrevMiniblockHash => "BAD_PREV_MINIBLOCK_HASH",
            ErrorCode::QuorumFailed => "QUORUM_FAILED",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error with a code, a human readable message, structured tags, and (for aggregated failures) the
/// underlying errors that caused it.
#[derive(Clone, Debug, Error)]
#[error("{code}: {message}{}", render_tags(.tags))]
pub struct ReplicationError {
    pub code: ErrorCode,
    pub message: String,
    pub tags: Vec<(String, String)>,
    pub causes: Vec<ReplicationError>,
}

// Borsh impls are written by hand because the derive's field-type bounds recurse on the
// self-referential `causes` field. Encoding matches the derive: fields in declaration order.
impl BorshSerialize for ReplicationError {
    fn serialize<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
        BorshSerialize::serialize(&self.code, writer)?;
        BorshSerialize::serialize(&self.message, writer)?;
        BorshSerialize::serialize(&self.tags, writer)?;
        BorshSerialize::serialize(&self.causes, writer)
    }
}

impl BorshDeserialize for ReplicationError {
    fn deserialize_reader<R: std::io::Read>(reader: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            code: BorshDeserialize::deserialize_reader(reader)?,
            message: BorshDeserialize::deserialize_reader(reader)?,
            tags: BorshDeserialize::deserialize_reader(reader)?,
            causes: BorshDeserialize::deserialize_reader(reader)?,
        })
    }
}

impl ReplicationError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            tags: Vec::new(),
            causes: Vec::new(),
        }
    }

    /// Attach a key-value pair of diagnostic context.
    pub fn tag(mut self, key: &str, value: impl Display) -> Self {
        self.tags.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_cause(mut self, cause: ReplicationError) -> Self {
        self.causes.push(cause);
        self
    }

    pub fn with_causes(mut self, causes: impl IntoIterator<Item = ReplicationError>) -> Self {
        self.causes.extend(causes);
        self
    }

    pub fn is_code(&self, code: ErrorCode) -> bool {
        self.code == code
    }

    /// Whether this error, or any error in its cause tree, has the given code.
    pub fn is_code_with_causes(&self, code: ErrorCode) -> bool {
        self.code == code || self.causes.iter().any(|cause| cause.is_code_with_causes(code))
    }

    /// Get the value of the first tag with the given key.
    pub fn get_tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }
}

fn render_tags(tags: &[(String, String)]) -> String {
    if tags.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!(" [{}]", rendered.join(", "))
}
