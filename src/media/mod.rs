/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Media streams: multi-chunk uploads that are written into an ephemeral stream on every node and
//! sealed into a regular stream once the last chunk arrived.
//!
//! - [`coordinator`]: the client-facing side. Validates chunks, fans each chunk out to the stream's
//!   nodes, and drives the seal (or the abort of every node's external upload when the seal fails).
//! - [`upload`]: the per-node side. Writes ephemeral miniblocks and mirrors the chunks into the
//!   optional [`MediaObjectStore`](crate::pluggables::MediaObjectStore) as a multipart upload.
//!
//! ## Numbering
//!
//! The genesis miniblock (number 0) holds the `MediaInception` event. Chunk `i` is the only event of
//! miniblock `i + 1` and part `i + 1` of the external multipart upload, so a stream of `chunk_count`
//! chunks is sealed with miniblocks `0..=chunk_count`.

pub mod coordinator;

pub mod upload;

pub use coordinator::{MediaConfiguration, MediaUploadCoordinator};
pub use upload::EphemeralUploads;
