/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Replication of individual events across the nodes of a stream, and the machinery that keeps lagging
//! replicas caught up.
//!
//! - [`event_writer`]: writes an event locally and on a quorum of remote replicas, retrying whole
//!   attempts while replicas report that they are behind.
//! - [`staleness`]: before an event is validated, waits for the local view to reach the miniblock the
//!   event refers to.
//! - [`reconcile`]: the background queue and worker that pull missing miniblocks from peers.

pub mod event_writer;

pub mod reconcile;

pub mod staleness;
