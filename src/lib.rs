/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A node of a replicated stream store.
//!
//! Streams are append-only, hash-chained logs of signed events. Each stream is hosted by an ordered set
//! of nodes chosen by a registry: the first `replication_factor` nodes form its quorum, the rest follow
//! it as sync nodes. Events are written to a majority of the quorum, and periodically sealed into
//! miniblocks agreed on by the quorum. Media streams are uploaded chunk by chunk into ephemeral storage
//! and sealed into regular streams once complete.
//!
//! Start with [`node`] to build and run a node.

pub mod backoff;

pub mod config;

pub mod consensus;

pub mod error;

pub(crate) mod event_bus;

pub mod events;

pub mod logging;

pub mod media;

pub mod networking;

pub mod node;

pub mod pluggables;

pub mod quorum;

pub mod replication;

pub mod service;

pub mod storage;

pub mod types;
