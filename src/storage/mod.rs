/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Persistent state of the streams a node hosts.
//!
//! The user provides a raw key-value store by implementing [`KVStore`] and [`WriteBatch`]. The
//! [`StreamStore`] owns everything above that: the key layout ([`paths`]), Borsh encoding of the stored
//! values, and validation of every write against the local chain.

pub mod kv_store;

pub mod paths;

pub mod stream_store;

pub mod view;

pub mod write_batch;

pub use kv_store::{KVGet, KVStore};
pub use stream_store::{Promotion, StreamStore};
pub use view::StreamView;
pub use write_batch::WriteBatch;
