/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable peer-to-peer (P2P) networking.

pub mod client;

pub mod messages;

pub mod network;

pub use client::RemoteClient;
pub use network::{Network, RequestHandler};
