/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that are used across multiple components of the replicated stream node.
//!
//! Types specific to a single component (e.g., the quorum tally, proposal messages) live in the
//! modules of their components.

pub mod basic;

pub mod cookies;

pub mod crypto_primitives;

pub mod event;

pub mod miniblock;

pub mod records;
