/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Sealing the events of a stream's minipool into the next miniblock.
//!
//! ## Protocol
//!
//! A miniblock moves through four states: `Minipool-Open → Proposed → CandidateSaved → Finalized`.
//! 1. **Propose**: the producing node asks every quorum node (itself included) for a
//!    [proposal](crate::networking::messages::MiniblockProposal) for the next miniblock number. Replicas
//!    that are on a different generation refuse, and a majority of proposals is required to go on.
//! 2. **Combine**: the events that appear in at least a quorum of proposals are packed into a candidate
//!    that references the producer's last miniblock.
//! 3. **Save candidate**: the candidate is stored on a majority of the quorum nodes. Replicas check that
//!    it extends their chain.
//! 4. **Finalize**: the producer compare-and-sets the stream's last miniblock in the
//!    [registry](crate::pluggables::StreamRegistry). The registry is the tie-breaker between concurrent
//!    producers: a lost compare-and-set means another candidate won, and is not an error.
//! 5. **Promote**: every replica that learns about the finalization applies the stored candidate to its
//!    chain and drops the included events from its minipool. Replicas missing the candidate or earlier
//!    miniblocks schedule a reconciliation instead.

pub mod producer;

pub mod proposal;

pub use producer::{MiniblockProducer, ProduceOutcome};
