/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The user-facing [`Configuration`] of a node, and its split into per-component configurations.
//!
//! Only the node's keypair and the `log_events` flag have to be set; every tunable has a default that
//! suits a small test cluster:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .me(signing_key)
//!     .operation_timeout(Duration::from_secs(5))
//!     .snapshot_interval(100)
//!     .log_events(true)
//!     .build()
//! ```

use std::time::Duration;

use ed25519_dalek::SigningKey;
use typed_builder::TypedBuilder;

use crate::backoff::BackoffPolicy;
use crate::consensus::producer::ConsensusConfiguration;
use crate::media::coordinator::MediaConfiguration;
use crate::replication::{
    event_writer::WriterConfiguration, reconcile::ReconcileWorkerConfiguration,
    staleness::ReconcilerConfiguration,
};
use crate::types::crypto_primitives::Keypair;

/// Stores the user-defined parameters required to start a node.
///
/// ## Timeouts
///
/// `operation_timeout` bounds every client-facing operation (stream creation, event writes including
/// their retries, media chunk ingestion and seal). The staleness wait before a write has its own bound,
/// `reconcile_timeout`, and is not counted against it.
///
/// ## Log Events
///
/// The node logs using the [log](https://docs.rs/log/latest/log/) crate. If `log_events` is set, every
/// [event](crate::events) is also printed as a CSV line by the handlers in [`logging`](crate::logging).
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`
    - `.log_events(...)`

    Optional (with defaults):
    - `.operation_timeout(...)`
    - `.write_start_delay(...)`, `.write_max_attempts(...)`
    - `.reconcile_start_delay(...)`, `.reconcile_max_attempts(...)`, `.reconcile_timeout(...)`, `.reconcile_after_attempts(...)`
    - `.proposal_timeout(...)`, `.candidate_timeout(...)`
    - `.max_events_per_miniblock(...)`, `.max_event_bytes_per_miniblock(...)`, `.snapshot_interval(...)`
    - `.max_chunk_size(...)`
    - `.reconcile_batch_size(...)`, `.reconcile_poll_interval(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the node's keypair. Its verifying key is the node's address, and derived events are signed with it. Required."))]
    pub me: SigningKey,
    #[builder(default = Duration::from_secs(10), setter(doc = "Set the deadline of client-facing operations. Optional."))]
    pub operation_timeout: Duration,
    #[builder(default = Duration::from_millis(20), setter(doc = "Set the first delay between attempts of a replicated write. Optional."))]
    pub write_start_delay: Duration,
    #[builder(default = 8, setter(doc = "Set the maximum number of attempts of a replicated write. Optional."))]
    pub write_max_attempts: u32,
    #[builder(default = Duration::from_millis(100), setter(doc = "Set the first delay between polls of the local view while waiting for it to catch up. Optional."))]
    pub reconcile_start_delay: Duration,
    #[builder(default = 10, setter(doc = "Set the maximum number of polls of the local view while waiting for it to catch up. Optional."))]
    pub reconcile_max_attempts: u32,
    #[builder(default = Duration::from_secs(5), setter(doc = "Set how long to wait for the local view to catch up before failing with `BAD_BLOCK_NUMBER`. Optional."))]
    pub reconcile_timeout: Duration,
    #[builder(default = 5, setter(doc = "Set after how many unsuccessful polls a background reconciliation is requested. Optional."))]
    pub reconcile_after_attempts: u32,
    #[builder(default = Duration::from_secs(5), setter(doc = "Set the deadline for collecting miniblock proposals. Optional."))]
    pub proposal_timeout: Duration,
    #[builder(default = Duration::from_secs(5), setter(doc = "Set the deadline for saving a miniblock candidate on the replicas. Optional."))]
    pub candidate_timeout: Duration,
    #[builder(default = 1000, setter(doc = "Set the maximum number of events sealed into one miniblock. Optional."))]
    pub max_events_per_miniblock: usize,
    #[builder(default = 8 * 1024 * 1024, setter(doc = "Set the maximum total encoded size of the events sealed into one miniblock. Optional."))]
    pub max_event_bytes_per_miniblock: usize,
    #[builder(default = 100, setter(doc = "Set the number of miniblocks after which a replica votes for a snapshot. Optional."))]
    pub snapshot_interval: u64,
    #[builder(default = 1024 * 1024, setter(doc = "Set the maximum size of the data of one media chunk. Optional."))]
    pub max_chunk_size: usize,
    #[builder(default = 32, setter(doc = "Set the number of miniblocks requested from a peer at once during reconciliation. Optional."))]
    pub reconcile_batch_size: u64,
    #[builder(default = Duration::from_millis(50), setter(doc = "Set how often the reconciliation worker checks for shutdown while idle. Optional."))]
    pub reconcile_poll_interval: Duration,
    #[builder(setter(doc = "Enable logging of events? Required."))]
    pub log_events: bool,
}

impl
    Into<(
        Keypair,
        WriterConfiguration,
        ReconcilerConfiguration,
        ReconcileWorkerConfiguration,
        ConsensusConfiguration,
        MediaConfiguration,
    )> for Configuration
{
    fn into(
        self,
    ) -> (
        Keypair,
        WriterConfiguration,
        ReconcilerConfiguration,
        ReconcileWorkerConfiguration,
        ConsensusConfiguration,
        MediaConfiguration,
    ) {
        let keypair = Keypair::new(self.me);
        let writer_config = WriterConfiguration {
            backoff: BackoffPolicy::doubling(self.write_start_delay, self.write_max_attempts),
            timeout: self.operation_timeout,
        };
        let reconciler_config = ReconcilerConfiguration {
            backoff: BackoffPolicy::doubling(self.reconcile_start_delay, self.reconcile_max_attempts),
            timeout: self.reconcile_timeout,
            reconcile_after_attempts: self.reconcile_after_attempts,
        };
        let reconcile_worker_config = ReconcileWorkerConfiguration {
            batch_size: self.reconcile_batch_size.max(1),
            poll_interval: self.reconcile_poll_interval,
        };
        let consensus_config = ConsensusConfiguration {
            proposal_timeout: self.proposal_timeout,
            candidate_timeout: self.candidate_timeout,
            max_events_per_miniblock: self.max_events_per_miniblock,
            max_event_bytes_per_miniblock: self.max_event_bytes_per_miniblock,
            snapshot_interval: self.snapshot_interval,
        };
        let media_config = MediaConfiguration {
            max_chunk_size: self.max_chunk_size,
            operation_timeout: self.operation_timeout,
        };
        (
            keypair,
            writer_config,
            reconciler_config,
            reconcile_worker_config,
            consensus_config,
            media_config,
        )
    }
}
