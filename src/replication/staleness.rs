/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Waiting for the local view of a stream to reach a miniblock referenced by an incoming event.
//!
//! An event can only be validated against the miniblock it refers to. When the local node has not
//! applied that miniblock yet, it is usually only a moment behind: the registry has finalized the
//! block and promotion on this node is in flight. [`StalenessReconciler::ensure_up_to_date`] polls the
//! local view with a backoff for that moment, and if the lag persists for
//! `reconcile_after_attempts` polls, asks the [`ReconcileScheduler`] to pull the missing miniblocks
//! from peers while it keeps polling.

use std::sync::Arc;
use std::time::Duration;

use crate::backoff::{BackoffPolicy, BackoffTracker, Deadline, Sleeper};
use crate::error::{ErrorCode, ReplicationError};
use crate::pluggables::{ReconcileScheduler, ReconcileTask};
use crate::storage::{KVStore, StreamStore, StreamView};
use crate::types::basic::{MiniblockRef, StreamId};

#[derive(Clone, Copy, Debug)]
pub struct ReconcilerConfiguration {
    pub backoff: BackoffPolicy,
    pub timeout: Duration,
    pub reconcile_after_attempts: u32,
}

#[derive(Clone)]
pub struct StalenessReconciler<K: KVStore> {
    config: ReconcilerConfiguration,
    store: StreamStore<K>,
    scheduler: Arc<dyn ReconcileScheduler>,
    sleeper: Arc<dyn Sleeper>,
}

impl<K: KVStore> StalenessReconciler<K> {
    pub(crate) fn new(
        config: ReconcilerConfiguration,
        store: StreamStore<K>,
        scheduler: Arc<dyn ReconcileScheduler>,
        sleeper: Arc<dyn Sleeper>,
    ) -> StalenessReconciler<K> {
        StalenessReconciler {
            config,
            store,
            scheduler,
            sleeper,
        }
    }

    /// Return the local view of `stream_id` once it has applied miniblock `target.num`.
    ///
    /// Fails with `BAD_BLOCK_NUMBER`, tagged with the `expected` and `observed` miniblock numbers, if the
    /// view does not get there before the attempts or the timeout run out. A stream that does not exist
    /// locally yet is treated as lagging.
    pub fn ensure_up_to_date(&self, stream_id: &StreamId, target: &MiniblockRef) -> Result<StreamView, ReplicationError> {
        let deadline = Deadline::after(self.config.timeout);
        let mut backoff = BackoffTracker::new(self.config.backoff, Arc::clone(&self.sleeper));
        let mut submitted = false;

        loop {
            let observed = match self.store.view(stream_id)? {
                Some(view) if view.last_block.num >= target.num => return Ok(view),
                Some(view) => view.last_block.num.to_string(),
                None => String::from("none"),
            };

            let err = ReplicationError::new(ErrorCode::BadBlockNumber, "local view is behind the referenced miniblock")
                .tag("stream_id", stream_id)
                .tag("expected", target.num)
                .tag("observed", observed);

            if !submitted && backoff.attempts() + 1 >= self.config.reconcile_after_attempts {
                self.submit(stream_id, target);
                submitted = true;
            }
            if let Err(err) = backoff.wait(&deadline, err) {
                if !submitted {
                    self.submit(stream_id, target);
                }
                return Err(err);
            }
        }
    }

    fn submit(&self, stream_id: &StreamId, target: &MiniblockRef) {
        log::debug!("stream {} is behind {}, requesting reconciliation", stream_id, target);
        self.scheduler.submit(ReconcileTask {
            stream_id: *stream_id,
            target: Some(*target),
        });
    }
}
