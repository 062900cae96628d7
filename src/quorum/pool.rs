/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The fan-out primitive that every multi-node operation is built on.
//!
//! A [`QuorumPool`] runs one task for the local node (optional) and one task per remote node, each on
//! its own thread, and lets the caller [`wait`](QuorumPool::wait) until enough of them succeeded. What
//! "enough" means is decided by a [`QuorumPolicy`]:
//! - [`QuorumPolicy::Majority`]: `counted / 2 + 1` successes, where `counted` is the number of local and
//!   remote tasks added to the pool.
//! - [`QuorumPolicy::Custom`]: a predicate over the [`Tally`], evaluated every time a task finishes.
//!
//! `wait` returns as soon as the policy is satisfied. Tasks still running at that point are left to
//! finish on their own; their results are recorded but nobody looks at them. `wait` fails with
//! `QUORUM_FAILED` as soon as the policy can no longer be satisfied, and with `DEADLINE_EXCEEDED` when
//! the pool's deadline passes first. Both errors carry every failure observed so far as causes.
//!
//! Tasks may have changed remote state even if the pool as a whole failed, so tasks must be safe to
//! repeat.
//!
//! Sync tasks ([`add_sync_task`](QuorumPool::add_sync_task)) are fire-and-forget: they are not counted,
//! not awaited, and their failures are only logged.

use std::{
    fmt::{self, Display, Formatter},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex},
    thread,
};

use crate::backoff::Deadline;
use crate::error::{ErrorCode, ReplicationError};
use crate::types::basic::NodeAddress;

/// Where a task ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskOrigin {
    Local,
    Remote(NodeAddress),
}

impl Display for TaskOrigin {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TaskOrigin::Local => write!(f, "local"),
            TaskOrigin::Remote(node) => write!(f, "{}", node),
        }
    }
}

/// Outcome of evaluating a [`QuorumPolicy`] against a [`Tally`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuorumCheck {
    Reached,
    Pending,
    /// The quorum can no longer be reached, whatever the outstanding tasks return.
    Unreachable,
}

pub type QuorumPredicate<T> = Box<dyn Fn(&Tally<T>) -> QuorumCheck + Send>;

pub enum QuorumPolicy<T> {
    Majority,
    Custom(QuorumPredicate<T>),
}

impl<T> QuorumPolicy<T> {
    pub fn custom(predicate: impl Fn(&Tally<T>) -> QuorumCheck + Send + 'static) -> QuorumPolicy<T> {
        QuorumPolicy::Custom(Box::new(predicate))
    }

    fn check(&self, tally: &Tally<T>) -> QuorumCheck {
        match self {
            QuorumPolicy::Majority => {
                let required = majority(tally.counted);
                if tally.successes.len() >= required {
                    QuorumCheck::Reached
                } else if tally.failures.len() > tally.counted - required {
                    QuorumCheck::Unreachable
                } else {
                    QuorumCheck::Pending
                }
            }
            QuorumPolicy::Custom(predicate) => match predicate(tally) {
                QuorumCheck::Pending if tally.pending.is_empty() => QuorumCheck::Unreachable,
                check => check,
            },
        }
    }
}

/// Strict majority of `n`.
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// Results recorded so far by the counted tasks of a pool.
pub struct Tally<T> {
    successes: Vec<(TaskOrigin, T)>,
    failures: Vec<(TaskOrigin, ReplicationError)>,
    pending: Vec<TaskOrigin>,
    counted: usize,
}

impl<T> Tally<T> {
    fn new() -> Tally<T> {
        Tally {
            successes: Vec::new(),
            failures: Vec::new(),
            pending: Vec::new(),
            counted: 0,
        }
    }

    pub fn successes(&self) -> &[(TaskOrigin, T)] {
        &self.successes
    }

    pub fn failures(&self) -> &[(TaskOrigin, ReplicationError)] {
        &self.failures
    }

    /// Number of counted tasks that have not finished yet.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Number of tasks that count towards the quorum.
    pub fn counted(&self) -> usize {
        self.counted
    }

    fn record(&mut self, origin: TaskOrigin, result: Result<T, ReplicationError>) {
        if let Some(position) = self.pending.iter().position(|pending| *pending == origin) {
            self.pending.swap_remove(position);
        }
        match result {
            Ok(value) => self.successes.push((origin, value)),
            Err(err) => self.failures.push((origin, err)),
        }
    }

    fn causes(&self) -> Vec<ReplicationError> {
        self.failures
            .iter()
            .map(|(origin, err)| err.clone().tag("node", origin))
            .collect()
    }
}

pub struct QuorumPool<T: Send + 'static> {
    tally: Arc<(Mutex<Tally<T>>, Condvar)>,
    policy: QuorumPolicy<T>,
    deadline: Deadline,
    tags: Vec<(String, String)>,
}

impl<T: Send + 'static> QuorumPool<T> {
    pub fn new(deadline: Deadline, policy: QuorumPolicy<T>) -> QuorumPool<T> {
        QuorumPool {
            tally: Arc::new((Mutex::new(Tally::new()), Condvar::new())),
            policy,
            deadline,
            tags: Vec::new(),
        }
    }

    /// Attach context (method name, stream id, ...) to the errors returned by [`wait`](Self::wait).
    pub fn tag(mut self, key: &str, value: impl Display) -> Self {
        self.tags.push((key.to_string(), value.to_string()));
        self
    }

    pub fn add_local_task(&mut self, task: impl FnOnce() -> Result<T, ReplicationError> + Send + 'static) {
        self.spawn_counted(TaskOrigin::Local, task)
    }

    pub fn add_remote_task(
        &mut self,
        node: NodeAddress,
        task: impl FnOnce() -> Result<T, ReplicationError> + Send + 'static,
    ) {
        self.spawn_counted(TaskOrigin::Remote(node), task)
    }

    /// Run `task` without counting it towards the quorum or waiting for it.
    pub fn add_sync_task(
        &self,
        node: NodeAddress,
        task: impl FnOnce() -> Result<T, ReplicationError> + Send + 'static,
    ) {
        let method = self.tag_value("method").unwrap_or("sync").to_string();
        thread::spawn(move || {
            if let Err(err) = run_task(task) {
                log::debug!("sync task to {} failed: {}: {}", node, method, err);
            }
        });
    }

    /// Block until the quorum is reached, becomes unreachable, or the deadline passes.
    ///
    /// On success, returns the successes recorded up to that point.
    pub fn wait(self) -> Result<Vec<(TaskOrigin, T)>, ReplicationError> {
        let (lock, condvar) = &*self.tally;
        let mut tally = lock
            .lock()
            .map_err(|_| ReplicationError::internal("quorum tally lock poisoned"))?;

        loop {
            if tally.counted == 0 {
                return Ok(Vec::new());
            }
            match self.policy.check(&tally) {
                QuorumCheck::Reached => return Ok(std::mem::take(&mut tally.successes)),
                QuorumCheck::Unreachable => {
                    let err = self
                        .with_tags(ReplicationError::new(ErrorCode::QuorumFailed, "quorum not reached"))
                        .tag("successes", tally.successes.len())
                        .tag("failures", tally.failures.len())
                        .tag("counted", tally.counted)
                        .with_causes(tally.causes());
                    return Err(err);
                }
                QuorumCheck::Pending => (),
            }

            let remaining = self.deadline.remaining();
            if remaining.is_zero() {
                let mut causes = tally.causes();
                causes.extend(tally.pending.iter().map(|origin| {
                    ReplicationError::new(ErrorCode::DeadlineExceeded, "task did not finish before the deadline")
                        .tag("node", origin)
                }));
                let err = self
                    .with_tags(ReplicationError::new(ErrorCode::DeadlineExceeded, "deadline exceeded waiting for quorum"))
                    .tag("successes", tally.successes.len())
                    .tag("failures", tally.failures.len())
                    .tag("counted", tally.counted)
                    .with_causes(causes);
                return Err(err);
            }

            tally = condvar
                .wait_timeout(tally, remaining)
                .map_err(|_| ReplicationError::internal("quorum tally lock poisoned"))?
                .0;
        }
    }

    fn spawn_counted(
        &mut self,
        origin: TaskOrigin,
        task: impl FnOnce() -> Result<T, ReplicationError> + Send + 'static,
    ) {
        match self.tally.0.lock() {
            Ok(mut tally) => {
                tally.counted += 1;
                tally.pending.push(origin);
            }
            Err(_) => {
                log::error!("quorum tally lock poisoned, dropping task for {}", origin);
                return;
            }
        }

        let tally = Arc::clone(&self.tally);
        thread::spawn(move || {
            let result = run_task(task);
            let (lock, condvar) = &*tally;
            if let Ok(mut tally) = lock.lock() {
                tally.record(origin, result);
            }
            condvar.notify_all();
        });
    }

    fn with_tags(&self, mut err: ReplicationError) -> ReplicationError {
        for (key, value) in &self.tags {
            err = err.tag(key, value);
        }
        err
    }

    fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Run a task, turning a panic into an `INTERNAL` failure.
fn run_task<T>(task: impl FnOnce() -> Result<T, ReplicationError>) -> Result<T, ReplicationError> {
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(result) => result,
        Err(_) => Err(ReplicationError::internal("quorum task panicked")),
    }
}
