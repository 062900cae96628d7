/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Bounded exponential backoff for retry loops.
//!
//! A retry loop owns one [`BackoffTracker`] for its whole lifetime. After every failed attempt the loop
//! calls [`BackoffTracker::wait`] with the error it observed; `wait` either sleeps and returns `Ok(())`
//! (try again), or gives the error back (stop retrying) when the attempt cap is hit or the loop's
//! [`Deadline`] has passed. Delays grow as `delay * multiplier / divisor` and never exceed the time
//! left before the deadline.
//!
//! Sleeping goes through the [`Sleeper`] trait so that tests can observe delays without waiting for them.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crate::error::ReplicationError;

/// A point in time after which an operation should stop waiting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn new(instant: Instant) -> Deadline {
        Deadline(instant)
    }

    pub fn after(duration: Duration) -> Deadline {
        Deadline(Instant::now() + duration)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    /// Time left before the deadline, zero if it has passed.
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.0
    }

    /// The earlier of the two deadlines.
    pub fn min(self, other: Deadline) -> Deadline {
        if self.0 <= other.0 {
            self
        } else {
            other
        }
    }
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration)
    }
}

/// Parameters of a [`BackoffTracker`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub start_delay: Duration,
    pub multiplier: u32,
    pub divisor: u32,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Doubling delays starting at `start_delay`.
    pub fn doubling(start_delay: Duration, max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            start_delay,
            multiplier: 2,
            divisor: 1,
            max_attempts,
        }
    }
}

pub struct BackoffTracker {
    next_delay: Duration,
    multiplier: u32,
    divisor: u32,
    max_attempts: u32,
    attempts: u32,
    sleeper: Arc<dyn Sleeper>,
}

impl BackoffTracker {
    pub fn new(policy: BackoffPolicy, sleeper: Arc<dyn Sleeper>) -> BackoffTracker {
        BackoffTracker {
            next_delay: policy.start_delay,
            multiplier: policy.multiplier,
            divisor: policy.divisor.max(1),
            max_attempts: policy.max_attempts,
            attempts: 0,
            sleeper,
        }
    }

    /// Number of times [`wait`](Self::wait) has been called.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The delay the next call to [`wait`](Self::wait) would sleep for, before clamping to the deadline.
    pub fn next_delay(&self) -> Duration {
        self.next_delay
    }

    /// Record a failed attempt that ended with `err` and sleep before the next one.
    ///
    /// Returns `err` back, tagged with the number of attempts, when the attempt cap is reached or when the
    /// deadline passes before the next attempt could start.
    pub fn wait(&mut self, deadline: &Deadline, err: ReplicationError) -> Result<(), ReplicationError> {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return Err(err.tag("attempts", self.attempts));
        }

        let remaining = deadline.remaining();
        if remaining <= self.next_delay {
            if !remaining.is_zero() {
                self.sleeper.sleep(remaining);
            }
            return Err(err.tag("attempts", self.attempts).tag("deadline", "elapsed"));
        }

        self.sleeper.sleep(self.next_delay);
        self.next_delay = self.next_delay * self.multiplier / self.divisor;
        Ok(())
    }
}
