use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use stream_replication::{
    backoff::{BackoffPolicy, BackoffTracker, Deadline, Sleeper},
    error::{ErrorCode, ReplicationError},
};

mod common;

use common::logging::log_with_context;

/// Records requested sleeps without sleeping.
#[derive(Default)]
struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

fn unavailable() -> ReplicationError {
    ReplicationError::new(ErrorCode::Unavailable, "peer down")
}

/// Tests that delays double between attempts and that the attempt cap gives the error back.
#[test]
fn backoff_doubles_until_attempt_cap_test() {
    // 1. Build a tracker allowing 5 attempts with a 10ms start delay.
    let sleeper = Arc::new(RecordingSleeper::default());
    let mut tracker = BackoffTracker::new(
        BackoffPolicy::doubling(Duration::from_millis(10), 5),
        Arc::clone(&sleeper) as Arc<dyn Sleeper>,
    );
    let deadline = Deadline::after(Duration::from_secs(60));

    // 2. The first 4 failures sleep for 10, 20, 40 and 80ms.
    log_with_context(None, "Failing 4 attempts, expecting doubling delays.");
    for _ in 0..4 {
        tracker.wait(&deadline, unavailable()).unwrap();
    }
    assert_eq!(
        sleeper.sleeps(),
        vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(40),
            Duration::from_millis(80),
        ]
    );

    // 3. The 5th failure hits the cap and returns the error without sleeping.
    let err = tracker.wait(&deadline, unavailable()).unwrap_err();
    assert!(err.is_code(ErrorCode::Unavailable));
    assert_eq!(err.get_tag("attempts"), Some("5"));
    assert_eq!(sleeper.sleeps().len(), 4);
    assert_eq!(tracker.attempts(), 5);
}

/// Tests a policy with a multiplier and divisor that grow delays by one half.
#[test]
fn backoff_fractional_growth_test() {
    let sleeper = Arc::new(RecordingSleeper::default());
    let mut tracker = BackoffTracker::new(
        BackoffPolicy {
            start_delay: Duration::from_millis(100),
            multiplier: 3,
            divisor: 2,
            max_attempts: 10,
        },
        Arc::clone(&sleeper) as Arc<dyn Sleeper>,
    );
    let deadline = Deadline::after(Duration::from_secs(60));

    for _ in 0..3 {
        tracker.wait(&deadline, unavailable()).unwrap();
    }
    assert_eq!(
        sleeper.sleeps(),
        vec![
            Duration::from_millis(100),
            Duration::from_millis(150),
            Duration::from_millis(225),
        ]
    );
    assert_eq!(tracker.next_delay(), Duration::from_micros(337_500));
}

/// Tests that the last sleep is clamped to the time left before the deadline.
#[test]
fn backoff_clamps_to_deadline_test() {
    // 1. A deadline 1s away and a start delay of 10s.
    let sleeper = Arc::new(RecordingSleeper::default());
    let mut tracker = BackoffTracker::new(
        BackoffPolicy::doubling(Duration::from_secs(10), 10),
        Arc::clone(&sleeper) as Arc<dyn Sleeper>,
    );
    let deadline = Deadline::after(Duration::from_secs(1));

    // 2. The failure sleeps at most the remaining second, then gives the error back.
    let err = tracker.wait(&deadline, unavailable()).unwrap_err();
    assert!(err.is_code(ErrorCode::Unavailable));
    assert_eq!(err.get_tag("deadline"), Some("elapsed"));
    let sleeps = sleeper.sleeps();
    assert_eq!(sleeps.len(), 1);
    assert!(sleeps[0] <= Duration::from_secs(1));
    assert!(sleeps[0] > Duration::from_millis(500));
}

/// Tests that an elapsed deadline returns the error without sleeping.
#[test]
fn backoff_elapsed_deadline_test() {
    let sleeper = Arc::new(RecordingSleeper::default());
    let mut tracker = BackoffTracker::new(
        BackoffPolicy::doubling(Duration::from_millis(10), 10),
        Arc::clone(&sleeper) as Arc<dyn Sleeper>,
    );
    let deadline = Deadline::after(Duration::ZERO);

    let err = tracker.wait(&deadline, unavailable()).unwrap_err();
    assert_eq!(err.get_tag("deadline"), Some("elapsed"));
    assert!(sleeper.sleeps().is_empty());
}
