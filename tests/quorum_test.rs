use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use stream_replication::{
    backoff::Deadline,
    error::{ErrorCode, ReplicationError},
    quorum::{QuorumCheck, QuorumPolicy, QuorumPool, StreamNodeSet, Tally, TaskOrigin},
    types::basic::NodeAddress,
};

mod common;

use common::logging::log_with_context;

fn addresses(n: usize) -> Vec<NodeAddress> {
    (0..n)
        .map(|_| NodeAddress::from(&SigningKey::generate(&mut OsRng).verifying_key()))
        .collect()
}

fn unavailable() -> ReplicationError {
    ReplicationError::new(ErrorCode::Unavailable, "peer down")
}

/// Tests that a majority of successes is enough, even when the other tasks fail.
#[test]
fn majority_with_failures_test() {
    // 1. Local and two remotes succeed, two remotes fail.
    let nodes = addresses(5);
    let mut pool = QuorumPool::new(Deadline::after(Duration::from_secs(5)), QuorumPolicy::Majority);
    pool.add_local_task(|| Ok(1));
    pool.add_remote_task(nodes[1], || Ok(2));
    pool.add_remote_task(nodes[2], || Ok(3));
    pool.add_remote_task(nodes[3], || Err(unavailable()));
    pool.add_remote_task(nodes[4], || Err(unavailable()));

    // 2. 3 of 5 is a majority.
    log_with_context(None, "Waiting for a majority of 5 tasks, 2 of which fail.");
    let successes = pool.wait().unwrap();
    assert!(successes.len() >= 3);
    assert!(successes.iter().any(|(origin, _)| *origin == TaskOrigin::Local));
}

/// Tests that an unreachable majority fails with `QUORUM_FAILED` carrying one tagged cause per failure.
#[test]
fn quorum_failed_causes_test() {
    let nodes = addresses(3);
    let mut pool = QuorumPool::<()>::new(Deadline::after(Duration::from_secs(5)), QuorumPolicy::Majority)
        .tag("method", "Test");
    pool.add_local_task(|| Ok(()));
    pool.add_remote_task(nodes[1], || Err(unavailable()));
    pool.add_remote_task(nodes[2], || Err(ReplicationError::new(ErrorCode::NotFound, "no such stream")));

    let err = pool.wait().unwrap_err();
    assert!(err.is_code(ErrorCode::QuorumFailed));
    assert_eq!(err.get_tag("method"), Some("Test"));
    assert_eq!(err.causes.len(), 2);
    assert!(err.is_code_with_causes(ErrorCode::NotFound));

    let tagged: HashSet<String> = err
        .causes
        .iter()
        .filter_map(|cause| cause.get_tag("node").map(str::to_string))
        .collect();
    let expected: HashSet<String> = nodes[1..].iter().map(|node| node.to_string()).collect();
    assert_eq!(tagged, expected);
}

/// Tests that the pool returns as soon as the majority is reached, without waiting for slow tasks.
#[test]
fn majority_does_not_wait_for_stragglers_test() {
    let nodes = addresses(3);
    let mut pool = QuorumPool::new(Deadline::after(Duration::from_secs(5)), QuorumPolicy::Majority);
    pool.add_local_task(|| Ok(()));
    pool.add_remote_task(nodes[1], || Ok(()));
    pool.add_remote_task(nodes[2], || {
        thread::sleep(Duration::from_secs(3));
        Ok(())
    });

    let start = Instant::now();
    pool.wait().unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
}

/// Tests that a custom predicate decides when the pool is done.
#[test]
fn custom_policy_test() {
    // 1. Require all three tasks to return the same value.
    let nodes = addresses(3);
    let policy = QuorumPolicy::custom(|tally: &Tally<u8>| {
        if !tally.failures().is_empty() {
            return QuorumCheck::Unreachable;
        }
        let values: HashSet<u8> = tally.successes().iter().map(|(_, value)| *value).collect();
        if values.len() > 1 {
            QuorumCheck::Unreachable
        } else if tally.successes().len() == tally.counted() {
            QuorumCheck::Reached
        } else {
            QuorumCheck::Pending
        }
    });

    // 2. Agreeing tasks reach the quorum.
    let mut pool = QuorumPool::new(Deadline::after(Duration::from_secs(5)), policy);
    pool.add_local_task(|| Ok(7u8));
    pool.add_remote_task(nodes[1], || Ok(7));
    pool.add_remote_task(nodes[2], || Ok(7));
    assert_eq!(pool.wait().unwrap().len(), 3);

    // 3. A disagreeing task makes it unreachable.
    let policy = QuorumPolicy::custom(|tally: &Tally<u8>| {
        let values: HashSet<u8> = tally.successes().iter().map(|(_, value)| *value).collect();
        if values.len() > 1 {
            QuorumCheck::Unreachable
        } else if tally.successes().len() == tally.counted() {
            QuorumCheck::Reached
        } else {
            QuorumCheck::Pending
        }
    });
    let mut pool = QuorumPool::new(Deadline::after(Duration::from_secs(5)), policy);
    pool.add_local_task(|| Ok(7u8));
    pool.add_remote_task(nodes[1], || Ok(8));
    assert!(pool.wait().unwrap_err().is_code(ErrorCode::QuorumFailed));
}

/// Tests that tasks still running at the deadline are reported as `DEADLINE_EXCEEDED` causes.
#[test]
fn deadline_exceeded_test() {
    let nodes = addresses(3);
    let mut pool = QuorumPool::new(Deadline::after(Duration::from_millis(200)), QuorumPolicy::Majority);
    pool.add_local_task(|| Ok(()));
    for node in &nodes[1..] {
        pool.add_remote_task(*node, || {
            thread::sleep(Duration::from_secs(2));
            Ok(())
        });
    }

    let err = pool.wait().unwrap_err();
    assert!(err.is_code(ErrorCode::DeadlineExceeded));
    assert_eq!(err.causes.len(), 2);
    assert!(err
        .causes
        .iter()
        .all(|cause| cause.is_code(ErrorCode::DeadlineExceeded)));
}

/// Tests that sync tasks run but are neither counted nor awaited.
#[test]
fn sync_tasks_not_counted_test() {
    let nodes = addresses(2);
    let ran = Arc::new(AtomicBool::new(false));

    let mut pool = QuorumPool::new(Deadline::after(Duration::from_secs(5)), QuorumPolicy::Majority);
    pool.add_local_task(|| Ok(()));
    {
        let ran = Arc::clone(&ran);
        pool.add_sync_task(nodes[1], move || {
            thread::sleep(Duration::from_millis(100));
            ran.store(true, Ordering::SeqCst);
            Err(unavailable())
        });
    }

    // 1. The local task alone is a majority of one counted task.
    let successes = pool.wait().unwrap();
    assert_eq!(successes.len(), 1);

    // 2. The sync task still ran to completion.
    assert!(common::cluster::wait_until(Duration::from_secs(2), || ran.load(Ordering::SeqCst)));

    // 3. A pool of only sync tasks returns immediately.
    let pool = QuorumPool::<()>::new(Deadline::after(Duration::from_secs(5)), QuorumPolicy::Majority);
    pool.add_sync_task(nodes[0], || Ok(()));
    assert!(pool.wait().unwrap().is_empty());
}

/// Tests a panicking task is recorded as an `INTERNAL` failure.
#[test]
fn panicking_task_test() {
    // 1. A policy that only decides once every task has finished, so no failure is left out.
    let nodes = addresses(3);
    let all_finished = |tally: &Tally<()>| {
        if tally.outstanding() > 0 {
            QuorumCheck::Pending
        } else if tally.failures().is_empty() {
            QuorumCheck::Reached
        } else {
            QuorumCheck::Unreachable
        }
    };
    let mut pool = QuorumPool::<()>::new(Deadline::after(Duration::from_secs(5)), QuorumPolicy::custom(all_finished));

    // 2. The local task panics, one remote fails and one succeeds after a while.
    pool.add_local_task(|| panic!("boom"));
    pool.add_remote_task(nodes[1], || Err(unavailable()));
    pool.add_remote_task(nodes[2], || {
        thread::sleep(Duration::from_millis(50));
        Ok(())
    });

    // 3. The panic is one of the causes, next to the remote failure.
    let err = pool.wait().unwrap_err();
    assert!(err.is_code(ErrorCode::QuorumFailed));
    assert!(err.is_code_with_causes(ErrorCode::Internal));
    assert!(err.is_code_with_causes(ErrorCode::Unavailable));
    assert_eq!(err.get_tag("failures"), Some("2"));
    assert_eq!(err.get_tag("successes"), Some("1"));
}

/// Tests how a stream's node list splits into quorum and sync nodes.
#[test]
fn stream_node_set_test() {
    // 1. Five nodes, replication factor 3.
    let nodes = addresses(5);

    // 1.1. Seen from a quorum node.
    let set = StreamNodeSet::new(nodes.clone(), 3, nodes[1]).unwrap();
    assert_eq!(set.quorum_nodes(), &nodes[..3]);
    assert_eq!(set.remote_quorum_nodes(), vec![nodes[0], nodes[2]]);
    assert_eq!(set.sync_nodes(), nodes[3..].to_vec());
    assert_eq!(set.remote_nodes().len(), 4);
    assert!(set.local_is_replica());
    assert!(set.local_in_quorum());
    assert!(!set.local_in_sync());
    assert_eq!(set.total_quorum_num(), 2);
    assert_eq!(set.remote_quorum_num(), 1);

    // 1.2. Seen from a sync node.
    let set = StreamNodeSet::new(nodes.clone(), 3, nodes[4]).unwrap();
    assert!(set.local_in_sync());
    assert!(!set.local_in_quorum());
    assert_eq!(set.remote_quorum_nodes(), nodes[..3].to_vec());
    assert_eq!(set.sync_nodes(), vec![nodes[3]]);
    assert_eq!(set.remote_quorum_num(), 2);

    // 1.3. Seen from an outsider.
    let outsider = addresses(1)[0];
    let set = StreamNodeSet::new(nodes.clone(), 3, outsider).unwrap();
    assert!(!set.local_is_replica());
    assert_eq!(set.remote_nodes(), nodes);

    // 2. The sticky peer is a remote quorum node, and advancing it cycles through all of them.
    let mut set = StreamNodeSet::new(nodes.clone(), 3, nodes[0]).unwrap();
    let first = set.sticky_peer().unwrap();
    assert!(nodes[1..3].contains(&first));
    let second = set.advance_sticky_peer().unwrap();
    assert_ne!(first, second);
    assert!(nodes[1..3].contains(&second));
    assert_eq!(set.advance_sticky_peer(), Some(first));

    // 3. A single-node stream has no sticky peer.
    let set = StreamNodeSet::new(vec![nodes[0]], 1, nodes[0]).unwrap();
    assert_eq!(set.sticky_peer(), None);
    assert_eq!(set.total_quorum_num(), 1);
    assert_eq!(set.remote_quorum_num(), 0);
}

/// Tests that a replication factor larger than the node list is clamped and invalid lists are rejected.
#[test]
fn stream_node_set_validation_test() {
    let nodes = addresses(3);

    // 1. Clamping.
    let set = StreamNodeSet::new(nodes.clone(), 5, nodes[0]).unwrap();
    assert_eq!(set.replication_factor(), 3);
    assert!(set.sync_nodes().is_empty());

    // 2. Rejections.
    assert!(StreamNodeSet::new(Vec::new(), 1, nodes[0])
        .unwrap_err()
        .is_code(ErrorCode::InvalidArgument));
    assert!(StreamNodeSet::new(nodes.clone(), 0, nodes[0])
        .unwrap_err()
        .is_code(ErrorCode::InvalidArgument));
    assert!(StreamNodeSet::new(vec![nodes[0], nodes[1], nodes[0]], 2, nodes[0])
        .unwrap_err()
        .is_code(ErrorCode::InvalidArgument));
}
