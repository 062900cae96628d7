use std::{collections::HashSet, time::Duration};

use log::LevelFilter;
use stream_replication::{
    consensus::{
        proposal::{combine_proposals, Combination},
        ProduceOutcome,
    },
    error::ErrorCode,
    networking::messages::MiniblockProposal,
    pluggables::StreamRegistry,
    storage::Promotion,
    types::{
        basic::{CryptoHash, MiniblockNum, MiniblockRef},
        event::Envelope,
    },
};

mod common;

use common::{
    cluster::{wait_until, ClusterBuilder},
    fixtures::{channel_id, Client},
    logging::{log_with_context, setup_logger},
};

fn proposal(events: &[&Envelope], should_snapshot: bool) -> MiniblockProposal {
    MiniblockProposal {
        new_miniblock_num: MiniblockNum::new(1),
        prev_miniblock_hash: CryptoHash::zero(),
        event_hashes: events.iter().map(|event| event.hash).collect(),
        should_snapshot,
    }
}

/// Tests which events and snapshot votes make it into a candidate.
#[test]
fn combine_proposals_test() {
    let client = Client::new();
    let prev = MiniblockRef::default();
    let a = client.message(prev, "a");
    let b = client.message(prev, "b");
    let c = client.message(prev, "c");
    let minipool = vec![a.clone(), b.clone(), c.clone()];

    // 1. Only events in a quorum (2) of proposals are taken, in order of first appearance.
    let proposals = vec![
        proposal(&[&b, &a], true),
        proposal(&[&a, &b, &c], false),
        proposal(&[&c], false),
    ];
    let combination = combine_proposals(&proposals, 2, &minipool, 100, usize::MAX);
    assert_eq!(
        combination,
        Combination {
            events: vec![b.clone(), a.clone(), c.clone()],
            snapshot: false,
        }
    );
    let combination = combine_proposals(&proposals, 3, &minipool, 100, usize::MAX);
    assert!(combination.events.is_empty());

    // 2. A proposal that lists an event twice votes for it once.
    let proposals = vec![proposal(&[&a, &a], true), proposal(&[&b], true)];
    let combination = combine_proposals(&proposals, 2, &minipool, 100, usize::MAX);
    assert!(combination.events.is_empty());
    assert!(combination.snapshot);

    // 3. Events the caller does not have are skipped.
    let proposals = vec![proposal(&[&a, &b], false), proposal(&[&a, &b], false)];
    let combination = combine_proposals(&proposals, 2, &[b.clone()], 100, usize::MAX);
    assert_eq!(combination.events, vec![b.clone()]);

    // 4. The event count and size caps cut the candidate short.
    let proposals = vec![proposal(&[&a, &b, &c], false), proposal(&[&a, &b, &c], false)];
    let combination = combine_proposals(&proposals, 2, &minipool, 2, usize::MAX);
    assert_eq!(combination.events, vec![a.clone(), b.clone()]);

    let two_events = a.encoded_len() + b.encoded_len();
    let combination = combine_proposals(&proposals, 2, &minipool, 100, two_events);
    assert_eq!(combination.events, vec![a.clone(), b.clone()]);

    // 4.1. A single event larger than the size cap is still taken on its own.
    let combination = combine_proposals(&proposals, 2, &minipool, 100, 1);
    assert_eq!(combination.events, vec![a]);
}

/// Tests producing miniblocks: every replica promotes the candidate and clears the sealed events from
/// its minipool.
#[test]
fn produce_and_promote_test() {
    setup_logger(LevelFilter::Info);

    // 1. 4 nodes, replication factor 3.
    let cluster = ClusterBuilder::new(4, 4, 3).build();
    let client = Client::new();
    let stream_id = channel_id(1);
    let (created, _) = cluster.nodes[0]
        .create_stream(&stream_id, &[client.inception(stream_id)])
        .unwrap();
    let genesis = created.miniblocks[0].reference();

    // 2. Nothing to seal yet.
    assert_eq!(
        cluster.nodes[0].produce_miniblock(&stream_id, false).unwrap(),
        ProduceOutcome::NothingToDo
    );

    // 3. Write 3 events and wait until every quorum replica has them.
    let events: Vec<Envelope> = (0..3).map(|i| client.message(genesis, &format!("event {}", i))).collect();
    for event in &events {
        cluster.nodes[1].add_event(&stream_id, event).unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || {
        (0..3).all(|node| cluster.nodes[node].get_view(&stream_id).unwrap().minipool.len() == 3)
    }));

    // 4. Produce miniblock 1 through node 2.
    log_with_context(Some(cluster.address(2)), "Producing miniblock 1.");
    let block_1 = match cluster.nodes[2].produce_miniblock(&stream_id, false).unwrap() {
        ProduceOutcome::Produced(reference) => reference,
        outcome => panic!("unexpected outcome {:?}", outcome),
    };
    assert_eq!(block_1.num, MiniblockNum::new(1));
    assert_eq!(cluster.registry.record(&stream_id).unwrap().last_miniblock, block_1);

    // 4.1. All nodes, including the sync node, apply it and clear their minipools.
    assert!(wait_until(Duration::from_secs(5), || {
        cluster.nodes.iter().all(|node| {
            let view = node.get_view(&stream_id).unwrap();
            view.last_block == block_1 && view.minipool.is_empty()
        })
    }));

    // 4.2. Each replica stores the same miniblock, sealing all 3 events.
    let written: HashSet<CryptoHash> = events.iter().map(|event| event.hash).collect();
    for node in &cluster.nodes {
        let miniblock = node.store().miniblock(&stream_id, block_1.num).unwrap().unwrap();
        assert_eq!(miniblock.hash, block_1.hash);
        assert_eq!(miniblock.prev_hash(), genesis.hash);
        assert_eq!(miniblock.header.event_hashes.iter().copied().collect::<HashSet<_>>(), written);
    }

    // 4.3. Reporting the finalization again is harmless.
    assert_eq!(
        cluster.nodes[0].on_miniblock_finalized(&stream_id, &block_1).unwrap(),
        Promotion::AlreadyApplied { matches: true }
    );

    // 5. A forced snapshot is recorded in the next miniblock.
    let event = client.message(block_1, "after 1");
    cluster.nodes[0].add_event(&stream_id, &event).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        (0..3).all(|node| cluster.nodes[node].get_view(&stream_id).unwrap().minipool.len() == 1)
    }));
    let block_2 = match cluster.nodes[0].produce_miniblock(&stream_id, true).unwrap() {
        ProduceOutcome::Produced(reference) => reference,
        outcome => panic!("unexpected outcome {:?}", outcome),
    };
    let miniblock = cluster.nodes[0].store().miniblock(&stream_id, block_2.num).unwrap().unwrap();
    assert!(miniblock.header.snapshot_hash.is_some());
    assert_eq!(cluster.nodes[0].get_view(&stream_id).unwrap().last_snapshot_num, block_2.num);

    // 6. Sync nodes do not produce.
    assert!(cluster.nodes[3]
        .produce_miniblock(&stream_id, false)
        .unwrap_err()
        .is_code(ErrorCode::InvalidArgument));
}

/// Tests that a replica which missed a miniblock answers proposals with `MINIBLOCK_TOO_NEW` and asks for
/// reconciliation, while the others carry on without it.
#[test]
fn lagging_replica_reconciles_test() {
    setup_logger(LevelFilter::Info);

    // 1. 3 nodes whose reconciliations are recorded instead of run.
    let cluster = ClusterBuilder::new(3, 3, 3).recording_schedulers().build();
    let client = Client::new();
    let stream_id = channel_id(2);
    let (created, _) = cluster.nodes[0]
        .create_stream(&stream_id, &[client.inception(stream_id)])
        .unwrap();
    let genesis = created.miniblocks[0].reference();

    // 2. Produce miniblock 1 while node 2 does not hear about its finalization.
    cluster.registry.mute(cluster.address(2));
    cluster.nodes[0].add_event(&stream_id, &client.message(genesis, "one")).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        (0..3).all(|node| cluster.nodes[node].get_view(&stream_id).unwrap().minipool.len() == 1)
    }));
    let block_1 = match cluster.nodes[0].produce_miniblock(&stream_id, false).unwrap() {
        ProduceOutcome::Produced(reference) => reference,
        outcome => panic!("unexpected outcome {:?}", outcome),
    };
    // 2.1. Node 1 may have been told before its candidate arrived, so report again until it applies it.
    assert!(wait_until(Duration::from_secs(5), || {
        let _ = cluster.nodes[1].on_miniblock_finalized(&stream_id, &block_1);
        cluster.nodes[1].get_view(&stream_id).unwrap().last_block == block_1
    }));
    assert_eq!(cluster.nodes[2].get_view(&stream_id).unwrap().last_block, genesis);

    // 3. Node 0 and node 1 still form a majority for the next miniblock.
    log_with_context(Some(cluster.address(0)), "Producing miniblock 2 with node 2 behind.");
    cluster.nodes[0].add_event(&stream_id, &client.message(block_1, "two")).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        (0..2).all(|node| cluster.nodes[node].get_view(&stream_id).unwrap().minipool.len() == 1)
    }));
    let block_2 = match cluster.nodes[0].produce_miniblock(&stream_id, false).unwrap() {
        ProduceOutcome::Produced(reference) => reference,
        outcome => panic!("unexpected outcome {:?}", outcome),
    };
    assert_eq!(block_2.num, MiniblockNum::new(2));

    // 4. Node 2 asked to be brought up to miniblock 1, the one the proposal built on.
    assert!(wait_until(Duration::from_secs(5), || {
        cluster.schedulers[2]
            .tasks()
            .iter()
            .any(|task| task.stream_id == stream_id && task.target == Some(block_1))
    }));
    assert!(cluster.schedulers[0].tasks().is_empty());

    // 5. Once told about miniblock 1, node 2 promotes the candidate it saved.
    assert_eq!(
        cluster.nodes[2].on_miniblock_finalized(&stream_id, &block_1).unwrap(),
        Promotion::Promoted(block_1)
    );

    // 6. A finalization it has no candidate for leaves a reconciliation request behind.
    let unknown = MiniblockRef::new(CryptoHash::new([9; 32]), MiniblockNum::new(2));
    assert_eq!(
        cluster.nodes[2].on_miniblock_finalized(&stream_id, &unknown).unwrap(),
        Promotion::MissingCandidate
    );
    assert!(cluster.schedulers[2].tasks().iter().any(|task| task.target == Some(unknown)));
}

/// Tests that a producer whose candidate loses the registry race reports it as superseded.
#[test]
fn superseded_candidate_test() {
    setup_logger(LevelFilter::Info);

    let cluster = ClusterBuilder::new(3, 3, 3).recording_schedulers().build();
    let client = Client::new();
    let stream_id = channel_id(3);
    let (created, _) = cluster.nodes[0]
        .create_stream(&stream_id, &[client.inception(stream_id)])
        .unwrap();
    let genesis = created.miniblocks[0].reference();

    cluster.nodes[0].add_event(&stream_id, &client.message(genesis, "one")).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        (0..3).all(|node| cluster.nodes[node].get_view(&stream_id).unwrap().minipool.len() == 1)
    }));

    // 1. Another miniblock 1 is finalized in the registry first.
    let (rival_num, rival_hash) = (MiniblockNum::new(1), CryptoHash::new([3; 32]));
    let rival = MiniblockRef::new(rival_hash, rival_num);
    assert!(cluster.registry.set_last_miniblock(&stream_id, &genesis, &rival).unwrap());

    // 2. The producer's candidate is saved but not finalized, and nothing is promoted.
    log_with_context(Some(cluster.address(0)), "Producing against a finalized rival.");
    assert_eq!(
        cluster.nodes[0].produce_miniblock(&stream_id, false).unwrap(),
        ProduceOutcome::Superseded
    );
    assert_eq!(cluster.nodes[0].get_view(&stream_id).unwrap().last_block, genesis);
    assert_eq!(cluster.registry.record(&stream_id).unwrap().last_miniblock, rival);
}
