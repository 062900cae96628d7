use stream_replication::{
    error::ErrorCode,
    storage::{Promotion, StreamStore},
    types::{
        basic::{CryptoHash, MiniblockNum},
        event::Envelope,
        miniblock::{verify_chain, Miniblock},
    },
};

mod common;

use common::{
    fixtures::{channel_id, Client},
    logging::log_with_context,
    mem_db::MemDB,
};

fn next_block(prev: &Miniblock, events: Vec<Envelope>) -> Miniblock {
    Miniblock::new(
        prev.num().next(),
        prev.hash,
        events,
        prev.header.timestamp_ms + 1,
        None,
    )
    .unwrap()
}

/// Tests creating a stream, appending events, and sealing them into a chain of miniblocks.
#[test]
fn chain_integrity_test() {
    // 1. Create a stream.
    let client = Client::new();
    let stream_id = channel_id(1);
    let store = StreamStore::new(MemDB::new());
    let genesis = Miniblock::genesis(vec![client.inception(stream_id)]).unwrap();

    let view = store.create_stream(&stream_id, &genesis).unwrap();
    assert_eq!(view.last_block, genesis.reference());
    assert!(view.minipool.is_empty());
    assert_eq!(view.minipool_generation(), MiniblockNum::new(1));

    // 1.1. Creating it again with the same genesis is a no-op, with another genesis it is rejected.
    store.create_stream(&stream_id, &genesis).unwrap();
    let other = Miniblock::genesis(vec![client.inception(stream_id)]).unwrap();
    assert!(store
        .create_stream(&stream_id, &other)
        .unwrap_err()
        .is_code(ErrorCode::AlreadyExists));

    // 2. Add two events, one of them twice.
    log_with_context(None, "Adding events to the minipool.");
    let first = client.message(genesis.reference(), "hello");
    let second = client.message(genesis.reference(), "world");
    assert!(store.add_event(&stream_id, &first).unwrap());
    assert!(!store.add_event(&stream_id, &first).unwrap());
    assert!(store.add_event(&stream_id, &second).unwrap());
    assert_eq!(
        store.get_view(&stream_id).unwrap().minipool_hashes(),
        vec![first.hash, second.hash]
    );

    // 3. Seal the first event into miniblock 1.
    let block_1 = next_block(&genesis, vec![first.clone()]);
    store.write_candidate(&stream_id, &block_1).unwrap();
    assert_eq!(
        store.promote_candidate(&stream_id, &block_1.reference()).unwrap(),
        Promotion::Promoted(block_1.reference())
    );

    // 3.1. The sealed event left the minipool but is still known.
    let view = store.get_view(&stream_id).unwrap();
    assert_eq!(view.last_block, block_1.reference());
    assert_eq!(view.minipool_hashes(), vec![second.hash]);
    assert!(store.has_event(&stream_id, &first.hash).unwrap());
    assert!(!store.add_event(&stream_id, &first).unwrap());

    // 4. The stored chain verifies.
    let chain = store
        .miniblocks(&stream_id, &[MiniblockNum::new(0), MiniblockNum::new(1), MiniblockNum::new(2)])
        .unwrap();
    assert_eq!(chain.len(), 2);
    verify_chain(&chain).unwrap();
}

/// Tests the errors of events that reference a miniblock the node does not have.
#[test]
fn add_event_errors_test() {
    let client = Client::new();
    let stream_id = channel_id(2);
    let store = StreamStore::new(MemDB::new());
    let genesis = Miniblock::genesis(vec![client.inception(stream_id)]).unwrap();

    // 1. Unknown stream.
    let event = client.message(genesis.reference(), "early");
    assert!(store
        .add_event(&stream_id, &event)
        .unwrap_err()
        .is_code(ErrorCode::NotFound));
    store.create_stream(&stream_id, &genesis).unwrap();

    // 2. A reference to a miniblock number past the local chain.
    let ahead = next_block(&genesis, Vec::new());
    let event = client.message(ahead.reference(), "from the future");
    let err = store.add_event(&stream_id, &event).unwrap_err();
    assert!(err.is_code(ErrorCode::BadBlockNumber));
    assert_eq!(err.get_tag("expected"), Some("1"));
    assert_eq!(err.get_tag("observed"), Some("0"));

    // 3. A reference to the right number with the wrong hash.
    let mut forged = genesis.reference();
    forged.hash = CryptoHash::new([7; 32]);
    let event = client.message(forged, "forged");
    assert!(store
        .add_event(&stream_id, &event)
        .unwrap_err()
        .is_code(ErrorCode::BadPrevMiniblockHash));

    // 4. Inceptions only belong in genesis.
    assert!(store
        .add_event(&stream_id, &client.inception(stream_id))
        .unwrap_err()
        .is_code(ErrorCode::InvalidArgument));
}

/// Tests candidate validation and the outcomes of promotion.
#[test]
fn candidates_test() {
    let client = Client::new();
    let stream_id = channel_id(3);
    let store = StreamStore::new(MemDB::new());
    let genesis = Miniblock::genesis(vec![client.inception(stream_id)]).unwrap();
    store.create_stream(&stream_id, &genesis).unwrap();

    // 1. Two competing candidates for miniblock 1.
    let candidate_a = next_block(&genesis, vec![client.message(genesis.reference(), "a")]);
    let candidate_b = next_block(&genesis, vec![client.message(genesis.reference(), "b")]);
    store.write_candidate(&stream_id, &candidate_a).unwrap();
    store.write_candidate(&stream_id, &candidate_b).unwrap();
    assert!(store.candidate(&stream_id, &candidate_b.reference()).unwrap().is_some());

    // 2. Candidates that do not fit the chain.
    let too_new = next_block(&candidate_a, Vec::new());
    assert!(store
        .write_candidate(&stream_id, &too_new)
        .unwrap_err()
        .is_code(ErrorCode::MiniblockTooNew));
    let wrong_prev = Miniblock::new(MiniblockNum::new(1), CryptoHash::new([1; 32]), Vec::new(), 0, None).unwrap();
    assert!(store
        .write_candidate(&stream_id, &wrong_prev)
        .unwrap_err()
        .is_code(ErrorCode::BadPrevMiniblockHash));
    assert_eq!(
        store
            .promote_candidate(&stream_id, &too_new.reference())
            .unwrap(),
        Promotion::Gap { last: genesis.reference() }
    );

    // 3. Promote candidate b. Candidate a is dropped.
    assert_eq!(
        store.promote_candidate(&stream_id, &candidate_b.reference()).unwrap(),
        Promotion::Promoted(candidate_b.reference())
    );
    assert!(store.candidate(&stream_id, &candidate_a.reference()).unwrap().is_none());

    // 4. Promoting again, or promoting the loser, reports the number as applied.
    assert_eq!(
        store.promote_candidate(&stream_id, &candidate_b.reference()).unwrap(),
        Promotion::AlreadyApplied { matches: true }
    );
    assert_eq!(
        store.promote_candidate(&stream_id, &candidate_a.reference()).unwrap(),
        Promotion::AlreadyApplied { matches: false }
    );

    // 5. Saving the applied block again is accepted, saving the loser is too old.
    store.write_candidate(&stream_id, &candidate_b).unwrap();
    assert!(store
        .write_candidate(&stream_id, &candidate_a)
        .unwrap_err()
        .is_code(ErrorCode::MiniblockTooOld));

    // 6. A candidate for the next number that was never saved.
    let unsaved = next_block(&candidate_b, Vec::new());
    assert_eq!(
        store.promote_candidate(&stream_id, &unsaved.reference()).unwrap(),
        Promotion::MissingCandidate
    );
}

/// Tests importing a chain fetched from a peer into an empty and into a lagging store.
#[test]
fn import_miniblocks_test() {
    // 1. Build a chain of 4 miniblocks on a source store.
    let client = Client::new();
    let stream_id = channel_id(4);
    let source = StreamStore::new(MemDB::new());
    let genesis = Miniblock::genesis(vec![client.inception(stream_id)]).unwrap();
    source.create_stream(&stream_id, &genesis).unwrap();

    let mut chain = vec![genesis];
    for i in 0..3 {
        let prev = chain.last().unwrap();
        let block = next_block(prev, vec![client.message(prev.reference(), &format!("event {}", i))]);
        chain.push(block);
    }

    // 2. Import the whole chain into an empty store.
    let target = StreamStore::new(MemDB::new());
    assert_eq!(target.import_miniblocks(&stream_id, &chain).unwrap(), 4);
    assert_eq!(target.get_view(&stream_id).unwrap().last_block, chain[3].reference());

    // 3. A lagging store skips what it has.
    let lagging = StreamStore::new(MemDB::new());
    lagging.import_miniblocks(&stream_id, &chain[..2]).unwrap();
    assert_eq!(lagging.import_miniblocks(&stream_id, &chain).unwrap(), 2);
    assert_eq!(lagging.import_miniblocks(&stream_id, &chain).unwrap(), 0);

    // 4. A segment that does not start at genesis cannot create a stream.
    let empty = StreamStore::new(MemDB::new());
    assert!(empty.import_miniblocks(&stream_id, &chain[1..]).is_err());
    assert!(empty.view(&stream_id).unwrap().is_none());

    // 5. A segment with a hole is rejected.
    let holed = StreamStore::new(MemDB::new());
    holed.import_miniblocks(&stream_id, &chain[..1]).unwrap();
    assert!(holed
        .import_miniblocks(&stream_id, &chain[2..])
        .unwrap_err()
        .is_code(ErrorCode::BadBlockNumber));
}
