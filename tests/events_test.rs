use std::{
    sync::{mpsc, Arc},
    time::Duration,
};

use ed25519_dalek::SigningKey;
use log::LevelFilter;
use rand_core::OsRng;
use stream_replication::{
    config::Configuration,
    consensus::ProduceOutcome,
    node::NodeSpec,
    pluggables::StreamRegistry,
    types::basic::NodeAddress,
};

mod common;

use common::{
    fixtures::{channel_id, Client},
    logging::{log_with_context, setup_logger},
    mem_db::MemDB,
    network::Hub,
    registry::RegistryStub,
};

/// Tests that a node's event handlers see its writes and its miniblocks, in order.
#[test]
fn event_handlers_test() {
    setup_logger(LevelFilter::Info);

    // 1. Start a single node with handlers that forward the events they see.
    let key = SigningKey::generate(&mut OsRng);
    let address = NodeAddress::from(&key.verifying_key());
    let hub = Hub::new();
    let registry = Arc::new(RegistryStub::new(vec![address], 1));
    let (writes, written) = mpsc::channel();
    let (saves, saved) = mpsc::channel();
    let (promotions, promoted) = mpsc::channel();

    let node = NodeSpec::builder()
        .kv_store(MemDB::new())
        .network(hub.stub(address))
        .registry(Arc::clone(&registry) as Arc<dyn StreamRegistry>)
        .configuration(
            Configuration::builder()
                .me(key)
                .operation_timeout(Duration::from_secs(5))
                .log_events(true)
                .build(),
        )
        .on_replicate_write(move |event| { let _ = writes.send(event.event); })
        .on_save_candidate(move |event| { let _ = saves.send(event.candidate); })
        .on_promote_miniblock(move |event| { let _ = promotions.send(event.miniblock); })
        .build()
        .start();
    hub.register(address, node.handler());
    registry.subscribe(address, node.finalization_observer());

    // 2. Create a stream and write 2 events to it.
    let client = Client::new();
    let stream_id = channel_id(1);
    let (created, _) = node.create_stream(&stream_id, &[client.inception(stream_id)]).unwrap();
    let genesis = created.miniblocks[0].reference();
    let first = client.message(genesis, "first");
    let second = client.message(genesis, "second");
    node.add_event(&stream_id, &first).unwrap();
    node.add_event(&stream_id, &second).unwrap();

    let timeout = Duration::from_secs(5);
    assert_eq!(written.recv_timeout(timeout).unwrap(), first.hash);
    assert_eq!(written.recv_timeout(timeout).unwrap(), second.hash);

    // 3. Produce a miniblock. The candidate is saved, then promoted.
    log_with_context(Some(address), "Producing a miniblock.");
    let block_1 = match node.produce_miniblock(&stream_id, false).unwrap() {
        ProduceOutcome::Produced(reference) => reference,
        outcome => panic!("unexpected outcome {:?}", outcome),
    };
    assert_eq!(saved.recv_timeout(timeout).unwrap(), block_1);
    assert_eq!(promoted.recv_timeout(timeout).unwrap(), block_1);

    // 3.1. The producer's own report of the finalization does not promote twice.
    assert!(promoted.recv_timeout(Duration::from_millis(200)).is_err());
}
