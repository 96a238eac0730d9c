//! Basic KV command paths against a single fake node.

mod common;

use std::time::Duration;

use common::{map_config, uniform_vbuckets, FakeNode};
use skerry_client::protocol::{opcode, Status, DATATYPE_JSON, DATATYPE_SNAPPY};
use skerry_client::{
    key_hash, Durability, DurabilityLevel, Error, GetCommand, Instance, NodeCapabilities,
    RemoveCommand, Settings, StoreCommand,
};

const N_VBUCKETS: usize = 1024;

async fn single_node(settings: Settings) -> (FakeNode, Instance) {
    let node = FakeNode::spawn().await;
    let instance = Instance::new(settings);
    let map = map_config(
        1,
        &[&node],
        uniform_vbuckets(N_VBUCKETS, vec![0]),
        NodeCapabilities::all(),
    );
    instance.publish_map(&map).await.unwrap();
    (node, instance)
}

#[tokio::test(flavor = "multi_thread")]
async fn upsert_then_get_round_trip() {
    let (_node, instance) = single_node(Settings::default()).await;
    let stored = instance
        .store(StoreCommand::upsert("k", "v").flags(0xdead))
        .await
        .unwrap();
    assert_ne!(stored.cas, 0);

    let token = stored.mutation_token.expect("mutation token");
    assert_eq!(
        u32::from(token.vbucket),
        key_hash(b"k") % N_VBUCKETS as u32
    );
    assert!(token.seqno > 0);

    let doc = instance.get(GetCommand::new("k")).await.unwrap();
    assert_eq!(&doc.value[..], b"v");
    assert_eq!(doc.flags, 0xdead);
    assert_ne!(doc.cas, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_then_get_is_not_found() {
    let (_node, instance) = single_node(Settings::default()).await;
    instance.store(StoreCommand::upsert("k", "v")).await.unwrap();
    let removed = instance.remove(RemoveCommand::new("k")).await.unwrap();
    assert_ne!(removed.cas, 0);
    assert_eq!(
        instance.get(GetCommand::new("k")).await,
        Err(Error::DocumentNotFound)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn store_family_error_mapping() {
    let (_node, instance) = single_node(Settings::default()).await;
    instance.store(StoreCommand::upsert("k", "v")).await.unwrap();

    assert_eq!(
        instance.store(StoreCommand::insert("k", "v2")).await,
        Err(Error::DocumentExists)
    );
    assert_eq!(
        instance.store(StoreCommand::replace("missing", "v")).await,
        Err(Error::DocumentNotFound)
    );
    assert_eq!(
        instance.store(StoreCommand::replace("k", "v2").cas(1)).await,
        Err(Error::CasMismatch)
    );
    assert_eq!(
        instance.store(StoreCommand::append("missing", "x")).await,
        Err(Error::DocumentNotFound)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn append_and_prepend_concatenate() {
    let (_node, instance) = single_node(Settings::default()).await;
    instance.store(StoreCommand::upsert("k", "mid")).await.unwrap();
    instance.store(StoreCommand::append("k", ">")).await.unwrap();
    instance.store(StoreCommand::prepend("k", "<")).await.unwrap();
    let doc = instance.get(GetCommand::new("k")).await.unwrap();
    assert_eq!(&doc.value[..], b"<mid>");
}

#[tokio::test(flavor = "multi_thread")]
async fn locked_document_is_reported() {
    let (node, instance) = single_node(Settings::default()).await;
    instance.store(StoreCommand::upsert("k", "v")).await.unwrap();
    node.fail_next(opcode::GET_LOCKED, Status::Locked);
    assert_eq!(
        instance.get(GetCommand::new("k").lock(5)).await,
        Err(Error::DocumentLocked)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn get_variants_use_their_opcodes() {
    let (node, instance) = single_node(Settings::default()).await;
    instance.store(StoreCommand::upsert("k", "v")).await.unwrap();
    instance
        .get(GetCommand::new("k").expiry(30))
        .await
        .unwrap();
    assert_eq!(node.received(opcode::GET_AND_TOUCH), 1);
    instance.get(GetCommand::new("k").lock(0)).await.unwrap();
    assert_eq!(node.received(opcode::GET_LOCKED), 1);
    assert_eq!(node.received(opcode::GET), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn validation_rejects_before_scheduling() {
    let (node, instance) = single_node(Settings::default()).await;

    assert_eq!(
        instance.get(GetCommand::new("")).await,
        Err(Error::EmptyKey)
    );
    assert_eq!(
        instance.get(GetCommand::new(vec![b'x'; 251])).await,
        Err(Error::EmptyKey)
    );
    assert!(matches!(
        instance.store(StoreCommand::append("k", "x").expiry(5)).await,
        Err(Error::OptionsConflict(_))
    ));
    assert!(matches!(
        instance.store(StoreCommand::prepend("k", "x").flags(1)).await,
        Err(Error::OptionsConflict(_))
    ));
    assert!(matches!(
        instance.store(StoreCommand::insert("k", "x").cas(7)).await,
        Err(Error::OptionsConflict(_))
    ));

    // Nothing reached the wire.
    for op in [
        opcode::GET,
        opcode::SET,
        opcode::ADD,
        opcode::APPEND,
        opcode::PREPEND,
    ] {
        assert_eq!(node.received(op), 0, "opcode 0x{op:02x} was scheduled");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn no_map_means_no_configuration() {
    let instance = Instance::new(Settings::default());
    assert_eq!(
        instance.get(GetCommand::new("k")).await,
        Err(Error::NoConfiguration)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn temporary_failure_retries_silently() {
    let mut settings = Settings::default();
    settings.retry_interval = Duration::from_millis(20);
    let (node, instance) = single_node(settings).await;
    instance.store(StoreCommand::upsert("k", "v")).await.unwrap();

    node.fail_next(opcode::GET, Status::TemporaryFailure);
    let doc = instance.get(GetCommand::new("k")).await.unwrap();
    assert_eq!(&doc.value[..], b"v");
    assert_eq!(node.received(opcode::GET), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn unanswered_request_times_out() {
    let mut settings = Settings::default();
    settings.operation_timeout = Duration::from_millis(200);
    let (node, instance) = single_node(settings).await;
    instance.store(StoreCommand::upsert("k", "v")).await.unwrap();

    node.swallow_next(opcode::GET, 1);
    let started = std::time::Instant::now();
    assert_eq!(
        instance.get(GetCommand::new("k")).await,
        Err(Error::Timeout)
    );
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test(flavor = "multi_thread")]
async fn values_compress_on_the_wire_and_inflate_on_read() {
    let (node, instance) = single_node(Settings::default()).await;
    let value = vec![b'a'; 4096];
    instance
        .store(StoreCommand::upsert("k", value.clone()))
        .await
        .unwrap();

    let stored = node.doc(b"k").expect("stored doc");
    assert_ne!(stored.datatype & DATATYPE_SNAPPY, 0);
    assert!(stored.value.len() < value.len());

    let doc = instance.get(GetCommand::new("k")).await.unwrap();
    assert_eq!(doc.value.len(), value.len());
    assert_eq!(&doc.value[..], &value[..]);
    assert_eq!(doc.datatype & DATATYPE_SNAPPY, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn json_values_are_marked_for_capable_servers() {
    let (node, instance) = single_node(Settings::default()).await;
    instance
        .store(StoreCommand::upsert("k", "{}").json())
        .await
        .unwrap();
    let stored = node.doc(b"k").expect("stored doc");
    assert_ne!(stored.datatype & DATATYPE_JSON, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_durability_rides_in_frame_extras() {
    let (node, instance) = single_node(Settings::default()).await;
    instance
        .store(
            StoreCommand::upsert("k", "v").durability(Durability::Sync(DurabilityLevel::Majority)),
        )
        .await
        .unwrap();
    let fx = node.last_frame_extras();
    assert_eq!(fx.len(), 4);
    assert_eq!(fx[0], 0x13);
    assert_eq!(fx[1], DurabilityLevel::Majority as u8);

    instance
        .store(StoreCommand::upsert("k2", "v"))
        .await
        .unwrap();
    instance
        .remove(RemoveCommand::new("k2").durability(DurabilityLevel::PersistToMajority))
        .await
        .unwrap();
    let fx = node.last_frame_extras();
    assert_eq!(fx[1], DurabilityLevel::PersistToMajority as u8);
}

#[tokio::test(flavor = "multi_thread")]
async fn diagnostics_reports_pipelines() {
    let (_node, instance) = single_node(Settings::default()).await;
    instance.store(StoreCommand::upsert("k", "v")).await.unwrap();
    let report = instance.diagnostics().await.unwrap();
    assert_eq!(report["map"]["rev"], 1);
    assert_eq!(report["pipelines"].as_array().unwrap().len(), 1);
    assert_eq!(report["pipelines"][0]["state"], "connected");
}
