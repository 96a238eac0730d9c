//! NOT_MY_VBUCKET handling and map replacement.

mod common;

use std::time::Duration;

use common::{map_config, new_store, uniform_vbuckets, FakeNode};
use skerry_client::protocol::{opcode, Status};
use skerry_client::{
    Error, GetCommand, Instance, NodeCapabilities, Settings, StoreCommand,
};
use tokio::time::timeout;

const N_VBUCKETS: usize = 256;

#[tokio::test(flavor = "multi_thread")]
async fn nmv_retries_once_on_the_refreshed_map() {
    let store = new_store();
    let a = FakeNode::spawn_shared(store.clone()).await;
    let b = FakeNode::spawn_shared(store.clone()).await;
    let instance = std::sync::Arc::new(Instance::new(Settings::default()));

    // Map v1: node a masters everything.
    let v1 = map_config(
        1,
        &[&a, &b],
        uniform_vbuckets(N_VBUCKETS, vec![0, 1]),
        NodeCapabilities::all(),
    );
    instance.publish_map(&v1).await.unwrap();
    instance.store(StoreCommand::upsert("k", "v")).await.unwrap();

    // a no longer owns the vbucket; the client must ask for a fresh map.
    a.fail_next(opcode::GET, Status::NotMyVbucket);
    let mut refresh = instance.map_refresh_requests();

    let get = {
        let instance = instance.clone();
        tokio::spawn(async move { instance.get(GetCommand::new("k")).await })
    };

    timeout(Duration::from_secs(5), refresh.changed())
        .await
        .expect("refresh request")
        .unwrap();

    // Map v2 moves mastership to node b.
    let v2 = map_config(
        2,
        &[&a, &b],
        uniform_vbuckets(N_VBUCKETS, vec![1, 0]),
        NodeCapabilities::all(),
    );
    instance.publish_map(&v2).await.unwrap();

    let doc = timeout(Duration::from_secs(5), get)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(&doc.value[..], b"v");

    // Exactly one silent retry, on the new master.
    assert_eq!(a.received(opcode::GET), 1);
    assert_eq!(b.received(opcode::GET), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn nmv_guesses_the_next_server_when_the_map_is_stale() {
    let store = new_store();
    let a = FakeNode::spawn_shared(store.clone()).await;
    let b = FakeNode::spawn_shared(store.clone()).await;
    let mut settings = Settings::default();
    settings.retry_interval = Duration::from_millis(20);
    let instance = Instance::new(settings);

    let map = map_config(
        1,
        &[&a, &b],
        uniform_vbuckets(N_VBUCKETS, vec![0, 1]),
        NodeCapabilities::all(),
    );
    instance.publish_map(&map).await.unwrap();
    instance.store(StoreCommand::upsert("k", "v")).await.unwrap();

    // No new map arrives; the retry probes the next server instead.
    a.fail_next(opcode::GET, Status::NotMyVbucket);
    let doc = instance.get(GetCommand::new("k")).await.unwrap();
    assert_eq!(&doc.value[..], b"v");
    assert_eq!(a.received(opcode::GET), 1);
    assert_eq!(b.received(opcode::GET), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn vb_noguess_sticks_to_the_map() {
    let store = new_store();
    let a = FakeNode::spawn_shared(store.clone()).await;
    let b = FakeNode::spawn_shared(store.clone()).await;
    let mut settings = Settings::default();
    settings.retry_interval = Duration::from_millis(20);
    settings.vb_noguess = true;
    let instance = Instance::new(settings);

    let map = map_config(
        1,
        &[&a, &b],
        uniform_vbuckets(N_VBUCKETS, vec![0, 1]),
        NodeCapabilities::all(),
    );
    instance.publish_map(&map).await.unwrap();
    instance.store(StoreCommand::upsert("k", "v")).await.unwrap();

    a.fail_next(opcode::GET, Status::NotMyVbucket);
    let doc = instance.get(GetCommand::new("k")).await.unwrap();
    assert_eq!(&doc.value[..], b"v");
    // Both attempts hit the mapped master; the guess is disabled.
    assert_eq!(a.received(opcode::GET), 2);
    assert_eq!(b.received(opcode::GET), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn nmv_exhausting_the_deadline_surfaces_timeout() {
    let node = FakeNode::spawn().await;
    let mut settings = Settings::default();
    settings.operation_timeout = Duration::from_millis(150);
    settings.retry_interval = Duration::from_millis(40);
    settings.vb_noguess = true;
    let instance = Instance::new(settings);

    let map = map_config(
        1,
        &[&node],
        uniform_vbuckets(N_VBUCKETS, vec![0]),
        NodeCapabilities::all(),
    );
    instance.publish_map(&map).await.unwrap();
    instance.store(StoreCommand::upsert("k", "v")).await.unwrap();

    // The node keeps disowning the vbucket and no new map ever arrives.
    node.fail_times(opcode::GET, Status::NotMyVbucket, 64);
    assert_eq!(
        instance.get(GetCommand::new("k")).await,
        Err(Error::Timeout)
    );
}
