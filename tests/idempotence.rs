//! addShard idempotence under concurrency and target respelling

use futures_util::future::join_all;
use minicatalog::catalog::{TopologyMode, CATALOG_SHARD_ID};
use minicatalog::common::ReplicationConfig;
use minicatalog::{CatalogServer, Error};
use std::collections::BTreeSet;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

async fn cluster() -> CatalogServer {
    let server = CatalogServer::in_memory("cfg", 3, ReplicationConfig::local()).unwrap();
    server.start();
    server.admin().await_stable_leader(WAIT).await.unwrap();
    server
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_add_of_one_target_creates_one_shard() {
    let server = cluster().await;
    let admin = server.admin();

    let calls = (0..8).map(|_| {
        let admin = admin.clone();
        tokio::spawn(async move { admin.add_shard("rs0/a.example:27018").await })
    });
    let outcomes: Vec<_> = join_all(calls)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let ids: BTreeSet<_> = outcomes.iter().map(|o| o.shard_id.clone()).collect();
    assert_eq!(ids.len(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.created).count(), 1);
    assert_eq!(admin.list_shards().await.unwrap().len(), 1);
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_self_and_other_registration() {
    let server = cluster().await;
    let admin = server.admin();
    let own = server.connection_target().to_string();

    let calls = (0..6).map(|i| {
        let admin = admin.clone();
        let target = if i % 2 == 0 {
            own.clone()
        } else {
            "rs0/a.example:27018".to_string()
        };
        tokio::spawn(async move { admin.add_shard(&target).await })
    });
    for joined in join_all(calls).await {
        joined.unwrap().unwrap();
    }

    let shards = admin.list_shards().await.unwrap();
    assert_eq!(shards.len(), 2);
    assert!(shards.iter().any(|s| s.shard_id == CATALOG_SHARD_ID));
    assert!(shards.iter().any(|s| s.shard_id == "shard0000"));
    assert_eq!(
        admin.topology_mode().await.unwrap(),
        TopologyMode::CatalogShard
    );
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn respelled_targets_resolve_to_the_same_shard() {
    let server = cluster().await;
    let admin = server.admin();

    let first = admin.add_shard("rs0/a.example:1,b.example:2").await.unwrap();
    for spelling in [
        " rs0/b.example:2, a.example:1 ",
        "rs0/A.EXAMPLE:1,b.example:2",
        "rs0/a.example:1,b.example:2,a.example:1",
    ] {
        let again = admin.add_shard(spelling).await.unwrap();
        assert!(!again.created, "{} registered twice", spelling);
        assert_eq!(again.shard_id, first.shard_id);
    }

    // A different host set is a different shard
    let other = admin.add_shard("rs0/a.example:1").await.unwrap();
    assert!(other.created);
    assert_ne!(other.shard_id, first.shard_id);

    assert_eq!(admin.metrics().add_shard_duplicates.get(), 3);
    assert_eq!(admin.metrics().shard_count.get(), 2);
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_targets_are_rejected() {
    let server = cluster().await;
    let admin = server.admin();

    for bad in ["", "   ", "/a:1", "rs0/", "rs0/a b:1"] {
        let err = admin.add_shard(bad).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{:?}: {}", bad, err);
    }
    assert!(admin.list_shards().await.unwrap().is_empty());
    server.shutdown();
}

#[cfg(feature = "heavy-tests")]
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn many_callers_many_targets() {
    let server = cluster().await;
    let admin = server.admin();

    let calls = (0..200).map(|i| {
        let admin = admin.clone();
        tokio::spawn(async move {
            admin
                .add_shard(&format!("rs{}/host{}.example:27018", i % 20, i % 20))
                .await
        })
    });
    let outcomes: Vec<_> = join_all(calls)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(outcomes.iter().filter(|o| o.created).count(), 20);
    assert_eq!(admin.list_shards().await.unwrap().len(), 20);
    server.shutdown();
}
