//! Routing and database caches stay stale until flushed

use minicatalog::catalog::ChunkBound;
use minicatalog::common::ReplicationConfig;
use minicatalog::CatalogServer;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);
const NS: &str = "foo.bar";

async fn two_shard_cluster() -> CatalogServer {
    let server = CatalogServer::in_memory("cfg", 3, ReplicationConfig::local()).unwrap();
    server.start();
    let admin = server.admin();
    admin.await_stable_leader(WAIT).await.unwrap();
    admin.add_shard("rs0/a.example:27018").await.unwrap();
    admin.add_shard("rs1/b.example:27018").await.unwrap();
    server
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn routing_entry_is_stale_until_flushed() {
    let server = two_shard_cluster().await;
    let admin = server.admin();
    let routing = admin.routing().clone();

    let route = admin.shard_collection(NS).await.unwrap();
    assert_eq!(route.placement_version, 1);
    assert_eq!(route.chunks.len(), 1);

    let cached = routing.get(NS).await.unwrap();
    assert_eq!(cached.version, 1);
    assert_eq!(
        routing.owning_shard(NS, "zebra").await.unwrap().as_deref(),
        Some("shard0000")
    );

    let split = admin.split_chunk(NS, "m").await.unwrap();
    assert_eq!(split.placement_version, 2);
    assert_eq!(split.chunks[1].min, ChunkBound::Key("m".into()));

    // No flush yet: the old placement is still served
    assert_eq!(routing.get(NS).await.unwrap().version, 1);

    admin.flush_routing_table_cache_updates(NS).await;
    let fresh = routing.get(NS).await.unwrap();
    assert_eq!(fresh.version, 2);
    assert_eq!(fresh.data.as_ref().unwrap().chunks.len(), 2);
    assert!(fresh.store_version >= cached.store_version);

    // Splitting at an existing boundary changes nothing
    let again = admin.split_chunk(NS, "m").await.unwrap();
    assert_eq!(again.placement_version, 2);
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn get_at_least_reloads_a_stale_entry() {
    let server = two_shard_cluster().await;
    let admin = server.admin();
    let routing = admin.routing().clone();

    admin.shard_collection(NS).await.unwrap();
    assert_eq!(routing.get(NS).await.unwrap().version, 1);
    admin.split_chunk(NS, "m").await.unwrap();

    let fresh = routing.get_at_least(NS, 2).await.unwrap();
    assert_eq!(fresh.version, 2);
    assert!(admin.metrics().cache_stale_reloads.get() >= 1);
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn database_entry_is_stale_until_flushed() {
    let server = two_shard_cluster().await;
    let admin = server.admin();
    let databases = admin.databases().clone();

    let db = admin.create_database("foo").await.unwrap();
    assert_eq!(db.primary_shard, "shard0000");
    assert_eq!(
        databases.primary_shard("foo").await.unwrap().as_deref(),
        Some("shard0000")
    );

    let moved = admin.move_primary("foo", "shard0001").await.unwrap();
    assert_eq!(moved.version, 2);
    assert_eq!(
        databases.primary_shard("foo").await.unwrap().as_deref(),
        Some("shard0000")
    );

    admin.flush_database_cache_updates("foo").await;
    assert_eq!(
        databases.primary_shard("foo").await.unwrap().as_deref(),
        Some("shard0001")
    );
    assert_eq!(databases.get_at_least("foo", 2).await.unwrap().version, 2);
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn absent_entries_are_cached_and_flushes_create_nothing() {
    let server = two_shard_cluster().await;
    let admin = server.admin();
    let routing = admin.routing().clone();

    let missing = routing.get("foo.baz").await.unwrap();
    assert!(missing.is_absent());
    assert_eq!(missing.version, 0);

    admin.shard_collection("foo.baz").await.unwrap();
    assert!(routing.get("foo.baz").await.unwrap().is_absent());
    assert!(!routing.get_at_least("foo.baz", 1).await.unwrap().is_absent());

    for _ in 0..3 {
        admin.flush_routing_table_cache_updates("does.not.exist").await;
        admin.flush_database_cache_updates("notRealDB").await;
    }
    let catalog = admin.registry().catalog().await.unwrap();
    assert!(catalog.route("does.not.exist").is_none());
    assert!(catalog.database("notRealDB").is_none());
    assert_eq!(catalog.routes.len(), 1);
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn catalog_errors_for_unknown_targets() {
    let server = two_shard_cluster().await;
    let admin = server.admin();

    let err = admin.split_chunk("foo.none", "m").await.unwrap_err();
    assert_eq!(err.code(), "NamespaceNotFound");
    let err = admin.move_primary("nodb", "shard0001").await.unwrap_err();
    assert_eq!(err.code(), "DatabaseNotFound");

    admin.create_database("foo").await.unwrap();
    let err = admin.move_primary("foo", "shard9999").await.unwrap_err();
    assert_eq!(err.code(), "ShardNotFound");
    server.shutdown();
}
