//! Leader failover, step-up and restart tolerance

use minicatalog::common::ReplicationConfig;
use minicatalog::coordinator::{MemberHealth, Phase};
use minicatalog::{CatalogServer, Error};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn cluster(members: usize) -> CatalogServer {
    let server = CatalogServer::in_memory("cfg", members, ReplicationConfig::local()).unwrap();
    server.start();
    server
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn step_up_keeps_committed_writes() {
    let server = cluster(3);
    let admin = server.admin();
    let leader = admin.await_stable_leader(WAIT).await.unwrap();

    let first = admin.add_shard("rs0/a.example:27018").await.unwrap();

    for member in server.replica_set().members().to_vec() {
        if member == leader.member {
            continue;
        }
        let stepped = admin.step_up(&member).await.unwrap();
        assert_eq!(stepped.member, member);
        let shards = admin.list_shards().await.unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].shard_id, first.shard_id);
    }

    let second = admin.add_shard("rs1/b.example:27018").await.unwrap();
    assert_ne!(second.shard_id, first.shard_id);
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn step_up_of_current_leader_is_noop() {
    let server = cluster(3);
    let admin = server.admin();
    let leader = admin.await_stable_leader(WAIT).await.unwrap();
    let again = admin.step_up(&leader.member).await.unwrap();
    assert_eq!(again.member, leader.member);
    assert_eq!(again.term, leader.term);
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn step_up_unknown_member_fails() {
    let server = cluster(3);
    let admin = server.admin();
    admin.await_stable_leader(WAIT).await.unwrap();
    let err = admin.step_up("nope").await.unwrap_err();
    assert!(matches!(err, Error::UnknownMember(_)));
    assert_eq!(err.code(), "UnknownMember");
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lagging_member_is_not_electable() {
    let server = cluster(3);
    let admin = server.admin();
    let leader = admin.await_stable_leader(WAIT).await.unwrap();
    let transport = server.replica_set().local_transport().unwrap();

    let lagging = server
        .replica_set()
        .members()
        .iter()
        .find(|m| **m != leader.member)
        .cloned()
        .unwrap();
    transport.isolate(&lagging);
    admin.add_shard("rs0/a.example:27018").await.unwrap();

    let err = admin.step_up(&lagging).await.unwrap_err();
    assert!(matches!(err, Error::NotElectable { .. }));

    // Once reachable again it catches up and may lead
    transport.heal(&lagging);
    let stepped = admin.step_up(&lagging).await.unwrap();
    assert_eq!(stepped.member, lagging);
    assert_eq!(admin.list_shards().await.unwrap().len(), 1);
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn isolated_leader_is_replaced() {
    let server = cluster(3);
    let admin = server.admin();
    let old = admin.await_stable_leader(WAIT).await.unwrap();
    let transport = server.replica_set().local_transport().unwrap();

    admin.add_shard("rs0/a.example:27018").await.unwrap();
    transport.isolate(&old.member);

    // The majority side elects a new leader and keeps committing
    admin.add_shard("rs1/b.example:27018").await.unwrap();
    let new = admin.await_stable_leader(WAIT).await.unwrap();
    assert_ne!(new.member, old.member);
    assert!(new.term > old.term);

    // The old leader rejoins as a follower and catches up
    transport.heal(&old.member);
    let node = server.replica_set().node(&old.member).unwrap();
    tokio::time::timeout(WAIT, node.wait_applied(new.commit_index))
        .await
        .unwrap();
    assert!(!node.is_leader() || node.term() > new.term);
    assert_eq!(node.local_catalog().shards.len(), 2);
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restarting_a_minority_keeps_the_cluster_writable() {
    let server = cluster(5);
    let admin = server.admin();
    admin.await_stable_leader(WAIT).await.unwrap();
    admin.add_shard("rs0/a.example:27018").await.unwrap();

    let members = server.replica_set().members().to_vec();
    for member in &members[..2] {
        admin.restart(member, true, false).await.unwrap();
    }
    admin.add_shard("rs1/b.example:27018").await.unwrap();
    assert_eq!(admin.list_shards().await.unwrap().len(), 2);

    for member in &members[..2] {
        let outcome = admin.restart(member, true, true).await.unwrap();
        assert!(outcome.waited);
        assert_eq!(outcome.health, MemberHealth::Healthy);
    }
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wiped_member_catches_up_from_the_leader() {
    let server = cluster(3);
    let admin = server.admin();
    let leader = admin.await_stable_leader(WAIT).await.unwrap();
    admin.add_shard("rs0/a.example:27018").await.unwrap();
    admin.add_shard("rs1/b.example:27018").await.unwrap();

    let member = server
        .replica_set()
        .members()
        .iter()
        .find(|m| **m != leader.member)
        .cloned()
        .unwrap();
    let outcome = admin.restart(&member, false, true).await.unwrap();
    assert_eq!(outcome.health, MemberHealth::Healthy);

    let node = server.replica_set().node(&member).unwrap();
    assert_eq!(node.local_catalog().shards.len(), 2);
    assert!(!node.is_catching_up());
    let status = admin.status();
    assert!(status.members.iter().all(|m| !m.catching_up));
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn status_reports_phase_and_members() {
    let server = cluster(3);
    let admin = server.admin();
    let leader = admin.await_stable_leader(WAIT).await.unwrap();

    let status = admin.status();
    assert_eq!(status.phase, Phase::Stable);
    assert_eq!(status.leader.as_deref(), Some(leader.member.as_str()));
    assert_eq!(status.members.len(), 3);
    assert!(status
        .members
        .iter()
        .all(|m| m.running && m.health == MemberHealth::Healthy));

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["phase"]["phase"], "stable");
    server.shutdown();
}
