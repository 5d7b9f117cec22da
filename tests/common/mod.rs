//! Shared helpers for the cluster integration tests

#![allow(dead_code)]

use minishard::common::{CollectionState, ReplicaRole};
use minishard::coordinator::predicates::StatePredicate;
use minishard::{Config, LocalCluster};
use std::time::Duration;

/// Upper bound for every convergence wait in the tests.
pub const CONVERGENCE: Duration = Duration::from_secs(10);

pub fn config(nodes: usize) -> Config {
    let mut config = Config::default();
    config.coordinator.local_nodes = nodes;
    config.replication.initial_backoff_ms = 10;
    config
}

pub fn start(nodes: usize) -> LocalCluster {
    LocalCluster::start(&config(nodes), None).unwrap()
}

pub async fn wait(cluster: &LocalCluster, collection: &str, predicate: impl StatePredicate) -> CollectionState {
    let snapshot = cluster
        .store()
        .wait_for_state(collection, CONVERGENCE, predicate)
        .await
        .unwrap();
    snapshot.require_collection().unwrap().clone()
}

/// Poll a replica's local document count until it matches.
pub async fn wait_for_docs(cluster: &LocalCluster, collection: &str, replica: &str, expected: usize) {
    let deadline = tokio::time::Instant::now() + CONVERGENCE;
    loop {
        let found = cluster
            .core(collection, replica)
            .and_then(|core| core.engine().num_docs());
        if matches!(found, Ok(n) if n == expected) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "replica {} never reached {} docs (last: {:?})",
                replica, expected, found
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn replicas_of(coll: &CollectionState, role: ReplicaRole) -> Vec<String> {
    coll.replicas_of(role).map(|r| r.name.clone()).collect()
}

pub fn leader_name(coll: &CollectionState, shard: &str) -> Option<String> {
    coll.shard(shard)
        .and_then(|s| s.leader())
        .map(|r| r.name.clone())
}

/// At most one leader per shard, and never a non-Writer.
pub fn assert_leadership_invariants(coll: &CollectionState) {
    for shard in &coll.shards {
        let leaders: Vec<_> = shard.replicas.iter().filter(|r| r.is_leader).collect();
        assert!(leaders.len() <= 1, "{} has {} leaders", shard.name, leaders.len());
        for leader in leaders {
            assert_eq!(leader.role, ReplicaRole::Writer, "{} leads", leader.name);
        }
    }
}
