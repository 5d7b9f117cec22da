//! Cluster records in RocksDB and update logs on disk survive a full restart

mod common;

use common::*;
use minishard::coordinator::predicates::{active_replica_count, has_live_leader};
use minishard::coordinator::CreateCollectionRequest;
use minishard::replica::{Document, QueryExpr, UpdateOp};
use minishard::LocalCluster;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_cluster_restart_restores_collections_and_documents() {
    let dir = TempDir::new().unwrap();
    let mut config = config(2);
    config.coordinator.db_path = Some(dir.path().join("db"));
    let logs = dir.path().join("logs");

    {
        let cluster = LocalCluster::start(&config, Some(logs.clone())).unwrap();
        cluster
            .admin()
            .create_collection(CreateCollectionRequest::new("c", 1).replicas(1, 0, 1))
            .await
            .unwrap();
        wait(&cluster, "c", active_replica_count(1, 0, 1)).await;
        wait(&cluster, "c", has_live_leader("shard1")).await;
        for id in ["1", "2"] {
            cluster
                .router()
                .write("c", UpdateOp::Add(Document::new(id)))
                .await
                .unwrap();
        }
        cluster.router().commit("c").await.unwrap();
        // Uncommitted, must not be visible after the restart.
        cluster
            .router()
            .write("c", UpdateOp::Add(Document::new("3")))
            .await
            .unwrap();
        cluster.shutdown();
    }
    // Let aborted tasks drop their handles on the RocksDB instance.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let cluster = LocalCluster::start(&config, Some(logs)).unwrap();
    let coll = wait(&cluster, "c", active_replica_count(1, 0, 1)).await;
    assert_eq!(coll.replicas().count(), 2);
    let coll = wait(&cluster, "c", has_live_leader("shard1")).await;
    assert_leadership_invariants(&coll);

    let writer = leader_name(&coll, "shard1").unwrap();
    wait_for_docs(&cluster, "c", &writer, 2).await;
    let response = cluster.router().query("c", &QueryExpr::All).await.unwrap();
    assert_eq!(response.num_found, 2);

    cluster
        .router()
        .write("c", UpdateOp::Add(Document::new("4")))
        .await
        .unwrap();
}
