//! End-to-end leader and passive replica scenarios on an in-process cluster

mod common;

use common::*;
use minishard::common::{ReplicaRole, ReplicaState};
use minishard::coordinator::predicates::{active_replica_count, has_live_leader, replica_down};
use minishard::coordinator::CreateCollectionRequest;
use minishard::replica::{Document, QueryExpr, UpdateOp};
use minishard::Error;

async fn one_writer_one_passive(cluster: &minishard::LocalCluster) -> (String, String) {
    cluster
        .admin()
        .create_collection(CreateCollectionRequest::new("c", 1).replicas(1, 0, 1))
        .await
        .unwrap();
    let coll = wait(cluster, "c", active_replica_count(1, 0, 1)).await;
    let coll = if leader_name(&coll, "shard1").is_some() {
        coll
    } else {
        wait(cluster, "c", has_live_leader("shard1")).await
    };
    let writer = replicas_of(&coll, ReplicaRole::Writer).remove(0);
    let passive = replicas_of(&coll, ReplicaRole::Passive).remove(0);
    assert_eq!(leader_name(&coll, "shard1").as_deref(), Some(writer.as_str()));
    (writer, passive)
}

fn add(id: &str) -> UpdateOp {
    UpdateOp::Add(Document::new(id).with_field("title", format!("doc {}", id)))
}

#[tokio::test]
async fn test_passive_converges_after_commit() {
    let cluster = start(2);
    let (writer, passive) = one_writer_one_passive(&cluster).await;

    let receipt = cluster.router().write("c", add("1")).await.unwrap();
    assert_eq!(receipt.leader, writer);
    cluster.router().commit("c").await.unwrap();

    wait_for_docs(&cluster, "c", &writer, 1).await;
    wait_for_docs(&cluster, "c", &passive, 1).await;

    let passive_core = cluster.core("c", &passive).unwrap();
    assert_eq!(passive_core.stats().adds, 0);
    assert_eq!(passive_core.stats().commits, 0);
    assert_eq!(cluster.core("c", &writer).unwrap().stats().adds, 1);

    let response = cluster.router().query("c", &QueryExpr::All).await.unwrap();
    assert_eq!(response.num_found, 1);
    assert_eq!(response.docs[0].id, "1");
}

#[tokio::test]
async fn test_leader_loss_then_new_writer() {
    let cluster = start(2);
    let (writer, passive) = one_writer_one_passive(&cluster).await;
    cluster.router().write("c", add("1")).await.unwrap();
    cluster.router().commit("c").await.unwrap();
    wait_for_docs(&cluster, "c", &passive, 1).await;

    let coll = cluster.store().get_state("c").collection().unwrap().clone();
    let writer_node = coll.locate(&writer).unwrap().1.node_id.clone();
    cluster.kill_node(&writer_node).unwrap();

    let coll = wait(&cluster, "c", replica_down(writer.clone())).await;
    assert_leadership_invariants(&coll);
    assert!(coll.shards[0].live_leader(&cluster.store().current().live_nodes).is_none());
    let passive_entry = coll.locate(&passive).unwrap().1;
    assert_eq!(passive_entry.state, ReplicaState::Active);

    let result = cluster.router().write("c", add("2")).await;
    assert!(matches!(result, Err(Error::NoLeader { .. })));

    let added = cluster
        .admin()
        .add_replica("c", "shard1", ReplicaRole::Writer)
        .await
        .unwrap();
    let coll = wait(&cluster, "c", has_live_leader("shard1")).await;
    assert_eq!(leader_name(&coll, "shard1"), Some(added.name.clone()));
    assert_leadership_invariants(&coll);

    // The new leader starts empty and the passive replica mirrors it.
    wait_for_docs(&cluster, "c", &passive, 0).await;
    cluster.router().write("c", add("3")).await.unwrap();
    cluster.router().commit("c").await.unwrap();
    wait_for_docs(&cluster, "c", &passive, 1).await;
    assert_eq!(cluster.core("c", &passive).unwrap().stats().adds, 0);
}

#[tokio::test]
async fn test_restarted_leader_keeps_its_data() {
    let cluster = start(2);
    let (writer, passive) = one_writer_one_passive(&cluster).await;
    for id in ["1", "2"] {
        cluster.router().write("c", add(id)).await.unwrap();
    }
    cluster.router().commit("c").await.unwrap();
    wait_for_docs(&cluster, "c", &passive, 2).await;

    let coll = cluster.store().get_state("c").collection().unwrap().clone();
    let writer_node = coll.locate(&writer).unwrap().1.node_id.clone();
    cluster.kill_node(&writer_node).unwrap();
    wait(&cluster, "c", replica_down(writer.clone())).await;
    assert!(matches!(
        cluster.router().write("c", add("3")).await,
        Err(Error::NoLeader { .. })
    ));

    cluster.restart_node(&writer_node).unwrap();
    let coll = wait(&cluster, "c", has_live_leader("shard1")).await;
    assert_eq!(leader_name(&coll, "shard1"), Some(writer.clone()));
    assert_leadership_invariants(&coll);
    wait_for_docs(&cluster, "c", &writer, 2).await;

    cluster.router().write("c", add("3")).await.unwrap();
    cluster.router().commit("c").await.unwrap();
    wait_for_docs(&cluster, "c", &passive, 3).await;
}

#[tokio::test]
async fn test_removing_sole_writer_blocks_writes() {
    let cluster = start(2);
    let (writer, _passive) = one_writer_one_passive(&cluster).await;

    cluster
        .admin()
        .delete_replica("c", "shard1", &writer)
        .await
        .unwrap();
    let coll = cluster.store().get_state("c").collection().unwrap().clone();
    assert!(coll.shards[0].leader().is_none());
    for id in ["a", "b", "c"] {
        assert!(matches!(
            cluster.router().write("c", add(id)).await,
            Err(Error::NoLeader { .. })
        ));
    }

    let added = cluster
        .admin()
        .add_replica("c", "shard1", ReplicaRole::Writer)
        .await
        .unwrap();
    wait(&cluster, "c", has_live_leader("shard1")).await;
    let receipt = cluster.router().write("c", add("a")).await.unwrap();
    assert_eq!(receipt.leader, added.name);
}

#[tokio::test]
async fn test_second_writer_takes_over() {
    let cluster = start(3);
    cluster
        .admin()
        .create_collection(CreateCollectionRequest::new("c", 1).replicas(2, 0, 1))
        .await
        .unwrap();
    wait(&cluster, "c", active_replica_count(2, 0, 1)).await;
    let coll = wait(&cluster, "c", has_live_leader("shard1")).await;
    let leader = leader_name(&coll, "shard1").unwrap();
    let standby = replicas_of(&coll, ReplicaRole::Writer)
        .into_iter()
        .find(|name| *name != leader)
        .unwrap();
    let passive = replicas_of(&coll, ReplicaRole::Passive).remove(0);

    for id in ["1", "2"] {
        cluster.router().write("c", add(id)).await.unwrap();
    }
    cluster.router().commit("c").await.unwrap();
    wait_for_docs(&cluster, "c", &standby, 2).await;
    wait_for_docs(&cluster, "c", &passive, 2).await;

    let leader_node = coll.locate(&leader).unwrap().1.node_id.clone();
    cluster.kill_node(&leader_node).unwrap();

    let coll = wait(&cluster, "c", replica_down(leader.clone())).await;
    let coll = if leader_name(&coll, "shard1").as_deref() == Some(standby.as_str()) {
        coll
    } else {
        wait(&cluster, "c", has_live_leader("shard1")).await
    };
    assert_leadership_invariants(&coll);
    assert_eq!(leader_name(&coll, "shard1").as_deref(), Some(standby.as_str()));

    let receipt = cluster.router().write("c", add("3")).await.unwrap();
    assert_eq!(receipt.leader, standby);
    cluster.router().commit("c").await.unwrap();
    wait_for_docs(&cluster, "c", &standby, 3).await;
    wait_for_docs(&cluster, "c", &passive, 3).await;
}
