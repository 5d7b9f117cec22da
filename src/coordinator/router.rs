//! Update router
//!
//! Routes each document to a shard by hashing its id, then forwards the write
//! to that shard's live leader only. There is no buffering: a shard without a
//! live leader fails the write with [`Error::NoLeader`] right away. Queries fan
//! out to one Active replica per shard.

use crate::common::{shard_index, Error, Replica, Result, METRICS};
use crate::coordinator::state::ClusterStateStore;
use crate::replica::engine::{Document, QueryExpr, UpdateOp};
use crate::replica::transport::ReplicaTransport;
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct WriteReceipt {
    pub shard: String,
    pub leader: String,
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub num_found: usize,
    pub docs: Vec<Document>,
}

pub struct UpdateRouter {
    store: ClusterStateStore,
    transport: Arc<dyn ReplicaTransport>,
}

impl UpdateRouter {
    pub fn new(store: ClusterStateStore, transport: Arc<dyn ReplicaTransport>) -> Self {
        Self { store, transport }
    }

    /// Shard name and live leader for a document id.
    pub fn route(&self, collection: &str, doc_id: &str) -> Result<(String, Replica)> {
        let snapshot = self.store.get_state(collection);
        let coll = snapshot.require_collection()?;
        if coll.shards.is_empty() {
            return Err(Error::Internal(format!("collection {} has no shards", collection)));
        }
        let shard = &coll.shards[shard_index(doc_id, coll.shards.len())];
        match shard.live_leader(snapshot.live_nodes()) {
            Some(leader) => Ok((shard.name.clone(), leader.clone())),
            None => Err(Error::NoLeader {
                collection: collection.to_string(),
                shard: shard.name.clone(),
            }),
        }
    }

    pub async fn write(&self, collection: &str, op: UpdateOp) -> Result<WriteReceipt> {
        let (shard, leader) = match self.route(collection, op.doc_id()) {
            Ok(target) => target,
            Err(e @ Error::NoLeader { .. }) => {
                METRICS.writes_no_leader.inc();
                tracing::warn!("Write to {} rejected: {}", collection, e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let sequence = self.transport.forward_update(&leader, op).await?;
        METRICS.writes_routed.inc();
        tracing::debug!(
            "Routed write for {}/{} to {} (seq {})",
            collection,
            shard,
            leader.name,
            sequence
        );
        Ok(WriteReceipt {
            shard,
            leader: leader.name,
            sequence,
        })
    }

    /// Commit on the leader of every shard, concurrently. Fails if any shard has
    /// no live leader.
    pub async fn commit(&self, collection: &str) -> Result<Vec<(String, u64)>> {
        let snapshot = self.store.get_state(collection);
        let coll = snapshot.require_collection()?;
        let mut leaders = Vec::with_capacity(coll.shards.len());
        for shard in &coll.shards {
            let leader = shard
                .live_leader(snapshot.live_nodes())
                .ok_or_else(|| Error::NoLeader {
                    collection: collection.to_string(),
                    shard: shard.name.clone(),
                })?;
            leaders.push((shard.name.clone(), leader.clone()));
        }

        let results = join_all(
            leaders
                .iter()
                .map(|(_, leader)| self.transport.commit(leader)),
        )
        .await;
        let mut generations = Vec::with_capacity(leaders.len());
        for ((shard, _), result) in leaders.into_iter().zip(results) {
            generations.push((shard, result?));
        }
        tracing::debug!("Committed {} on {} shards", collection, generations.len());
        Ok(generations)
    }

    /// Query one Active replica per shard and merge the results by id.
    pub async fn query(&self, collection: &str, query: &QueryExpr) -> Result<QueryResponse> {
        let snapshot = self.store.get_state(collection);
        let coll = snapshot.require_collection()?;
        let live = snapshot.live_nodes();

        let mut docs = Vec::new();
        for shard in &coll.shards {
            let mut served = false;
            // Leader first, then the rest in record order.
            let mut candidates: Vec<&Replica> =
                shard.replicas.iter().filter(|r| r.is_active(live)).collect();
            candidates.sort_by_key(|r| !r.is_leader);
            for replica in candidates {
                match self.transport.query(replica, query).await {
                    Ok(found) => {
                        docs.extend(found);
                        served = true;
                        break;
                    }
                    Err(e) => {
                        tracing::debug!("Query on {} failed, trying next: {}", replica.name, e)
                    }
                }
            }
            if !served {
                return Err(Error::ReplicaNotActive(format!(
                    "no active replica for {}/{}",
                    collection, shard.name
                )));
            }
        }

        docs.sort_by(|a, b| a.id.cmp(&b.id));
        METRICS.queries_served.inc();
        Ok(QueryResponse {
            num_found: docs.len(),
            docs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{CollectionState, ReplicaRole, ReplicaState};
    use crate::coordinator::substrate::MemorySubstrate;
    use crate::replica::transport::LocalTransport;

    #[tokio::test]
    async fn test_no_leader_fails_fast() {
        let store = ClusterStateStore::new(Arc::new(MemorySubstrate::new())).unwrap();
        let mut coll = CollectionState::new("c", 2);
        let name = coll.allocate_replica_name();
        coll.shards[0].replicas.push(Replica {
            name,
            node_id: "n1".into(),
            service_address: String::new(),
            role: ReplicaRole::Writer,
            state: ReplicaState::Active,
            is_leader: true,
        });
        store.create_collection_record(&coll).unwrap();

        let router = UpdateRouter::new(store, Arc::new(LocalTransport::new()));
        // n1 is not live, so neither shard has a live leader.
        let before = METRICS.writes_no_leader.get();
        for id in ["a", "b", "c", "d"] {
            let result = router.write("c", UpdateOp::Add(Document::new(id))).await;
            assert!(matches!(result, Err(Error::NoLeader { .. })));
        }
        assert!(METRICS.writes_no_leader.get() >= before + 4);
        assert!(matches!(
            router.write("missing", UpdateOp::Delete { id: "a".into() }).await,
            Err(Error::CollectionNotFound(_))
        ));
        assert!(matches!(router.commit("c").await, Err(Error::NoLeader { .. })));
    }

    #[test]
    fn test_route_is_stable() {
        let store = ClusterStateStore::new(Arc::new(MemorySubstrate::new())).unwrap();
        store
            .create_collection_record(&CollectionState::new("c", 3))
            .unwrap();
        let router = UpdateRouter::new(store, Arc::new(LocalTransport::new()));
        let shard_of = |id: &str| match router.route("c", id) {
            Err(Error::NoLeader { shard, .. }) => shard,
            other => panic!("unexpected {:?}", other.map(|(s, _)| s)),
        };
        assert_eq!(shard_of("doc-1"), shard_of("doc-1"));
        let expected = format!("shard{}", shard_index("doc-1", 3) + 1);
        assert_eq!(shard_of("doc-1"), expected);
    }
}
