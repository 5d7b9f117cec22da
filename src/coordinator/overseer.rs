//! Overseer
//!
//! Background reconciler. On every cluster state change, and whenever an
//! election token disappears, it marks replicas on departed nodes Down and
//! re-runs the election of every shard. Reconciling is idempotent and writes
//! nothing when the record already agrees.

use crate::common::{Error, ReplicaState, Result};
use crate::coordinator::election::LeaderElector;
use crate::coordinator::state::{ClusterStateStore, LIVE_NODES};
use crate::replica::lifecycle::{next_state, LifecycleEvent};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct Overseer {
    store: ClusterStateStore,
    elector: Arc<LeaderElector>,
}

impl Overseer {
    pub fn new(store: ClusterStateStore, elector: Arc<LeaderElector>) -> Self {
        Self { store, elector }
    }

    /// Run the reconcile loop until the returned task is aborted.
    pub fn spawn(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    async fn run(self) {
        let mut rx = self.store.subscribe();
        let kick = self.elector.kicked();
        loop {
            if let Err(e) = self.reconcile() {
                tracing::warn!("Reconcile failed: {}", e);
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    rx.borrow_and_update();
                }
                _ = kick.notified() => {}
            }
        }
    }

    /// One reconcile pass. Returns the number of replicas marked Down.
    pub fn reconcile(&self) -> Result<usize> {
        let state = self.store.current();
        let mut marked = 0;

        for (name, coll) in &state.collections {
            let stale_entries = coll.replicas().any(|r| {
                !state.live_nodes.contains(&r.node_id)
                    && (r.state != ReplicaState::Down || r.is_leader)
            });
            if stale_entries {
                match self.mark_departed(name) {
                    Ok(n) => marked += n,
                    Err(Error::CollectionNotFound(_)) => continue,
                    Err(e) => return Err(e),
                }
            }

            for shard in &coll.shards {
                match self.elector.evaluate(name, &shard.name) {
                    Ok(_) => {}
                    Err(Error::CollectionNotFound(_)) | Err(Error::ShardNotFound { .. }) => break,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(marked)
    }

    fn mark_departed(&self, collection: &str) -> Result<usize> {
        let substrate = self.store.substrate().clone();
        let mut marked = 0;
        self.store.mutate_collection(collection, |coll| {
            // Re-read on every attempt so a node that just rejoined is never
            // marked from an older view.
            let live: BTreeSet<String> = substrate.list_children(LIVE_NODES)?.into_iter().collect();
            marked = 0;
            for replica in coll.shards.iter_mut().flat_map(|s| s.replicas.iter_mut()) {
                if live.contains(&replica.node_id) {
                    continue;
                }
                if replica.state == ReplicaState::Down && !replica.is_leader {
                    continue;
                }
                replica.state = next_state(&replica.name, replica.state, LifecycleEvent::NodeLost)?;
                replica.is_leader = false;
                marked += 1;
            }
            Ok(marked > 0)
        })?;
        if marked > 0 {
            tracing::warn!(
                "Marked {} replicas of {} down after node loss",
                marked,
                collection
            );
        }
        Ok(marked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{CollectionState, Replica, ReplicaRole};
    use crate::coordinator::election::SubstrateSequencer;
    use crate::coordinator::state::live_node_path;
    use crate::coordinator::substrate::{CoordinationSubstrate, MemorySubstrate};

    #[test]
    fn test_reconcile_marks_departed_and_reelects() {
        let substrate = Arc::new(MemorySubstrate::new());
        let store = ClusterStateStore::new(substrate.clone()).unwrap();
        let mut coll = CollectionState::new("c", 1);
        for (node, role) in [
            ("n1", ReplicaRole::Writer),
            ("n2", ReplicaRole::Writer),
            ("n3", ReplicaRole::Passive),
        ] {
            let name = coll.allocate_replica_name();
            coll.shards[0].replicas.push(Replica {
                name,
                node_id: node.into(),
                service_address: String::new(),
                role,
                state: ReplicaState::Active,
                is_leader: false,
            });
        }
        store.create_collection_record(&coll).unwrap();

        let elector = Arc::new(LeaderElector::new(
            store.clone(),
            Arc::new(SubstrateSequencer::new(substrate.clone())),
        ));
        let mut sessions = Vec::new();
        for (i, node) in ["n1", "n2", "n3"].iter().enumerate() {
            let session = substrate.open_session(node).unwrap();
            substrate
                .register_ephemeral(session, &live_node_path(node), vec![], false)
                .unwrap();
            if i < 2 {
                elector
                    .contend(
                        session,
                        "c",
                        "shard1",
                        &format!("core_node{}", i + 1),
                        node,
                        ReplicaRole::Writer,
                    )
                    .unwrap();
            }
            sessions.push(session);
        }

        let overseer = Overseer::new(store.clone(), elector);
        assert_eq!(overseer.reconcile().unwrap(), 0);
        let leader = |store: &ClusterStateStore| {
            store
                .get_state("c")
                .collection()
                .and_then(|c| c.shards[0].leader().map(|r| r.name.clone()))
        };
        assert_eq!(leader(&store).as_deref(), Some("core_node1"));

        substrate.close_session(sessions[0]).unwrap();
        assert_eq!(overseer.reconcile().unwrap(), 1);
        assert_eq!(leader(&store).as_deref(), Some("core_node2"));
        let snapshot = store.get_state("c");
        let coll = snapshot.collection().unwrap();
        assert_eq!(coll.shards[0].replicas[0].state, ReplicaState::Down);
        assert_eq!(coll.shards[0].replicas[2].state, ReplicaState::Active);

        // Nothing left to do.
        assert_eq!(overseer.reconcile().unwrap(), 0);
    }
}
