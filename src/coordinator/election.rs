//! Per-shard leader election
//!
//! Leader-eligible replicas register a sequential ephemeral token under the
//! shard's election path. The lowest token whose replica can lead and whose
//! node is live wins; the win is confirmed by a compare-and-swap of the
//! collection record that moves the `is_leader` flag. Losers keep their token
//! and simply wait for the tokens ahead of them to disappear.

use crate::common::{Error, ReplicaRole, Result, METRICS};
use crate::coordinator::state::{election_path, ClusterStateStore, LIVE_NODES};
use crate::coordinator::substrate::{
    CoordinationSubstrate, SessionId, WatchEvent, WatchEventKind, WatchId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

const TOKEN_PREFIX: &str = "n_";

/// A registered election token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionToken {
    pub path: String,
    pub sequence: u64,
    pub replica: String,
    pub node_id: String,
    pub role: ReplicaRole,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenData {
    replica: String,
    node_id: String,
    role: ReplicaRole,
}

/// Election state of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardElectionState {
    NoLeader,
    LeaderPending,
    LeaderActive,
}

pub type LivenessCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Ordered-token capability the election is expressed against.
pub trait Sequencer: Send + Sync {
    /// Register a token for `replica` under `election`, bound to `session`.
    fn register_token(
        &self,
        session: SessionId,
        election: &str,
        replica: &str,
        node_id: &str,
        role: ReplicaRole,
    ) -> Result<ElectionToken>;

    fn release_token(&self, token: &ElectionToken) -> Result<()>;

    /// All tokens under `election`, lowest sequence first.
    fn tokens(&self, election: &str) -> Result<Vec<ElectionToken>>;

    /// Lowest token that may lead and whose node is live.
    fn observe_lowest_live_token(
        &self,
        election: &str,
        live_nodes: &BTreeSet<String>,
    ) -> Result<Option<ElectionToken>> {
        Ok(self
            .tokens(election)?
            .into_iter()
            .find(|t| t.role.capabilities().can_lead && live_nodes.contains(&t.node_id)))
    }

    /// Invoke `callback` with the token path whenever a token under `election`
    /// disappears.
    fn on_liveness_loss(&self, election: &str, callback: LivenessCallback) -> Result<WatchId>;

    fn cancel(&self, id: WatchId);
}

/// [`Sequencer`] over sequential ephemeral registrations.
pub struct SubstrateSequencer {
    substrate: Arc<dyn CoordinationSubstrate>,
}

impl SubstrateSequencer {
    pub fn new(substrate: Arc<dyn CoordinationSubstrate>) -> Self {
        Self { substrate }
    }
}

impl Sequencer for SubstrateSequencer {
    fn register_token(
        &self,
        session: SessionId,
        election: &str,
        replica: &str,
        node_id: &str,
        role: ReplicaRole,
    ) -> Result<ElectionToken> {
        let data = serde_json::to_vec(&TokenData {
            replica: replica.to_string(),
            node_id: node_id.to_string(),
            role,
        })?;
        let registration = self.substrate.register_ephemeral(
            session,
            &format!("{}/{}", election, TOKEN_PREFIX),
            data,
            true,
        )?;
        Ok(ElectionToken {
            path: registration.path,
            sequence: registration.sequence,
            replica: replica.to_string(),
            node_id: node_id.to_string(),
            role,
        })
    }

    fn release_token(&self, token: &ElectionToken) -> Result<()> {
        self.substrate.delete(&token.path, None)?;
        Ok(())
    }

    fn tokens(&self, election: &str) -> Result<Vec<ElectionToken>> {
        let mut tokens = Vec::new();
        for child in self.substrate.list_children(election)? {
            let Some(sequence) = child
                .strip_prefix(TOKEN_PREFIX)
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            let path = format!("{}/{}", election, child);
            // Gone between listing and reading.
            let Some(record) = self.substrate.read(&path)? else {
                continue;
            };
            let data: TokenData = serde_json::from_slice(&record.data)?;
            tokens.push(ElectionToken {
                path,
                sequence,
                replica: data.replica,
                node_id: data.node_id,
                role: data.role,
            });
        }
        tokens.sort_by_key(|t| t.sequence);
        Ok(tokens)
    }

    fn on_liveness_loss(&self, election: &str, callback: LivenessCallback) -> Result<WatchId> {
        self.substrate.watch(
            election,
            Arc::new(move |event: &WatchEvent| {
                if event.kind == WatchEventKind::Deleted {
                    callback(&event.path);
                }
            }),
        )
    }

    fn cancel(&self, id: WatchId) {
        self.substrate.unwatch(id);
    }
}

/// Runs elections for every shard against one [`Sequencer`].
pub struct LeaderElector {
    store: ClusterStateStore,
    sequencer: Arc<dyn Sequencer>,
    kick: Arc<Notify>,
    watched: Mutex<HashMap<String, WatchId>>,
}

impl LeaderElector {
    pub fn new(store: ClusterStateStore, sequencer: Arc<dyn Sequencer>) -> Self {
        Self {
            store,
            sequencer,
            kick: Arc::new(Notify::new()),
            watched: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &ClusterStateStore {
        &self.store
    }

    /// Notified whenever a token of a watched election disappears.
    pub fn kicked(&self) -> Arc<Notify> {
        self.kick.clone()
    }

    /// Register `replica` as a candidate. Only leader-eligible roles may contend.
    pub fn contend(
        &self,
        session: SessionId,
        collection: &str,
        shard: &str,
        replica: &str,
        node_id: &str,
        role: ReplicaRole,
    ) -> Result<ElectionToken> {
        if !role.capabilities().participates_in_election {
            return Err(Error::IneligibleRole {
                replica: replica.to_string(),
                role: role.to_string(),
            });
        }
        let election = election_path(collection, shard);
        self.watch_election(&election)?;
        let token = self
            .sequencer
            .register_token(session, &election, replica, node_id, role)?;
        tracing::info!(
            "Replica {} registered election token {} for {}/{}",
            replica,
            token.sequence,
            collection,
            shard
        );
        Ok(token)
    }

    pub fn withdraw(&self, token: &ElectionToken) -> Result<()> {
        tracing::info!("Replica {} released election token {}", token.replica, token.sequence);
        self.sequencer.release_token(token)
    }

    fn watch_election(&self, election: &str) -> Result<()> {
        let mut watched = self.watched.lock().unwrap_or_else(|e| e.into_inner());
        if watched.contains_key(election) {
            return Ok(());
        }
        let kick = self.kick.clone();
        let id = self.sequencer.on_liveness_loss(
            election,
            Arc::new(move |path: &str| {
                tracing::debug!("Election token {} disappeared", path);
                kick.notify_one();
            }),
        )?;
        watched.insert(election.to_string(), id);
        Ok(())
    }

    fn live_nodes(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .store
            .substrate()
            .list_children(LIVE_NODES)?
            .into_iter()
            .collect())
    }

    /// Confirm the current winner of a shard's election in the collection
    /// record. Returns the leader's replica name, if any.
    pub fn evaluate(&self, collection: &str, shard: &str) -> Result<Option<String>> {
        let live = self.live_nodes()?;
        let tokens = self.sequencer.tokens(&election_path(collection, shard))?;

        let mut previous = None;
        let mut winner = None;
        let changed = self.store.mutate_collection(collection, |coll| {
            let shard_state = coll.shard_mut_or_err(shard)?;
            previous = shard_state.leader().map(|r| r.name.clone());
            winner = tokens
                .iter()
                .filter(|t| t.role.capabilities().can_lead && live.contains(&t.node_id))
                .find(|t| {
                    shard_state
                        .replica(&t.replica)
                        .map(|r| r.role.capabilities().can_lead && r.node_id == t.node_id)
                        .unwrap_or(false)
                })
                .map(|t| t.replica.clone());

            let mut changed = false;
            for replica in shard_state.replicas.iter_mut() {
                let lead = winner.as_deref() == Some(replica.name.as_str());
                if replica.is_leader != lead {
                    replica.is_leader = lead;
                    changed = true;
                }
            }
            Ok(changed)
        })?;

        if changed {
            match (&previous, &winner) {
                (_, Some(new)) => {
                    METRICS.leaders_elected.inc();
                    tracing::info!(
                        "Leader of {}/{}: {:?} -> {}",
                        collection,
                        shard,
                        previous,
                        new
                    );
                }
                (Some(old), None) => {
                    METRICS.leaders_lost.inc();
                    tracing::warn!("Leader {} of {}/{} lost, no live writer", old, collection, shard);
                }
                (None, None) => {}
            }
        }
        Ok(winner)
    }

    pub fn election_state(&self, collection: &str, shard: &str) -> Result<ShardElectionState> {
        let snapshot = self.store.get_state(collection);
        let coll = snapshot.require_collection()?;
        let shard_state = coll.shard_or_err(shard)?;
        if shard_state.live_leader(snapshot.live_nodes()).is_some() {
            return Ok(ShardElectionState::LeaderActive);
        }
        let live = self.live_nodes()?;
        match self
            .sequencer
            .observe_lowest_live_token(&election_path(collection, shard), &live)?
        {
            Some(_) => Ok(ShardElectionState::LeaderPending),
            None => Ok(ShardElectionState::NoLeader),
        }
    }

    /// Re-check, right before acting as leader, that `token` is still the
    /// winning registration and the record names its replica as leader.
    pub fn revalidate(&self, collection: &str, shard: &str, token: &ElectionToken) -> Result<bool> {
        let live = self.live_nodes()?;
        let lowest = self
            .sequencer
            .observe_lowest_live_token(&election_path(collection, shard), &live)?;
        if lowest.as_ref().map(|t| &t.path) != Some(&token.path) {
            return Ok(false);
        }
        let snapshot = self.store.get_state(collection);
        Ok(snapshot
            .collection()
            .and_then(|c| c.shard(shard))
            .and_then(|s| s.replica(&token.replica))
            .map(|r| r.is_leader)
            .unwrap_or(false))
    }
}

impl Drop for LeaderElector {
    fn drop(&mut self) {
        let watched = std::mem::take(&mut *self.watched.lock().unwrap_or_else(|e| e.into_inner()));
        for (_, id) in watched {
            self.sequencer.cancel(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{CollectionState, Replica, ReplicaState};
    use crate::coordinator::state::live_node_path;
    use crate::coordinator::substrate::MemorySubstrate;

    struct Fixture {
        substrate: Arc<MemorySubstrate>,
        elector: LeaderElector,
    }

    fn fixture(replicas: &[(&str, ReplicaRole)]) -> Fixture {
        let substrate = Arc::new(MemorySubstrate::new());
        let store = ClusterStateStore::new(substrate.clone()).unwrap();
        let mut coll = CollectionState::new("c", 1);
        for (node, role) in replicas {
            let name = coll.allocate_replica_name();
            coll.shards[0].replicas.push(Replica {
                name,
                node_id: node.to_string(),
                service_address: format!("local://{}", node),
                role: *role,
                state: ReplicaState::Active,
                is_leader: false,
            });
        }
        store.create_collection_record(&coll).unwrap();
        let sequencer = Arc::new(SubstrateSequencer::new(substrate.clone()));
        Fixture {
            substrate,
            elector: LeaderElector::new(store, sequencer),
        }
    }

    fn join(substrate: &MemorySubstrate, node: &str) -> SessionId {
        let session = substrate.open_session(node).unwrap();
        substrate
            .register_ephemeral(session, &live_node_path(node), vec![], false)
            .unwrap();
        session
    }

    fn leaders(f: &Fixture) -> Vec<String> {
        f.elector
            .store()
            .get_state("c")
            .collection()
            .unwrap()
            .replicas()
            .filter(|r| r.is_leader)
            .map(|r| r.name.clone())
            .collect()
    }

    #[test]
    fn test_passive_cannot_contend() {
        let f = fixture(&[("n1", ReplicaRole::Passive)]);
        let session = join(&f.substrate, "n1");
        let result = f
            .elector
            .contend(session, "c", "shard1", "core_node1", "n1", ReplicaRole::Passive);
        assert!(matches!(result, Err(Error::IneligibleRole { .. })));
        let result = f
            .elector
            .contend(session, "c", "shard1", "core_node1", "n1", ReplicaRole::Active);
        assert!(matches!(result, Err(Error::IneligibleRole { .. })));
    }

    #[test]
    fn test_lowest_token_wins() {
        let f = fixture(&[("n1", ReplicaRole::Writer), ("n2", ReplicaRole::Writer)]);
        let s1 = join(&f.substrate, "n1");
        let s2 = join(&f.substrate, "n2");
        assert_eq!(
            f.elector.election_state("c", "shard1").unwrap(),
            ShardElectionState::NoLeader
        );

        let t2 = f
            .elector
            .contend(s2, "c", "shard1", "core_node2", "n2", ReplicaRole::Writer)
            .unwrap();
        let t1 = f
            .elector
            .contend(s1, "c", "shard1", "core_node1", "n1", ReplicaRole::Writer)
            .unwrap();
        assert_eq!(
            f.elector.election_state("c", "shard1").unwrap(),
            ShardElectionState::LeaderPending
        );

        let winner = f.elector.evaluate("c", "shard1").unwrap();
        assert_eq!(winner.as_deref(), Some("core_node2"));
        assert_eq!(leaders(&f), vec!["core_node2"]);
        assert_eq!(
            f.elector.election_state("c", "shard1").unwrap(),
            ShardElectionState::LeaderActive
        );
        assert!(f.elector.revalidate("c", "shard1", &t2).unwrap());
        assert!(!f.elector.revalidate("c", "shard1", &t1).unwrap());
    }

    #[test]
    fn test_failover_on_session_loss() {
        let f = fixture(&[("n1", ReplicaRole::Writer), ("n2", ReplicaRole::Writer)]);
        let s1 = join(&f.substrate, "n1");
        let s2 = join(&f.substrate, "n2");
        let t1 = f
            .elector
            .contend(s1, "c", "shard1", "core_node1", "n1", ReplicaRole::Writer)
            .unwrap();
        f.elector
            .contend(s2, "c", "shard1", "core_node2", "n2", ReplicaRole::Writer)
            .unwrap();
        f.elector.evaluate("c", "shard1").unwrap();
        assert_eq!(leaders(&f), vec!["core_node1"]);

        f.substrate.close_session(s1).unwrap();
        assert!(!f.elector.revalidate("c", "shard1", &t1).unwrap());
        f.elector.evaluate("c", "shard1").unwrap();
        assert_eq!(leaders(&f), vec!["core_node2"]);
    }

    #[test]
    fn test_no_live_writer_means_no_leader() {
        let f = fixture(&[("n1", ReplicaRole::Writer), ("n2", ReplicaRole::Passive)]);
        let s1 = join(&f.substrate, "n1");
        join(&f.substrate, "n2");
        f.elector
            .contend(s1, "c", "shard1", "core_node1", "n1", ReplicaRole::Writer)
            .unwrap();
        f.elector.evaluate("c", "shard1").unwrap();
        f.substrate.close_session(s1).unwrap();

        assert_eq!(f.elector.evaluate("c", "shard1").unwrap(), None);
        assert!(leaders(&f).is_empty());
        assert_eq!(
            f.elector.election_state("c", "shard1").unwrap(),
            ShardElectionState::NoLeader
        );
    }

    #[test]
    fn test_liveness_loss_kicks() {
        let f = fixture(&[("n1", ReplicaRole::Writer)]);
        let s1 = join(&f.substrate, "n1");
        let token = f
            .elector
            .contend(s1, "c", "shard1", "core_node1", "n1", ReplicaRole::Writer)
            .unwrap();
        let kick = f.elector.kicked();
        f.elector.withdraw(&token).unwrap();
        // A stored permit makes this resolve immediately.
        tokio_test::block_on(kick.notified());
        assert!(f.elector.evaluate("c", "shard1").unwrap().is_none());
    }
}
