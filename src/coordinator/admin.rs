//! Collection admin operations
//!
//! Creating and deleting collections, adding and removing replicas, and the
//! cluster property allowlist. Every operation edits the collection record in
//! the coordination substrate first and then asks the hosting nodes to create
//! or unload cores; replicas report their own progress through the record.

use crate::common::{
    validate_name, CollectionState, CoordinatorConfig, Error, Replica, ReplicaRole, ReplicaState,
    Result,
};
use crate::coordinator::election::LeaderElector;
use crate::coordinator::placement::{node_load, PlacementManager};
use crate::coordinator::predicates::{collection_absent, replica_absent};
use crate::coordinator::state::ClusterStateStore;
use crate::replica::replication::REPLICATION_TIMEOUT_PROPERTY;
use crate::replica::transport::{
    core_name, local_address, CoreDescriptor, CoreStatus, ReplicaTransport,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Cluster property capping replicas per node during placement.
pub const MAX_REPLICAS_PER_NODE_PROPERTY: &str = "max_replicas_per_node";
pub const LEGACY_CLOUD_PROPERTY: &str = "legacy_cloud";

/// Cluster properties that may be set.
pub const KNOWN_PROPERTIES: [&str; 3] = [
    MAX_REPLICAS_PER_NODE_PROPERTY,
    LEGACY_CLOUD_PROPERTY,
    REPLICATION_TIMEOUT_PROPERTY,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCollectionRequest {
    pub name: String,
    #[serde(default = "default_shards")]
    pub shards: usize,
    #[serde(default = "default_writer_count")]
    pub writer_count: usize,
    #[serde(default)]
    pub active_count: usize,
    #[serde(default)]
    pub passive_count: usize,
    #[serde(default)]
    pub max_replicas_per_node: Option<usize>,
}

fn default_shards() -> usize {
    1
}

fn default_writer_count() -> usize {
    1
}

impl CreateCollectionRequest {
    pub fn new(name: impl Into<String>, shards: usize) -> Self {
        Self {
            name: name.into(),
            shards,
            writer_count: 1,
            active_count: 0,
            passive_count: 0,
            max_replicas_per_node: None,
        }
    }

    pub fn replicas(mut self, writers: usize, actives: usize, passives: usize) -> Self {
        self.writer_count = writers;
        self.active_count = actives;
        self.passive_count = passives;
        self
    }

    fn roles(&self) -> Vec<ReplicaRole> {
        std::iter::repeat(ReplicaRole::Writer)
            .take(self.writer_count)
            .chain(std::iter::repeat(ReplicaRole::Active).take(self.active_count))
            .chain(std::iter::repeat(ReplicaRole::Passive).take(self.passive_count))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicaStatus {
    #[serde(flatten)]
    pub replica: Replica,
    pub live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core: Option<CoreStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardStatus {
    pub name: String,
    pub leader: Option<String>,
    pub replicas: Vec<ReplicaStatus>,
}

/// Descriptor of a collection as currently recorded.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStatus {
    pub name: String,
    pub version: u64,
    pub stale: bool,
    pub shards: Vec<ShardStatus>,
}

pub struct CollectionAdmin {
    store: ClusterStateStore,
    elector: Arc<LeaderElector>,
    transport: Arc<dyn ReplicaTransport>,
    config: CoordinatorConfig,
}

impl CollectionAdmin {
    pub fn new(
        store: ClusterStateStore,
        elector: Arc<LeaderElector>,
        transport: Arc<dyn ReplicaTransport>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            elector,
            transport,
            config,
        }
    }

    pub fn store(&self) -> &ClusterStateStore {
        &self.store
    }

    fn placement(&self, requested: Option<usize>) -> PlacementManager {
        let limit = requested
            .or_else(|| {
                self.store
                    .current()
                    .property(MAX_REPLICAS_PER_NODE_PROPERTY)
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(self.config.max_replicas_per_node);
        PlacementManager::new(limit)
    }

    fn core_descriptor(collection: &str, shard: &str, replica: &Replica) -> CoreDescriptor {
        CoreDescriptor {
            collection: collection.to_string(),
            shard: shard.to_string(),
            replica: replica.name.clone(),
            role: replica.role,
        }
    }

    fn new_replica(
        collection: &str,
        shard: &str,
        name: String,
        node_id: String,
        role: ReplicaRole,
    ) -> Replica {
        Replica {
            service_address: local_address(&node_id, &core_name(collection, shard, &name)),
            name,
            node_id,
            role,
            state: ReplicaState::Down,
            is_leader: false,
        }
    }

    /// Create a collection and start its cores. Returns the record as written.
    pub async fn create_collection(&self, req: CreateCollectionRequest) -> Result<CollectionState> {
        validate_name("collection", &req.name)?;
        if req.shards == 0 {
            return Err(Error::InvalidRequest("shards must be at least 1".into()));
        }
        let roles = req.roles();
        if roles.is_empty() {
            return Err(Error::InvalidRequest(
                "a shard needs at least one replica".into(),
            ));
        }

        let snapshot = self.store.force_refresh(&req.name)?;
        if snapshot.collection().is_some() {
            return Err(Error::CollectionExists(req.name.clone()));
        }
        let live: Vec<String> = snapshot.live_nodes().iter().cloned().collect();
        let mut load = node_load(snapshot.cluster());
        let placement = self.placement(req.max_replicas_per_node);

        let mut coll = CollectionState::new(&req.name, req.shards);
        for shard in 0..coll.shards.len() {
            let shard_name = coll.shards[shard].name.clone();
            let nodes = placement.place_shard(
                &req.name,
                &shard_name,
                roles.len(),
                &live,
                &BTreeSet::new(),
                &mut load,
            )?;
            for (node, role) in nodes.into_iter().zip(roles.iter().copied()) {
                let name = coll.allocate_replica_name();
                let replica = Self::new_replica(&req.name, &shard_name, name, node, role);
                coll.shards[shard].replicas.push(replica);
            }
        }

        self.store.create_collection_record(&coll)?;
        tracing::info!(
            "Created collection {} ({} shards, {} writer / {} active / {} passive per shard)",
            req.name,
            req.shards,
            req.writer_count,
            req.active_count,
            req.passive_count
        );

        for shard in &coll.shards {
            for replica in &shard.replicas {
                self.start_core(&coll.name, &shard.name, replica).await;
            }
        }
        Ok(coll)
    }

    async fn start_core(&self, collection: &str, shard: &str, replica: &Replica) {
        let descriptor = Self::core_descriptor(collection, shard, replica);
        if let Err(e) = self.transport.create_core(&replica.node_id, descriptor).await {
            // The replica stays Down in the record until its node hosts it.
            tracing::warn!(
                "Failed to create core {} on {}: {}",
                replica.name,
                replica.node_id,
                e
            );
        }
    }

    /// Add one replica of `role` to a shard.
    pub async fn add_replica(&self, collection: &str, shard: &str, role: ReplicaRole) -> Result<Replica> {
        let snapshot = self.store.force_refresh(collection)?;
        let coll = snapshot.require_collection()?;
        let hosting: BTreeSet<String> = coll
            .shard_or_err(shard)?
            .replicas
            .iter()
            .map(|r| r.node_id.clone())
            .collect();
        let live: Vec<String> = snapshot.live_nodes().iter().cloned().collect();
        let mut load = node_load(snapshot.cluster());
        let node = self
            .placement(None)
            .place_shard(collection, shard, 1, &live, &hosting, &mut load)?
            .remove(0);

        let mut added = None;
        self.store.mutate_collection(collection, |coll| {
            let name = coll.allocate_replica_name();
            let replica = Self::new_replica(collection, shard, name, node.clone(), role);
            coll.shard_mut_or_err(shard)?.replicas.push(replica.clone());
            added = Some(replica);
            Ok(true)
        })?;
        let replica = added.ok_or_else(|| Error::Internal("replica not recorded".into()))?;

        tracing::info!(
            "Added {} replica {} to {}/{} on {}",
            role,
            replica.name,
            collection,
            shard,
            replica.node_id
        );
        self.start_core(collection, shard, &replica).await;
        Ok(replica)
    }

    /// Remove a replica and wait until the record no longer lists it.
    pub async fn delete_replica(&self, collection: &str, shard: &str, replica: &str) -> Result<()> {
        let snapshot = self.store.force_refresh(collection)?;
        let coll = snapshot.require_collection()?;
        let entry = coll
            .shard_or_err(shard)?
            .replica(replica)
            .cloned()
            .ok_or_else(|| Error::ReplicaNotFound {
                collection: collection.to_string(),
                shard: shard.to_string(),
                replica: replica.to_string(),
            })?;

        if let Err(e) = self.transport.unload_core(&entry).await {
            // A dead node's token is already gone with its session.
            tracing::warn!("Unload of {} on {} failed: {}", entry.name, entry.node_id, e);
        }

        self.store.mutate_collection(collection, |coll| {
            let shard = coll.shard_mut_or_err(shard)?;
            let before = shard.replicas.len();
            shard.replicas.retain(|r| r.name != replica);
            Ok(shard.replicas.len() != before)
        })?;
        if entry.is_leader {
            tracing::warn!("Removed leader {} of {}/{}", replica, collection, shard);
        }
        self.elector.evaluate(collection, shard)?;

        self.store
            .wait_for_state(
                collection,
                self.config.state_wait_timeout(),
                replica_absent(shard, replica),
            )
            .await?;
        tracing::info!("Deleted replica {} of {}/{}", replica, collection, shard);
        Ok(())
    }

    /// Unload every core, remove the record, then wait until the collection is
    /// gone from the cluster view.
    pub async fn delete_collection(&self, name: &str) -> Result<()> {
        let snapshot = self.store.force_refresh(name)?;
        let coll = snapshot.require_collection()?;
        for replica in coll.replicas() {
            if let Err(e) = self.transport.unload_core(replica).await {
                tracing::warn!("Unload of {} on {} failed: {}", replica.name, replica.node_id, e);
            }
        }

        self.store.remove_collection_record(name)?;
        self.store
            .wait_for_state(name, self.config.deletion_timeout(), collection_absent())
            .await
            .map_err(|e| {
                tracing::error!("Collection {} still present after deletion: {}", name, e);
                e
            })?;
        tracing::info!("Deleted collection {}", name);
        Ok(())
    }

    /// Set or (with `None`) remove a cluster property from the allowlist.
    pub fn set_cluster_property(&self, key: &str, value: Option<String>) -> Result<()> {
        if !KNOWN_PROPERTIES.contains(&key) {
            return Err(Error::UnknownClusterProperty(key.to_string()));
        }
        if let Some(value) = &value {
            let valid = match key {
                LEGACY_CLOUD_PROPERTY => value == "true" || value == "false",
                _ => value.parse::<u64>().map(|v| v > 0).unwrap_or(false),
            };
            if !valid {
                return Err(Error::InvalidRequest(format!(
                    "invalid value for {}: {}",
                    key, value
                )));
            }
        }
        self.store.set_cluster_property(key, value.clone())?;
        tracing::info!("Cluster property {} set to {:?}", key, value);
        Ok(())
    }

    pub fn list_collections(&self) -> Vec<String> {
        self.store.current().collections.keys().cloned().collect()
    }

    /// Current record of a collection, with each live replica's own report
    /// when `with_cores` is set.
    pub async fn collection_status(&self, name: &str, with_cores: bool) -> Result<CollectionStatus> {
        let snapshot = self.store.get_state(name);
        let coll = snapshot.require_collection()?;
        let live = snapshot.live_nodes();

        let mut shards = Vec::with_capacity(coll.shards.len());
        for shard in &coll.shards {
            let mut replicas = Vec::with_capacity(shard.replicas.len());
            for replica in &shard.replicas {
                let is_live = live.contains(&replica.node_id);
                let core = if with_cores && is_live {
                    self.transport.core_status(replica).await.ok()
                } else {
                    None
                };
                replicas.push(ReplicaStatus {
                    replica: replica.clone(),
                    live: is_live,
                    core,
                });
            }
            shards.push(ShardStatus {
                name: shard.name.clone(),
                leader: shard.live_leader(live).map(|r| r.name.clone()),
                replicas,
            });
        }

        Ok(CollectionStatus {
            name: coll.name.clone(),
            version: coll.version,
            stale: snapshot.is_stale(),
            shards,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::election::SubstrateSequencer;
    use crate::coordinator::state::live_node_path;
    use crate::coordinator::substrate::{CoordinationSubstrate, MemorySubstrate};
    use crate::replica::transport::LocalTransport;

    fn admin_with_nodes(nodes: &[&str]) -> CollectionAdmin {
        let substrate = Arc::new(MemorySubstrate::new());
        for node in nodes {
            let session = substrate.open_session(node).unwrap();
            substrate
                .register_ephemeral(session, &live_node_path(node), vec![], false)
                .unwrap();
        }
        let store = ClusterStateStore::new(substrate.clone()).unwrap();
        let elector = Arc::new(LeaderElector::new(
            store.clone(),
            Arc::new(SubstrateSequencer::new(substrate)),
        ));
        CollectionAdmin::new(
            store,
            elector,
            Arc::new(LocalTransport::new()),
            CoordinatorConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_create_records_roles_per_shard() {
        let admin = admin_with_nodes(&["n1", "n2", "n3"]);
        let coll = admin
            .create_collection(CreateCollectionRequest::new("c", 2).replicas(1, 0, 3))
            .await
            .unwrap();
        assert_eq!(coll.replicas().count(), 8);
        assert_eq!(coll.replicas_of(ReplicaRole::Passive).count(), 6);
        assert_eq!(coll.replicas_of(ReplicaRole::Writer).count(), 2);
        assert!(coll.replicas().all(|r| r.state == ReplicaState::Down));

        let names: BTreeSet<_> = coll.replicas().map(|r| r.name.clone()).collect();
        assert_eq!(names.len(), 8);
        assert!(matches!(
            admin
                .create_collection(CreateCollectionRequest::new("c", 1))
                .await,
            Err(Error::CollectionExists(_))
        ));
    }

    #[tokio::test]
    async fn test_create_respects_node_limit() {
        let admin = admin_with_nodes(&["n1", "n2"]);
        let mut req = CreateCollectionRequest::new("c", 2).replicas(1, 1, 0);
        req.max_replicas_per_node = Some(1);
        assert!(matches!(
            admin.create_collection(req).await,
            Err(Error::InsufficientNodes { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let admin = admin_with_nodes(&["n1"]);
        assert!(admin
            .create_collection(CreateCollectionRequest::new("bad name", 1))
            .await
            .is_err());
        assert!(admin
            .create_collection(CreateCollectionRequest::new("c", 0))
            .await
            .is_err());
        assert!(admin
            .create_collection(CreateCollectionRequest::new("c", 1).replicas(0, 0, 0))
            .await
            .is_err());
    }

    #[test]
    fn test_cluster_property_allowlist() {
        let admin = admin_with_nodes(&["n1"]);
        admin
            .set_cluster_property("max_replicas_per_node", Some("4".into()))
            .unwrap();
        assert_eq!(
            admin.store().current().property("max_replicas_per_node"),
            Some("4")
        );
        assert!(matches!(
            admin.set_cluster_property("autoAddReplicas", Some("true".into())),
            Err(Error::UnknownClusterProperty(_))
        ));
        assert!(admin
            .set_cluster_property("legacy_cloud", Some("maybe".into()))
            .is_err());
        admin.set_cluster_property("max_replicas_per_node", None).unwrap();
        assert_eq!(
            admin.store().current().property("max_replicas_per_node"),
            None
        );
    }

    #[tokio::test]
    async fn test_missing_targets() {
        let admin = admin_with_nodes(&["n1"]);
        assert!(matches!(
            admin.delete_collection("nope").await,
            Err(Error::CollectionNotFound(_))
        ));
        admin
            .create_collection(CreateCollectionRequest::new("c", 1))
            .await
            .unwrap();
        assert!(matches!(
            admin.delete_replica("c", "shard1", "core_node9").await,
            Err(Error::ReplicaNotFound { .. })
        ));
        assert!(matches!(
            admin.add_replica("c", "shard7", ReplicaRole::Passive).await,
            Err(Error::ShardNotFound { .. })
        ));
    }
}
