//! In-process cluster
//!
//! Wires a coordination substrate, the cluster state store, election, the
//! overseer and a set of replica nodes into one process. Nodes can be killed
//! and restarted to exercise failover. The coordinator binary serves this
//! cluster over HTTP, and the integration tests drive it directly.

use crate::common::{Config, Error, Result};
use crate::coordinator::metadata::MetadataStore;
use crate::coordinator::{
    ClusterStateStore, CollectionAdmin, LeaderElector, MemorySubstrate, Overseer,
    SubstrateSequencer, UpdateRouter,
};
use crate::replica::transport::core_name;
use crate::replica::{LocalTransport, ReplicaCore, ReplicaNode, ReplicationEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct LocalCluster {
    substrate: Arc<MemorySubstrate>,
    store: ClusterStateStore,
    elector: Arc<LeaderElector>,
    nodes: Vec<Arc<ReplicaNode>>,
    admin: Arc<CollectionAdmin>,
    router: Arc<UpdateRouter>,
    overseer: JoinHandle<()>,
}

impl LocalCluster {
    /// Start `config.coordinator.local_nodes` nodes named `node1..nodeN`.
    ///
    /// Cluster records are kept in RocksDB when `coordinator.db_path` is set;
    /// update logs go under `data_dir` when given. Must run inside a tokio
    /// runtime.
    pub fn start(config: &Config, data_dir: Option<PathBuf>) -> Result<Self> {
        let substrate = match &config.coordinator.db_path {
            Some(path) => Arc::new(MemorySubstrate::with_store(Arc::new(MetadataStore::open(
                path,
            )?))?),
            None => Arc::new(MemorySubstrate::new()),
        };
        Self::with_substrate(substrate, config, data_dir)
    }

    pub fn with_substrate(
        substrate: Arc<MemorySubstrate>,
        config: &Config,
        data_dir: Option<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        let store = ClusterStateStore::new(substrate.clone())?;
        let elector = Arc::new(LeaderElector::new(
            store.clone(),
            Arc::new(SubstrateSequencer::new(substrate.clone())),
        ));
        let transport = Arc::new(LocalTransport::new());
        let replication = Arc::new(ReplicationEngine::new(
            store.clone(),
            elector.clone(),
            transport.clone(),
            config.replication.clone(),
        ));

        let nodes: Vec<Arc<ReplicaNode>> = (1..=config.coordinator.local_nodes)
            .map(|i| {
                ReplicaNode::new(
                    format!("node{}", i),
                    store.clone(),
                    elector.clone(),
                    replication.clone(),
                    data_dir.clone(),
                )
            })
            .collect();
        for node in &nodes {
            transport.register(node);
        }

        // Records loaded from disk still describe the previous run; no node is
        // live yet, so this marks every replica Down before nodes rejoin.
        let overseer = Overseer::new(store.clone(), elector.clone());
        let marked = overseer.reconcile()?;
        if marked > 0 {
            tracing::info!("Marked {} recorded replicas down at startup", marked);
        }
        for node in &nodes {
            node.start()?;
        }
        let overseer = overseer.spawn();
        let admin = Arc::new(CollectionAdmin::new(
            store.clone(),
            elector.clone(),
            transport.clone(),
            config.coordinator.clone(),
        ));
        let router = Arc::new(UpdateRouter::new(store.clone(), transport));

        tracing::info!("Local cluster started with {} nodes", nodes.len());
        Ok(Self {
            substrate,
            store,
            elector,
            nodes,
            admin,
            router,
            overseer,
        })
    }

    pub fn substrate(&self) -> &Arc<MemorySubstrate> {
        &self.substrate
    }

    pub fn store(&self) -> &ClusterStateStore {
        &self.store
    }

    pub fn elector(&self) -> &Arc<LeaderElector> {
        &self.elector
    }

    pub fn admin(&self) -> &Arc<CollectionAdmin> {
        &self.admin
    }

    pub fn router(&self) -> &Arc<UpdateRouter> {
        &self.router
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.id().to_string()).collect()
    }

    pub fn node(&self, id: &str) -> Result<&Arc<ReplicaNode>> {
        self.nodes
            .iter()
            .find(|n| n.id() == id)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown node {}", id)))
    }

    /// Stop a node: its session closes, so its live registration and election
    /// tokens disappear.
    pub fn kill_node(&self, id: &str) -> Result<()> {
        self.node(id)?.stop()
    }

    pub fn restart_node(&self, id: &str) -> Result<()> {
        self.node(id)?.start()
    }

    /// The core behind a recorded replica.
    pub fn core(&self, collection: &str, replica: &str) -> Result<Arc<ReplicaCore>> {
        let snapshot = self.store.get_state(collection);
        let coll = snapshot.require_collection()?;
        let (shard, entry) = coll.locate(replica).ok_or_else(|| Error::ReplicaNotFound {
            collection: collection.to_string(),
            shard: String::new(),
            replica: replica.to_string(),
        })?;
        self.node(&entry.node_id)?
            .core(&core_name(collection, &shard.name, replica))
    }

    /// Stop every node and the overseer.
    pub fn shutdown(&self) {
        self.overseer.abort();
        for node in &self.nodes {
            if let Err(e) = node.stop() {
                tracing::warn!("Stopping {} failed: {}", node.id(), e);
            }
        }
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.overseer.abort();
    }
}
