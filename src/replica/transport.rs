//! Replica transport
//!
//! Every call between the coordinator, the router and replicas goes through
//! [`ReplicaTransport`]. The wire protocol is an external collaborator;
//! [`LocalTransport`] dispatches to in-process [`ReplicaNode`]s and fails with
//! a connection error when the target node is down.
//!
//! A replica's `service_address` names its core on the hosting node:
//! `local://<node>/<collection>_<shard>_<replica>`.

use crate::common::{Error, Replica, ReplicaRole, Result};
use crate::replica::engine::{Document, IndexSnapshot, QueryExpr, UpdateHandlerStats, UpdateOp};
use crate::replica::core::ReplicaCore;
use crate::replica::node::ReplicaNode;
use crate::replica::update_log::LogEntry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

/// What a node needs to host a core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreDescriptor {
    pub collection: String,
    pub shard: String,
    pub replica: String,
    pub role: ReplicaRole,
}

impl CoreDescriptor {
    pub fn core_name(&self) -> String {
        core_name(&self.collection, &self.shard, &self.replica)
    }
}

/// Name of a core on its node. Replica names are only unique per collection.
pub fn core_name(collection: &str, shard: &str, replica: &str) -> String {
    format!("{}_{}_{}", collection, shard, replica)
}

pub fn local_address(node_id: &str, core_name: &str) -> String {
    format!("local://{}/{}", node_id, core_name)
}

/// A leader's committed state plus the log offset it corresponds to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexTransfer {
    pub leader: String,
    pub snapshot: IndexSnapshot,
    /// First log sequence not reflected in `snapshot`; `None` for log-less cores
    pub log_head: Option<u64>,
}

/// Log entries from an offset. `entries` is `None` when the source no longer
/// holds the offset and a bulk resync is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateBatch {
    pub leader: String,
    pub entries: Option<Vec<LogEntry>>,
    pub head: u64,
}

/// Local view of a core, as reported by its node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreStatus {
    pub replica: String,
    pub role: ReplicaRole,
    pub num_docs: usize,
    pub stats: UpdateHandlerStats,
    pub log_head: Option<u64>,
    pub synced_leader: Option<String>,
}

#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    async fn create_core(&self, node_id: &str, descriptor: CoreDescriptor) -> Result<()>;

    async fn unload_core(&self, target: &Replica) -> Result<()>;

    /// Send one update to `target`, which applies it only if it is the live leader.
    async fn forward_update(&self, target: &Replica, op: UpdateOp) -> Result<u64>;

    async fn commit(&self, target: &Replica) -> Result<u64>;

    async fn query(&self, target: &Replica, query: &QueryExpr) -> Result<Vec<Document>>;

    async fn fetch_index(&self, source: &Replica) -> Result<IndexTransfer>;

    async fn fetch_updates(&self, source: &Replica, since: u64) -> Result<UpdateBatch>;

    /// Tell `follower` that `leader` committed.
    async fn notify_commit(&self, follower: &Replica, leader: &str) -> Result<()>;

    async fn core_status(&self, target: &Replica) -> Result<CoreStatus>;
}

/// In-process transport over registered nodes.
#[derive(Default)]
pub struct LocalTransport {
    nodes: RwLock<HashMap<String, Weak<ReplicaNode>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: &Arc<ReplicaNode>) {
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node.id().to_string(), Arc::downgrade(node));
    }

    fn node(&self, node_id: &str) -> Result<Arc<ReplicaNode>> {
        let node = self
            .nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(node_id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::ConnectionFailed(format!("unknown node {}", node_id)))?;
        if !node.is_up() {
            return Err(Error::ConnectionFailed(format!("node {} is down", node_id)));
        }
        Ok(node)
    }

    fn core(&self, target: &Replica) -> Result<Arc<ReplicaCore>> {
        self.node(&target.node_id)?.core(address_core(target)?)
    }
}

fn address_core(target: &Replica) -> Result<&str> {
    target
        .service_address
        .strip_prefix("local://")
        .and_then(|rest| rest.split_once('/'))
        .map(|(_, core)| core)
        .filter(|core| !core.is_empty())
        .ok_or_else(|| {
            Error::ConnectionFailed(format!(
                "unsupported address {:?} for {}",
                target.service_address, target.name
            ))
        })
}

#[async_trait]
impl ReplicaTransport for LocalTransport {
    async fn create_core(&self, node_id: &str, descriptor: CoreDescriptor) -> Result<()> {
        self.node(node_id)?.create_core(descriptor)
    }

    async fn unload_core(&self, target: &Replica) -> Result<()> {
        self.node(&target.node_id)?
            .unload_core(address_core(target)?)
    }

    async fn forward_update(&self, target: &Replica, op: UpdateOp) -> Result<u64> {
        self.core(target)?.handle_update(op).await
    }

    async fn commit(&self, target: &Replica) -> Result<u64> {
        self.node(&target.node_id)?
            .commit(address_core(target)?)
            .await
    }

    async fn query(&self, target: &Replica, query: &QueryExpr) -> Result<Vec<Document>> {
        self.core(target)?.handle_query(query)
    }

    async fn fetch_index(&self, source: &Replica) -> Result<IndexTransfer> {
        self.core(source)?.index_transfer().await
    }

    async fn fetch_updates(&self, source: &Replica, since: u64) -> Result<UpdateBatch> {
        Ok(self.core(source)?.updates_since(since))
    }

    async fn notify_commit(&self, follower: &Replica, leader: &str) -> Result<()> {
        self.node(&follower.node_id)?
            .on_commit_notice(address_core(follower)?, leader)
    }

    async fn core_status(&self, target: &Replica) -> Result<CoreStatus> {
        self.core(target)?.status()
    }
}
