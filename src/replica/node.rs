//! Replica node
//!
//! A node hosts replica cores. While up it holds a substrate session that
//! carries its `/live_nodes` registration and the election tokens of its
//! Writer cores; stopping the node closes the session, which is how the rest
//! of the cluster observes the node leaving.
//!
//! Cores survive a stop/start cycle, so a restarted node comes back with the
//! data it had.

use crate::common::{Error, ReplicaState, Result};
use crate::coordinator::election::LeaderElector;
use crate::coordinator::state::{live_node_path, ClusterState};
use crate::coordinator::substrate::{CoordinationSubstrate, SessionId};
use crate::coordinator::ClusterStateStore;
use crate::replica::core::{remove_log_file, ReplicaCore};
use crate::replica::engine::MemoryEngine;
use crate::replica::lifecycle::record_startup;
use crate::replica::replication::ReplicationEngine;
use crate::replica::transport::CoreDescriptor;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::task::JoinHandle;

pub struct ReplicaNode {
    id: String,
    store: ClusterStateStore,
    elector: Arc<LeaderElector>,
    replication: Arc<ReplicationEngine>,
    data_dir: Option<PathBuf>,
    cores: RwLock<HashMap<String, Arc<ReplicaCore>>>,
    session: Mutex<Option<SessionId>>,
    up: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
    me: Weak<ReplicaNode>,
}

impl ReplicaNode {
    pub fn new(
        id: impl Into<String>,
        store: ClusterStateStore,
        elector: Arc<LeaderElector>,
        replication: Arc<ReplicationEngine>,
        data_dir: Option<PathBuf>,
    ) -> Arc<Self> {
        let id = id.into();
        let data_dir = data_dir.map(|d| d.join(&id));
        Arc::new_cyclic(|me| Self {
            id,
            store,
            elector,
            replication,
            data_dir,
            cores: RwLock::new(HashMap::new()),
            session: Mutex::new(None),
            up: AtomicBool::new(false),
            watcher: Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn substrate(&self) -> &Arc<dyn CoordinationSubstrate> {
        self.store.substrate()
    }

    fn session(&self) -> Option<SessionId> {
        *self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Join the cluster: register as live, start watching cluster state and
    /// bring every hosted core back.
    pub fn start(&self) -> Result<()> {
        if self.is_up() {
            return Ok(());
        }
        let session = self.substrate().open_session(&self.id)?;
        self.substrate().register_ephemeral(
            session,
            &live_node_path(&self.id),
            self.id.as_bytes().to_vec(),
            false,
        )?;
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session);
        self.up.store(true, Ordering::SeqCst);

        let rx = self.store.subscribe();
        let me = self.me.clone();
        let handle = tokio::spawn(async move {
            let mut rx = rx;
            while rx.changed().await.is_ok() {
                let state = rx.borrow_and_update().clone();
                let Some(node) = me.upgrade() else {
                    break;
                };
                node.on_state_change(&state);
            }
        });
        if let Some(old) = self
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            old.abort();
        }

        let dropped = self.drop_orphaned_cores();
        if dropped > 0 {
            tracing::info!("Node {} dropped {} cores deleted while it was down", self.id, dropped);
        }
        let discovered = self.load_assigned_cores()?;
        if discovered > 0 {
            tracing::info!("Node {} loaded {} cores from cluster state", self.id, discovered);
        }
        let cores = self.cores();
        tracing::info!("Node {} joined with {} cores", self.id, cores.len());
        for core in cores {
            self.spawn_bring_up(core, true);
        }
        Ok(())
    }

    /// Leave the cluster. Hosted cores keep their data.
    pub fn stop(&self) -> Result<()> {
        if !self.up.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        for core in self.cores() {
            // Tokens die with the session.
            core.take_token();
        }
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(session) = session {
            self.substrate().close_session(session)?;
        }
        tracing::warn!("Node {} stopped", self.id);
        Ok(())
    }

    pub fn cores(&self) -> Vec<Arc<ReplicaCore>> {
        self.cores
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Look up a hosted core by its core name.
    pub fn core(&self, core_name: &str) -> Result<Arc<ReplicaCore>> {
        self.cores
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(core_name)
            .cloned()
            .ok_or_else(|| {
                Error::ConnectionFailed(format!("core {} is not hosted on {}", core_name, self.id))
            })
    }

    /// Open a core unless it is already hosted.
    fn open_core(&self, descriptor: CoreDescriptor) -> Result<Option<Arc<ReplicaCore>>> {
        let mut cores = self.cores.write().unwrap_or_else(|e| e.into_inner());
        let name = descriptor.core_name();
        if cores.contains_key(&name) {
            return Ok(None);
        }
        let core = Arc::new(ReplicaCore::new(
            descriptor,
            self.id.clone(),
            Arc::new(MemoryEngine::new()),
            self.elector.clone(),
            self.data_dir.as_deref(),
            self.replication.config().log_retention,
        )?);
        cores.insert(name, core.clone());
        Ok(Some(core))
    }

    /// Host a new core and bring it up in the background. A hosted core with
    /// the same name belongs to a deleted replica and is replaced.
    pub fn create_core(&self, descriptor: CoreDescriptor) -> Result<()> {
        let name = descriptor.core_name();
        if self.discard_core(&name)? {
            tracing::warn!("Node {} replaced stale core {}", self.id, name);
        }
        if let Some(dir) = &self.data_dir {
            remove_log_file(dir, &name)?;
        }
        let Some(core) = self.open_core(descriptor)? else {
            return Ok(());
        };
        tracing::info!(
            "Node {} created core {} ({}) for {}/{}",
            self.id,
            core.name(),
            core.role(),
            core.collection(),
            core.shard()
        );
        self.spawn_bring_up(core, false);
        Ok(())
    }

    /// Open the cores the cluster state assigns to this node that are not
    /// hosted yet, e.g. after the whole process restarted.
    fn load_assigned_cores(&self) -> Result<usize> {
        let state = self.store.current();
        let mut loaded = 0;
        for coll in state.collections.values() {
            for shard in &coll.shards {
                for replica in shard.replicas.iter().filter(|r| r.node_id == self.id) {
                    let descriptor = CoreDescriptor {
                        collection: coll.name.clone(),
                        shard: shard.name.clone(),
                        replica: replica.name.clone(),
                        role: replica.role,
                    };
                    if self.open_core(descriptor)?.is_some() {
                        loaded += 1;
                    }
                }
            }
        }
        Ok(loaded)
    }

    /// Drop a core, releasing its election token and its update log file.
    pub fn unload_core(&self, core_name: &str) -> Result<()> {
        if self.discard_core(core_name)? {
            tracing::info!("Node {} unloaded core {}", self.id, core_name);
        }
        Ok(())
    }

    /// Returns whether the core was hosted.
    fn discard_core(&self, core_name: &str) -> Result<bool> {
        let removed = self
            .cores
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(core_name);
        let Some(core) = removed else {
            return Ok(false);
        };
        if let Some(token) = core.take_token() {
            self.elector.withdraw(&token)?;
        }
        core.discard_log()?;
        Ok(true)
    }

    /// Unload hosted cores the cluster state no longer assigns to this node,
    /// such as those of a collection deleted while the node was down.
    fn drop_orphaned_cores(&self) -> usize {
        // Cores first: a core created after this read is not considered, and
        // its record is already in any state read below.
        let cores = self.cores();
        let state = self.store.current();
        if state.stale {
            return 0;
        }
        let mut dropped = 0;
        for core in cores {
            let assigned = state
                .collection(core.collection())
                .and_then(|c| c.shard(core.shard()))
                .and_then(|s| s.replica(core.name()))
                .is_some_and(|r| r.node_id == self.id && r.role == core.role());
            if assigned {
                continue;
            }
            match self.discard_core(&core.core_name()) {
                Ok(true) => {
                    tracing::info!("Node {} dropped orphaned core {}", self.id, core.core_name());
                    dropped += 1;
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("Dropping core {} failed: {}", core.core_name(), e),
            }
        }
        dropped
    }

    /// Commit on a leader core, then notify its followers asynchronously.
    pub async fn commit(&self, core_name: &str) -> Result<u64> {
        let core = self.core(core_name)?;
        let generation = core.handle_commit().await?;
        let replication = self.replication.clone();
        tokio::spawn(async move {
            replication.propagate_commit(&core).await;
        });
        Ok(generation)
    }

    pub fn on_commit_notice(&self, core_name: &str, leader: &str) -> Result<()> {
        let core = self.core(core_name)?;
        tracing::debug!("Core {} notified of commit by {}", core_name, leader);
        self.spawn_catch_up(core);
        Ok(())
    }

    fn spawn_catch_up(&self, core: Arc<ReplicaCore>) {
        let replication = self.replication.clone();
        tokio::spawn(async move {
            if let Err(e) = replication.catch_up(&core).await {
                tracing::warn!("Catch-up of {} ended with error: {}", core.name(), e);
            }
        });
    }

    fn spawn_bring_up(&self, core: Arc<ReplicaCore>, rejoining: bool) {
        let Some(node) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = node.bring_up(&core, rejoining).await {
                tracing::warn!("Bring-up of core {} failed: {}", core.name(), e);
            }
        });
    }

    /// Recovering, then (for Writers) an election token, then catch-up.
    async fn bring_up(&self, core: &ReplicaCore, rejoining: bool) -> Result<()> {
        record_startup(&self.store, core.collection(), core.name(), rejoining)?;

        if core.role().capabilities().participates_in_election && core.token().is_none() {
            let session = self
                .session()
                .ok_or_else(|| Error::ConnectionFailed(format!("node {} is down", self.id)))?;
            let token = self.elector.contend(
                session,
                core.collection(),
                core.shard(),
                core.name(),
                &self.id,
                core.role(),
            )?;
            core.set_token(token);
            self.elector.evaluate(core.collection(), core.shard())?;
        }

        let outcome = self.replication.catch_up(core).await?;
        tracing::info!("Core {} is up ({:?})", core.name(), outcome);
        Ok(())
    }

    /// Start a catch-up for every core whose shard now has a live leader it
    /// has not synchronized with.
    fn on_state_change(&self, state: &ClusterState) {
        if !self.is_up() {
            return;
        }
        self.drop_orphaned_cores();
        for core in self.cores() {
            let Some(shard) = state
                .collection(core.collection())
                .and_then(|c| c.shard(core.shard()))
            else {
                continue;
            };
            let Some(entry) = shard.replica(core.name()) else {
                continue;
            };
            if entry.state == ReplicaState::Down || core.catch_up_in_flight() {
                continue;
            }
            let Some(leader) = shard.live_leader(&state.live_nodes) else {
                continue;
            };
            if leader.name != core.name()
                && core.synced_leader().as_deref() != Some(leader.name.as_str())
            {
                tracing::info!(
                    "Core {} sees new leader {}, catching up",
                    core.name(),
                    leader.name
                );
                self.spawn_catch_up(core);
            }
        }
    }
}

impl Drop for ReplicaNode {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}
