//! Replication engine
//!
//! Brings a follower core up to date with its shard's live leader.
//!
//! - Writer and Active replicas follow the leader's update log from their own
//!   log head. When the leader changed since the last sync, or the leader no
//!   longer holds the offset, they fall back to a bulk resync and adopt the new
//!   leader's log head.
//! - Passive replicas have no log and always mirror the leader's committed
//!   state in full.
//!
//! A catch-up is bounded by the configured timeout and retries transient
//! failures with exponential backoff. A catch-up that still fails leaves the
//! replica Down and releases its election token.

use crate::common::{retry_with_backoff, Error, Replica, ReplicationConfig, Result, METRICS};
use crate::coordinator::election::LeaderElector;
use crate::coordinator::ClusterStateStore;
use crate::replica::core::ReplicaCore;
use crate::replica::lifecycle::{record_transition, LifecycleEvent};
use crate::replica::transport::ReplicaTransport;
use std::sync::Arc;
use std::time::Duration;

/// Cluster property overriding the catch-up timeout.
pub const REPLICATION_TIMEOUT_PROPERTY: &str = "replication_timeout_ms";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchUpOutcome {
    /// The shard has no live leader to follow
    NoLeader,
    /// The core is the leader itself
    IsLeader,
    /// Log replay applied this many entries
    Replayed(usize),
    /// Full copy of the leader's committed state
    Resynced { leader: String, docs: usize },
}

impl CatchUpOutcome {
    fn event(&self) -> LifecycleEvent {
        match self {
            CatchUpOutcome::NoLeader | CatchUpOutcome::IsLeader | CatchUpOutcome::Replayed(0) => {
                LifecycleEvent::NothingToCatchUp
            }
            _ => LifecycleEvent::CatchUpCompleted,
        }
    }
}

pub struct ReplicationEngine {
    store: ClusterStateStore,
    elector: Arc<LeaderElector>,
    transport: Arc<dyn ReplicaTransport>,
    config: ReplicationConfig,
}

impl ReplicationEngine {
    pub fn new(
        store: ClusterStateStore,
        elector: Arc<LeaderElector>,
        transport: Arc<dyn ReplicaTransport>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            store,
            elector,
            transport,
            config,
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn ReplicaTransport> {
        &self.transport
    }

    fn catch_up_timeout(&self) -> Duration {
        self.store
            .current()
            .property(REPLICATION_TIMEOUT_PROPERTY)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.catch_up_timeout())
    }

    fn live_leader(&self, core: &ReplicaCore) -> Option<Replica> {
        let snapshot = self.store.get_state(core.collection());
        snapshot
            .collection()
            .and_then(|c| c.shard(core.shard()))
            .and_then(|s| s.live_leader(snapshot.live_nodes()))
            .cloned()
    }

    /// Catch `core` up with its shard's live leader and record the outcome.
    /// One catch-up runs at a time per core.
    pub async fn catch_up(&self, core: &ReplicaCore) -> Result<CatchUpOutcome> {
        let _guard = core.lock_catch_up().await;

        let outcome = match self.live_leader(core) {
            None => Ok(CatchUpOutcome::NoLeader),
            Some(leader) if leader.name == core.name() => Ok(CatchUpOutcome::IsLeader),
            Some(_) => {
                METRICS.catch_ups_started.inc();
                let timeout = self.catch_up_timeout();
                let attempt = retry_with_backoff(
                    || self.sync_with_current_leader(core),
                    self.config.max_retries,
                    self.config.initial_backoff(),
                );
                match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(format!(
                        "catch-up of {} exceeded {:?}",
                        core.name(),
                        timeout
                    ))),
                }
            }
        };

        match outcome {
            Ok(outcome) => {
                record_transition(&self.store, core.collection(), core.name(), outcome.event())?;
                Ok(outcome)
            }
            Err(e) => {
                METRICS.catch_ups_failed.inc();
                tracing::error!("Catch-up of replica {} failed: {}", core.name(), e);
                self.give_up(core);
                Err(Error::CatchUpFailed {
                    replica: core.name().to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Leave the replica Down without an election token.
    fn give_up(&self, core: &ReplicaCore) {
        if let Some(token) = core.take_token() {
            if let Err(e) = self.elector.withdraw(&token) {
                tracing::warn!("Failed to release token of {}: {}", core.name(), e);
            }
        }
        if let Err(e) = record_transition(
            &self.store,
            core.collection(),
            core.name(),
            LifecycleEvent::CatchUpFailed,
        ) {
            tracing::warn!("Failed to record catch-up failure of {}: {}", core.name(), e);
        }
    }

    /// One attempt against whichever replica leads right now, so a leader lost
    /// mid catch-up is never retried.
    async fn sync_with_current_leader(&self, core: &ReplicaCore) -> Result<CatchUpOutcome> {
        match self.live_leader(core) {
            None => Ok(CatchUpOutcome::NoLeader),
            Some(leader) if leader.name == core.name() => Ok(CatchUpOutcome::IsLeader),
            Some(leader) => self.sync_once(core, &leader).await,
        }
    }

    async fn sync_once(&self, core: &ReplicaCore, leader: &Replica) -> Result<CatchUpOutcome> {
        let follows_log = core.role().capabilities().replays_update_log;
        let same_leader = core.synced_leader().as_deref() == Some(leader.name.as_str());

        if follows_log && same_leader {
            let since = core.log_head().unwrap_or(0);
            let batch = self.transport.fetch_updates(leader, since).await?;
            if batch.leader == leader.name {
                if let Some(entries) = batch.entries {
                    let applied = core.apply_replicated(entries)?;
                    if applied > 0 {
                        tracing::debug!(
                            "Replica {} replayed {} entries from {}",
                            core.name(),
                            applied,
                            leader.name
                        );
                    }
                    return Ok(CatchUpOutcome::Replayed(applied));
                }
            }
            tracing::info!(
                "Leader {} no longer holds offset {} for {}, resyncing",
                leader.name,
                since,
                core.name()
            );
        }

        let transfer = self.transport.fetch_index(leader).await?;
        let docs = transfer.snapshot.num_docs();
        let source = transfer.leader.clone();
        core.install_transfer(transfer)?;
        METRICS.bulk_resyncs.inc();
        tracing::info!(
            "Replica {} resynced {} docs from leader {}",
            core.name(),
            docs,
            source
        );
        Ok(CatchUpOutcome::Resynced {
            leader: source,
            docs,
        })
    }

    /// Tell every other replica of the shard that `leader` committed.
    pub async fn propagate_commit(&self, leader: &ReplicaCore) {
        let snapshot = self.store.get_state(leader.collection());
        let Some(shard) = snapshot
            .collection()
            .and_then(|c| c.shard(leader.shard()))
        else {
            return;
        };
        for follower in shard.replicas.iter().filter(|r| r.name != leader.name()) {
            if !snapshot.live_nodes().contains(&follower.node_id) {
                continue;
            }
            if let Err(e) = self
                .transport
                .notify_commit(follower, leader.name())
                .await
            {
                tracing::debug!("Commit notice to {} failed: {}", follower.name, e);
            }
        }
    }
}
