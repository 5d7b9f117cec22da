//! Replica core
//!
//! One hosted replica: its local engine, its update log (Writer and Active
//! only), its election token and the leader it last synchronized with.

use crate::common::{Error, ReplicaRole, Result, METRICS};
use crate::coordinator::election::{ElectionToken, LeaderElector};
use crate::replica::engine::{Document, DocumentEngine, QueryExpr, UpdateHandlerStats, UpdateOp};
use crate::replica::transport::{CoreDescriptor, CoreStatus, IndexTransfer, UpdateBatch};
use crate::replica::update_log::{LogEntry, LogOp, UpdateLog};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn log_path(dir: &Path, core_name: &str) -> PathBuf {
    dir.join(format!("{}.ulog", core_name))
}

/// Remove a leftover update log file for `core_name` under `dir`, if any.
pub fn remove_log_file(dir: &Path, core_name: &str) -> Result<()> {
    match std::fs::remove_file(log_path(dir, core_name)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub struct ReplicaCore {
    descriptor: CoreDescriptor,
    node_id: String,
    engine: Arc<dyn DocumentEngine>,
    log: Option<Mutex<UpdateLog>>,
    /// First log sequence not covered by the last commit
    committed_head: AtomicU64,
    token: Mutex<Option<ElectionToken>>,
    synced_leader: Mutex<Option<String>>,
    /// Serializes leader-side applies and commits
    write_lock: tokio::sync::Mutex<()>,
    catch_up_lock: tokio::sync::Mutex<()>,
    elector: Arc<LeaderElector>,
}

impl ReplicaCore {
    /// Create a core. With `log_dir`, the update log is file-backed and any
    /// entries already on disk are replayed into `engine`. At most
    /// `log_retention` committed entries stay in memory afterwards.
    pub fn new(
        descriptor: CoreDescriptor,
        node_id: impl Into<String>,
        engine: Arc<dyn DocumentEngine>,
        elector: Arc<LeaderElector>,
        log_dir: Option<&Path>,
        log_retention: usize,
    ) -> Result<Self> {
        let mut log = if descriptor.role.capabilities().replays_update_log {
            Some(match log_dir {
                Some(dir) => UpdateLog::open(log_path(dir, &descriptor.core_name()))?,
                None => UpdateLog::in_memory(),
            })
        } else {
            None
        };

        let mut committed_head = 0;
        if let Some(log) = &mut log {
            committed_head = log.base();
            for entry in log.entries() {
                match &entry.op {
                    LogOp::Update(op) => engine.local_apply(op)?,
                    LogOp::Commit => {
                        engine.local_commit()?;
                        committed_head = entry.sequence + 1;
                    }
                }
            }
            log.set_retention(log_retention);
        }

        Ok(Self {
            descriptor,
            node_id: node_id.into(),
            engine,
            log: log.map(Mutex::new),
            committed_head: AtomicU64::new(committed_head),
            token: Mutex::new(None),
            synced_leader: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
            catch_up_lock: tokio::sync::Mutex::new(()),
            elector,
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.replica
    }

    /// Key of this core on its node.
    pub fn core_name(&self) -> String {
        self.descriptor.core_name()
    }

    pub fn collection(&self) -> &str {
        &self.descriptor.collection
    }

    pub fn shard(&self) -> &str {
        &self.descriptor.shard
    }

    pub fn role(&self) -> ReplicaRole {
        self.descriptor.role
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn descriptor(&self) -> &CoreDescriptor {
        &self.descriptor
    }

    pub fn engine(&self) -> &Arc<dyn DocumentEngine> {
        &self.engine
    }

    pub fn stats(&self) -> UpdateHandlerStats {
        self.engine.stats()
    }

    pub fn log_head(&self) -> Option<u64> {
        self.log.as_ref().map(|log| lock(log).head())
    }

    pub fn token(&self) -> Option<ElectionToken> {
        lock(&self.token).clone()
    }

    pub fn set_token(&self, token: ElectionToken) {
        *lock(&self.token) = Some(token);
    }

    pub fn take_token(&self) -> Option<ElectionToken> {
        lock(&self.token).take()
    }

    pub fn synced_leader(&self) -> Option<String> {
        lock(&self.synced_leader).clone()
    }

    pub fn set_synced_leader(&self, leader: Option<String>) {
        *lock(&self.synced_leader) = leader;
    }

    /// Held for the duration of one catch-up.
    pub async fn lock_catch_up(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.catch_up_lock.lock().await
    }

    pub fn catch_up_in_flight(&self) -> bool {
        self.catch_up_lock.try_lock().is_err()
    }

    fn reject(&self, reason: impl Into<String>) -> Error {
        METRICS.writes_rejected_by_replica.inc();
        let reason = reason.into();
        tracing::debug!("Replica {} rejected write: {}", self.name(), reason);
        Error::WriteRejected {
            replica: self.name().to_string(),
            reason,
        }
    }

    fn check_accepts_writes(&self) -> Result<()> {
        if self.role().capabilities().accepts_writes {
            Ok(())
        } else {
            Err(self.reject(format!("role {} does not accept writes", self.role())))
        }
    }

    /// Only the registered live leader may apply; checked again right before
    /// every apply.
    fn ensure_leader(&self) -> Result<()> {
        let Some(token) = self.token() else {
            return Err(self.reject("not registered for leader election"));
        };
        if !self.elector.revalidate(self.collection(), self.shard(), &token)? {
            return Err(self.reject("not the registered live leader"));
        }
        Ok(())
    }

    fn append_log(&self, op: LogOp) -> Result<u64> {
        match &self.log {
            Some(log) => lock(log).append(op),
            None => Err(Error::Internal(format!(
                "replica {} has no update log",
                self.name()
            ))),
        }
    }

    /// Apply one update as leader. Returns its log sequence.
    pub async fn handle_update(&self, op: UpdateOp) -> Result<u64> {
        self.check_accepts_writes()?;
        let _guard = self.write_lock.lock().await;
        self.ensure_leader()?;
        // Logged first: the engine never holds an update followers cannot replay.
        let sequence = self.append_log(LogOp::Update(op.clone()))?;
        self.engine.local_apply(&op)?;
        Ok(sequence)
    }

    /// Commit as leader. Returns the new commit generation.
    pub async fn handle_commit(&self) -> Result<u64> {
        self.check_accepts_writes()?;
        let _guard = self.write_lock.lock().await;
        self.ensure_leader()?;
        let sequence = self.append_log(LogOp::Commit)?;
        let generation = self.engine.local_commit()?;
        self.committed_head.store(sequence + 1, Ordering::SeqCst);
        tracing::debug!(
            "Replica {} committed generation {} at log {}",
            self.name(),
            generation,
            sequence
        );
        Ok(generation)
    }

    /// Serve a query; only replicas recorded Active on a live node may.
    pub fn handle_query(&self, query: &QueryExpr) -> Result<Vec<Document>> {
        let snapshot = self.elector.store().get_state(self.collection());
        let active = snapshot
            .collection()
            .and_then(|c| c.locate(self.name()))
            .map(|(_, r)| r.is_active(snapshot.live_nodes()))
            .unwrap_or(false);
        if !active {
            return Err(Error::ReplicaNotActive(self.name().to_string()));
        }
        self.engine.local_query(query)
    }

    /// Committed state together with the log offset it corresponds to.
    pub async fn index_transfer(&self) -> Result<IndexTransfer> {
        let _guard = self.write_lock.lock().await;
        Ok(IndexTransfer {
            leader: self.name().to_string(),
            snapshot: self.engine.snapshot()?,
            log_head: self
                .log
                .as_ref()
                .map(|_| self.committed_head.load(Ordering::SeqCst)),
        })
    }

    pub fn updates_since(&self, since: u64) -> UpdateBatch {
        match &self.log {
            Some(log) => {
                let log = lock(log);
                UpdateBatch {
                    leader: self.name().to_string(),
                    entries: log.entries_since(since),
                    head: log.head(),
                }
            }
            None => UpdateBatch {
                leader: self.name().to_string(),
                entries: None,
                head: 0,
            },
        }
    }

    /// Replay entries fetched from the leader. Entries already held are skipped.
    pub fn apply_replicated(&self, entries: Vec<LogEntry>) -> Result<usize> {
        let Some(log) = &self.log else {
            return Err(Error::Internal(format!(
                "replica {} has no update log",
                self.name()
            )));
        };
        let mut log = lock(log);
        let mut applied = 0;
        for entry in entries {
            if entry.sequence < log.head() {
                continue;
            }
            let sequence = entry.sequence;
            let op = entry.op.clone();
            log.append_replicated(entry)?;
            match &op {
                LogOp::Update(op) => self.engine.local_apply(op)?,
                LogOp::Commit => {
                    self.engine.local_commit()?;
                    self.committed_head.store(sequence + 1, Ordering::SeqCst);
                }
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// Drop the on-disk update log of a deleted core.
    pub fn discard_log(&self) -> Result<()> {
        match &self.log {
            Some(log) => lock(log).discard(),
            None => Ok(()),
        }
    }

    /// Replace local state with a leader's transfer and adopt its log head.
    pub fn install_transfer(&self, transfer: IndexTransfer) -> Result<()> {
        let head = transfer.log_head.unwrap_or(0);
        self.engine.local_bulk_resync(transfer.snapshot)?;
        if let Some(log) = &self.log {
            lock(log).reset_to(head)?;
            self.committed_head.store(head, Ordering::SeqCst);
        }
        self.set_synced_leader(Some(transfer.leader));
        Ok(())
    }

    pub fn status(&self) -> Result<CoreStatus> {
        Ok(CoreStatus {
            replica: self.name().to_string(),
            role: self.role(),
            num_docs: self.engine.num_docs()?,
            stats: self.stats(),
            log_head: self.log_head(),
            synced_leader: self.synced_leader(),
        })
    }
}
