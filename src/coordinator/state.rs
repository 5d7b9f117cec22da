//! Cluster state store
//!
//! Holds the cached view of live nodes, collection records and cluster
//! properties. Every refresh builds a fresh immutable [`ClusterState`] and swaps
//! it in atomically; readers always hold a fixed `Arc` and never observe a
//! partial update.
//!
//! Refreshes are driven by substrate watches. [`ClusterStateStore::wait_for_state`]
//! parks the caller on a `tokio::sync::watch` channel until a predicate holds or
//! its deadline passes.

use crate::common::{CollectionState, Error, Result, METRICS};
use crate::coordinator::substrate::{CoordinationSubstrate, WatchEvent, WatchId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;

pub const LIVE_NODES: &str = "/live_nodes";
pub const COLLECTIONS: &str = "/collections";
pub const CLUSTER_PROPS: &str = "/clusterprops.json";

const MAX_CAS_ATTEMPTS: usize = 32;

pub fn collection_path(name: &str) -> String {
    format!("{}/{}", COLLECTIONS, name)
}

pub fn state_path(name: &str) -> String {
    format!("{}/{}/state.json", COLLECTIONS, name)
}

pub fn election_path(collection: &str, shard: &str) -> String {
    format!("{}/{}/leader_elect/{}/election", COLLECTIONS, collection, shard)
}

pub fn live_node_path(node_id: &str) -> String {
    format!("{}/{}", LIVE_NODES, node_id)
}

/// One immutable view of the cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    /// Substrate revision the view was read at
    pub revision: u64,
    pub live_nodes: BTreeSet<String>,
    pub collections: BTreeMap<String, Arc<CollectionState>>,
    pub properties: BTreeMap<String, String>,
    /// Set when the last refresh failed; the view is the last known good one
    pub stale: bool,
}

impl ClusterState {
    pub fn collection(&self, name: &str) -> Option<&CollectionState> {
        self.collections.get(name).map(|c| c.as_ref())
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// A fixed snapshot of the cluster, focused on one collection.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    cluster: Arc<ClusterState>,
    collection: String,
}

impl StateSnapshot {
    pub fn collection(&self) -> Option<&CollectionState> {
        self.cluster.collection(&self.collection)
    }

    pub fn require_collection(&self) -> Result<&CollectionState> {
        self.collection()
            .ok_or_else(|| Error::CollectionNotFound(self.collection.clone()))
    }

    pub fn live_nodes(&self) -> &BTreeSet<String> {
        &self.cluster.live_nodes
    }

    pub fn is_stale(&self) -> bool {
        self.cluster.stale
    }

    pub fn revision(&self) -> u64 {
        self.cluster.revision
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }
}

struct StoreInner {
    substrate: Arc<dyn CoordinationSubstrate>,
    current: RwLock<Arc<ClusterState>>,
    notify: watch::Sender<Arc<ClusterState>>,
    watch_ids: Mutex<Vec<WatchId>>,
}

impl StoreInner {
    fn current(&self) -> Arc<ClusterState> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn read_cluster(&self) -> Result<ClusterState> {
        let revision = self.substrate.revision()?;
        let live_nodes = self
            .substrate
            .list_children(LIVE_NODES)?
            .into_iter()
            .collect();

        let mut collections = BTreeMap::new();
        for name in self.substrate.list_children(COLLECTIONS)? {
            // Leftover election entries of a deleted collection have no record.
            let Some(record) = self.substrate.read(&state_path(&name))? else {
                continue;
            };
            let mut coll: CollectionState = serde_json::from_slice(&record.data)?;
            coll.version = record.version;
            collections.insert(name, Arc::new(coll));
        }

        let properties = match self.substrate.read(CLUSTER_PROPS)? {
            Some(record) => serde_json::from_slice(&record.data)?,
            None => BTreeMap::new(),
        };

        Ok(ClusterState {
            revision,
            live_nodes,
            collections,
            properties,
            stale: false,
        })
    }

    fn refresh(&self) -> Result<Arc<ClusterState>> {
        match self.read_cluster() {
            Ok(next) => Ok(self.install(next)),
            Err(e) => {
                self.mark_stale();
                Err(e)
            }
        }
    }

    fn install(&self, next: ClusterState) -> Arc<ClusterState> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let newer = next.revision > current.revision
            || (current.stale && next.revision >= current.revision);
        if !newer {
            return current.clone();
        }
        let next = Arc::new(next);
        *current = next.clone();
        METRICS.live_nodes.set(next.live_nodes.len() as u64);
        METRICS.state_version.set(next.revision);
        self.notify.send_replace(next.clone());
        next
    }

    fn mark_stale(&self) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if current.stale {
            return;
        }
        let mut stale = (**current).clone();
        stale.stale = true;
        let stale = Arc::new(stale);
        *current = stale.clone();
        self.notify.send_replace(stale);
        tracing::warn!("Cluster state marked stale at revision {}", current.revision);
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let ids = std::mem::take(&mut *self.watch_ids.lock().unwrap_or_else(|e| e.into_inner()));
        for id in ids {
            self.substrate.unwatch(id);
        }
    }
}

/// Cached, watch-refreshed view of the cluster.
#[derive(Clone)]
pub struct ClusterStateStore {
    inner: Arc<StoreInner>,
}

impl ClusterStateStore {
    /// Create a store, register its watches and load the initial view.
    pub fn new(substrate: Arc<dyn CoordinationSubstrate>) -> Result<Self> {
        let (notify, _) = watch::channel(Arc::new(ClusterState::default()));
        let inner = Arc::new(StoreInner {
            substrate: substrate.clone(),
            current: RwLock::new(Arc::new(ClusterState::default())),
            notify,
            watch_ids: Mutex::new(Vec::new()),
        });

        for path in [LIVE_NODES, COLLECTIONS, CLUSTER_PROPS] {
            let weak: Weak<StoreInner> = Arc::downgrade(&inner);
            let id = substrate.watch(
                path,
                Arc::new(move |event: &WatchEvent| {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    if let Err(e) = inner.refresh() {
                        tracing::debug!("Refresh after change to {} failed: {}", event.path, e);
                    }
                }),
            )?;
            inner
                .watch_ids
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(id);
        }

        inner.refresh()?;
        Ok(Self { inner })
    }

    pub fn substrate(&self) -> &Arc<dyn CoordinationSubstrate> {
        &self.inner.substrate
    }

    /// The whole cached cluster view.
    pub fn current(&self) -> Arc<ClusterState> {
        self.inner.current()
    }

    /// Cached snapshot for `collection`; never blocks on the substrate.
    pub fn get_state(&self, collection: &str) -> StateSnapshot {
        StateSnapshot {
            cluster: self.inner.current(),
            collection: collection.to_string(),
        }
    }

    /// Re-read the substrate now, bypassing the cache.
    pub fn force_refresh(&self, collection: &str) -> Result<StateSnapshot> {
        let cluster = self.inner.refresh()?;
        Ok(StateSnapshot {
            cluster,
            collection: collection.to_string(),
        })
    }

    /// Subscribe to every installed cluster view.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.inner.notify.subscribe()
    }

    /// Wait until `predicate(live_nodes, collection_state)` holds, or fail with
    /// [`Error::StateWaitTimeout`] once `timeout` has elapsed.
    pub async fn wait_for_state<P>(
        &self,
        collection: &str,
        timeout: Duration,
        predicate: P,
    ) -> Result<StateSnapshot>
    where
        P: Fn(&BTreeSet<String>, Option<&CollectionState>) -> bool + Send,
    {
        let mut rx = self.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let cluster = self.inner.current();
            if predicate(&cluster.live_nodes, cluster.collection(collection)) {
                return Ok(StateSnapshot {
                    cluster,
                    collection: collection.to_string(),
                });
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {
                    rx.borrow_and_update();
                }
                Ok(Err(_)) => {
                    return Err(Error::CoordinationUnavailable(
                        "cluster state notifications closed".into(),
                    ))
                }
                Err(_) => {
                    return Err(Error::StateWaitTimeout {
                        collection: collection.to_string(),
                        waited: timeout,
                    })
                }
            }
        }
    }

    /// Read-modify-write a collection record with compare-and-swap. The closure
    /// returns whether it changed anything; nothing is written otherwise. It may
    /// run several times when other writers race.
    pub fn mutate_collection<F>(&self, name: &str, mut f: F) -> Result<bool>
    where
        F: FnMut(&mut CollectionState) -> Result<bool>,
    {
        let path = state_path(name);
        let substrate = &self.inner.substrate;
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let Some(record) = substrate.read(&path)? else {
                return Err(Error::CollectionNotFound(name.to_string()));
            };
            let mut coll: CollectionState = serde_json::from_slice(&record.data)?;
            coll.version = record.version;
            if !f(&mut coll)? {
                return Ok(false);
            }
            let bytes = serde_json::to_vec(&coll)?;
            if substrate.compare_and_swap(&path, Some(record.version), bytes)? {
                return Ok(true);
            }
            tracing::debug!("Version conflict on {} (attempt {})", path, attempt + 1);
            std::thread::yield_now();
        }
        Err(Error::VersionConflict(path))
    }

    /// Write a brand-new collection record.
    pub fn create_collection_record(&self, coll: &CollectionState) -> Result<()> {
        let bytes = serde_json::to_vec(coll)?;
        if self
            .inner
            .substrate
            .compare_and_swap(&state_path(&coll.name), None, bytes)?
        {
            Ok(())
        } else {
            Err(Error::CollectionExists(coll.name.clone()))
        }
    }

    /// Remove a collection record together with its election entries.
    pub fn remove_collection_record(&self, name: &str) -> Result<()> {
        self.inner.substrate.delete_tree(&collection_path(name))
    }

    /// Set (or with `None`, remove) a cluster property.
    pub fn set_cluster_property(&self, key: &str, value: Option<String>) -> Result<()> {
        let substrate = &self.inner.substrate;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let record = substrate.read(CLUSTER_PROPS)?;
            let mut props: BTreeMap<String, String> = match &record {
                Some(r) => serde_json::from_slice(&r.data)?,
                None => BTreeMap::new(),
            };
            let changed = match &value {
                Some(v) => props.insert(key.to_string(), v.clone()).as_ref() != Some(v),
                None => props.remove(key).is_some(),
            };
            if !changed {
                return Ok(());
            }
            let bytes = serde_json::to_vec(&props)?;
            if substrate.compare_and_swap(CLUSTER_PROPS, record.map(|r| r.version), bytes)? {
                return Ok(());
            }
        }
        Err(Error::VersionConflict(CLUSTER_PROPS.to_string()))
    }
}
