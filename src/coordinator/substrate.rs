//! Coordination substrate
//!
//! The substrate is the only source of strong consistency in the cluster. It
//! offers versioned records with compare-and-swap, session-bound ephemeral
//! registrations (optionally sequential), child listing and prefix watches.
//!
//! [`MemorySubstrate`] is an in-process implementation. Persistent records can be
//! written through to a [`MetadataStore`] so they survive restarts; ephemeral
//! registrations never are.

use crate::common::{Error, Result};
use crate::coordinator::metadata::{MetadataStore, StoredRecord};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

pub type SessionId = u64;
pub type WatchId = u64;
pub type WatchCallback = Arc<dyn Fn(&WatchEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Changed,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
    pub revision: u64,
}

/// A record and the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub data: Vec<u8>,
    pub version: u64,
}

/// Result of an ephemeral registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralRegistration {
    pub path: String,
    /// Sequence number for sequential registrations, 0 otherwise
    pub sequence: u64,
}

/// Capabilities required from the coordination substrate.
pub trait CoordinationSubstrate: Send + Sync {
    /// Open a session; ephemeral registrations live as long as their session.
    fn open_session(&self, owner: &str) -> Result<SessionId>;

    /// Close a session, dropping every ephemeral registration it owns.
    fn close_session(&self, session: SessionId) -> Result<()>;

    /// Register an ephemeral record. With `sequential`, `path` is a prefix and a
    /// monotonically increasing sequence number is appended.
    fn register_ephemeral(
        &self,
        session: SessionId,
        path: &str,
        data: Vec<u8>,
        sequential: bool,
    ) -> Result<EphemeralRegistration>;

    fn read(&self, path: &str) -> Result<Option<Versioned>>;

    /// Names of the direct children of `path`.
    fn list_children(&self, path: &str) -> Result<Vec<String>>;

    /// Write `value` if the record's version equals `expected_version`; `None`
    /// means the record must not exist yet. Returns false on mismatch.
    fn compare_and_swap(&self, path: &str, expected_version: Option<u64>, value: Vec<u8>)
        -> Result<bool>;

    /// Delete a record, optionally only at `expected_version`. Returns false if it
    /// was absent or the version did not match.
    fn delete(&self, path: &str, expected_version: Option<u64>) -> Result<bool>;

    /// Delete a record and everything below it.
    fn delete_tree(&self, path: &str) -> Result<()>;

    /// Watch `path` and all its descendants. Callbacks run after the change is
    /// applied, on the mutating thread, and must not block.
    fn watch(&self, path: &str, callback: WatchCallback) -> Result<WatchId>;

    fn unwatch(&self, id: WatchId);

    /// Global revision, incremented on every mutation.
    fn revision(&self) -> Result<u64>;
}

struct Entry {
    data: Vec<u8>,
    version: u64,
    ephemeral_owner: Option<SessionId>,
}

struct Inner {
    nodes: BTreeMap<String, Entry>,
    sessions: HashSet<SessionId>,
    next_session: SessionId,
    next_sequence: u64,
    next_watch: WatchId,
    revision: u64,
    watches: Vec<(WatchId, String, WatchCallback)>,
    available: bool,
}

/// In-process coordination substrate.
pub struct MemorySubstrate {
    inner: Mutex<Inner>,
    store: Option<Arc<MetadataStore>>,
}

const REVISION_KEY: &str = "revision";

fn is_under(path: &str, prefix: &str) -> bool {
    path == prefix
        || prefix == "/"
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: BTreeMap::new(),
                sessions: HashSet::new(),
                next_session: 1,
                next_sequence: 0,
                next_watch: 1,
                revision: 0,
                watches: Vec::new(),
                available: true,
            }),
            store: None,
        }
    }

    /// Open a substrate whose persistent records are written through to `store`.
    pub fn with_store(store: Arc<MetadataStore>) -> Result<Self> {
        let substrate = Self::new();
        {
            let mut inner = substrate.lock();
            for (path, record) in store.list_records()? {
                inner.nodes.insert(
                    path,
                    Entry {
                        data: record.data,
                        version: record.version,
                        ephemeral_owner: None,
                    },
                );
            }
            if let Some(bytes) = store.get_config(REVISION_KEY)? {
                let revision: u64 = bincode::deserialize(&bytes)?;
                inner.revision = revision;
                inner.next_sequence = revision;
            }
            tracing::info!(
                "Loaded {} persistent records at revision {}",
                inner.nodes.len(),
                inner.revision
            );
        }
        Ok(Self {
            inner: substrate.inner,
            store: Some(store),
        })
    }

    /// Simulate losing (or regaining) the connection to the substrate.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
        tracing::warn!("Coordination substrate available={}", available);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(inner: &Inner) -> Result<()> {
        if inner.available {
            Ok(())
        } else {
            Err(Error::CoordinationUnavailable(
                "coordination substrate unreachable".into(),
            ))
        }
    }

    fn persist(&self, inner: &Inner, path: &str) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        match inner.nodes.get(path) {
            Some(entry) if entry.ephemeral_owner.is_none() => store.put_record(
                path,
                &StoredRecord {
                    version: entry.version,
                    data: entry.data.clone(),
                },
            )?,
            Some(_) => {}
            None => store.delete_record(path)?,
        }
        store.put_config(REVISION_KEY, &bincode::serialize(&inner.revision)?)
    }

    /// Collect the callbacks interested in `events`; they are invoked once the
    /// lock is released.
    fn pending_notifications(
        inner: &Inner,
        events: Vec<WatchEvent>,
    ) -> Vec<(WatchCallback, WatchEvent)> {
        let mut out = Vec::new();
        for event in events {
            for (_, prefix, callback) in &inner.watches {
                if is_under(&event.path, prefix) {
                    out.push((callback.clone(), event.clone()));
                }
            }
        }
        out
    }

    fn notify(pending: Vec<(WatchCallback, WatchEvent)>) {
        for (callback, event) in pending {
            callback(&event);
        }
    }
}

impl Default for MemorySubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinationSubstrate for MemorySubstrate {
    fn open_session(&self, owner: &str) -> Result<SessionId> {
        let mut inner = self.lock();
        Self::check_available(&inner)?;
        let session = inner.next_session;
        inner.next_session += 1;
        inner.sessions.insert(session);
        tracing::debug!("Opened session {} for {}", session, owner);
        Ok(session)
    }

    fn close_session(&self, session: SessionId) -> Result<()> {
        let pending = {
            let mut inner = self.lock();
            Self::check_available(&inner)?;
            if !inner.sessions.remove(&session) {
                return Ok(());
            }
            let owned: Vec<String> = inner
                .nodes
                .iter()
                .filter(|(_, e)| e.ephemeral_owner == Some(session))
                .map(|(p, _)| p.clone())
                .collect();
            if owned.is_empty() {
                return Ok(());
            }
            inner.revision += 1;
            let revision = inner.revision;
            let mut events = Vec::with_capacity(owned.len());
            for path in owned {
                inner.nodes.remove(&path);
                events.push(WatchEvent {
                    path,
                    kind: WatchEventKind::Deleted,
                    revision,
                });
            }
            tracing::debug!("Closed session {}, dropped {} ephemerals", session, events.len());
            Self::pending_notifications(&inner, events)
        };
        Self::notify(pending);
        Ok(())
    }

    fn register_ephemeral(
        &self,
        session: SessionId,
        path: &str,
        data: Vec<u8>,
        sequential: bool,
    ) -> Result<EphemeralRegistration> {
        let (registration, pending) = {
            let mut inner = self.lock();
            Self::check_available(&inner)?;
            if !inner.sessions.contains(&session) {
                return Err(Error::CoordinationUnavailable(format!(
                    "session {} expired",
                    session
                )));
            }
            let (full_path, sequence) = if sequential {
                inner.next_sequence += 1;
                let seq = inner.next_sequence;
                (format!("{}{:010}", path, seq), seq)
            } else {
                if inner.nodes.contains_key(path) {
                    return Err(Error::InvalidRequest(format!("{} already registered", path)));
                }
                (path.to_string(), 0)
            };
            inner.revision += 1;
            let revision = inner.revision;
            inner.nodes.insert(
                full_path.clone(),
                Entry {
                    data,
                    version: 0,
                    ephemeral_owner: Some(session),
                },
            );
            let event = WatchEvent {
                path: full_path.clone(),
                kind: WatchEventKind::Created,
                revision,
            };
            (
                EphemeralRegistration {
                    path: full_path,
                    sequence,
                },
                Self::pending_notifications(&inner, vec![event]),
            )
        };
        Self::notify(pending);
        Ok(registration)
    }

    fn read(&self, path: &str) -> Result<Option<Versioned>> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        Ok(inner.nodes.get(path).map(|e| Versioned {
            data: e.data.clone(),
            version: e.version,
        }))
    }

    fn list_children(&self, path: &str) -> Result<Vec<String>> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut children: Vec<String> = Vec::new();
        for key in inner.nodes.range(prefix.clone()..).map(|(k, _)| k) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            let child = rest.split('/').next().unwrap_or(rest);
            if children.last().map(String::as_str) != Some(child) {
                children.push(child.to_string());
            }
        }
        Ok(children)
    }

    fn compare_and_swap(
        &self,
        path: &str,
        expected_version: Option<u64>,
        value: Vec<u8>,
    ) -> Result<bool> {
        let pending = {
            let mut inner = self.lock();
            Self::check_available(&inner)?;
            let kind = match (inner.nodes.get(path), expected_version) {
                (None, None) => WatchEventKind::Created,
                (Some(e), Some(v)) if e.version == v && e.ephemeral_owner.is_none() => {
                    WatchEventKind::Changed
                }
                _ => return Ok(false),
            };
            inner.revision += 1;
            let revision = inner.revision;
            let version = expected_version.map(|v| v + 1).unwrap_or(0);
            inner.nodes.insert(
                path.to_string(),
                Entry {
                    data: value,
                    version,
                    ephemeral_owner: None,
                },
            );
            self.persist(&inner, path)?;
            Self::pending_notifications(
                &inner,
                vec![WatchEvent {
                    path: path.to_string(),
                    kind,
                    revision,
                }],
            )
        };
        Self::notify(pending);
        Ok(true)
    }

    fn delete(&self, path: &str, expected_version: Option<u64>) -> Result<bool> {
        let pending = {
            let mut inner = self.lock();
            Self::check_available(&inner)?;
            match (inner.nodes.get(path), expected_version) {
                (None, _) => return Ok(false),
                (Some(e), Some(v)) if e.version != v => return Ok(false),
                _ => {}
            }
            inner.nodes.remove(path);
            inner.revision += 1;
            let revision = inner.revision;
            self.persist(&inner, path)?;
            Self::pending_notifications(
                &inner,
                vec![WatchEvent {
                    path: path.to_string(),
                    kind: WatchEventKind::Deleted,
                    revision,
                }],
            )
        };
        Self::notify(pending);
        Ok(true)
    }

    fn delete_tree(&self, path: &str) -> Result<()> {
        let pending = {
            let mut inner = self.lock();
            Self::check_available(&inner)?;
            let doomed: Vec<String> = inner
                .nodes
                .keys()
                .filter(|k| is_under(k, path))
                .cloned()
                .collect();
            if doomed.is_empty() {
                return Ok(());
            }
            inner.revision += 1;
            let revision = inner.revision;
            let mut events = Vec::with_capacity(doomed.len());
            for key in doomed {
                inner.nodes.remove(&key);
                self.persist(&inner, &key)?;
                events.push(WatchEvent {
                    path: key,
                    kind: WatchEventKind::Deleted,
                    revision,
                });
            }
            Self::pending_notifications(&inner, events)
        };
        Self::notify(pending);
        Ok(())
    }

    fn watch(&self, path: &str, callback: WatchCallback) -> Result<WatchId> {
        let mut inner = self.lock();
        Self::check_available(&inner)?;
        let id = inner.next_watch;
        inner.next_watch += 1;
        inner.watches.push((id, path.to_string(), callback));
        Ok(id)
    }

    fn unwatch(&self, id: WatchId) {
        self.lock().watches.retain(|(w, _, _)| *w != id);
    }

    fn revision(&self) -> Result<u64> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        Ok(inner.revision)
    }
}
