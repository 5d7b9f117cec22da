//! Local document engine
//!
//! The indexing/query engine is an external collaborator; replicas reach it
//! only through [`DocumentEngine`]. [`MemoryEngine`] is the in-process engine:
//! updates land in a pending set and become visible on commit.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// A document: unique id plus arbitrary JSON fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// A single update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum UpdateOp {
    Add(Document),
    Delete { id: String },
}

impl UpdateOp {
    /// Routing key of the update.
    pub fn doc_id(&self) -> &str {
        match self {
            UpdateOp::Add(doc) => &doc.id,
            UpdateOp::Delete { id } => id,
        }
    }
}

/// Parsed query: `*:*` or `field:value` (`id:value` matches the id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryExpr {
    All,
    Term { field: String, value: String },
}

impl QueryExpr {
    pub fn parse(q: &str) -> Result<Self> {
        let q = q.trim();
        if q.is_empty() || q == "*:*" {
            return Ok(QueryExpr::All);
        }
        match q.split_once(':') {
            Some((field, value)) if !field.is_empty() && !value.is_empty() => Ok(QueryExpr::Term {
                field: field.to_string(),
                value: value.to_string(),
            }),
            _ => Err(Error::InvalidRequest(format!("unsupported query: {}", q))),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            QueryExpr::All => true,
            QueryExpr::Term { field, value } if field == "id" => &doc.id == value,
            QueryExpr::Term { field, value } => match doc.fields.get(field) {
                Some(serde_json::Value::String(s)) => s == value,
                Some(serde_json::Value::Array(items)) => items.iter().any(|v| match v {
                    serde_json::Value::String(s) => s == value,
                    other => other.to_string() == *value,
                }),
                Some(other) => other.to_string() == *value,
                None => false,
            },
        }
    }
}

/// Committed contents of an engine, as transferred by a bulk resync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub docs: BTreeMap<String, Document>,
    /// Commit generation the snapshot was taken at
    pub generation: u64,
}

impl IndexSnapshot {
    pub fn num_docs(&self) -> usize {
        self.docs.len()
    }
}

/// Counters of the local update handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateHandlerStats {
    pub adds: u64,
    pub deletes: u64,
    pub commits: u64,
}

/// Local indexing and query operations of one core.
pub trait DocumentEngine: Send + Sync {
    fn local_apply(&self, op: &UpdateOp) -> Result<()>;

    /// Make pending updates visible; returns the new commit generation.
    fn local_commit(&self) -> Result<u64>;

    fn local_query(&self, query: &QueryExpr) -> Result<Vec<Document>>;

    /// Replace the whole committed state. Does not count as update handling.
    fn local_bulk_resync(&self, snapshot: IndexSnapshot) -> Result<()>;

    /// Committed state.
    fn snapshot(&self) -> Result<IndexSnapshot>;

    fn stats(&self) -> UpdateHandlerStats;

    fn num_docs(&self) -> Result<usize> {
        Ok(self.snapshot()?.num_docs())
    }
}

#[derive(Default)]
struct EngineState {
    committed: BTreeMap<String, Document>,
    pending: Vec<UpdateOp>,
    generation: u64,
    stats: UpdateHandlerStats,
}

/// In-memory [`DocumentEngine`].
#[derive(Default)]
pub struct MemoryEngine {
    state: Mutex<EngineState>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DocumentEngine for MemoryEngine {
    fn local_apply(&self, op: &UpdateOp) -> Result<()> {
        let mut state = self.lock();
        match op {
            UpdateOp::Add(_) => state.stats.adds += 1,
            UpdateOp::Delete { .. } => state.stats.deletes += 1,
        }
        state.pending.push(op.clone());
        Ok(())
    }

    fn local_commit(&self) -> Result<u64> {
        let mut state = self.lock();
        let pending = std::mem::take(&mut state.pending);
        for op in pending {
            match op {
                UpdateOp::Add(doc) => {
                    state.committed.insert(doc.id.clone(), doc);
                }
                UpdateOp::Delete { id } => {
                    state.committed.remove(&id);
                }
            }
        }
        state.generation += 1;
        state.stats.commits += 1;
        Ok(state.generation)
    }

    fn local_query(&self, query: &QueryExpr) -> Result<Vec<Document>> {
        let state = self.lock();
        Ok(state
            .committed
            .values()
            .filter(|doc| query.matches(doc))
            .cloned()
            .collect())
    }

    fn local_bulk_resync(&self, snapshot: IndexSnapshot) -> Result<()> {
        let mut state = self.lock();
        state.committed = snapshot.docs;
        state.pending.clear();
        state.generation = snapshot.generation;
        Ok(())
    }

    fn snapshot(&self) -> Result<IndexSnapshot> {
        let state = self.lock();
        Ok(IndexSnapshot {
            docs: state.committed.clone(),
            generation: state.generation,
        })
    }

    fn stats(&self) -> UpdateHandlerStats {
        self.lock().stats
    }
}
