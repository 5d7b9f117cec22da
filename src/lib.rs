//! # minishard
//!
//! Role-aware shard coordination and replication for a sharded document
//! cluster:
//! - Cluster state kept in a coordination substrate and cached as immutable
//!   snapshots
//! - Per-shard leader election among Writer replicas
//! - Update-log replay for Active replicas, full index mirroring for Passive
//!   replicas
//! - Routing of writes to shard leaders, queries to Active replicas
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              Coordinator                     │
//! │  admin API · update router · overseer        │
//! │  cluster state store · leader election       │
//! └──────────────┬───────────────────────────────┘
//!                │ coordination substrate
//!   ┌────────────┴──────────┬─────────────────┐
//!   │                       │                 │
//! ┌─▼──────────────┐  ┌─────▼──────────┐  ┌───▼────────────┐
//! │ node1          │  │ node2          │  │ node3          │
//! │ shard1 writer  │  │ shard1 passive │  │ shard2 writer  │
//! │  + update log  │  │  (index copy)  │  │  + update log  │
//! └────────────────┘  └────────────────┘  └────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! minishard-coord serve --id coord-1 --bind 0.0.0.0:8983 --nodes 3 --db ./coord-data
//!
//! curl -X POST localhost:8983/admin/collections -H 'content-type: application/json' \
//!   -d '{"name": "docs", "shards": 2, "writer_count": 1, "passive_count": 1}'
//! curl -X POST localhost:8983/collections/docs/update -H 'content-type: application/json' \
//!   -d '{"op": "add", "id": "1"}'
//! curl -X POST localhost:8983/collections/docs/commit
//! curl 'localhost:8983/collections/docs/select?q=*:*'
//! ```

#![allow(clippy::result_large_err)]

pub mod cluster;
pub mod common;
pub mod coordinator;
pub mod replica;

// Re-export commonly used types
pub use cluster::LocalCluster;
pub use common::{Config, Error, Result};
pub use coordinator::Coordinator;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
