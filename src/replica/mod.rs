//! Replica side of the cluster
//!
//! Nodes host replica cores. A core wraps a document engine and, for Writer
//! and Active roles, an update log. Cores move through the Down, Recovering
//! and Active states as they start, catch up with their shard leader, and lose
//! or regain their node.

pub mod core;
pub mod engine;
pub mod lifecycle;
pub mod node;
pub mod replication;
pub mod transport;
pub mod update_log;

pub use self::core::ReplicaCore;
pub use engine::{Document, DocumentEngine, MemoryEngine, QueryExpr, UpdateOp};
pub use lifecycle::{next_state, LifecycleEvent};
pub use node::ReplicaNode;
pub use replication::{CatchUpOutcome, ReplicationEngine};
pub use transport::{LocalTransport, ReplicaTransport};
pub use update_log::UpdateLog;
