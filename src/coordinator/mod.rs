//! Coordinator side of the cluster
//!
//! - Cluster state store over the coordination substrate
//! - Leader election per shard, driven by sequential ephemeral tokens
//! - Overseer reconciling replicas of departed nodes
//! - Placement (HRW) and collection admin operations
//! - Update routing and the HTTP API

pub mod admin;
pub mod election;
pub mod http;
pub mod metadata;
pub mod overseer;
pub mod placement;
pub mod predicates;
pub mod router;
pub mod server;
pub mod state;
pub mod substrate;

pub use admin::{CollectionAdmin, CreateCollectionRequest};
pub use election::{LeaderElector, Sequencer, SubstrateSequencer};
pub use overseer::Overseer;
pub use router::UpdateRouter;
pub use server::Coordinator;
pub use state::{ClusterState, ClusterStateStore, StateSnapshot};
pub use substrate::{CoordinationSubstrate, MemorySubstrate};
