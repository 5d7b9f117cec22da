//! Common utilities and types shared across minishard

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod model;
pub mod utils;

pub use config::{Config, CoordinatorConfig, ReplicationConfig};
pub use error::{Error, Result};
pub use hash::{hrw_order, shard_index};
pub use metrics::{MetricsRegistry, METRICS};
pub use model::{CollectionState, Replica, ReplicaRole, ReplicaState, RoleCapabilities, Shard};
pub use utils::{crc32, retry_with_backoff, timestamp_now_millis, validate_name};
