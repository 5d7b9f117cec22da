//! Cluster data model
//!
//! A collection is an ordered list of shards, each shard a set of replicas. The
//! whole collection is stored as a single JSON record in the coordination
//! substrate and read back into immutable snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Replica role, fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaRole {
    /// Leader-eligible; accepts and commits writes while leader.
    Writer,
    /// Follows the leader's update log, never leads.
    Active,
    /// Read-only mirror, full index copies only.
    Passive,
}

/// What a role is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleCapabilities {
    pub can_lead: bool,
    pub accepts_writes: bool,
    pub participates_in_election: bool,
    pub replays_update_log: bool,
}

impl ReplicaRole {
    pub const ALL: [ReplicaRole; 3] = [ReplicaRole::Writer, ReplicaRole::Active, ReplicaRole::Passive];

    pub const fn capabilities(self) -> RoleCapabilities {
        match self {
            ReplicaRole::Writer => RoleCapabilities {
                can_lead: true,
                accepts_writes: true,
                participates_in_election: true,
                replays_update_log: true,
            },
            ReplicaRole::Active => RoleCapabilities {
                can_lead: false,
                accepts_writes: false,
                participates_in_election: false,
                replays_update_log: true,
            },
            ReplicaRole::Passive => RoleCapabilities {
                can_lead: false,
                accepts_writes: false,
                participates_in_election: false,
                replays_update_log: false,
            },
        }
    }

    /// Single-letter tag used in generated core names.
    pub fn tag(self) -> char {
        match self {
            ReplicaRole::Writer => 'w',
            ReplicaRole::Active => 'a',
            ReplicaRole::Passive => 'p',
        }
    }
}

impl std::fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaRole::Writer => write!(f, "writer"),
            ReplicaRole::Active => write!(f, "active"),
            ReplicaRole::Passive => write!(f, "passive"),
        }
    }
}

impl std::str::FromStr for ReplicaRole {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "writer" => Ok(ReplicaRole::Writer),
            "active" => Ok(ReplicaRole::Active),
            "passive" => Ok(ReplicaRole::Passive),
            other => Err(crate::Error::InvalidRequest(format!(
                "unknown replica role: {}",
                other
            ))),
        }
    }
}

/// Replica liveness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaState {
    Active,
    Down,
    Recovering,
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaState::Active => write!(f, "active"),
            ReplicaState::Down => write!(f, "down"),
            ReplicaState::Recovering => write!(f, "recovering"),
        }
    }
}

/// One replica entry of a collection record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub name: String,
    pub node_id: String,
    pub service_address: String,
    pub role: ReplicaRole,
    pub state: ReplicaState,
    #[serde(default)]
    pub is_leader: bool,
}

impl Replica {
    /// Active in the record and hosted on a live node.
    pub fn is_active(&self, live_nodes: &BTreeSet<String>) -> bool {
        self.state == ReplicaState::Active && live_nodes.contains(&self.node_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub name: String,
    #[serde(default)]
    pub replicas: Vec<Replica>,
}

impl Shard {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replicas: Vec::new(),
        }
    }

    pub fn leader(&self) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.is_leader)
    }

    /// The leader, if it is active on a live node.
    pub fn live_leader(&self, live_nodes: &BTreeSet<String>) -> Option<&Replica> {
        self.leader().filter(|r| r.is_active(live_nodes))
    }

    pub fn replica(&self, name: &str) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.name == name)
    }

    pub fn replica_mut(&mut self, name: &str) -> Option<&mut Replica> {
        self.replicas.iter_mut().find(|r| r.name == name)
    }

    pub fn replicas_of(&self, role: ReplicaRole) -> impl Iterator<Item = &Replica> {
        self.replicas.iter().filter(move |r| r.role == role)
    }
}

/// State record of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionState {
    pub name: String,
    pub shards: Vec<Shard>,
    /// Counter for generated replica names
    #[serde(default)]
    pub next_replica_id: u64,
    /// Substrate version of the record this value was read from
    #[serde(skip)]
    pub version: u64,
}

impl CollectionState {
    pub fn new(name: impl Into<String>, num_shards: usize) -> Self {
        Self {
            name: name.into(),
            shards: (1..=num_shards)
                .map(|i| Shard::new(format!("shard{}", i)))
                .collect(),
            next_replica_id: 1,
            version: 0,
        }
    }

    pub fn shard(&self, name: &str) -> Option<&Shard> {
        self.shards.iter().find(|s| s.name == name)
    }

    pub fn shard_mut(&mut self, name: &str) -> Option<&mut Shard> {
        self.shards.iter_mut().find(|s| s.name == name)
    }

    pub fn shard_or_err(&self, name: &str) -> crate::Result<&Shard> {
        self.shard(name).ok_or_else(|| crate::Error::ShardNotFound {
            collection: self.name.clone(),
            shard: name.to_string(),
        })
    }

    pub fn shard_mut_or_err(&mut self, name: &str) -> crate::Result<&mut Shard> {
        let collection = self.name.clone();
        self.shard_mut(name).ok_or(crate::Error::ShardNotFound {
            collection,
            shard: name.to_string(),
        })
    }

    pub fn replicas(&self) -> impl Iterator<Item = &Replica> {
        self.shards.iter().flat_map(|s| s.replicas.iter())
    }

    pub fn replicas_of(&self, role: ReplicaRole) -> impl Iterator<Item = &Replica> {
        self.replicas().filter(move |r| r.role == role)
    }

    /// Find a replica and the shard it belongs to.
    pub fn locate(&self, replica: &str) -> Option<(&Shard, &Replica)> {
        self.shards
            .iter()
            .find_map(|s| s.replica(replica).map(|r| (s, r)))
    }

    /// Allocate the next replica name, `core_node<N>`.
    pub fn allocate_replica_name(&mut self) -> String {
        let id = self.next_replica_id.max(1);
        self.next_replica_id = id + 1;
        format!("core_node{}", id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(name: &str, node: &str, role: ReplicaRole, state: ReplicaState) -> Replica {
        Replica {
            name: name.into(),
            node_id: node.into(),
            service_address: format!("local://{}/{}", node, name),
            role,
            state,
            is_leader: false,
        }
    }

    #[test]
    fn test_role_capabilities() {
        assert!(ReplicaRole::Writer.capabilities().can_lead);
        assert!(ReplicaRole::Writer.capabilities().accepts_writes);
        assert!(!ReplicaRole::Active.capabilities().can_lead);
        assert!(ReplicaRole::Active.capabilities().replays_update_log);
        let passive = ReplicaRole::Passive.capabilities();
        assert!(!passive.can_lead);
        assert!(!passive.participates_in_election);
        assert!(!passive.replays_update_log);
        assert!(!passive.accepts_writes);
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Passive".parse::<ReplicaRole>().unwrap(), ReplicaRole::Passive);
        assert!("leader".parse::<ReplicaRole>().is_err());
    }

    #[test]
    fn test_is_active_requires_live_node() {
        let live: BTreeSet<String> = ["n1".to_string()].into_iter().collect();
        let r = replica("core_node1", "n1", ReplicaRole::Passive, ReplicaState::Active);
        assert!(r.is_active(&live));
        let r = replica("core_node2", "n2", ReplicaRole::Passive, ReplicaState::Active);
        assert!(!r.is_active(&live));
        let r = replica("core_node3", "n1", ReplicaRole::Passive, ReplicaState::Recovering);
        assert!(!r.is_active(&live));
    }

    #[test]
    fn test_record_serialization() {
        let mut coll = CollectionState::new("c", 2);
        let name = coll.allocate_replica_name();
        let mut r = replica(&name, "n1", ReplicaRole::Writer, ReplicaState::Active);
        r.is_leader = true;
        coll.shard_mut("shard1").unwrap().replicas.push(r);
        coll.version = 42;

        let bytes = serde_json::to_vec(&coll).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let entry = &json["shards"][0]["replicas"][0];
        assert_eq!(entry["role"], "writer");
        assert_eq!(entry["state"], "active");
        assert_eq!(entry["is_leader"], true);
        assert!(json.get("version").is_none());

        let back: CollectionState = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.version, 0);
        assert_eq!(back.shard("shard1").unwrap().leader().unwrap().name, "core_node1");
        assert_eq!(back.shards[1].name, "shard2");
    }

    #[test]
    fn test_allocate_names_are_unique() {
        let mut coll = CollectionState::new("c", 1);
        let a = coll.allocate_replica_name();
        let b = coll.allocate_replica_name();
        assert_ne!(a, b);
        assert_eq!(b, "core_node2");
    }
}
