//! Reusable state predicates for [`ClusterStateStore::wait_for_state`].
//!
//! [`ClusterStateStore::wait_for_state`]: crate::coordinator::ClusterStateStore::wait_for_state

use crate::common::{CollectionState, ReplicaRole, ReplicaState};
use std::collections::BTreeSet;

/// A predicate over `(live_nodes, collection_state)`.
pub trait StatePredicate: Fn(&BTreeSet<String>, Option<&CollectionState>) -> bool + Send {}

impl<T> StatePredicate for T where T: Fn(&BTreeSet<String>, Option<&CollectionState>) -> bool + Send {}

/// The collection has exactly `shards` shards, each with `replicas_per_shard`
/// replicas that are all active on live nodes.
pub fn cluster_shape(shards: usize, replicas_per_shard: usize) -> impl StatePredicate {
    move |live: &BTreeSet<String>, coll: Option<&CollectionState>| {
        let Some(coll) = coll else {
            return false;
        };
        coll.shards.len() == shards
            && coll.shards.iter().all(|s| {
                s.replicas.len() == replicas_per_shard
                    && s.replicas.iter().all(|r| r.is_active(live))
            })
    }
}

/// Every shard has exactly the given number of active replicas per role.
pub fn active_replica_count(writers: usize, actives: usize, passives: usize) -> impl StatePredicate {
    move |live: &BTreeSet<String>, coll: Option<&CollectionState>| {
        let Some(coll) = coll else {
            return false;
        };
        coll.shards.iter().all(|s| {
            let count = |role| s.replicas_of(role).filter(|r| r.is_active(live)).count();
            count(ReplicaRole::Writer) == writers
                && count(ReplicaRole::Active) == actives
                && count(ReplicaRole::Passive) == passives
        })
    }
}

/// Every replica is either Active on a live node or Down on a dead one.
pub fn reflects_active_and_down() -> impl StatePredicate {
    |live: &BTreeSet<String>, coll: Option<&CollectionState>| {
        let Some(coll) = coll else {
            return false;
        };
        coll.replicas().all(|r| match r.state {
            ReplicaState::Active => live.contains(&r.node_id),
            ReplicaState::Down => !live.contains(&r.node_id),
            ReplicaState::Recovering => false,
        })
    }
}

pub fn collection_absent() -> impl StatePredicate {
    |_: &BTreeSet<String>, coll: Option<&CollectionState>| coll.is_none()
}

/// The shard exists and no longer lists `replica`.
pub fn replica_absent(shard: impl Into<String>, replica: impl Into<String>) -> impl StatePredicate {
    let shard = shard.into();
    let replica = replica.into();
    move |_: &BTreeSet<String>, coll: Option<&CollectionState>| {
        coll.and_then(|c| c.shard(&shard))
            .map(|s| s.replica(&replica).is_none())
            .unwrap_or(false)
    }
}

/// The shard has a leader that is active on a live node.
pub fn has_live_leader(shard: impl Into<String>) -> impl StatePredicate {
    let shard = shard.into();
    move |live: &BTreeSet<String>, coll: Option<&CollectionState>| {
        coll.and_then(|c| c.shard(&shard))
            .and_then(|s| s.live_leader(live))
            .is_some()
    }
}

/// A specific replica is active on a live node.
pub fn replica_active(replica: impl Into<String>) -> impl StatePredicate {
    let replica = replica.into();
    move |live: &BTreeSet<String>, coll: Option<&CollectionState>| {
        coll.and_then(|c| c.locate(&replica))
            .map(|(_, r)| r.is_active(live))
            .unwrap_or(false)
    }
}

/// A specific replica is recorded Down.
pub fn replica_down(replica: impl Into<String>) -> impl StatePredicate {
    let replica = replica.into();
    move |_: &BTreeSet<String>, coll: Option<&CollectionState>| {
        coll.and_then(|c| c.locate(&replica))
            .map(|(_, r)| r.state == ReplicaState::Down)
            .unwrap_or(false)
    }
}
