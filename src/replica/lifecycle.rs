//! Replica state machine
//!
//! ```text
//!   Down --CoreStarted/NodeRejoined--> Recovering
//!   Recovering --CatchUpCompleted/NothingToCatchUp--> Active
//!   Recovering/Active --CatchUpFailed--> Down
//!   any --NodeLost--> Down
//! ```
//!
//! [`next_state`] is pure; [`record_transition`] persists its result in the
//! collection record.

use crate::common::{Error, ReplicaState, Result};
use crate::coordinator::ClusterStateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    CoreStarted,
    NodeLost,
    NodeRejoined,
    CatchUpCompleted,
    NothingToCatchUp,
    CatchUpFailed,
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleEvent::CoreStarted => "core_started",
            LifecycleEvent::NodeLost => "node_lost",
            LifecycleEvent::NodeRejoined => "node_rejoined",
            LifecycleEvent::CatchUpCompleted => "catch_up_completed",
            LifecycleEvent::NothingToCatchUp => "nothing_to_catch_up",
            LifecycleEvent::CatchUpFailed => "catch_up_failed",
        };
        f.write_str(name)
    }
}

/// Next state of `replica` after `event`, or [`Error::IllegalTransition`].
pub fn next_state(replica: &str, current: ReplicaState, event: LifecycleEvent) -> Result<ReplicaState> {
    use LifecycleEvent::*;
    use ReplicaState::*;

    match (current, event) {
        (_, NodeLost) => Ok(Down),
        (Down, CoreStarted) | (Down, NodeRejoined) => Ok(Recovering),
        // A core restarted on a node that never dropped out.
        (Recovering, CoreStarted) | (Active, CoreStarted) => Ok(Recovering),
        (Recovering, CatchUpCompleted) | (Recovering, NothingToCatchUp) => Ok(Active),
        (Active, CatchUpCompleted) | (Active, NothingToCatchUp) => Ok(Active),
        (Recovering, CatchUpFailed) | (Active, CatchUpFailed) => Ok(Down),
        (from, event) => Err(Error::IllegalTransition {
            replica: replica.to_string(),
            from: from.to_string(),
            event: event.to_string(),
        }),
    }
}

/// Apply `event` to `replica`'s entry in the collection record. Entering Down
/// clears the leader flag. Nothing is written when the state is unchanged.
pub fn record_transition(
    store: &ClusterStateStore,
    collection: &str,
    replica: &str,
    event: LifecycleEvent,
) -> Result<ReplicaState> {
    record_transition_with(store, collection, replica, |_| event)
}

/// Record a core start. A core coming back on a rejoined node whose entry is
/// Down uses `NodeRejoined`, everything else `CoreStarted`.
pub fn record_startup(
    store: &ClusterStateStore,
    collection: &str,
    replica: &str,
    rejoining: bool,
) -> Result<ReplicaState> {
    record_transition_with(store, collection, replica, |current| {
        if rejoining && current == ReplicaState::Down {
            LifecycleEvent::NodeRejoined
        } else {
            LifecycleEvent::CoreStarted
        }
    })
}

fn record_transition_with<F>(
    store: &ClusterStateStore,
    collection: &str,
    replica: &str,
    event_for: F,
) -> Result<ReplicaState>
where
    F: Fn(ReplicaState) -> LifecycleEvent,
{
    let mut next = ReplicaState::Down;
    let mut transition = None;
    store.mutate_collection(collection, |coll| {
        let coll_name = coll.name.clone();
        let Some(shard) = coll
            .shards
            .iter_mut()
            .find(|s| s.replica(replica).is_some())
        else {
            return Err(Error::ReplicaNotFound {
                collection: coll_name,
                shard: "*".into(),
                replica: replica.to_string(),
            });
        };
        let Some(entry) = shard.replica_mut(replica) else {
            return Ok(false);
        };
        let event = event_for(entry.state);
        next = next_state(replica, entry.state, event)?;
        transition = Some((entry.state, event));
        let clear_leader = next == ReplicaState::Down && entry.is_leader;
        if entry.state == next && !clear_leader {
            return Ok(false);
        }
        entry.state = next;
        if next == ReplicaState::Down {
            entry.is_leader = false;
        }
        Ok(true)
    })?;
    if let Some((from, event)) = transition {
        if from != next {
            tracing::info!(
                "Replica {}/{} {} -> {} on {}",
                collection,
                replica,
                from,
                next,
                event
            );
        }
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleEvent::*;

    #[test]
    fn test_rejoin_path() {
        let mut state = ReplicaState::Active;
        for (event, expected) in [
            (NodeLost, ReplicaState::Down),
            (NodeRejoined, ReplicaState::Recovering),
            (CatchUpCompleted, ReplicaState::Active),
        ] {
            state = next_state("r", state, event).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_nothing_to_catch_up() {
        let state = next_state("r", ReplicaState::Down, CoreStarted).unwrap();
        assert_eq!(next_state("r", state, NothingToCatchUp).unwrap(), ReplicaState::Active);
    }

    #[test]
    fn test_failure_leaves_down() {
        assert_eq!(
            next_state("r", ReplicaState::Recovering, CatchUpFailed).unwrap(),
            ReplicaState::Down
        );
        assert_eq!(
            next_state("r", ReplicaState::Active, CatchUpFailed).unwrap(),
            ReplicaState::Down
        );
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(matches!(
            next_state("r", ReplicaState::Down, CatchUpCompleted),
            Err(Error::IllegalTransition { .. })
        ));
        assert!(next_state("r", ReplicaState::Active, NodeRejoined).is_err());
        assert!(next_state("r", ReplicaState::Down, CatchUpFailed).is_err());
    }

    #[test]
    fn test_recorded_transitions() {
        use crate::common::{CollectionState, Replica, ReplicaRole};
        use crate::coordinator::substrate::MemorySubstrate;
        use std::sync::Arc;

        let store = ClusterStateStore::new(Arc::new(MemorySubstrate::new())).unwrap();
        let mut coll = CollectionState::new("c", 1);
        coll.shards[0].replicas.push(Replica {
            name: "core_node1".into(),
            node_id: "n1".into(),
            service_address: String::new(),
            role: ReplicaRole::Writer,
            state: ReplicaState::Active,
            is_leader: true,
        });
        store.create_collection_record(&coll).unwrap();

        assert_eq!(
            record_transition(&store, "c", "core_node1", NodeLost).unwrap(),
            ReplicaState::Down
        );
        let snapshot = store.get_state("c");
        let entry = &snapshot.collection().unwrap().shards[0].replicas[0];
        assert!(!entry.is_leader);

        assert_eq!(
            record_startup(&store, "c", "core_node1", true).unwrap(),
            ReplicaState::Recovering
        );
        assert!(record_transition(&store, "c", "core_node1", NodeRejoined).is_err());
        assert!(matches!(
            record_transition(&store, "c", "core_node9", NodeLost),
            Err(Error::ReplicaNotFound { .. })
        ));
    }
}
