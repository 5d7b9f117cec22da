//! Replica placement using HRW ordering
//!
//! Nodes are ranked per shard with HRW (Highest Random Weight) hashing seeded by
//! `collection/shard`. Replicas of one shard go to distinct nodes while any are
//! left, and no node is given more than `max_replicas_per_node` replicas in
//! total.

use crate::common::{hrw_order, Result};
use crate::coordinator::state::ClusterState;
use std::collections::{BTreeSet, HashMap};

/// Replicas currently recorded per node, across all collections.
pub fn node_load(state: &ClusterState) -> HashMap<String, usize> {
    let mut load = HashMap::new();
    for coll in state.collections.values() {
        for replica in coll.replicas() {
            *load.entry(replica.node_id.clone()).or_insert(0) += 1;
        }
    }
    load
}

/// PlacementManager chooses nodes for new replicas.
pub struct PlacementManager {
    max_replicas_per_node: usize,
}

impl PlacementManager {
    pub fn new(max_replicas_per_node: usize) -> Self {
        Self {
            max_replicas_per_node: max_replicas_per_node.max(1),
        }
    }

    /// Select nodes for `count` new replicas of `collection/shard`.
    ///
    /// `hosting` lists nodes that already hold a replica of the shard; `load` is
    /// updated with the assignments made.
    pub fn place_shard(
        &self,
        collection: &str,
        shard: &str,
        count: usize,
        live_nodes: &[String],
        hosting: &BTreeSet<String>,
        load: &mut HashMap<String, usize>,
    ) -> Result<Vec<String>> {
        let ordered = hrw_order(&format!("{}/{}", collection, shard), live_nodes);
        let mut used = hosting.clone();
        let mut selected = Vec::with_capacity(count);

        for _ in 0..count {
            let has_room = |node: &String| load.get(node).copied().unwrap_or(0) < self.max_replicas_per_node;
            let choice = ordered
                .iter()
                .find(|n| has_room(n) && !used.contains(*n))
                .or_else(|| ordered.iter().find(|n| has_room(n)))
                .cloned();

            let Some(node) = choice else {
                let capacity: usize = live_nodes
                    .iter()
                    .map(|n| {
                        self.max_replicas_per_node
                            .saturating_sub(load.get(n).copied().unwrap_or(0))
                    })
                    .sum();
                return Err(crate::Error::InsufficientNodes {
                    needed: count,
                    available: capacity + selected.len(),
                });
            };
            *load.entry(node.clone()).or_insert(0) += 1;
            used.insert(node.clone());
            selected.push(node);
        }

        Ok(selected)
    }
}
