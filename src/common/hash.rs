//! Hashing utilities for minishard
//!
//! - BLAKE3 routing of document ids onto shards
//! - HRW (Highest Random Weight) ordering of nodes for replica placement

/// First 8 bytes of BLAKE3(data) as a little-endian integer.
fn blake3_u64(data: &[u8]) -> u64 {
    let hash = blake3::hash(data);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(prefix)
}

/// Compute the shard index for a routing key.
///
/// Returns an index into the collection's ordered shard list. `num_shards` must be
/// non-zero.
pub fn shard_index(key: &str, num_shards: usize) -> usize {
    (blake3_u64(key.as_bytes()) % num_shards as u64) as usize
}

/// HRW (Highest Random Weight) hashing for replica placement
///
/// Given a seed (e.g. `collection/shard`) and a set of nodes, returns the nodes
/// sorted by their weight. The order is deterministic for a seed and stable as
/// unrelated nodes join or leave.
pub fn hrw_order(seed: &str, nodes: &[String]) -> Vec<String> {
    let mut weights: Vec<(String, u64)> = nodes
        .iter()
        .map(|node| {
            let combined = format!("{}{}", seed, node);
            (node.clone(), blake3_u64(combined.as_bytes()))
        })
        .collect();

    // Sort by weight (descending)
    weights.sort_by(|a, b| b.1.cmp(&a.1));

    weights.into_iter().map(|(node, _)| node).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> Vec<String> {
        vec![
            "127.0.0.1:8983_solr".to_string(),
            "127.0.0.1:8984_solr".to_string(),
            "127.0.0.1:8985_solr".to_string(),
        ]
    }

    #[test]
    fn test_shard_index_deterministic() {
        let a = shard_index("doc-1", 4);
        let b = shard_index("doc-1", 4);
        assert_eq!(a, b);
        assert!(a < 4);
    }

    #[test]
    fn test_shard_index_spreads_keys() {
        let mut hit = [false; 2];
        for i in 0..64 {
            hit[shard_index(&format!("doc-{}", i), 2)] = true;
        }
        assert!(hit[0] && hit[1]);
    }

    #[test]
    fn test_single_shard() {
        assert_eq!(shard_index("anything", 1), 0);
    }

    #[test]
    fn test_hrw_order_consistent() {
        let sorted1 = hrw_order("coll/shard1", &nodes());
        let sorted2 = hrw_order("coll/shard1", &nodes());
        assert_eq!(sorted1, sorted2);
        assert_eq!(sorted1.len(), 3);
    }

    #[test]
    fn test_hrw_order_stable_on_removal() {
        let full = hrw_order("coll/shard2", &nodes());
        let removed = full[1].clone();
        let rest: Vec<String> = nodes().into_iter().filter(|n| *n != removed).collect();
        let partial = hrw_order("coll/shard2", &rest);
        let expected: Vec<String> = full.into_iter().filter(|n| *n != removed).collect();
        assert_eq!(partial, expected);
    }
}
