use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::MeshError;
use crate::registration::InstanceRecord;

/// Monotonic cursor modulo the current instance count. Instances are sorted
/// by key before indexing so re-ordering under membership change stays
/// deterministic rather than depending on watch-event arrival order.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    cursor: AtomicU64,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, instances: &[InstanceRecord]) -> Result<InstanceRecord, MeshError> {
        if instances.is_empty() {
            return Err(MeshError::NoHealthy);
        }
        let mut sorted: Vec<&InstanceRecord> = instances.iter().collect();
        sorted.sort_by(|a, b| a.key.cmp(&b.key).then(a.address.cmp(&b.address)));
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % sorted.len();
        Ok(sorted[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceType;

    fn instance(key: &str, addr: &str) -> InstanceRecord {
        InstanceRecord::new("ns", ServiceType::Rpc, key, addr)
    }

    #[test]
    fn fairness_over_k_times_n_selections() {
        let lb = RoundRobinBalancer::new();
        let instances = vec![instance("a", "1.1.1.1:1"), instance("b", "1.1.1.1:2")];
        let mut counts = std::collections::HashMap::new();
        for _ in 0..8 {
            let picked = lb.select(&instances).unwrap();
            *counts.entry(picked.key).or_insert(0) += 1;
        }
        assert_eq!(counts["a"], 4);
        assert_eq!(counts["b"], 4);
    }

    #[test]
    fn sequence_matches_stable_key_order() {
        let lb = RoundRobinBalancer::new();
        let instances = vec![instance("a", "1.1.1.1:1"), instance("b", "1.1.1.1:2")];
        let seq: Vec<String> = (0..4).map(|_| lb.select(&instances).unwrap().key).collect();
        assert_eq!(seq, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn empty_is_no_healthy() {
        let lb = RoundRobinBalancer::new();
        assert!(matches!(lb.select(&[]), Err(MeshError::NoHealthy)));
    }
}
