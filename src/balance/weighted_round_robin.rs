use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::MeshError;
use crate::registration::InstanceRecord;

/// Nginx-style smooth weighted round robin. Each instance carries a running
/// `current_weight`; every call adds each instance's static weight to its
/// running total, picks the maximum, and subtracts the sum of all weights
/// from the winner. This interleaves instances instead of producing the
/// blocky runs a naive weighted-prefix-sum approach would.
///
/// Keyed by `address` rather than `key`: `key` is the service name and is
/// identical across every instance of a service (§3 data model), so it
/// cannot identify one instance among its siblings. `address` (`host:port`)
/// is the field that is actually unique per instance.
#[derive(Debug, Default)]
pub struct WeightedRoundRobinBalancer {
    current_weight: Mutex<HashMap<String, i64>>,
}

impl WeightedRoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, instances: &[InstanceRecord]) -> Result<InstanceRecord, MeshError> {
        if instances.is_empty() {
            return Err(MeshError::NoHealthy);
        }

        let mut state = self.current_weight.lock().unwrap();
        state.retain(|k, _| instances.iter().any(|i| &i.address == k));

        let total_weight: i64 = instances
            .iter()
            .map(|i| effective_weight(i.weight))
            .sum();

        let mut best_idx = 0;
        let mut best_weight = i64::MIN;
        for (idx, inst) in instances.iter().enumerate() {
            let w = effective_weight(inst.weight);
            let entry = state.entry(inst.address.clone()).or_insert(0);
            *entry += w;
            if *entry > best_weight {
                best_weight = *entry;
                best_idx = idx;
            }
        }

        let winner_address = instances[best_idx].address.clone();
        if let Some(entry) = state.get_mut(&winner_address) {
            *entry -= total_weight;
        }

        Ok(instances[best_idx].clone())
    }
}

/// A `weight` of 0 means "equal" per the data model — treat as 1.
fn effective_weight(weight: u32) -> i64 {
    if weight == 0 {
        1
    } else {
        weight as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceType;

    /// All instances of one service share the same `key` (the service name,
    /// per §3) — `address` is what actually distinguishes them here.
    fn weighted(address: &str, weight: u32) -> InstanceRecord {
        let mut r = InstanceRecord::new("ns", ServiceType::Rpc, "svc", address);
        r.weight = weight;
        r
    }

    #[test]
    fn balanced_weights_bound_streak_to_two() {
        let lb = WeightedRoundRobinBalancer::new();
        let instances = vec![weighted("a", 1), weighted("b", 1), weighted("c", 1)];
        let seq: Vec<String> = (0..9).map(|_| lb.select(&instances).unwrap().address).collect();
        let mut streak = 1;
        let mut max_streak = 1;
        for w in seq.windows(2) {
            if w[0] == w[1] {
                streak += 1;
                max_streak = max_streak.max(streak);
            } else {
                streak = 1;
            }
        }
        assert!(max_streak <= 2, "max streak was {max_streak}");
    }

    #[test]
    fn counts_match_weights_and_streak_is_bounded() {
        let lb = WeightedRoundRobinBalancer::new();
        let instances = vec![weighted("a", 5), weighted("b", 1), weighted("c", 1)];
        let seq: Vec<String> = (0..7).map(|_| lb.select(&instances).unwrap().address).collect();
        let mut counts = std::collections::HashMap::new();
        for k in &seq {
            *counts.entry(k.clone()).or_insert(0) += 1;
        }
        assert_eq!(counts["a"], 5);
        assert_eq!(counts["b"], 1);
        assert_eq!(counts["c"], 1);

        let mut streak = 1;
        let mut max_streak = 1;
        for w in seq.windows(2) {
            if w[0] == w[1] {
                streak += 1;
                max_streak = max_streak.max(streak);
            } else {
                streak = 1;
            }
        }
        assert!(max_streak <= 2, "max streak of 'a' was {max_streak}");
    }
}
