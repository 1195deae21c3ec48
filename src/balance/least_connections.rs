use dashmap::DashMap;

use crate::error::MeshError;
use crate::registration::InstanceRecord;

/// Exact-minimum scan over the Service Group's `connection_counts`, ties
/// broken by lowest instance address. The counter itself lives on the
/// Service Group so balancer hot-swap never loses in-flight accounting.
///
/// Counted by `address` rather than `key`: `key` is the service name and is
/// identical across every instance of a service (§3 data model), so every
/// instance would otherwise share one counter slot. `address` (`host:port`)
/// is the field that is actually unique per instance, and is also what
/// `ServiceGroup::release` / `ReleaseConnection` key their decrements by.
#[derive(Debug, Default)]
pub struct LeastConnectionsBalancer;

impl LeastConnectionsBalancer {
    pub fn new() -> Self {
        Self
    }

    /// Picks the instance with the minimum count, then increments it.
    pub fn select(
        &self,
        instances: &[InstanceRecord],
        counts: &DashMap<String, i64>,
    ) -> Result<InstanceRecord, MeshError> {
        if instances.is_empty() {
            return Err(MeshError::NoHealthy);
        }

        let mut best: Option<(&InstanceRecord, i64)> = None;
        for inst in instances {
            let count = counts.get(&inst.address).map(|v| *v).unwrap_or(0);
            best = match best {
                None => Some((inst, count)),
                Some((cur, cur_count)) => {
                    if count < cur_count || (count == cur_count && inst.address < cur.address) {
                        Some((inst, count))
                    } else {
                        Some((cur, cur_count))
                    }
                }
            };
        }

        let (winner, _) = best.expect("non-empty instances guarantees a winner");
        let address = winner.address.clone();
        *counts.entry(address).or_insert(0) += 1;
        Ok(winner.clone())
    }
}
