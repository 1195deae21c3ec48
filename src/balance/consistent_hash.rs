use std::collections::BTreeMap;
use std::hash::Hasher;

use twox_hash::XxHash32;

use crate::error::MeshError;
use crate::registration::InstanceRecord;

const VIRTUAL_NODES_PER_INSTANCE: u32 = 160;

fn hash32(s: &str) -> u32 {
    let mut hasher = XxHash32::with_seed(0);
    hasher.write(s.as_bytes());
    hasher.finish() as u32
}

/// A ring of `VIRTUAL_NODES_PER_INSTANCE` per instance, rebuilt from the
/// caller-supplied instance slice on every selection. Rebuilding per call
/// keeps the ring always consistent with the Service Group's current
/// membership without a separate invalidation path.
///
/// Vnodes are keyed by `address` rather than `key`: `key` is the service
/// name and is identical across every instance of a service (§3 data
/// model), which would collapse all `160·N` vnodes onto a single instance.
/// `address` (`host:port`) is the field that is actually unique per
/// instance.
#[derive(Debug, Default)]
pub struct ConsistentHashBalancer;

impl ConsistentHashBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn select_with_key(
        &self,
        instances: &[InstanceRecord],
        key: &str,
    ) -> Result<InstanceRecord, MeshError> {
        if instances.is_empty() {
            return Err(MeshError::NoHealthy);
        }

        let ring = build_ring(instances);
        let target = hash32(key);
        let instance_address = ring
            .range(target..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, addr)| addr.clone())
            .expect("non-empty instances produce a non-empty ring");

        instances
            .iter()
            .find(|i| i.address == instance_address)
            .cloned()
            .ok_or(MeshError::NoHealthy)
    }
}

fn build_ring(instances: &[InstanceRecord]) -> BTreeMap<u32, String> {
    let mut ring = BTreeMap::new();
    for inst in instances {
        for replica in 0..VIRTUAL_NODES_PER_INSTANCE {
            let vnode_key = format!("{}#{}", inst.address, replica);
            ring.insert(hash32(&vnode_key), inst.address.clone());
        }
    }
    ring
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceType;

    /// All instances of one service share the same `key` (the service name,
    /// per §3) — `address` is what actually distinguishes them here.
    fn instance(address: &str) -> InstanceRecord {
        InstanceRecord::new("ns", ServiceType::Rpc, "svc", address)
    }

    #[test]
    fn removing_an_unrelated_instance_does_not_change_mapping() {
        let lb = ConsistentHashBalancer::new();
        let full = vec![instance("a"), instance("b"), instance("c")];
        let picked_full = lb.select_with_key(&full, "some-routing-key").unwrap();

        let other_to_remove = full
            .iter()
            .map(|i| i.address.clone())
            .find(|a| a != &picked_full.address)
            .expect("at least one other instance exists");

        let reduced: Vec<InstanceRecord> = full
            .into_iter()
            .filter(|i| i.address != other_to_remove)
            .collect();
        let picked_reduced = lb.select_with_key(&reduced, "some-routing-key").unwrap();
        assert_eq!(picked_reduced.address, picked_full.address);
    }

    #[test]
    fn same_key_same_instance_set_is_stable() {
        let lb = ConsistentHashBalancer::new();
        let instances = vec![instance("a"), instance("b"), instance("c")];
        let first = lb.select_with_key(&instances, "k").unwrap();
        let second = lb.select_with_key(&instances, "k").unwrap();
        assert_eq!(first.address, second.address);
    }
}
