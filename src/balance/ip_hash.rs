use std::hash::Hasher;

use twox_hash::XxHash32;

use crate::error::MeshError;
use crate::registration::InstanceRecord;

fn hash32(s: &str) -> u32 {
    let mut hasher = XxHash32::with_seed(0);
    hasher.write(s.as_bytes());
    hasher.finish() as u32
}

/// Hash of the dotted-quad IP modulo the instance count, instances sorted by
/// `address` for a stable index assignment across calls.
///
/// Sorted by `address` rather than `key`: `key` is the service name and is
/// identical across every instance of a service (§3 data model), so sorting
/// by it is a no-op that leaves ordering to nondeterministic map iteration.
/// `address` (`host:port`) is the field that is actually unique per
/// instance.
#[derive(Debug, Default)]
pub struct IpHashBalancer;

impl IpHashBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn select_with_ip(
        &self,
        instances: &[InstanceRecord],
        ip: &str,
    ) -> Result<InstanceRecord, MeshError> {
        if instances.is_empty() {
            return Err(MeshError::NoHealthy);
        }
        let mut sorted: Vec<&InstanceRecord> = instances.iter().collect();
        sorted.sort_by(|a, b| a.address.cmp(&b.address));
        let idx = (hash32(ip) as usize) % sorted.len();
        Ok(sorted[idx].clone())
    }
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
    fn same_ip_maps_to_same_instance() {
        let lb = IpHashBalancer::new();
        let instances = vec![instance("a"), instance("b"), instance("c")];
        let first = lb.select_with_ip(&instances, "10.0.0.1").unwrap();
        let second = lb.select_with_ip(&instances, "10.0.0.1").unwrap();
        assert_eq!(first.address, second.address);
    }

    #[test]
    fn empty_is_no_healthy() {
        let lb = IpHashBalancer::new();
        assert!(matches!(lb.select_with_ip(&[], "10.0.0.1"), Err(MeshError::NoHealthy)));
    }
}
