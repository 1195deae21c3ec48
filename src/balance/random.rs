use rand::Rng;

use crate::error::MeshError;
use crate::registration::InstanceRecord;

/// Uniform random selection over the current instance set.
#[derive(Debug, Default)]
pub struct RandomBalancer;

impl RandomBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn select(&self, instances: &[InstanceRecord]) -> Result<InstanceRecord, MeshError> {
        if instances.is_empty() {
            return Err(MeshError::NoHealthy);
        }
        let idx = rand::thread_rng().gen_range(0..instances.len());
        Ok(instances[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceType;

    #[test]
    fn always_returns_one_of_the_instances() {
        let lb = RandomBalancer::new();
        let instances = vec![
            InstanceRecord::new("ns", ServiceType::Rpc, "a", "addr"),
            InstanceRecord::new("ns", ServiceType::Rpc, "b", "addr"),
        ];
        for _ in 0..20 {
            let picked = lb.select(&instances).unwrap();
            assert!(instances.iter().any(|i| i.key == picked.key));
        }
    }

    #[test]
    fn empty_is_no_healthy() {
        let lb = RandomBalancer::new();
        assert!(matches!(lb.select(&[]), Err(MeshError::NoHealthy)));
    }
}
