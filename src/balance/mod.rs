pub mod consistent_hash;
pub mod ip_hash;
pub mod least_connections;
pub mod random;
pub mod round_robin;
pub mod weighted_round_robin;

use dashmap::DashMap;

use crate::config::BalancerKind;
use crate::error::MeshError;
use crate::registration::InstanceRecord;

use consistent_hash::ConsistentHashBalancer;
use ip_hash::IpHashBalancer;
use least_connections::LeastConnectionsBalancer;
use random::RandomBalancer;
use round_robin::RoundRobinBalancer;
use weighted_round_robin::WeightedRoundRobinBalancer;

/// Closed enum of balancer variants, no trait objects. Hot-swapping the
/// balancer replaces the whole variant; counters that must survive a swap
/// (`connection_counts`) live on the Service Group, not here.
pub enum Balancer {
    RoundRobin(RoundRobinBalancer),
    WeightedRoundRobin(WeightedRoundRobinBalancer),
    LeastConnections(LeastConnectionsBalancer),
    Random(RandomBalancer),
    ConsistentHash(ConsistentHashBalancer),
    IpHash(IpHashBalancer),
}

impl Balancer {
    pub fn new(kind: BalancerKind) -> Self {
        match kind {
            BalancerKind::RoundRobin => Self::RoundRobin(RoundRobinBalancer::new()),
            BalancerKind::WeightedRoundRobin => {
                Self::WeightedRoundRobin(WeightedRoundRobinBalancer::new())
            }
            BalancerKind::LeastConnections => {
                Self::LeastConnections(LeastConnectionsBalancer::new())
            }
            BalancerKind::Random => Self::Random(RandomBalancer::new()),
            BalancerKind::ConsistentHash => Self::ConsistentHash(ConsistentHashBalancer::new()),
            BalancerKind::IpHash => Self::IpHash(IpHashBalancer::new()),
        }
    }

    pub fn kind(&self) -> BalancerKind {
        match self {
            Self::RoundRobin(_) => BalancerKind::RoundRobin,
            Self::WeightedRoundRobin(_) => BalancerKind::WeightedRoundRobin,
            Self::LeastConnections(_) => BalancerKind::LeastConnections,
            Self::Random(_) => BalancerKind::Random,
            Self::ConsistentHash(_) => BalancerKind::ConsistentHash,
            Self::IpHash(_) => BalancerKind::IpHash,
        }
    }

    /// Common `select(instances) -> instance | err` contract. `counts` is
    /// only consulted by `LeastConnections`; every other variant ignores it.
    pub fn select(
        &self,
        instances: &[InstanceRecord],
        counts: &DashMap<String, i64>,
    ) -> Result<InstanceRecord, MeshError> {
        match self {
            Self::RoundRobin(lb) => lb.select(instances),
            Self::WeightedRoundRobin(lb) => lb.select(instances),
            Self::LeastConnections(lb) => lb.select(instances, counts),
            Self::Random(lb) => lb.select(instances),
            Self::ConsistentHash(lb) => {
                // No key supplied: ConsistentHash has no natural default, so
                // fall back to uniform random the same way `RandomBalancer`
                // would, keeping `select` total over all variants.
                if instances.is_empty() {
                    return Err(MeshError::NoHealthy);
                }
                let idx = rand::random::<usize>() % instances.len();
                Ok(instances[idx].clone())
            }
            Self::IpHash(_) => {
                if instances.is_empty() {
                    return Err(MeshError::NoHealthy);
                }
                let idx = rand::random::<usize>() % instances.len();
                Ok(instances[idx].clone())
            }
        }
    }

    /// Keyed selection — satisfied only by `ConsistentHash`.
    pub fn select_with_key(
        &self,
        instances: &[InstanceRecord],
        key: &str,
    ) -> Result<InstanceRecord, MeshError> {
        match self {
            Self::ConsistentHash(lb) => lb.select_with_key(instances, key),
            _ => Err(MeshError::UnsupportedBalancer),
        }
    }

    /// IP-keyed selection — satisfied by `IpHash`, or by `ConsistentHash`
    /// (which also implements keyed selection) as a fallback.
    pub fn select_with_ip(
        &self,
        instances: &[InstanceRecord],
        ip: &str,
    ) -> Result<InstanceRecord, MeshError> {
        match self {
            Self::IpHash(lb) => lb.select_with_ip(instances, ip),
            Self::ConsistentHash(lb) => lb.select_with_key(instances, ip),
            _ => Err(MeshError::UnsupportedBalancer),
        }
    }
}
