use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::balance::Balancer;
use crate::config::{BalancerKind, InstanceStatus};
use crate::error::MeshError;
use crate::registration::InstanceRecord;

/// Per-service-name aggregate of live Instance Records plus the balancer
/// bound to it. All mutation comes from the Discovery Client's serialized
/// watch-event stream; reads may run concurrently with selection.
///
/// `instances` is keyed by the registry-assigned instance-key (unique per
/// watch event); `connection_counts` is keyed by `address` (`host:port`),
/// since `InstanceRecord.key` is the *service* name and is identical across
/// every instance of a service — it cannot identify one instance among its
/// siblings the way `address` can.
pub struct ServiceGroup {
    service_name: String,
    instances: DashMap<String, InstanceRecord>,
    balancer: ArcSwap<Balancer>,
    last_used: AtomicI64,
    connection_counts: DashMap<String, i64>,
}

impl ServiceGroup {
    pub fn new(service_name: impl Into<String>, kind: BalancerKind) -> Self {
        Self {
            service_name: service_name.into(),
            instances: DashMap::new(),
            balancer: ArcSwap::from_pointee(Balancer::new(kind)),
            last_used: AtomicI64::new(0),
            connection_counts: DashMap::new(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// `Put`: upsert an Instance Record. A `status=Kill` record is never
    /// selectable — once observed, it is removed from `instances` instead of
    /// being stored.
    pub fn upsert(&self, instance_key: String, record: InstanceRecord) {
        if record.status == InstanceStatus::Kill {
            self.instances.remove(&instance_key);
        } else {
            self.instances.insert(instance_key, record);
        }
    }

    /// `Delete`: remove by instance-key (the registry-assigned instance id).
    /// The group itself is retained by the caller even if this empties it
    /// (avoids thrashing during a restart).
    ///
    /// `connection_counts` is keyed by `address`, not by this instance-key
    /// (balancers select and count by `address` — see `balance::least_connections`
    /// for why), so the removed record's address is looked up to clean up
    /// its counter slot too.
    pub fn remove(&self, instance_key: &str) {
        if let Some((_, record)) = self.instances.remove(instance_key) {
            self.connection_counts.remove(&record.address);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn service_count(&self) -> usize {
        self.instances.len()
    }

    /// Every instance currently tracked, regardless of status.
    pub fn all_instances(&self) -> Vec<InstanceRecord> {
        self.instances.iter().map(|e| e.value().clone()).collect()
    }

    /// `status=Run` and passing the balancer's implicit health filter
    /// (Kill is already excluded by construction; WaitDone instances are
    /// still selectable until the host finishes draining).
    pub fn healthy_instances(&self) -> Vec<InstanceRecord> {
        self.instances
            .iter()
            .filter(|e| e.value().status == InstanceStatus::Run)
            .map(|e| e.value().clone())
            .collect()
    }

    fn touch_last_used(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.last_used.store(now, Ordering::Relaxed);
    }

    pub fn last_used(&self) -> i64 {
        self.last_used.load(Ordering::Relaxed)
    }

    pub fn select(&self) -> Result<InstanceRecord, MeshError> {
        self.touch_last_used();
        let instances = self.healthy_instances();
        let balancer = self.balancer.load();
        self.record_selection(balancer.select(&instances, &self.connection_counts))
    }

    pub fn select_with_key(&self, key: &str) -> Result<InstanceRecord, MeshError> {
        self.touch_last_used();
        let instances = self.healthy_instances();
        let balancer = self.balancer.load();
        self.record_selection(balancer.select_with_key(&instances, key))
    }

    pub fn select_with_ip(&self, ip: &str) -> Result<InstanceRecord, MeshError> {
        self.touch_last_used();
        let instances = self.healthy_instances();
        let balancer = self.balancer.load();
        self.record_selection(balancer.select_with_ip(&instances, ip))
    }

    fn record_selection(
        &self,
        result: Result<InstanceRecord, MeshError>,
    ) -> Result<InstanceRecord, MeshError> {
        let kind = self.balancer_kind();
        match &result {
            Ok(_) => {
                metrics::counter!(
                    "mesh_balancer_selections_total",
                    "service" => self.service_name.clone(),
                    "balancer" => kind.to_string(),
                )
                .increment(1);
            }
            Err(MeshError::NoHealthy) | Err(MeshError::NoService) => {
                metrics::counter!(
                    "mesh_balancer_no_healthy_total",
                    "service" => self.service_name.clone(),
                )
                .increment(1);
            }
            Err(_) => {}
        }
        result
    }

    /// Decrements the least-connections counter for the instance at
    /// `address`, never below zero. `address`, not the registry instance-key,
    /// because that is what `LeastConnectionsBalancer::select` increments by.
    pub fn release(&self, address: &str) {
        if let Some(mut entry) = self.connection_counts.get_mut(address) {
            *entry = (*entry - 1).max(0);
        }
    }

    /// Hot-swap the balancer, preserving `connection_counts` (they live on
    /// the group, not the balancer being replaced).
    pub fn set_balancer(&self, kind: BalancerKind) {
        self.balancer.store(std::sync::Arc::new(Balancer::new(kind)));
    }

    pub fn balancer_kind(&self) -> BalancerKind {
        self.balancer.load().kind()
    }
}

impl fmt::Display for ServiceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ServiceGroup(name={}, instances={}, balancer={:?})",
            self.service_name,
            self.instances.len(),
            self.balancer_kind()
        )
    }
}
