use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::{BalancerKind, DiscoveryConfig};
use crate::error::MeshError;
use crate::etcd::client::{b64_decode, b64_encode, WatchCreate, WatchCreateRequest, WatchEvent};
use crate::etcd::EtcdClient;
use crate::registration::machine::local_machine_id;
use crate::registration::record::{parse_key, InstanceRecord};

use super::group::ServiceGroup;

/// Multi-service watcher: owns `{service-name -> Service Group}` for a
/// namespace.
///
/// Watches a single namespace prefix, parses each event, and applies it to
/// local state, with service name and instance key parsed out of the tail of
/// the watched key.
pub struct DiscoveryClient {
    etcd: EtcdClient,
    namespace: String,
    default_balancer: BalancerKind,
    balancer_overrides: HashMap<String, BalancerKind>,
    use_isolate: bool,
    local_machine_id: Option<String>,
    groups: DashMap<String, Arc<ServiceGroup>>,
    updated: Arc<Notify>,
    cancel: Arc<Notify>,
}

impl DiscoveryClient {
    pub fn new(etcd: EtcdClient, cfg: &DiscoveryConfig) -> Arc<Self> {
        Arc::new(Self {
            etcd,
            namespace: cfg.namespace.clone(),
            default_balancer: cfg.default_balancer,
            balancer_overrides: cfg.balancer_overrides.clone(),
            use_isolate: cfg.use_isolate,
            local_machine_id: if cfg.use_isolate {
                Some(local_machine_id())
            } else {
                None
            },
            groups: DashMap::new(),
            updated: Arc::new(Notify::new()),
            cancel: Arc::new(Notify::new()),
        })
    }

    fn namespace_prefix(&self) -> String {
        format!("/{}/", self.namespace)
    }

    fn balancer_for(&self, service_name: &str) -> BalancerKind {
        self.balancer_overrides
            .get(service_name)
            .copied()
            .unwrap_or(self.default_balancer)
    }

    fn group_for(&self, service_name: &str) -> Arc<ServiceGroup> {
        self.groups
            .entry(service_name.to_string())
            .or_insert_with(|| Arc::new(ServiceGroup::new(service_name, self.balancer_for(service_name))))
            .clone()
    }

    /// Bootstrap: one `get_prefix` to seed, then one `watch` over the whole
    /// namespace prefix, since service names are discovered rather than
    /// enumerated in advance.
    pub async fn start(self: &Arc<Self>) -> Result<(), MeshError> {
        let prefix = self.namespace_prefix();
        let seed = self
            .etcd
            .get_prefix(&prefix)
            .await
            .map_err(|e| MeshError::RegistryUnavailable(e.to_string()))?;

        for kv in seed.kvs {
            if let Ok(key) = b64_decode(&kv.key) {
                if let Ok(value) = b64_decode(&kv.value) {
                    self.apply_put(&key, &value);
                }
            }
        }

        let watcher = Arc::clone(self);
        tokio::spawn(async move { watcher.run_watch().await });

        Ok(())
    }

    async fn run_watch(self: Arc<Self>) {
        let prefix = self.namespace_prefix();
        loop {
            let stream = self.etcd.watch_stream(&WatchCreateRequest {
                create_request: WatchCreate {
                    key: b64_encode(&prefix),
                    range_end: crate::etcd::client::prefix_range_end(&prefix),
                    start_revision: None,
                },
            });

            let mut stream = tokio::select! {
                res = stream => match res {
                    Ok(s) => s,
                    Err(e) => {
                        metrics::counter!("mesh_discovery_reconnects_total").increment(1);
                        warn!("discovery: watch connect failed: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
                _ = self.cancel.notified() => return,
            };

            loop {
                tokio::select! {
                    resp = stream.next_response() => {
                        match resp {
                            Some(watch_resp) => {
                                if let Some(result) = watch_resp.result {
                                    for event in result.events {
                                        self.apply_event(event);
                                    }
                                    self.updated.notify_waiters();
                                }
                            }
                            None => break,
                        }
                    }
                    _ = self.cancel.notified() => return,
                }
            }
        }
    }

    fn apply_event(&self, event: WatchEvent) {
        let is_delete = event.event_type.as_deref() == Some("DELETE");
        let Some(kv) = event.kv else { return };
        let Ok(key) = b64_decode(&kv.key) else { return };

        if is_delete {
            self.apply_delete(&key);
            return;
        }

        let Ok(value) = b64_decode(&kv.value) else { return };
        self.apply_put(&key, &value);
    }

    fn apply_put(&self, raw_key: &str, raw_value: &str) {
        let Some(parsed) = parse_key(raw_key) else {
            debug!("discovery: unparseable key {}", raw_key);
            return;
        };

        if self.use_isolate {
            match (&self.local_machine_id, &parsed.machine_id) {
                (Some(local), Some(remote)) if local != remote => return,
                (Some(_), None) => return,
                _ => {}
            }
        }

        let Ok(record) = InstanceRecord::decode(raw_value) else {
            warn!("discovery: dropping undecodable record at {}", raw_key);
            return;
        };

        let group = self.group_for(&parsed.service_name);
        group.upsert(parsed.instance_id, record);
        metrics::counter!("mesh_discovery_watch_events_total").increment(1);
        metrics::gauge!("mesh_discovered_instances", "service" => parsed.service_name)
            .set(group.service_count() as f64);
    }

    fn apply_delete(&self, raw_key: &str) {
        let Some(parsed) = parse_key(raw_key) else { return };
        if let Some(group) = self.groups.get(&parsed.service_name) {
            group.remove(&parsed.instance_id);
            metrics::counter!("mesh_discovery_watch_events_total").increment(1);
            metrics::gauge!("mesh_discovered_instances", "service" => parsed.service_name)
                .set(group.service_count() as f64);
        }
    }

    pub fn select_service(&self, service_name: &str) -> Result<InstanceRecord, MeshError> {
        self.groups
            .get(service_name)
            .ok_or(MeshError::NoService)?
            .select()
    }

    pub fn select_service_with_key(
        &self,
        service_name: &str,
        key: &str,
    ) -> Result<InstanceRecord, MeshError> {
        self.groups
            .get(service_name)
            .ok_or(MeshError::NoService)?
            .select_with_key(key)
    }

    pub fn select_service_with_ip(
        &self,
        service_name: &str,
        ip: &str,
    ) -> Result<InstanceRecord, MeshError> {
        self.groups
            .get(service_name)
            .ok_or(MeshError::NoService)?
            .select_with_ip(ip)
    }

    /// Same selection path as `select_service` — the health filter
    /// (`status=Run`) is already applied inside `ServiceGroup::select`.
    pub fn select_healthy_service(&self, service_name: &str) -> Result<InstanceRecord, MeshError> {
        self.select_service(service_name)
    }

    /// `address` is the instance's `host:port`, matching what
    /// `ConnectionPool`/the balancers key their per-instance counters by —
    /// not the registry instance-key, and not `InstanceRecord.key` (the
    /// shared service name).
    pub fn release_connection(&self, service_name: &str, address: &str) {
        if let Some(group) = self.groups.get(service_name) {
            group.release(address);
        }
    }

    pub async fn wait_for_service(
        &self,
        service_name: &str,
        timeout: Duration,
    ) -> Result<(), MeshError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register as a waiter before checking the condition: a watch
            // event landing between the check and the wait would otherwise
            // notify a `Notified` future that doesn't exist yet and be lost.
            let notified = self.updated.notified();

            if let Some(group) = self.groups.get(service_name) {
                if !group.is_empty() {
                    return Ok(());
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(MeshError::Timeout);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Err(MeshError::Timeout),
            }
        }
    }

    pub fn set_service_load_balancer(&self, service_name: &str, kind: BalancerKind) {
        if let Some(group) = self.groups.get(service_name) {
            group.set_balancer(kind);
        }
    }

    pub fn get_all_service_names(&self) -> Vec<String> {
        self.groups.iter().map(|e| e.key().clone()).collect()
    }

    pub fn get_service_count(&self, service_name: &str) -> usize {
        self.groups
            .get(service_name)
            .map(|g| g.service_count())
            .unwrap_or(0)
    }

    pub fn has_service(&self, service_name: &str) -> bool {
        self.groups.contains_key(service_name)
    }

    pub fn get_service_group(&self, service_name: &str) -> Option<Arc<ServiceGroup>> {
        self.groups.get(service_name).map(|e| e.clone())
    }

    /// Cancel the watch loop. Connection Pool channels are closed by the
    /// pool itself, which the host shuts down alongside this client.
    pub fn close(&self) {
        self.cancel.notify_waiters();
        info!("discovery: closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balancer_override_takes_precedence_over_default() {
        let mut overrides = HashMap::new();
        overrides.insert("special".to_string(), BalancerKind::LeastConnections);
        let cfg = DiscoveryConfig {
            namespace: "ns".to_string(),
            default_balancer: BalancerKind::RoundRobin,
            balancer_overrides: overrides,
            use_isolate: false,
        };
        assert_eq!(
            cfg.balancer_overrides.get("special").copied(),
            Some(BalancerKind::LeastConnections)
        );
        assert_eq!(cfg.default_balancer, BalancerKind::RoundRobin);
    }
}
