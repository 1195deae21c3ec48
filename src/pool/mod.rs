pub mod tls;

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::discovery::DiscoveryClient;
use crate::error::MeshError;

use tls::{dial_channel, Channel, TlsMaterial};

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct ChannelEntry {
    channel: Channel,
    /// The dialed instance's `host:port` — the channel-binding identity.
    /// `InstanceRecord.key` is the *service* name and is identical across
    /// every instance of a service (§3 data model), so it cannot tell two
    /// instances of the same service apart; `address` can.
    address: String,
    last_used: AtomicI64,
    in_flight: AtomicUsize,
}

/// A handle to an acquired channel. Dropping it decrements `in_flight`
/// without closing the underlying channel — channels persist for reuse.
pub struct PoolClient {
    entry: Arc<ChannelEntry>,
}

impl PoolClient {
    pub fn channel(&self) -> &Channel {
        &self.entry.channel
    }

    /// The dialed instance's `host:port`, for callers building the request URI.
    pub fn address(&self) -> &str {
        &self.entry.address
    }
}

impl Drop for PoolClient {
    fn drop(&mut self) {
        self.entry.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Per-process singleton holding `{service_name -> channel groups}` and
/// per-channel `(instance-key, last_used, in_flight)` bookkeeping. Channels
/// are dialed lazily on first acquire rather than eagerly maintained for
/// every discovered instance.
pub struct ConnectionPool {
    cfg: PoolConfig,
    discovery: Arc<DiscoveryClient>,
    tls_material: Option<Arc<dyn TlsMaterial>>,
    channels: DashMap<String, Vec<Arc<ChannelEntry>>>,
    cancel: Arc<tokio::sync::Notify>,
}

impl ConnectionPool {
    pub fn new(
        cfg: PoolConfig,
        discovery: Arc<DiscoveryClient>,
        tls_material: Option<Arc<dyn TlsMaterial>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            discovery,
            tls_material,
            channels: DashMap::new(),
            cancel: Arc::new(tokio::sync::Notify::new()),
        })
    }

    /// Spawn the idle-channel reaper. Runs until `shutdown` is called.
    pub fn start_reaper(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move { pool.run_reaper().await });
    }

    async fn run_reaper(self: Arc<Self>) {
        let interval = Duration::from_secs(self.cfg.cleanup_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.notified() => return,
            }
            self.reap_once();
        }
    }

    fn reap_once(&self) {
        let max_idle = self.cfg.max_idle_time_secs as i64;
        let now = now_secs();

        for mut entry in self.channels.iter_mut() {
            let service_name = entry.key().clone();
            let still_discovered = self.discovery.has_service(&service_name);
            let min_channels = if still_discovered {
                self.cfg.min_channels_per_service
            } else {
                0
            };

            let group = entry.value_mut();
            let mut kept = Vec::with_capacity(group.len());
            for chan in group.drain(..) {
                let idle_for = now - chan.last_used.load(Ordering::Relaxed);
                let in_flight = chan.in_flight.load(Ordering::Relaxed);
                let can_drop = in_flight == 0 && idle_for > max_idle && kept.len() >= min_channels;
                if can_drop {
                    debug!(service = %service_name, address = %chan.address, "pool: reaping idle channel");
                    metrics::counter!("mesh_pool_idle_reaps_total").increment(1);
                } else {
                    kept.push(chan);
                }
            }
            metrics::gauge!("mesh_pool_channels_active", "service" => service_name.clone())
                .set(kept.len() as f64);
            *group = kept;
        }
    }

    /// `NewClient(service_name, opts)`: resolve a target instance via
    /// Discovery, then find or dial a channel bound to it.
    pub async fn acquire(&self, service_name: &str) -> Result<PoolClient, MeshError> {
        let instance = self.discovery.select_service(service_name)?;
        self.acquire_for_instance(service_name, &instance.address).await
    }

    pub async fn acquire_with_key(
        &self,
        service_name: &str,
        routing_key: &str,
    ) -> Result<PoolClient, MeshError> {
        let instance = self
            .discovery
            .select_service_with_key(service_name, routing_key)?;
        self.acquire_for_instance(service_name, &instance.address).await
    }

    /// Finds or dials a channel bound to `address` (`host:port`), the
    /// instance's unique identity — `InstanceRecord.key` is the shared
    /// service name and cannot tell instances of the same service apart.
    async fn acquire_for_instance(
        &self,
        service_name: &str,
        address: &str,
    ) -> Result<PoolClient, MeshError> {
        loop {
            let decision = {
                let group = self.channels.entry(service_name.to_string()).or_default();
                let bound: Vec<&Arc<ChannelEntry>> = group
                    .iter()
                    .filter(|c| c.address == address)
                    .collect();

                let min_in_flight = bound.iter().map(|c| c.in_flight.load(Ordering::Relaxed)).min();

                let should_dial = match min_in_flight {
                    None => true,
                    Some(min) => {
                        min >= self.cfg.concurrency_threshold
                            && group.len() < self.cfg.max_channels_per_service
                    }
                };

                if should_dial {
                    Decision::Dial
                } else {
                    let winner = bound
                        .into_iter()
                        .min_by_key(|c| c.in_flight.load(Ordering::Relaxed))
                        .expect("should_dial is false only when bound is non-empty")
                        .clone();
                    Decision::Reuse(winner)
                }
            };

            let entry = match decision {
                Decision::Reuse(entry) => entry,
                Decision::Dial => {
                    let channel = dial_channel(
                        self.cfg.tls.tls_type,
                        self.cfg.tls.server_name_override.as_deref(),
                        self.tls_material.as_deref().map(|m| m as &dyn TlsMaterial),
                        Duration::from_secs(5),
                    )
                    .map_err(|e| MeshError::TransportFailure(e.to_string()))?;
                    metrics::counter!("mesh_pool_dials_total").increment(1);

                    let entry = Arc::new(ChannelEntry {
                        channel,
                        address: address.to_string(),
                        last_used: AtomicI64::new(now_secs()),
                        in_flight: AtomicUsize::new(0),
                    });

                    let mut group = self.channels.entry(service_name.to_string()).or_default();
                    if group.len() >= self.cfg.max_channels_per_service {
                        // Lost the race against a concurrent dialer; reuse
                        // whatever now exists for this instance instead.
                        if let Some(existing) = group.iter().find(|c| c.address == address) {
                            existing.clone()
                        } else {
                            group.push(entry.clone());
                            entry
                        }
                    } else {
                        group.push(entry.clone());
                        entry
                    }
                }
            };

            entry.in_flight.fetch_add(1, Ordering::AcqRel);
            entry.last_used.store(now_secs(), Ordering::Relaxed);
            return Ok(PoolClient { entry });
        }
    }

    /// Close every channel for every service. Called at pool shutdown.
    pub fn close(&self) {
        self.cancel.notify_waiters();
        self.channels.clear();
        info!("pool: closed");
    }

    pub fn channel_count(&self, service_name: &str) -> usize {
        self.channels.get(service_name).map(|g| g.len()).unwrap_or(0)
    }
}

enum Decision {
    Reuse(Arc<ChannelEntry>),
    Dial,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_count_starts_at_zero_for_unknown_service() {
        // ConnectionPool construction needs a DiscoveryClient, which needs an
        // EtcdClient; exercised end-to-end in the integration tests instead.
        // Here we only check the config-driven reaper threshold math.
        let cfg = PoolConfig::default();
        assert!(cfg.min_channels_per_service <= cfg.max_channels_per_service);
    }
}
