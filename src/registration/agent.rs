use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{error, info, warn};

use crate::config::{InstanceStatus, RegistrationConfig, ShutdownSignal};
use crate::error::MeshError;
use crate::etcd::client::{
    b64_decode, b64_encode, PutRequest, WatchCreate, WatchCreateRequest,
};
use crate::etcd::EtcdClient;

use super::machine::local_machine_id;
use super::record::{instance_key, InstanceIdSource, InstanceRecord, RandomBase36InstanceId};

/// `Starting -> Advertising -> (Reconciling | WaitingDone | Retrying) -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentState {
    Starting = 0,
    Advertising = 1,
    Reconciling = 2,
    WaitingDone = 3,
    Retrying = 4,
    Stopped = 5,
}

impl AgentState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => AgentState::Starting,
            1 => AgentState::Advertising,
            2 => AgentState::Reconciling,
            3 => AgentState::WaitingDone,
            4 => AgentState::Retrying,
            _ => AgentState::Stopped,
        }
    }
}

/// Signal sent to the host process on terminal failure. Default is
/// `Interrupt`, matching a typical SIGINT-triggered graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTag {
    Interrupt,
    Terminate,
}

impl From<ShutdownSignal> for SignalTag {
    fn from(s: ShutdownSignal) -> Self {
        match s {
            ShutdownSignal::Interrupt => SignalTag::Interrupt,
            ShutdownSignal::Terminate => SignalTag::Terminate,
        }
    }
}

/// Host callbacks invoked by the agent. Implementations must be
/// non-blocking — each call is dispatched via `tokio::spawn` so a slow
/// callback cannot stall the watcher task.
pub trait AgentHost: Send + Sync {
    fn on_back(&self) {}
    fn on_status_change(&self, _record: &InstanceRecord) {}
    fn retry_func(&self, _attempt: u32) {}
    fn retry_ok_func(&self) {}
}

#[derive(Debug, Default)]
pub struct NoopHost;
impl AgentHost for NoopHost {}

/// Lease-keepalive + self-watch + bounded-reconnect state machine.
pub struct RegistrationAgent {
    etcd: EtcdClient,
    cfg: RegistrationConfig,
    host: Arc<dyn AgentHost>,
    signal_tx: Option<mpsc::UnboundedSender<SignalTag>>,
    signal_tag: SignalTag,
    id_source: Arc<dyn InstanceIdSource>,

    machine_id: Option<String>,
    instance_id: String,
    key: String,

    record: RwLock<InstanceRecord>,
    lease_id: std::sync::Mutex<Option<i64>>,
    state: AtomicU8,
    caller_initiated: AtomicBool,
    cancel: Arc<Notify>,

    /// The exact encoded value this agent last wrote to its own key. A watch
    /// `Put` whose value matches this is this agent's own write echoing back
    /// through its self-watch, not an external edit — without this check the
    /// "any other Put: re-lease with the new value" rule would re-publish in
    /// response to its own publish, forever.
    last_published: std::sync::Mutex<Option<String>>,
}

impl RegistrationAgent {
    pub fn new(etcd: EtcdClient, cfg: RegistrationConfig, host: Arc<dyn AgentHost>) -> Arc<Self> {
        Self::with_signal(etcd, cfg, host, None)
    }

    pub fn with_signal(
        etcd: EtcdClient,
        cfg: RegistrationConfig,
        host: Arc<dyn AgentHost>,
        signal_tx: Option<mpsc::UnboundedSender<SignalTag>>,
    ) -> Arc<Self> {
        let id_source: Arc<dyn InstanceIdSource> = Arc::new(RandomBase36InstanceId);
        let machine_id = if cfg.is_development_isolation() {
            Some(local_machine_id())
        } else {
            None
        };
        let instance_id = id_source.generate();
        let key = instance_key(
            &cfg.namespace,
            cfg.service_type,
            &cfg.service_name,
            machine_id.as_deref(),
            &instance_id,
        );

        let mut record = InstanceRecord::new(
            cfg.namespace.clone(),
            cfg.service_type,
            cfg.service_name.clone(),
            cfg.address.clone(),
        );
        record.weight = cfg.weight;
        record.meta = cfg.meta.clone();
        let signal_tag = SignalTag::from(cfg.shutdown_signal);

        Arc::new(Self {
            etcd,
            cfg,
            host,
            signal_tx,
            signal_tag,
            id_source,
            machine_id,
            instance_id,
            key,
            record: RwLock::new(record),
            lease_id: std::sync::Mutex::new(None),
            state: AtomicU8::new(AgentState::Starting as u8),
            caller_initiated: AtomicBool::new(false),
            cancel: Arc::new(Notify::new()),
            last_published: std::sync::Mutex::new(None),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> AgentState {
        AgentState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: AgentState) {
        self.state.store(s as u8, Ordering::Release);
        metrics::gauge!("mesh_registration_state").set(s as u8 as f64);
    }

    /// `Start`: grant a lease, publish the record, spawn the watcher and
    /// keepalive-consumer tasks.
    pub async fn start(self: &Arc<Self>) -> Result<(), MeshError> {
        self.advertise().await?;

        let watcher = Arc::clone(self);
        tokio::spawn(async move { watcher.run_watcher().await });

        let keepalive = Arc::clone(self);
        tokio::spawn(async move { keepalive.run_keepalive().await });

        Ok(())
    }

    async fn advertise(&self) -> Result<(), MeshError> {
        let lease_id = self
            .etcd
            .lease_grant(self.cfg.lease_ttl_secs)
            .await
            .map_err(|e| MeshError::RegistryUnavailable(e.to_string()))?;
        {
            let mut guard = self.lease_id.lock().unwrap();
            *guard = Some(lease_id);
        }
        self.put_record(lease_id).await?;
        self.set_state(AgentState::Advertising);
        info!(instance_id = %self.instance_id, key = %self.key, lease_id, "registration: advertising");
        Ok(())
    }

    async fn put_record(&self, lease_id: i64) -> Result<(), MeshError> {
        let value = self.record.read().await.encode()?;
        self.etcd
            .put(&PutRequest {
                key: b64_encode(&self.key),
                value: b64_encode(&value),
                lease: Some(lease_id),
            })
            .await
            .map_err(|e| MeshError::RegistryUnavailable(e.to_string()))?;
        *self.last_published.lock().unwrap() = Some(value);
        Ok(())
    }

    fn current_lease(&self) -> Option<i64> {
        *self.lease_id.lock().unwrap()
    }

    /// Watcher contract: reacts to events on the agent's own key.
    async fn run_watcher(self: Arc<Self>) {
        loop {
            let stream = self.etcd.watch_stream(&WatchCreateRequest {
                create_request: WatchCreate {
                    key: b64_encode(&self.key),
                    range_end: String::new(),
                    start_revision: None,
                },
            });

            let mut stream = tokio::select! {
                res = stream => match res {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("registration: watch connect failed: {}", e);
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
                                        if self.handle_watch_event(event).await {
                                            return;
                                        }
                                    }
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

    /// Returns `true` when the watcher should stop entirely.
    async fn handle_watch_event(
        &self,
        event: crate::etcd::client::WatchEvent,
    ) -> bool {
        let is_delete = event.event_type.as_deref() == Some("DELETE");

        if is_delete {
            if self.caller_initiated.load(Ordering::Acquire) {
                return true;
            }
            warn!(key = %self.key, "registration: self key deleted externally, re-publishing");
            if let Some(old_lease) = self.current_lease() {
                let _ = self.etcd.lease_revoke(old_lease).await;
            }
            match self.etcd.lease_grant(self.cfg.lease_ttl_secs).await {
                Ok(new_lease) => {
                    {
                        let mut guard = self.lease_id.lock().unwrap();
                        *guard = Some(new_lease);
                    }
                    if self.put_record(new_lease).await.is_err() {
                        error!("registration: re-publish failed, giving up on self key {}", self.key);
                        let _ = self.etcd.delete(&self.key).await;
                        self.cancel.notify_waiters();
                        self.dispatch_on_back();
                        self.signal(self.signal_tag);
                        return true;
                    }
                }
                Err(e) => {
                    error!("registration: lease re-grant failed: {}", e);
                    self.cancel.notify_waiters();
                    self.dispatch_on_back();
                    self.signal(self.signal_tag);
                    return true;
                }
            }
            return false;
        }

        // Put.
        let Some(kv) = event.kv else { return false };
        let Ok(raw) = b64_decode(&kv.value) else { return false };
        let Ok(parsed) = InstanceRecord::decode(&raw) else {
            return false;
        };

        if self.last_published.lock().unwrap().as_deref() == Some(raw.as_str()) {
            // This agent's own write echoing back through its self-watch,
            // not an external edit — otherwise the re-lease branch below
            // would re-publish in response to its own publish, forever.
            return false;
        }

        if parsed.status == InstanceStatus::Kill {
            info!(key = %self.key, "registration: observed status=Kill, deleting self key");
            if let Some(lease) = self.current_lease() {
                let _ = self.etcd.lease_revoke(lease).await;
            }
            let _ = self.etcd.delete(&self.key).await;
            self.cancel.notify_waiters();
            return true;
        }

        let status_changed = {
            let current = self.record.read().await;
            current.status != parsed.status
        };

        {
            let mut current = self.record.write().await;
            *current = parsed.clone();
        }

        if status_changed {
            self.dispatch_on_status_change(parsed.clone());
            if parsed.status == InstanceStatus::WaitDone {
                self.set_state(AgentState::WaitingDone);
            }
        } else {
            // Externally edited value with metadata intact: re-lease to keep
            // it authoritative without waiting for the next keepalive tick.
            if let Some(lease) = self.current_lease() {
                let _ = self.put_record(lease).await;
            }
        }

        false
    }

    fn dispatch_on_back(&self) {
        let host = Arc::clone(&self.host);
        tokio::spawn(async move { host.on_back() });
    }

    fn dispatch_on_status_change(&self, record: InstanceRecord) {
        let host = Arc::clone(&self.host);
        tokio::spawn(async move { host.on_status_change(&record) });
    }

    fn signal(&self, tag: SignalTag) {
        if let Some(tx) = &self.signal_tx {
            let _ = tx.send(tag);
        }
    }

    /// Keepalive consumer contract.
    async fn run_keepalive(self: Arc<Self>) {
        let interval = Duration::from_secs((self.cfg.lease_ttl_secs / 3).max(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.notified() => return,
            }

            let Some(lease_id) = self.current_lease() else { return };
            match self.etcd.lease_keepalive(lease_id).await {
                Ok(()) => {
                    metrics::counter!("mesh_lease_renewals_total").increment(1);
                    continue;
                }
                Err(e) => {
                    metrics::counter!("mesh_lease_lost_total").increment(1);
                    warn!("registration: keepalive lost lease {}: {}", lease_id, e);
                    if self.caller_initiated.load(Ordering::Acquire) {
                        return;
                    }
                    if self.cfg.retry.enabled {
                        self.set_state(AgentState::Retrying);
                        self.run_retry_loop().await;
                    } else {
                        self.set_state(AgentState::Stopped);
                    }
                    return;
                }
            }
        }
    }

    /// Periodic `member_list` probe, invoked from the keepalive consumer on
    /// lease loss.
    async fn run_retry_loop(self: &Arc<Self>) {
        let mut wait = Duration::from_secs(self.cfg.retry.wait_secs.max(1));
        let max_wait = wait * 10;
        let mut attempt: u32 = 0;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.cancel.notified() => return,
            }

            attempt += 1;
            metrics::counter!("mesh_retry_attempts_total").increment(1);
            metrics::histogram!("mesh_retry_wait_seconds").record(wait.as_secs_f64());
            self.host.retry_func(attempt);

            match self.etcd.member_list().await {
                Ok(()) => {
                    info!("registration: registry reachable again after {} attempts", attempt);
                    match self.advertise().await {
                        Ok(()) => {
                            let watcher = Arc::clone(self);
                            tokio::spawn(async move { watcher.run_watcher().await });
                            let keepalive = Arc::clone(self);
                            tokio::spawn(async move { keepalive.run_keepalive().await });
                            self.host.retry_ok_func();
                        }
                        Err(e) => {
                            error!("registration: re-advertise after recovery failed: {}", e);
                        }
                    }
                    return;
                }
                Err(e) => {
                    warn!("registration: retry probe {} failed: {}", attempt, e);
                    if self.cfg.retry.max_attempts != 0 && attempt >= self.cfg.retry.max_attempts {
                        error!("registration: retry attempts exhausted, giving up");
                        self.set_state(AgentState::Stopped);
                        self.dispatch_on_back();
                        self.signal(self.signal_tag);
                        return;
                    }
                    if self.cfg.retry.exponential {
                        wait = (wait * 2).min(max_wait);
                    }
                }
            }
        }
    }

    /// Graceful close: revoke the lease under a bounded 10-second timeout.
    pub async fn close(&self) {
        self.caller_initiated.store(true, Ordering::Release);
        let lease_id = self.current_lease();
        if let Some(id) = lease_id {
            let revoke = self.etcd.lease_revoke(id);
            if tokio::time::timeout(Duration::from_secs(10), revoke).await.is_err() {
                warn!("registration: lease revoke timed out during close");
            }
        }
        self.cancel.notify_waiters();
        self.set_state(AgentState::Stopped);
    }

    /// Fatal-path shutdown: cancels all tasks and signals the host.
    pub fn shutdown(&self) {
        self.set_state(AgentState::Stopped);
        self.cancel.notify_waiters();
        self.signal(self.signal_tag);
    }
}
