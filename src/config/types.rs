use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a `T` that implements `Default` — treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
#[allow(dead_code)]
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level mesh configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub etcd: EtcdConfig,

    #[serde(default)]
    pub registration: RegistrationConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    #[serde(default = "default_etcd_endpoints")]
    pub endpoints: Vec<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: default_etcd_endpoints(),
            username: None,
            password: None,
        }
    }
}

fn default_etcd_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

/// `service_type` discriminator in the Registry key path
/// `/{namespace}/{service_type}/{key}/{instance_id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Api,
    Rpc,
}

impl Default for ServiceType {
    fn default() -> Self {
        ServiceType::Rpc
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::Api => write!(f, "api"),
            ServiceType::Rpc => write!(f, "rpc"),
        }
    }
}

/// Instance lifecycle status, as published in an Instance Record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Run,
    WaitDone,
    Kill,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        InstanceStatus::Run
    }
}

/// Retry parameters for the Registration Agent's reconnect loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Whether lease loss moves the agent into `Retrying` at all. When
    /// `false` the keepalive consumer terminates the agent on lease loss
    /// instead of entering the retry loop.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base wait between attempts.
    #[serde(default = "default_retry_wait_secs")]
    pub wait_secs: u64,

    /// Double `wait_secs` on each failed attempt, capped at 10x the base.
    #[serde(default)]
    pub exponential: bool,

    /// 0 = unbounded.
    #[serde(default)]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            wait_secs: default_retry_wait_secs(),
            exponential: false,
            max_attempts: 0,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_retry_wait_secs() -> u64 {
    5
}

/// Configuration for the Registration Agent (component F).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub service_type: ServiceType,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default)]
    pub weight: u32,

    #[serde(default)]
    pub meta: HashMap<String, String>,

    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// Development-mode isolation: prefix the Registry key with an MD5 of a
    /// machine identifier so only discovery clients on the same host observe
    /// this instance.
    #[serde(default)]
    pub use_isolate: bool,

    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Signal sent to the host channel on terminal failure or shutdown.
    /// Default matches a typical SIGINT-triggered graceful shutdown.
    #[serde(default)]
    pub shutdown_signal: ShutdownSignal,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            service_type: ServiceType::default(),
            service_name: default_service_name(),
            address: default_address(),
            weight: 0,
            meta: HashMap::new(),
            lease_ttl_secs: default_lease_ttl_secs(),
            use_isolate: false,
            environment: default_environment(),
            retry: RetryConfig::default(),
            shutdown_signal: ShutdownSignal::default(),
        }
    }
}

/// Configured default for `RegistrationAgent`'s host-channel signal. Mirrors
/// `registration::agent::SignalTag` one-to-one; kept as a separate type here
/// so `config` doesn't need to depend on `registration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        ShutdownSignal::Interrupt
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_service_name() -> String {
    "unnamed-service".to_string()
}

fn default_address() -> String {
    "127.0.0.1:0".to_string()
}

fn default_lease_ttl_secs() -> u64 {
    10
}

fn default_environment() -> String {
    "production".to_string()
}

impl RegistrationConfig {
    pub fn is_development_isolation(&self) -> bool {
        self.use_isolate && self.environment == "development"
    }
}

/// Which balancer a Service Group is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    Random,
    ConsistentHash,
    IpHash,
}

impl Default for BalancerKind {
    fn default() -> Self {
        BalancerKind::RoundRobin
    }
}

impl std::fmt::Display for BalancerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BalancerKind::RoundRobin => "round_robin",
            BalancerKind::WeightedRoundRobin => "weighted_round_robin",
            BalancerKind::LeastConnections => "least_connections",
            BalancerKind::Random => "random",
            BalancerKind::ConsistentHash => "consistent_hash",
            BalancerKind::IpHash => "ip_hash",
        };
        write!(f, "{}", s)
    }
}

/// Configuration for the Discovery Client (component D).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub default_balancer: BalancerKind,

    /// Per-service-name balancer overrides.
    #[serde(default)]
    pub balancer_overrides: HashMap<String, BalancerKind>,

    #[serde(default)]
    pub use_isolate: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            default_balancer: BalancerKind::default(),
            balancer_overrides: HashMap::new(),
            use_isolate: false,
        }
    }
}

/// TLS posture for Connection Pool channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsType {
    None,
    OneWay,
    Mutual,
}

impl Default for TlsType {
    fn default() -> Self {
        TlsType::None
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub tls_type: TlsType,

    /// Decouples the certificate CN check from the dialed address.
    #[serde(default)]
    pub server_name_override: Option<String>,
}

/// Configuration for the Connection Pool (component E).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_channels")]
    pub max_channels_per_service: usize,

    #[serde(default = "default_min_channels")]
    pub min_channels_per_service: usize,

    #[serde(default = "default_concurrency_threshold")]
    pub concurrency_threshold: usize,

    #[serde(default = "default_max_idle_secs")]
    pub max_idle_time_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_channels_per_service: default_max_channels(),
            min_channels_per_service: default_min_channels(),
            concurrency_threshold: default_concurrency_threshold(),
            max_idle_time_secs: default_max_idle_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            tls: TlsConfig::default(),
        }
    }
}

fn default_max_channels() -> usize {
    4
}

fn default_min_channels() -> usize {
    1
}

fn default_concurrency_threshold() -> usize {
    16
}

fn default_max_idle_secs() -> u64 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    30
}
