pub mod types;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl MeshConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — allowing the host program to start with zero configuration
    /// for local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: MeshConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            MeshConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!("loaded mesh configuration");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MESH_ETCD_ENDPOINTS") {
            self.etcd.endpoints = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("MESH_ETCD_USERNAME") {
            self.etcd.username = Some(v);
        }
        if let Ok(v) = std::env::var("MESH_ETCD_PASSWORD") {
            self.etcd.password = Some(v);
        }

        if let Ok(v) = std::env::var("MESH_REGISTRATION_NAMESPACE") {
            self.registration.namespace = v;
        }
        if let Ok(v) = std::env::var("MESH_REGISTRATION_SERVICE_NAME") {
            self.registration.service_name = v;
        }
        if let Ok(v) = std::env::var("MESH_REGISTRATION_ADDRESS") {
            self.registration.address = v;
        }
        if let Ok(v) = std::env::var("MESH_REGISTRATION_ENVIRONMENT") {
            self.registration.environment = v;
        }
        if let Ok(v) = std::env::var("MESH_REGISTRATION_USE_ISOLATE") {
            self.registration.use_isolate = v == "true" || v == "1";
        }

        if let Ok(v) = std::env::var("MESH_DISCOVERY_NAMESPACE") {
            self.discovery.namespace = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.etcd.endpoints.is_empty() {
            anyhow::bail!("at least one etcd endpoint is required");
        }
        for ep in &self.etcd.endpoints {
            if ep.is_empty() {
                anyhow::bail!("etcd endpoint cannot be empty");
            }
        }
        if self.registration.service_name.is_empty() {
            anyhow::bail!("registration.service_name cannot be empty");
        }
        if self.registration.lease_ttl_secs == 0 {
            anyhow::bail!("registration.lease_ttl_secs must be greater than zero");
        }
        if self.pool.max_channels_per_service < self.pool.min_channels_per_service {
            anyhow::bail!("pool.max_channels_per_service must be >= min_channels_per_service");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_endpoints() {
        let mut cfg = MeshConfig::default();
        cfg.etcd.endpoints.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_ttl() {
        let mut cfg = MeshConfig::default();
        cfg.registration.lease_ttl_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults() {
        let cfg = MeshConfig::default();
        assert!(cfg.validate().is_ok());
    }
}
