//! Configuration management for the fleet control plane.
//!
//! Provides hierarchical configuration loading from multiple sources, in
//! ascending precedence:
//! 1. Built-in defaults
//! 2. `~/.config/fleetd-controller/config.toml` (user defaults)
//! 3. `fleetd.toml` (git-tracked, project config)
//! 4. `fleetd.local.toml` (gitignored, local overrides)
//! 5. `FLEETD_*` environment variables (highest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Top-level control-plane configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetdConfig {
    pub project: ProjectConfig,
    pub discovery: DiscoveryConfig,
    pub agent: AgentConfig,
    pub registry: RegistryConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self { name: "fleetd-controller".to_string() }
    }
}

/// The discovery gRPC endpoint: aggregated and virtual-host delta discovery
/// on a configurable TCP port, default 18000; also co-exposes the poke
/// bridge, health, and reflection services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub bind_address: String,
    pub keepalive_interval_secs: u64,
    pub keepalive_timeout_secs: u64,
    pub max_concurrent_streams: u32,
    pub max_message_size_bytes: u32,
    pub reflection_enabled: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:18000".to_string(),
            keepalive_interval_secs: 30,
            keepalive_timeout_secs: 5,
            max_concurrent_streams: 10_000,
            max_message_size_bytes: 50 * 1024 * 1024,
            reflection_enabled: true,
        }
    }
}

/// The agent gRPC endpoint: `CommandService` + `ControllerService` on port
/// 50051, with its own keepalive/window/buffer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub bind_address: String,
    pub keepalive_interval_secs: u64,
    pub keepalive_timeout_secs: u64,
    pub min_ping_interval_without_stream_secs: u64,
    pub initial_window_size_bytes: u32,
    pub max_header_list_size_bytes: u32,
    pub read_buffer_bytes: u32,
    pub write_buffer_bytes: u32,
    /// Bearer tokens a `Register` call must present one of.
    pub allowed_registration_tokens: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:50051".to_string(),
            keepalive_interval_secs: 60,
            keepalive_timeout_secs: 10,
            min_ping_interval_without_stream_secs: 5,
            initial_window_size_bytes: 1024 * 1024,
            max_header_list_size_bytes: 32 * 1024,
            read_buffer_bytes: 64 * 1024,
            write_buffer_bytes: 64 * 1024,
            allowed_registration_tokens: Vec::new(),
        }
    }
}

/// The cross-controller registry this replica publishes its ownership to.
/// `controller_id`/`grpc_address` default to hostname-based auto-detection
/// when left unset, performed by `fleetd-registry-client`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub address: String,
    pub controller_id: Option<String>,
    pub grpc_address: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { address: "127.0.0.1:50052".to_string(), controller_id: None, grpc_address: None }
    }
}

/// The persisted-document backend behind the `Store` trait boundary. A real
/// backend is out of scope here; this section only carries enough to select
/// and address one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: String,
    pub dsn: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { backend: "memory".to_string(), dsn: None }
    }
}

impl FleetdConfig {
    /// Loads configuration from the default locations, rooted at the
    /// current directory.
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Loads configuration rooted at a specific project directory.
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_expected_endpoint_tuning() {
        let config = FleetdConfig::default();
        assert_eq!(config.discovery.bind_address, "0.0.0.0:18000");
        assert_eq!(config.discovery.max_concurrent_streams, 10_000);
        assert_eq!(config.discovery.max_message_size_bytes, 50 * 1024 * 1024);
        assert_eq!(config.agent.bind_address, "0.0.0.0:50051");
        assert_eq!(config.agent.initial_window_size_bytes, 1024 * 1024);
        assert!(config.agent.allowed_registration_tokens.is_empty());
        assert_eq!(config.store.backend, "memory");
    }
}
