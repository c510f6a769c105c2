//! Configuration types for objnbd
//!
//! This module defines configuration structures used across components. All
//! structs deserialize with defaults for missing fields, so a config file
//! only has to name what it changes.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Default maximum transfer size of a single request: 8 MiB
pub const DEFAULT_MAX_TRANSFER_SIZE: u32 = 8 * 1024 * 1024;

/// Default backend object size: 4 MiB
pub const DEFAULT_OBJECT_SIZE: u64 = 4 * 1024 * 1024;

/// Root configuration for the gateway process
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// NBD listener configuration
    pub listen: ListenConfig,
    /// Per-connection protocol settings
    pub connector: ConnectorConfig,
    /// Object backend configuration
    pub backend: BackendConfig,
}

impl GatewayConfig {
    /// Load a configuration file (JSON) and validate it.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        self.connector.validate()?;
        self.backend.validate()
    }
}

/// Listener configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// NBD TCP listen address
    pub nbd: SocketAddr,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            nbd: SocketAddr::from(([0, 0, 0, 0], 10809)),
        }
    }
}

/// Settings applied to every client connection
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Largest request length accepted; anything above closes the connection
    pub max_transfer_size: u32,
    /// Outstanding client requests per connection before reading pauses
    pub max_inflight_requests: usize,
    /// Backend domain passed on attach
    pub domain: String,
    /// Blob name holding the volume's objects
    pub blob: String,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            max_transfer_size: DEFAULT_MAX_TRANSFER_SIZE,
            max_inflight_requests: 256,
            domain: "default".to_string(),
            blob: "block".to_string(),
        }
    }
}

impl ConnectorConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.max_transfer_size == 0 {
            return Err(ConfigError::invalid("connector.max_transfer_size must be > 0"));
        }
        if self.max_inflight_requests == 0 {
            return Err(ConfigError::invalid(
                "connector.max_inflight_requests must be > 0",
            ));
        }
        if self.blob.is_empty() {
            return Err(ConfigError::invalid("connector.blob must not be empty"));
        }
        Ok(())
    }
}

/// Which object backend the gateway talks to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process object store (testing and demos)
    #[default]
    Memory,
}

/// Object backend configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend implementation
    pub kind: BackendKind,
    /// Artificial latency added to every backend call (milliseconds)
    pub latency_ms: u64,
    /// Volumes served by the backend
    pub volumes: Vec<VolumeConfig>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Memory,
            latency_ms: 0,
            volumes: vec![VolumeConfig::default()],
        }
    }
}

impl BackendConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.volumes.is_empty() {
            return Err(ConfigError::invalid("backend.volumes must not be empty"));
        }
        for vol in &self.volumes {
            vol.validate()?;
        }
        Ok(())
    }
}

/// A volume exposed by the backend
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Volume (export) name
    pub name: String,
    /// Bytes per backend object
    pub object_size: u64,
    /// Addressable bytes
    pub capacity: u64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            name: "vol0".to_string(),
            object_size: DEFAULT_OBJECT_SIZE,
            capacity: 1024 * 1024 * 1024, // 1 GiB
        }
    }
}

impl VolumeConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.name.is_empty() {
            return Err(ConfigError::invalid("volume name must not be empty"));
        }
        if self.object_size == 0 || self.object_size > u64::from(u32::MAX) {
            return Err(ConfigError::invalid(format!(
                "volume '{}': object_size {} out of range",
                self.name, self.object_size
            )));
        }
        if self.capacity == 0 {
            return Err(ConfigError::invalid(format!(
                "volume '{}': capacity must be > 0",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen.nbd.port(), 10809);
        assert_eq!(config.connector.max_transfer_size, 8 * 1024 * 1024);
        assert_eq!(config.backend.kind, BackendKind::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "connector": {{ "max_inflight_requests": 16 }},
                "backend": {{ "volumes": [{{ "name": "data", "object_size": 4096, "capacity": 1048576 }}] }}
            }}"#
        )
        .unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.connector.max_inflight_requests, 16);
        assert_eq!(config.connector.blob, "block");
        assert_eq!(config.backend.volumes.len(), 1);
        assert_eq!(config.backend.volumes[0].object_size, 4096);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "backend": {{ "volumes": [{{ "name": "x", "object_size": 0 }}] }} }}"#
        )
        .unwrap();

        let err = GatewayConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = GatewayConfig::load("/nonexistent/objnbd.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
