//! objnbd Common - Shared configuration types
//!
//! This crate provides the configuration structures and their error type
//! used by the block connector crates and the gateway binary.

pub mod config;
pub mod error;

pub use config::{
    BackendConfig, BackendKind, ConnectorConfig, GatewayConfig, ListenConfig, VolumeConfig,
};
pub use error::{ConfigError, ConfigResult};
