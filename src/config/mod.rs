//! Unified configuration for the gateway and REST admission layers.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (shardgate.toml)
//! ```toml
//! [gateway]
//! total_shards = 32
//! shards_per_worker = 8
//! total_workers = 4
//!
//! [host]
//! max_concurrency = 4
//!
//! [rest]
//! max_retry_count = 5
//! ```
//!
//! Environment variables use the `SHARDGATE_` prefix and a double underscore
//! between sections, e.g. `SHARDGATE_HOST__MAX_CONCURRENCY=16`.

mod defaults;

pub use defaults::*;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use crate::error::ConfigError;

/// Main configuration for shardgate components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardgateConfig {
    /// Gateway shard admission
    pub gateway: GatewayConfig,
    /// Limits advertised by the host
    pub host: HostLimits,
    /// REST request admission
    pub rest: RestConfig,
}

impl ShardgateConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(ShardgateConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with SHARDGATE_ prefix
        figment = figment.merge(Env::prefixed("SHARDGATE_").split("__"));

        // Layer 3: CLI overrides
        figment = figment.merge(Serialized::defaults(overrides));

        figment.extract().map_err(ConfigError::from)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }
}

/// Properties sent by a shard when it identifies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "shardgate".to_string(),
            device: "shardgate".to_string(),
        }
    }
}

/// Gateway manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway URL passed to new connections
    pub url: String,
    /// Gateway API version
    pub version: u8,
    /// Credential used by connections to identify
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Intent bitfield sent on identify
    pub intents: u64,
    /// Whether payloads are zlib-compressed
    pub compress: bool,
    /// Total shards; falls back to the host hint when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_shards: Option<u32>,
    /// First shard id owned by this manager
    pub first_shard_id: u32,
    /// Last shard id owned by this manager; defaults to `total_shards - 1`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_shard_id: Option<u32>,
    /// Shards grouped onto one worker
    pub shards_per_worker: u32,
    /// Number of workers
    pub total_workers: u32,
    /// Pacing interval between identifies in one bucket (ms)
    pub spawn_shard_delay_ms: u64,
    /// Grace period on shutdown (ms)
    pub shutdown_grace_ms: u64,
    /// Member request timeout (ms)
    pub request_members_timeout_ms: u64,
    /// Identify properties
    pub properties: IdentifyProperties,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            version: DEFAULT_GATEWAY_VERSION,
            token: None,
            intents: 0,
            compress: false,
            total_shards: None,
            first_shard_id: 0,
            last_shard_id: None,
            shards_per_worker: DEFAULT_SHARDS_PER_WORKER,
            total_workers: DEFAULT_TOTAL_WORKERS,
            spawn_shard_delay_ms: DEFAULT_SPAWN_SHARD_DELAY_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            request_members_timeout_ms: DEFAULT_REQUEST_MEMBERS_TIMEOUT_MS,
            properties: IdentifyProperties::default(),
        }
    }
}

impl GatewayConfig {
    pub fn spawn_shard_delay(&self) -> Duration {
        Duration::from_millis(self.spawn_shard_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn request_members_timeout(&self) -> Duration {
        Duration::from_millis(self.request_members_timeout_ms)
    }
}

/// Limits learned from the host before the manager is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostLimits {
    /// Shards that may begin their handshake simultaneously
    pub max_concurrency: u32,
    /// Recommended shard count
    pub shard_total_hint: u32,
    /// Session-start window (ms)
    pub reset_window_ms: u64,
}

impl Default for HostLimits {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            shard_total_hint: DEFAULT_TOTAL_SHARDS,
            reset_window_ms: DEFAULT_RESET_WINDOW_MS,
        }
    }
}

impl HostLimits {
    /// Time until the host's session-start budget refills.
    pub fn reset_window(&self) -> Duration {
        Duration::from_millis(self.reset_window_ms)
    }
}

/// REST manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    /// Base URL, without trailing slash
    pub base_url: String,
    /// REST API version
    pub version: u8,
    /// Retries after a rate-limit rejection; unbounded when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retry_count: Option<u32>,
    /// Idle time before an empty queue is dropped (ms)
    pub delete_queue_delay_ms: u64,
    /// Invalid responses tolerated per window
    pub invalid_request_max: u32,
    /// Invalid-request window (ms)
    pub invalid_request_interval_ms: u64,
    /// Headroom kept below `invalid_request_max`
    pub invalid_request_safety_margin: u32,
    /// Fallback wait for a 429 without retry hints (ms)
    pub default_retry_after_ms: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_REST_BASE_URL.to_string(),
            version: DEFAULT_REST_VERSION,
            max_retry_count: None,
            delete_queue_delay_ms: DEFAULT_DELETE_QUEUE_DELAY_MS,
            invalid_request_max: DEFAULT_INVALID_REQUEST_MAX,
            invalid_request_interval_ms: DEFAULT_INVALID_REQUEST_INTERVAL_MS,
            invalid_request_safety_margin: DEFAULT_INVALID_REQUEST_SAFETY_MARGIN,
            default_retry_after_ms: DEFAULT_RETRY_AFTER_MS,
        }
    }
}

impl RestConfig {
    pub fn delete_queue_delay(&self) -> Duration {
        Duration::from_millis(self.delete_queue_delay_ms)
    }

    pub fn invalid_request_interval(&self) -> Duration {
        Duration::from_millis(self.invalid_request_interval_ms)
    }

    pub fn default_retry_after(&self) -> Duration {
        Duration::from_millis(self.default_retry_after_ms)
    }

    /// Versioned prefix prepended to relative request paths.
    pub fn api_root(&self) -> String {
        format!("{}/v{}", self.base_url.trim_end_matches('/'), self.version)
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<HostOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_shards: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_shard_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_shard_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shards_per_worker: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_workers: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
}
