//! # Shardgate
//!
//! Rate-limited admission control for a client of a real-time messaging
//! platform.
//!
//! Two transports share the same problem: a bounded resource whose limits
//! are learned at runtime. The [`gateway`] side paces shard identify
//! handshakes through per-bucket gates, with buckets running in parallel.
//! The [`rest`] side keeps a FIFO per route, sleeps until a bucket resets
//! when its window is spent, honours global limits, and stops all traffic
//! before the host's invalid-request ceiling is reached.
//!
//! Connections and HTTP are collaborators behind [`ShardConnection`] and
//! [`RestTransport`]; this crate owns only the admission decisions.

pub mod config;
pub mod error;
pub mod gateway;
pub mod rest;

pub use config::{
    ConfigOverrides, GatewayConfig, GatewayOverrides, HostLimits, HostOverrides, RestConfig,
    ShardgateConfig,
};
pub use error::{ConfigError, GatewayError, RestError};
pub use gateway::{
    calculate_shard_id, calculate_total_shards, BucketPlan, GatewayManager, IdentifyDispatcher,
    ShardConnection, ShardFactory, ShardId,
};
pub use rest::{RequestMethod, RestManager, RestResponse, RestTransport};
