//! Error types for the gateway and REST admission layers.
//!
//! Rate-limit delays never appear here: they are absorbed by queueing.
//! Callers only see configuration problems, routing misses, collaborator
//! failures, and terminal REST outcomes.

use crate::gateway::ShardId;
use crate::rest::RequestMethod;

/// Configuration error.
#[derive(Debug, thiserror::Error)]
#[error("configuration error: {message}")]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::new(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("shard {0} not found")]
    ShardNotFound(ShardId),
    #[error("shard {shard_id} connection failed")]
    Connection {
        shard_id: ShardId,
        #[source]
        source: anyhow::Error,
    },
    #[error("worker {worker_id} rejected identify for shard {shard_id}")]
    Dispatch {
        worker_id: u32,
        shard_id: ShardId,
        #[source]
        source: anyhow::Error,
    },
}

impl GatewayError {
    /// Routing misses may clear once the registry catches up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::ShardNotFound(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RestError {
    #[error("{method} {url} failed with status {status}")]
    Http {
        method: RequestMethod,
        url: String,
        status: u16,
        body: Option<String>,
    },
    #[error("{method} {url} still rate limited after {retries} retries")]
    RetriesExhausted {
        method: RequestMethod,
        url: String,
        retries: u32,
    },
    #[error("{method} {url} transport failure")]
    Transport {
        method: RequestMethod,
        url: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("request manager dropped the request before completion")]
    Dropped,
}

impl RestError {
    pub fn status(&self) -> Option<u16> {
        match self {
            RestError::Http { status, .. } => Some(*status),
            RestError::RetriesExhausted { .. } => Some(429),
            _ => None,
        }
    }
}
