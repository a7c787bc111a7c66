//! Shard-to-worker routing and the identify dispatch seam.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::registry::ShardRegistry;
use super::ShardId;
use crate::error::ConfigError;

/// Maps shard ids onto a fixed set of workers.
///
/// Shards past the last worker's range saturate onto the last worker
/// instead of failing. Heavy over-subscription therefore piles onto one
/// worker; raise `total_workers` if that becomes a bottleneck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerRouter {
    shards_per_worker: u32,
    total_workers: u32,
}

impl WorkerRouter {
    pub fn new(shards_per_worker: u32, total_workers: u32) -> Result<Self, ConfigError> {
        if shards_per_worker == 0 {
            return Err(ConfigError::new("shards_per_worker must be at least 1"));
        }
        if total_workers == 0 {
            return Err(ConfigError::new("total_workers must be at least 1"));
        }
        Ok(Self {
            shards_per_worker,
            total_workers,
        })
    }

    pub fn shards_per_worker(&self) -> u32 {
        self.shards_per_worker
    }

    pub fn total_workers(&self) -> u32 {
        self.total_workers
    }

    pub fn worker_id(&self, shard_id: ShardId) -> u32 {
        let worker_id = (shard_id / self.shards_per_worker).min(self.total_workers - 1);
        debug!(
            shard_id,
            worker_id,
            shards_per_worker = self.shards_per_worker,
            total_workers = self.total_workers,
            "calculated worker id"
        );
        worker_id
    }
}

/// An instruction telling a worker to begin a shard's handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifyInstruction {
    pub worker_id: u32,
    pub shard_id: ShardId,
    pub bucket_id: u32,
}

/// Delivers identify instructions to whatever owns the worker.
///
/// Implementations may run the shard in-process or forward the instruction
/// to another process. The gateway manager only decides when and to whom.
#[async_trait]
pub trait IdentifyDispatcher: Send + Sync {
    async fn dispatch(&self, instruction: IdentifyInstruction) -> anyhow::Result<()>;
}

/// Identifies shards on the local registry.
#[derive(Clone)]
pub struct LocalDispatcher {
    registry: Arc<ShardRegistry>,
}

impl LocalDispatcher {
    pub fn new(registry: Arc<ShardRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl IdentifyDispatcher for LocalDispatcher {
    async fn dispatch(&self, instruction: IdentifyInstruction) -> anyhow::Result<()> {
        self.registry.identify(instruction.shard_id).await?;
        Ok(())
    }
}
