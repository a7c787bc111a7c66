//! Concurrency bucket allocation for shard identifies.
//!
//! The host lets `max_concurrency` shards begin their handshake at once.
//! Shard `n` always identifies through bucket `n % max_concurrency`, and each
//! bucket admits one identify per pacing interval.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::pacing::PacingGate;
use super::worker::WorkerRouter;
use super::ShardId;
use crate::config::{
    GatewayConfig, HostLimits, SINGLE_CONCURRENCY_SHARD_MULTIPLE, SMALL_BOT_SHARD_THRESHOLD,
};
use crate::error::ConfigError;

/// Round a shard total up to a count the host accepts.
///
/// Totals under the small-bot threshold are used as-is. Larger totals are
/// rounded up to a multiple of `max_concurrency`, or of 16 when the host
/// only allows one concurrent identify.
pub fn calculate_total_shards(total_shards: u32, max_concurrency: u32) -> u32 {
    if total_shards < SMALL_BOT_SHARD_THRESHOLD {
        return total_shards;
    }
    let multiple = if max_concurrency <= 1 {
        SINGLE_CONCURRENCY_SHARD_MULTIPLE
    } else {
        max_concurrency
    };
    total_shards.div_ceil(multiple) * multiple
}

/// The shard range a manager owns and the concurrency it identifies with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardTopology {
    pub first_shard_id: ShardId,
    pub last_shard_id: ShardId,
    pub total_shards: u32,
    pub max_concurrency: u32,
}

impl ShardTopology {
    pub fn new(
        first_shard_id: ShardId,
        last_shard_id: ShardId,
        total_shards: u32,
        max_concurrency: u32,
    ) -> Result<Self, ConfigError> {
        if total_shards == 0 {
            return Err(ConfigError::new("total_shards must be at least 1"));
        }
        if max_concurrency == 0 {
            return Err(ConfigError::new("max_concurrency must be at least 1"));
        }
        if first_shard_id > last_shard_id {
            return Err(ConfigError::new(format!(
                "first shard id {first_shard_id} is after last shard id {last_shard_id}"
            )));
        }
        Ok(Self {
            first_shard_id,
            last_shard_id,
            total_shards,
            max_concurrency,
        })
    }

    /// Resolve the topology from configuration and host limits.
    pub fn from_config(config: &GatewayConfig, host: &HostLimits) -> Result<Self, ConfigError> {
        let requested = config.total_shards.unwrap_or(host.shard_total_hint);
        let total_shards = calculate_total_shards(requested, host.max_concurrency);
        debug!(requested, total_shards, "calculated total shards");
        let last_shard_id = config
            .last_shard_id
            .unwrap_or_else(|| total_shards.saturating_sub(1));
        Self::new(
            config.first_shard_id,
            last_shard_id,
            total_shards,
            host.max_concurrency,
        )
    }

    pub fn bucket_id(&self, shard_id: ShardId) -> u32 {
        shard_id % self.max_concurrency
    }

    pub fn shard_ids(&self) -> impl Iterator<Item = ShardId> {
        self.first_shard_id..=self.last_shard_id
    }
}

/// Shards queued for identify on one worker, in identify order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerQueue {
    pub worker_id: u32,
    pub shard_ids: Vec<ShardId>,
}

/// One concurrency bucket: its worker queues and its pacing gate.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub id: u32,
    pub workers: Vec<WorkerQueue>,
    pub gate: Arc<PacingGate>,
}

impl Bucket {
    fn new(id: u32, gate: Arc<PacingGate>) -> Self {
        Self {
            id,
            workers: Vec::new(),
            gate,
        }
    }

    fn push(&mut self, worker_id: u32, shard_id: ShardId) {
        match self.workers.iter_mut().find(|w| w.worker_id == worker_id) {
            Some(worker) => worker.shard_ids.push(shard_id),
            None => self.workers.push(WorkerQueue {
                worker_id,
                shard_ids: vec![shard_id],
            }),
        }
    }

    pub fn shard_ids(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.workers.iter().flat_map(|w| w.shard_ids.iter().copied())
    }
}

/// One pacing gate per concurrency bucket.
///
/// Gates outlive any single plan, so a respawn keeps honouring the last
/// identify each bucket admitted.
pub fn pacing_gates(max_concurrency: u32, interval: Duration) -> Vec<Arc<PacingGate>> {
    (0..max_concurrency)
        .map(|_| Arc::new(PacingGate::new(interval)))
        .collect()
}

/// The full identify plan. Rebuilt whenever topology changes; the gates
/// are supplied by the caller and shared across rebuilds.
#[derive(Debug, Clone)]
pub struct BucketPlan {
    topology: ShardTopology,
    buckets: Vec<Bucket>,
}

impl BucketPlan {
    pub fn prepare(
        topology: &ShardTopology,
        router: &WorkerRouter,
        gates: &[Arc<PacingGate>],
    ) -> Result<Self, ConfigError> {
        if gates.len() != topology.max_concurrency as usize {
            return Err(ConfigError::new(format!(
                "{} pacing gates supplied for max concurrency {}",
                gates.len(),
                topology.max_concurrency
            )));
        }
        let mut buckets: Vec<Bucket> = gates
            .iter()
            .zip(0..)
            .map(|(gate, id)| Bucket::new(id, gate.clone()))
            .collect();

        for shard_id in topology.shard_ids() {
            if shard_id >= topology.total_shards {
                return Err(ConfigError::new(format!(
                    "shard {shard_id} is not below the total shard count {}",
                    topology.total_shards
                )));
            }
            let bucket_id = topology.bucket_id(shard_id);
            let bucket = buckets.get_mut(bucket_id as usize).ok_or_else(|| {
                ConfigError::new(format!(
                    "shard {shard_id} mapped to bucket {bucket_id}, expected 0..{}",
                    topology.max_concurrency
                ))
            })?;
            let worker_id = router.worker_id(shard_id);
            debug!(shard_id, bucket_id, worker_id, "prepared shard bucket");
            bucket.push(worker_id, shard_id);
        }

        Ok(Self {
            topology: *topology,
            buckets,
        })
    }

    pub fn topology(&self) -> &ShardTopology {
        &self.topology
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn bucket(&self, bucket_id: u32) -> Option<&Bucket> {
        self.buckets.get(bucket_id as usize)
    }

    pub fn shard_count(&self) -> usize {
        self.buckets.iter().map(|b| b.shard_ids().count()).sum()
    }
}
