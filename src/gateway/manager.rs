//! Gateway manager: staggered shard spawning and guild-to-shard routing.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::bucket::{pacing_gates, Bucket, BucketPlan, ShardTopology};
use super::members::PendingMembers;
use super::pacing::PacingGate;
use super::registry::ShardRegistry;
use super::shard::{
    ChannelId, GuildId, Member, MembersChunk, RequestMembersOptions, ShardConnectInfo,
    ShardConnection, ShardFactory, StatusUpdate, VoiceStateOptions,
};
use super::worker::{IdentifyDispatcher, IdentifyInstruction, LocalDispatcher, WorkerRouter};
use super::ShardId;
use crate::config::{GatewayConfig, HostLimits};
use crate::error::{ConfigError, GatewayError};

/// Shard id that owns a guild.
pub fn calculate_shard_id(guild_id: GuildId, total_shards: u32) -> ShardId {
    if total_shards <= 1 {
        return 0;
    }
    ((guild_id >> 22) % u64::from(total_shards)) as ShardId
}

/// Admission layer for one set of gateway shards.
pub struct GatewayManager {
    config: GatewayConfig,
    host: RwLock<HostLimits>,
    topology: RwLock<ShardTopology>,
    router: WorkerRouter,
    registry: Arc<ShardRegistry>,
    dispatcher: Arc<dyn IdentifyDispatcher>,
    plan: RwLock<Option<Arc<BucketPlan>>>,
    gates: RwLock<Vec<Arc<PacingGate>>>,
    members: PendingMembers,
}

impl std::fmt::Debug for GatewayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayManager")
            .field("topology", &*self.topology.read())
            .field("router", &self.router)
            .field("registry", &self.registry)
            .finish()
    }
}

impl GatewayManager {
    /// Build a manager that identifies shards in-process.
    pub fn new(
        config: GatewayConfig,
        host: HostLimits,
        factory: Arc<dyn ShardFactory>,
    ) -> Result<Self, ConfigError> {
        let topology = ShardTopology::from_config(&config, &host)?;
        let router = WorkerRouter::new(config.shards_per_worker, config.total_workers)?;
        let registry = Arc::new(ShardRegistry::new(
            factory,
            ShardConnectInfo::from_config(&config, topology.total_shards),
        ));
        let dispatcher = Arc::new(LocalDispatcher::new(registry.clone()));
        let gates = pacing_gates(topology.max_concurrency, config.spawn_shard_delay());
        info!(
            first_shard_id = topology.first_shard_id,
            last_shard_id = topology.last_shard_id,
            total_shards = topology.total_shards,
            max_concurrency = topology.max_concurrency,
            reset_window = ?host.reset_window(),
            "gateway manager created"
        );
        Ok(Self {
            config,
            host: RwLock::new(host),
            topology: RwLock::new(topology),
            router,
            registry,
            dispatcher,
            plan: RwLock::new(None),
            gates: RwLock::new(gates),
            members: PendingMembers::new(),
        })
    }

    /// Route identify instructions through a custom dispatcher.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn IdentifyDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    pub fn topology(&self) -> ShardTopology {
        *self.topology.read()
    }

    pub fn host_limits(&self) -> HostLimits {
        *self.host.read()
    }

    pub fn router(&self) -> &WorkerRouter {
        &self.router
    }

    pub fn total_shards(&self) -> u32 {
        self.topology.read().total_shards
    }

    /// Apply refreshed host limits. Buckets are rebuilt on the next spawn.
    ///
    /// Pacing gates survive the update unless the bucket count changes.
    pub fn update_host_limits(&self, host: HostLimits) -> Result<(), ConfigError> {
        let topology = ShardTopology::from_config(&self.config, &host)?;
        self.registry
            .set_connect_info(ShardConnectInfo::from_config(&self.config, topology.total_shards));
        {
            let mut gates = self.gates.write();
            if gates.len() != topology.max_concurrency as usize {
                *gates = pacing_gates(topology.max_concurrency, self.config.spawn_shard_delay());
            }
        }
        *self.host.write() = host;
        *self.topology.write() = topology;
        *self.plan.write() = None;
        info!(
            max_concurrency = topology.max_concurrency,
            total_shards = topology.total_shards,
            reset_window = ?host.reset_window(),
            "host limits updated"
        );
        Ok(())
    }

    pub fn calculate_worker_id(&self, shard_id: ShardId) -> u32 {
        self.router.worker_id(shard_id)
    }

    pub fn calculate_shard_id(&self, guild_id: GuildId) -> ShardId {
        calculate_shard_id(guild_id, self.total_shards())
    }

    /// Group the owned shards into concurrency buckets and worker queues.
    pub fn prepare_buckets(&self) -> Result<Arc<BucketPlan>, ConfigError> {
        let topology = self.topology();
        let plan = Arc::new(BucketPlan::prepare(
            &topology,
            &self.router,
            &self.gates.read(),
        )?);
        *self.plan.write() = Some(plan.clone());
        Ok(plan)
    }

    /// The plan built by the last `prepare_buckets` or `spawn_shards`.
    pub fn buckets(&self) -> Option<Arc<BucketPlan>> {
        self.plan.read().clone()
    }

    /// Identify every owned shard.
    ///
    /// Buckets run in parallel. Inside a bucket, shards go worker by worker
    /// and shard by shard, each waiting for the bucket's pacing gate.
    /// Per-shard failures are logged and do not stop the rest of the bucket.
    #[instrument(skip(self))]
    pub async fn spawn_shards(&self) -> Result<(), GatewayError> {
        let plan = self.prepare_buckets()?;
        self.registry.clear_cancelled();
        info!(
            buckets = plan.buckets().len(),
            shards = plan.shard_count(),
            "spawning shards"
        );

        let mut tasks = JoinSet::new();
        for bucket in plan.buckets().iter().cloned() {
            let dispatcher = self.dispatcher.clone();
            let registry = self.registry.clone();
            tasks.spawn(run_bucket(bucket, dispatcher, registry));
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "bucket task aborted");
            }
        }
        Ok(())
    }

    /// Hand one identify to the worker that owns the shard.
    pub async fn tell_worker_to_identify(
        &self,
        worker_id: u32,
        shard_id: ShardId,
        bucket_id: u32,
    ) -> Result<(), GatewayError> {
        dispatch_identify(
            self.dispatcher.as_ref(),
            IdentifyInstruction {
                worker_id,
                shard_id,
                bucket_id,
            },
        )
        .await
    }

    /// Hook for asking a parent coordinator for identify permission.
    /// Standalone managers need no permission.
    pub async fn request_identify(&self) {
        debug!("requesting identify");
    }

    pub async fn identify(
        &self,
        shard_id: ShardId,
    ) -> Result<Arc<dyn ShardConnection>, GatewayError> {
        self.registry.identify(shard_id).await
    }

    pub async fn kill(&self, shard_id: ShardId) -> Result<(), GatewayError> {
        self.registry.kill(shard_id).await
    }

    /// Close every shard and wait for the configured grace period.
    pub async fn shutdown(&self, code: u16, reason: &str) {
        self.registry
            .shutdown(code, reason, self.config.shutdown_grace())
            .await;
    }

    fn owning_shard(&self, guild_id: GuildId) -> Result<Arc<dyn ShardConnection>, GatewayError> {
        let shard_id = self.calculate_shard_id(guild_id);
        self.registry.get(shard_id)
    }

    pub async fn join_voice_channel(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        options: VoiceStateOptions,
    ) -> Result<(), GatewayError> {
        let shard = self.owning_shard(guild_id)?;
        debug!(guild_id, channel_id, shard_id = shard.id(), "joining voice channel");
        shard
            .join_voice_channel(guild_id, channel_id, &options)
            .await
            .map_err(|source| connection_error(shard.id(), source))
    }

    pub async fn leave_voice_channel(&self, guild_id: GuildId) -> Result<(), GatewayError> {
        let shard = self.owning_shard(guild_id)?;
        debug!(guild_id, shard_id = shard.id(), "leaving voice channel");
        shard
            .leave_voice_channel(guild_id)
            .await
            .map_err(|source| connection_error(shard.id(), source))
    }

    pub async fn edit_shard_status(
        &self,
        shard_id: ShardId,
        status: &StatusUpdate,
    ) -> Result<(), GatewayError> {
        let shard = self.registry.get(shard_id)?;
        debug!(shard_id, status = %status.status, "editing shard status");
        shard
            .edit_status(status)
            .await
            .map_err(|source| connection_error(shard_id, source))
    }

    /// Edit the status on every registered shard.
    ///
    /// All shards are attempted; the first failure is returned.
    pub async fn edit_bot_status(&self, status: &StatusUpdate) -> Result<(), GatewayError> {
        let mut first_error = None;
        for shard_id in self.registry.shard_ids() {
            if let Err(err) = self.edit_shard_status(shard_id, status).await {
                warn!(shard_id, error = %err, "status edit failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Fetch a guild's member list over its owning shard.
    pub async fn request_members(
        &self,
        guild_id: GuildId,
        mut options: RequestMembersOptions,
    ) -> Result<Vec<Member>, GatewayError> {
        let shard = self.owning_shard(guild_id)?;
        let nonce = options
            .nonce
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        options.nonce = Some(nonce.clone());

        let receiver = self.members.register(&nonce);
        debug!(guild_id, shard_id = shard.id(), %nonce, "requesting members");
        if let Err(source) = shard.request_members(guild_id, &options).await {
            receiver.cancel();
            return Err(connection_error(shard.id(), source));
        }
        Ok(receiver
            .wait(self.config.request_members_timeout())
            .await)
    }

    /// Feed a member chunk from the connection layer.
    pub fn handle_members_chunk(&self, chunk: MembersChunk) -> bool {
        self.members.handle_chunk(chunk)
    }

    pub fn pending_member_requests(&self) -> usize {
        self.members.len()
    }
}

fn connection_error(shard_id: ShardId, source: anyhow::Error) -> GatewayError {
    GatewayError::Connection { shard_id, source }
}

async fn dispatch_identify(
    dispatcher: &dyn IdentifyDispatcher,
    instruction: IdentifyInstruction,
) -> Result<(), GatewayError> {
    debug!(
        worker_id = instruction.worker_id,
        shard_id = instruction.shard_id,
        bucket_id = instruction.bucket_id,
        "telling worker to identify"
    );
    dispatcher
        .dispatch(instruction)
        .await
        .map_err(|source| GatewayError::Dispatch {
            worker_id: instruction.worker_id,
            shard_id: instruction.shard_id,
            source,
        })
}

async fn run_bucket(
    bucket: Bucket,
    dispatcher: Arc<dyn IdentifyDispatcher>,
    registry: Arc<ShardRegistry>,
) {
    for worker in &bucket.workers {
        for &shard_id in &worker.shard_ids {
            if registry.is_cancelled(shard_id) {
                debug!(shard_id, bucket_id = bucket.id, "skipping killed shard");
                continue;
            }
            bucket.gate.acquire().await;
            // The shard may have been killed while we waited for the gate.
            if registry.is_cancelled(shard_id) {
                debug!(shard_id, bucket_id = bucket.id, "skipping killed shard");
                continue;
            }
            let instruction = IdentifyInstruction {
                worker_id: worker.worker_id,
                shard_id,
                bucket_id: bucket.id,
            };
            if let Err(err) = dispatch_identify(dispatcher.as_ref(), instruction).await {
                warn!(shard_id, bucket_id = bucket.id, error = %err, "shard identify failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_shard_always_zero() {
        assert_eq!(calculate_shard_id(81_384_788_765_712_384, 1), 0);
        assert_eq!(calculate_shard_id(0, 0), 0);
    }

    #[test]
    fn test_shard_id_uses_timestamp_bits() {
        let guild_id: u64 = 41_771_983_423_143_937;
        let expected = ((guild_id >> 22) % 16) as u32;
        assert_eq!(calculate_shard_id(guild_id, 16), expected);
        assert_eq!(calculate_shard_id(5 << 22, 4), 1);
        assert_eq!(calculate_shard_id((1 << 22) - 1, 4), 0);
    }
}
