#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use shardgate::config::{GatewayConfig, HostLimits};
use shardgate::gateway::{
    ChannelId, GuildId, IdentifyDispatcher, IdentifyInstruction, RequestMembersOptions,
    ShardConnectInfo, ShardConnection, ShardFactory, ShardId, StatusUpdate, VoiceStateOptions,
};
use shardgate::rest::{RestRequest, RestResponse, RestTransport};
use tokio::time::Instant;

/// Everything the mock shards were asked to do, in order.
#[derive(Default)]
pub struct ShardLog {
    /// Every handshake attempt, including failed ones.
    pub handshakes: Mutex<Vec<ShardId>>,
    /// Handshakes still to fail, per shard.
    pub failing_handshakes: Mutex<HashMap<ShardId, u32>>,
    pub identified: Mutex<Vec<(ShardId, Instant)>>,
    pub shutdowns: Mutex<Vec<ShardId>>,
    pub closes: Mutex<Vec<(ShardId, u16, String)>>,
    pub statuses: Mutex<Vec<(ShardId, String)>>,
    pub voice: Mutex<Vec<(ShardId, GuildId, Option<ChannelId>)>>,
    pub member_requests: Mutex<Vec<(ShardId, GuildId, Option<String>)>>,
}

impl ShardLog {
    pub fn fail_next_handshakes(&self, shard_id: ShardId, count: u32) {
        self.failing_handshakes.lock().insert(shard_id, count);
    }

    pub fn identified_ids(&self) -> Vec<ShardId> {
        self.identified.lock().iter().map(|(id, _)| *id).collect()
    }

    pub fn identified_at(&self, shard_id: ShardId) -> Option<Instant> {
        self.identified
            .lock()
            .iter()
            .find(|(id, _)| *id == shard_id)
            .map(|(_, at)| *at)
    }
}

pub struct MockShard {
    id: ShardId,
    log: Arc<ShardLog>,
}

#[async_trait]
impl ShardConnection for MockShard {
    fn id(&self) -> ShardId {
        self.id
    }

    async fn identify(&self) -> anyhow::Result<()> {
        self.log.handshakes.lock().push(self.id);
        if let Some(left) = self.log.failing_handshakes.lock().get_mut(&self.id) {
            if *left > 0 {
                *left -= 1;
                anyhow::bail!("handshake rejected");
            }
        }
        self.log.identified.lock().push((self.id, Instant::now()));
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.log.shutdowns.lock().push(self.id);
        Ok(())
    }

    async fn close(&self, code: u16, reason: &str) -> anyhow::Result<()> {
        self.log
            .closes
            .lock()
            .push((self.id, code, reason.to_string()));
        Ok(())
    }

    async fn edit_status(&self, status: &StatusUpdate) -> anyhow::Result<()> {
        self.log
            .statuses
            .lock()
            .push((self.id, status.status.clone()));
        Ok(())
    }

    async fn join_voice_channel(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        _options: &VoiceStateOptions,
    ) -> anyhow::Result<()> {
        self.log
            .voice
            .lock()
            .push((self.id, guild_id, Some(channel_id)));
        Ok(())
    }

    async fn leave_voice_channel(&self, guild_id: GuildId) -> anyhow::Result<()> {
        self.log.voice.lock().push((self.id, guild_id, None));
        Ok(())
    }

    async fn request_members(
        &self,
        guild_id: GuildId,
        options: &RequestMembersOptions,
    ) -> anyhow::Result<()> {
        self.log
            .member_requests
            .lock()
            .push((self.id, guild_id, options.nonce.clone()));
        Ok(())
    }
}

/// Builds [`MockShard`]s that all write to one log.
#[derive(Default)]
pub struct MockFactory {
    pub log: Arc<ShardLog>,
}

impl ShardFactory for MockFactory {
    fn create(&self, shard_id: ShardId, _info: &ShardConnectInfo) -> Arc<dyn ShardConnection> {
        Arc::new(MockShard {
            id: shard_id,
            log: self.log.clone(),
        })
    }
}

/// Records identify instructions instead of running them.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub instructions: Mutex<Vec<(IdentifyInstruction, Instant)>>,
}

#[async_trait]
impl IdentifyDispatcher for RecordingDispatcher {
    async fn dispatch(&self, instruction: IdentifyInstruction) -> anyhow::Result<()> {
        self.instructions.lock().push((instruction, Instant::now()));
        Ok(())
    }
}

pub fn gateway_config(total_shards: u32) -> GatewayConfig {
    GatewayConfig {
        total_shards: Some(total_shards),
        ..GatewayConfig::default()
    }
}

pub fn host(max_concurrency: u32) -> HostLimits {
    HostLimits {
        max_concurrency,
        ..HostLimits::default()
    }
}

#[derive(Debug, Clone)]
pub struct SentRequest {
    pub url: String,
    pub at: Instant,
}

type Responder = Box<dyn Fn(&RestRequest, usize) -> anyhow::Result<RestResponse> + Send + Sync>;

/// Transport that answers from a closure and records when each request
/// left the manager.
pub struct MockTransport {
    respond: Responder,
    latency: Duration,
    sent: Mutex<Vec<SentRequest>>,
}

impl MockTransport {
    pub fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&RestRequest, usize) -> anyhow::Result<RestResponse> + Send + Sync + 'static,
    {
        Self::with_latency(Duration::ZERO, respond)
    }

    pub fn with_latency<F>(latency: Duration, respond: F) -> Arc<Self>
    where
        F: Fn(&RestRequest, usize) -> anyhow::Result<RestResponse> + Send + Sync + 'static,
    {
        Arc::new(Self {
            respond: Box::new(respond),
            latency,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl RestTransport for MockTransport {
    async fn send(&self, request: &RestRequest) -> anyhow::Result<RestResponse> {
        let call = {
            let mut sent = self.sent.lock();
            sent.push(SentRequest {
                url: request.url.clone(),
                at: Instant::now(),
            });
            sent.len() - 1
        };
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        (self.respond)(request, call)
    }
}

pub fn ok_with_limit(remaining: u32, reset_after_secs: f64) -> RestResponse {
    RestResponse::new(200)
        .with_header("x-ratelimit-remaining", remaining.to_string())
        .with_header("x-ratelimit-reset-after", reset_after_secs.to_string())
}

pub fn rate_limited(retry_after_secs: f64, global: bool) -> RestResponse {
    RestResponse::new(429)
        .with_header("retry-after", retry_after_secs.to_string())
        .with_body(format!(
            r#"{{"message":"You are being rate limited.","retry_after":{retry_after_secs},"global":{global}}}"#
        ))
}
