//! Interfaces to the per-shard connection state machine.
//!
//! The handshake, heartbeat and resume logic of a single connection live
//! outside this crate. The gateway manager only needs the handle below.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ShardId;
use crate::config::{GatewayConfig, IdentifyProperties};

pub type GuildId = u64;
pub type ChannelId = u64;

/// A guild member as delivered by the connection layer.
pub type Member = Value;

/// Everything a new connection needs to identify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardConnectInfo {
    pub url: String,
    pub version: u8,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub intents: u64,
    pub compress: bool,
    pub total_shards: u32,
    pub properties: IdentifyProperties,
}

impl ShardConnectInfo {
    pub fn from_config(config: &GatewayConfig, total_shards: u32) -> Self {
        Self {
            url: config.url.clone(),
            version: config.version,
            token: config.token.clone(),
            intents: config.intents,
            compress: config.compress,
            total_shards,
            properties: config.properties.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: String,
    #[serde(default)]
    pub activities: Vec<Value>,
    #[serde(default)]
    pub afk: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateOptions {
    pub self_mute: bool,
    pub self_deaf: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMembersOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub presences: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_ids: Vec<u64>,
    /// Filled in by the gateway manager before the command is sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// One chunk of a member list answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembersChunk {
    pub guild_id: GuildId,
    pub nonce: Option<String>,
    pub chunk_index: u32,
    pub chunk_count: u32,
    pub members: Vec<Member>,
}

impl MembersChunk {
    pub fn is_last(&self) -> bool {
        self.chunk_index.saturating_add(1) >= self.chunk_count
    }
}

/// Handle to one live streaming connection.
#[async_trait]
pub trait ShardConnection: Send + Sync {
    fn id(&self) -> ShardId;

    /// Begin or resume the handshake. Internal retries are the handle's concern.
    async fn identify(&self) -> anyhow::Result<()>;

    /// Orderly shutdown; the handle will not reconnect.
    async fn shutdown(&self) -> anyhow::Result<()>;

    async fn close(&self, code: u16, reason: &str) -> anyhow::Result<()>;

    async fn edit_status(&self, status: &StatusUpdate) -> anyhow::Result<()>;

    async fn join_voice_channel(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        options: &VoiceStateOptions,
    ) -> anyhow::Result<()>;

    async fn leave_voice_channel(&self, guild_id: GuildId) -> anyhow::Result<()>;

    /// Send a member list request. Answers arrive as [`MembersChunk`]s
    /// through `GatewayManager::handle_members_chunk`.
    async fn request_members(
        &self,
        guild_id: GuildId,
        options: &RequestMembersOptions,
    ) -> anyhow::Result<()>;
}

/// Builds connection handles for the registry.
pub trait ShardFactory: Send + Sync {
    fn create(&self, shard_id: ShardId, info: &ShardConnectInfo) -> Arc<dyn ShardConnection>;
}

impl<F> ShardFactory for F
where
    F: Fn(ShardId, &ShardConnectInfo) -> Arc<dyn ShardConnection> + Send + Sync,
{
    fn create(&self, shard_id: ShardId, info: &ShardConnectInfo) -> Arc<dyn ShardConnection> {
        self(shard_id, info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(chunk_index: u32, chunk_count: u32) -> MembersChunk {
        MembersChunk {
            guild_id: 1,
            nonce: None,
            chunk_index,
            chunk_count,
            members: Vec::new(),
        }
    }

    #[test]
    fn test_last_chunk_detection() {
        assert!(!chunk(0, 2).is_last());
        assert!(chunk(1, 2).is_last());
        assert!(chunk(3, 2).is_last());
        assert!(chunk(0, 0).is_last());
    }

    #[test]
    fn test_max_chunk_index_does_not_overflow() {
        assert!(chunk(u32::MAX, u32::MAX).is_last());
        assert!(chunk(u32::MAX - 1, u32::MAX).is_last());
        assert!(!chunk(u32::MAX - 2, u32::MAX).is_last());
    }
}
