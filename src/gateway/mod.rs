//! Gateway-side admission: which shard may start its handshake, and when.

pub mod bucket;
pub mod manager;
pub mod members;
pub mod pacing;
pub mod registry;
pub mod shard;
pub mod worker;

/// Index of one streaming connection, `0 <= id < total_shards`.
pub type ShardId = u32;

pub use bucket::{calculate_total_shards, pacing_gates, Bucket, BucketPlan, ShardTopology, WorkerQueue};
pub use manager::{calculate_shard_id, GatewayManager};
pub use members::PendingMembers;
pub use pacing::PacingGate;
pub use registry::ShardRegistry;
pub use shard::{
    ChannelId, GuildId, Member, MembersChunk, RequestMembersOptions, ShardConnectInfo,
    ShardConnection, ShardFactory, StatusUpdate, VoiceStateOptions,
};
pub use worker::{IdentifyDispatcher, IdentifyInstruction, LocalDispatcher, WorkerRouter};
