//! Default constants for shardgate configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Gateway Defaults
// =============================================================================

/// Default gateway URL handed to new shard connections
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";

/// Default gateway API version
pub const DEFAULT_GATEWAY_VERSION: u8 = 10;

/// Default number of shards when the host gives no hint
pub const DEFAULT_TOTAL_SHARDS: u32 = 1;

/// Shard totals below this are used as-is instead of being rounded up
/// to a multiple of the concurrency value.
pub const SMALL_BOT_SHARD_THRESHOLD: u32 = 100;

/// Rounding multiple used when the host allows a concurrency of one.
pub const SINGLE_CONCURRENCY_SHARD_MULTIPLE: u32 = 16;

/// Default number of shards grouped onto one worker
pub const DEFAULT_SHARDS_PER_WORKER: u32 = 25;

/// Default number of workers
pub const DEFAULT_TOTAL_WORKERS: u32 = 4;

/// Delay between two identifies in the same concurrency bucket (ms).
/// The host allows one identify per five seconds per bucket; the extra
/// 300ms absorbs clock skew and network jitter.
pub const DEFAULT_SPAWN_SHARD_DELAY_MS: u64 = 5_300;

/// Grace period after broadcasting close on shutdown (ms)
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

/// How long a member request waits for its final chunk (ms)
pub const DEFAULT_REQUEST_MEMBERS_TIMEOUT_MS: u64 = 30_000;

// =============================================================================
// Host Limit Defaults
// =============================================================================

/// Identifies the host allows to start at the same time
pub const DEFAULT_MAX_CONCURRENCY: u32 = 1;

/// Length of the session-start window (ms), one day
pub const DEFAULT_RESET_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

// =============================================================================
// REST Defaults
// =============================================================================

/// Default base URL for REST requests (no trailing slash)
pub const DEFAULT_REST_BASE_URL: &str = "https://discord.com/api";

/// Default REST API version
pub const DEFAULT_REST_VERSION: u8 = 10;

/// Idle time before an empty request queue is dropped (ms)
pub const DEFAULT_DELETE_QUEUE_DELAY_MS: u64 = 60_000;

/// Invalid responses tolerated per window before admission halts.
/// The host bans credentials at 10,000 invalid requests per 10 minutes.
pub const DEFAULT_INVALID_REQUEST_MAX: u32 = 10_000;

/// Length of the invalid-request window (ms)
pub const DEFAULT_INVALID_REQUEST_INTERVAL_MS: u64 = 10 * 60 * 1000;

/// Requests held back below the invalid-request ceiling
pub const DEFAULT_INVALID_REQUEST_SAFETY_MARGIN: u32 = 1;

/// Fallback wait when a 429 carries no usable retry hint (ms)
pub const DEFAULT_RETRY_AFTER_MS: u64 = 1_000;
