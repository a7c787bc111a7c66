//! Request/response side: per-route FIFO queues paced by limits the host
//! reports in its responses.

pub mod invalid;
pub mod manager;
pub mod queue;
pub mod ratelimit;
pub mod route;

pub use invalid::InvalidRequestBreaker;
pub use manager::RestManager;
pub use queue::{RestRequest, RestResponse, RestTransport};
pub use ratelimit::{BucketState, Observation, RateLimitHeaders, RateLimitTracker, StatusCategory};
pub use route::{route_key, simplify_url, RequestMethod};
