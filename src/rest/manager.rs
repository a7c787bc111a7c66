//! Per-route request queues gated by learned rate limits.
//!
//! Every route key gets its own FIFO and a long-lived task that admits the
//! head of the queue when the global limit, the invalid-request breaker and
//! the route's bucket all allow it. A limited queue sleeps until its own
//! reset deadline; nothing polls.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, instrument, warn};

use crate::config::RestConfig;
use crate::error::RestError;
use crate::rest::invalid::InvalidRequestBreaker;
use crate::rest::queue::{PendingRequest, RequestQueue, RestRequest, RestResponse, RestTransport};
use crate::rest::ratelimit::{RateLimitHeaders, RateLimitTracker, StatusCategory};
use crate::rest::route::{route_key, RequestMethod};

#[derive(Debug)]
struct Limits {
    tracker: RateLimitTracker,
    breaker: InvalidRequestBreaker,
}

struct Inner {
    config: RestConfig,
    api_root: String,
    transport: Arc<dyn RestTransport>,
    limits: Mutex<Limits>,
    queues: DashMap<String, Arc<RequestQueue>>,
}

enum Admission {
    Admit(PendingRequest),
    Wait(Duration),
    AwaitResponse,
    Idle,
}

/// Request manager for the request/response transport.
///
/// Cheap to clone; clones share queues and limit state.
#[derive(Clone)]
pub struct RestManager {
    inner: Arc<Inner>,
}

impl RestManager {
    pub fn new(config: RestConfig, transport: Arc<dyn RestTransport>) -> Self {
        let breaker = InvalidRequestBreaker::new(
            config.invalid_request_max,
            config.invalid_request_interval(),
            config.invalid_request_safety_margin,
        );
        Self {
            inner: Arc::new(Inner {
                api_root: config.api_root(),
                config,
                transport,
                limits: Mutex::new(Limits {
                    tracker: RateLimitTracker::new(),
                    breaker,
                }),
                queues: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &RestConfig {
        &self.inner.config
    }

    /// Queue a request and wait for its terminal outcome.
    ///
    /// Rate-limit rejections are retried internally; the caller only sees
    /// success, a non-429 error status, a transport failure, or exhausted
    /// retries.
    #[instrument(skip(self, body), fields(route = tracing::field::Empty))]
    pub async fn make_request(
        &self,
        method: RequestMethod,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<RestResponse, RestError> {
        let route = route_key(method, url);
        tracing::Span::current().record("route", route.as_str());

        let (tx, rx) = oneshot::channel();
        let mut pending = PendingRequest {
            request: RestRequest {
                method,
                url: self.absolute_url(url),
                body,
            },
            retry_count: 0,
            responder: tx,
        };

        // A queue retired between lookup and push hands the request back.
        loop {
            let queue = self.queue_for(&route);
            match queue.push(pending) {
                Ok(()) => break,
                Err(returned) => pending = returned,
            }
        }

        rx.await.unwrap_or(Err(RestError::Dropped))
    }

    pub async fn get(&self, url: &str) -> Result<RestResponse, RestError> {
        self.make_request(RequestMethod::Get, url, None).await
    }

    pub async fn post(
        &self,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<RestResponse, RestError> {
        self.make_request(RequestMethod::Post, url, body).await
    }

    pub async fn put(
        &self,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<RestResponse, RestError> {
        self.make_request(RequestMethod::Put, url, body).await
    }

    pub async fn patch(
        &self,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<RestResponse, RestError> {
        self.make_request(RequestMethod::Patch, url, body).await
    }

    pub async fn delete(&self, url: &str) -> Result<RestResponse, RestError> {
        self.make_request(RequestMethod::Delete, url, None).await
    }

    /// Requests waiting in the queue for `route` (a key from [`route_key`]).
    pub fn queue_len(&self, route: &str) -> usize {
        self.inner.queues.get(route).map_or(0, |q| q.len())
    }

    pub fn in_flight(&self, route: &str) -> usize {
        self.inner.queues.get(route).map_or(0, |q| q.in_flight())
    }

    /// Number of live route queues.
    pub fn queue_count(&self) -> usize {
        self.inner.queues.len()
    }

    /// Shared bucket the host assigned to `route`, once learned.
    pub fn bucket_id(&self, route: &str) -> Option<String> {
        self.inner
            .limits
            .lock()
            .tracker
            .bucket_id(route)
            .map(str::to_string)
    }

    /// Routes still mapped onto a shared bucket. Retired routes drop out.
    pub fn shared_bucket_routes(&self) -> usize {
        self.inner.limits.lock().tracker.alias_count()
    }

    pub fn is_globally_limited(&self) -> bool {
        self.inner
            .limits
            .lock()
            .tracker
            .is_globally_limited(Instant::now())
    }

    pub fn invalid_request_count(&self) -> u32 {
        self.inner.limits.lock().breaker.count()
    }

    fn absolute_url(&self, url: &str) -> String {
        if url.contains("://") {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{}", self.inner.api_root, url)
        } else {
            format!("{}/{}", self.inner.api_root, url)
        }
    }

    fn queue_for(&self, route: &str) -> Arc<RequestQueue> {
        if let Some(queue) = self.inner.queues.get(route) {
            return queue.clone();
        }
        self.inner
            .queues
            .entry(route.to_string())
            .or_insert_with(|| {
                let queue = Arc::new(RequestQueue::new(route.to_string()));
                debug!(route, "request queue created");
                tokio::spawn(run_queue(self.inner.clone(), queue.clone()));
                queue
            })
            .clone()
    }
}

impl std::fmt::Debug for RestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestManager")
            .field("api_root", &self.inner.api_root)
            .field("queues", &self.inner.queues.len())
            .finish()
    }
}

impl Inner {
    fn next_admission(&self, queue: &RequestQueue) -> Admission {
        let now = Instant::now();
        let route = queue.route();
        let mut limits = self.limits.lock();

        if !queue.has_pending() {
            return if queue.in_flight() > 0 {
                Admission::AwaitResponse
            } else {
                Admission::Idle
            };
        }
        if let Some(wait) = limits.breaker.wait_time(now) {
            return Admission::Wait(wait);
        }
        if let Some(wait) = limits.tracker.wait_time(route, now) {
            return Admission::Wait(wait);
        }
        // Until the first response teaches the limit, send one at a time.
        if !limits.tracker.is_known(route, now) && queue.in_flight() > 0 {
            return Admission::AwaitResponse;
        }

        match queue.admit() {
            Some(request) => {
                limits.tracker.consume(route, now);
                Admission::Admit(request)
            }
            None => Admission::Idle,
        }
    }

    /// Drop the queue from the map if it stayed idle.
    fn retire(&self, queue: &Arc<RequestQueue>) -> bool {
        let removed = self
            .queues
            .remove_if(queue.route(), |_, current| {
                Arc::ptr_eq(current, queue) && current.close_if_idle()
            })
            .is_some();
        if removed {
            let now = Instant::now();
            let mut limits = self.limits.lock();
            limits.tracker.forget(queue.route(), now);
            limits.tracker.prune(now);
            drop(limits);
            debug!(route = queue.route(), "idle request queue removed");
        }
        removed
    }
}

async fn run_queue(inner: Arc<Inner>, queue: Arc<RequestQueue>) {
    loop {
        match inner.next_admission(&queue) {
            Admission::Admit(request) => {
                tokio::spawn(dispatch(inner.clone(), queue.clone(), request));
            }
            Admission::Wait(wait) => {
                debug!(
                    route = queue.route(),
                    wait_ms = wait.as_millis() as u64,
                    "route waiting for rate limit reset"
                );
                sleep(wait).await;
            }
            Admission::AwaitResponse => queue.notified().await,
            Admission::Idle => {
                let delay = inner.config.delete_queue_delay();
                if timeout(delay, queue.notified()).await.is_err() && inner.retire(&queue) {
                    return;
                }
            }
        }
    }
}

/// Releases one in-flight slot when dropped, requeueing `retry` at the head.
///
/// Runs on every exit from `dispatch`, unwinding included.
struct InFlight {
    queue: Arc<RequestQueue>,
    retry: Option<PendingRequest>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.queue.complete(self.retry.take());
    }
}

async fn dispatch(inner: Arc<Inner>, queue: Arc<RequestQueue>, mut pending: PendingRequest) {
    let mut in_flight = InFlight {
        queue: queue.clone(),
        retry: None,
    };
    let method = pending.request.method;
    let result = inner.transport.send(&pending.request).await;
    let now = Instant::now();

    let response = match result {
        Ok(response) => response,
        Err(source) => {
            warn!(route = queue.route(), error = %source, "transport failure");
            let url = pending.request.url.clone();
            pending.resolve(Err(RestError::Transport { method, url, source }));
            return;
        }
    };

    let headers = RateLimitHeaders::parse(&response.headers, response.body.as_deref());
    {
        let mut limits = inner.limits.lock();
        limits
            .breaker
            .record(response.status, headers.is_shared_scope(), now);
        limits.tracker.observe(
            queue.route(),
            response.status,
            &headers,
            now,
            inner.config.default_retry_after(),
        );
    }

    match StatusCategory::from_status(response.status) {
        StatusCategory::Success => pending.resolve(Ok(response)),
        StatusCategory::RateLimited => {
            let exhausted = inner
                .config
                .max_retry_count
                .is_some_and(|max| pending.retry_count >= max);
            if exhausted {
                warn!(
                    route = queue.route(),
                    retry_count = pending.retry_count,
                    "rate limit retries exhausted"
                );
                let error = RestError::RetriesExhausted {
                    method,
                    url: pending.request.url.clone(),
                    retries: pending.retry_count,
                };
                pending.resolve(Err(error));
            } else {
                pending.retry_count += 1;
                debug!(
                    route = queue.route(),
                    retry_count = pending.retry_count,
                    "rate limited, requeued at head"
                );
                in_flight.retry = Some(pending);
            }
        }
        StatusCategory::ClientError | StatusCategory::ServerError => {
            let error = RestError::Http {
                method,
                url: pending.request.url.clone(),
                status: response.status,
                body: response.body,
            };
            pending.resolve(Err(error));
        }
    }
}
