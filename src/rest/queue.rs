//! Request and response types, the transport seam, and the per-route FIFO.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::{oneshot, Notify};

use crate::error::RestError;
use crate::rest::RequestMethod;

#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    pub method: RequestMethod,
    /// Absolute URL the transport sends to.
    pub url: String,
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestResponse {
    pub status: u16,
    /// Header names are expected lower-cased.
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl RestResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Decode the body as JSON. An empty body decodes as `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.body.as_deref().unwrap_or("null"))
    }
}

/// HTTP client the request manager sends through.
#[async_trait]
pub trait RestTransport: Send + Sync {
    async fn send(&self, request: &RestRequest) -> anyhow::Result<RestResponse>;
}

pub(crate) type Responder = oneshot::Sender<Result<RestResponse, RestError>>;

#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub request: RestRequest,
    pub retry_count: u32,
    pub responder: Responder,
}

impl PendingRequest {
    pub fn resolve(self, result: Result<RestResponse, RestError>) {
        // The caller may have given up on the future.
        let _ = self.responder.send(result);
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<PendingRequest>,
    in_flight: usize,
    closed: bool,
}

/// FIFO of requests for one route, plus its in-flight count.
#[derive(Debug)]
pub(crate) struct RequestQueue {
    route: String,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl RequestQueue {
    pub fn new(route: String) -> Self {
        Self {
            route,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    /// Append a request. Hands it back if the queue has already been retired.
    pub fn push(&self, request: PendingRequest) -> Result<(), PendingRequest> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(request);
            }
            state.pending.push_back(request);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// Pop the head and count it as in flight.
    pub fn admit(&self) -> Option<PendingRequest> {
        let mut state = self.state.lock();
        let request = state.pending.pop_front()?;
        state.in_flight += 1;
        Some(request)
    }

    /// Mark one in-flight request done, putting it back at the head when it
    /// must be retried.
    pub fn complete(&self, retry: Option<PendingRequest>) {
        {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            if let Some(request) = retry {
                state.pending.push_front(request);
            }
        }
        self.notify.notify_one();
    }

    /// Retire the queue if nothing is pending or in flight.
    pub fn close_if_idle(&self) -> bool {
        let mut state = self.state.lock();
        if state.pending.is_empty() && state.in_flight == 0 {
            state.closed = true;
        }
        state.closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub async fn notified(&self) {
        self.notify.notified().await
    }
}
