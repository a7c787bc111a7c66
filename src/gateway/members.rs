//! Pending member list requests awaiting their chunked answers.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::shard::{Member, MembersChunk};

struct PendingMemberRequest {
    resolve: oneshot::Sender<Vec<Member>>,
    members: Vec<Member>,
}

/// Tracks member requests by nonce until their last chunk arrives.
#[derive(Default)]
pub struct PendingMembers {
    pending: Mutex<HashMap<String, PendingMemberRequest>>,
}

impl PendingMembers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, nonce: &str) -> MembersReceiver<'_> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            nonce.to_string(),
            PendingMemberRequest {
                resolve: tx,
                members: Vec::new(),
            },
        );
        MembersReceiver {
            owner: self,
            nonce: nonce.to_string(),
            rx,
        }
    }

    /// Append a chunk to its request. Returns false for unknown nonces.
    pub fn handle_chunk(&self, chunk: MembersChunk) -> bool {
        let Some(nonce) = chunk.nonce.as_deref() else {
            return false;
        };
        let mut pending = self.pending.lock();
        let Some(request) = pending.get_mut(nonce) else {
            return false;
        };
        let is_last = chunk.is_last();
        request.members.extend(chunk.members);
        debug!(
            nonce,
            chunk_index = chunk.chunk_index,
            chunk_count = chunk.chunk_count,
            "received members chunk"
        );

        if is_last {
            if let Some(request) = pending.remove(nonce) {
                let _ = request.resolve.send(request.members);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    fn take_partial(&self, nonce: &str) -> Option<Vec<Member>> {
        self.pending.lock().remove(nonce).map(|request| request.members)
    }

    fn discard(&self, nonce: &str) {
        self.pending.lock().remove(nonce);
    }
}

/// Awaits one registered member request.
pub struct MembersReceiver<'a> {
    owner: &'a PendingMembers,
    nonce: String,
    rx: oneshot::Receiver<Vec<Member>>,
}

impl MembersReceiver<'_> {
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Resolve with the full list, or with whatever arrived before `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Vec<Member> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(members)) => members,
            Ok(Err(_)) => self.owner.take_partial(&self.nonce).unwrap_or_default(),
            Err(_) => match self.owner.take_partial(&self.nonce) {
                Some(members) => {
                    warn!(
                        nonce = %self.nonce,
                        received = members.len(),
                        "member request timed out, returning partial result"
                    );
                    members
                }
                // The last chunk won the race with the timer.
                None => self.rx.try_recv().unwrap_or_default(),
            },
        }
    }

    /// Drop the request without waiting, e.g. when sending it failed.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for MembersReceiver<'_> {
    fn drop(&mut self) {
        self.owner.discard(&self.nonce);
    }
}
