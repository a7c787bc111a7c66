//! Registry of live shard connections, keyed by shard id.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use super::shard::{ShardConnectInfo, ShardConnection, ShardFactory};
use super::ShardId;
use crate::error::GatewayError;

/// Owns exactly one connection handle per registered shard id.
pub struct ShardRegistry {
    shards: RwLock<HashMap<ShardId, Arc<dyn ShardConnection>>>,
    cancelled: Mutex<HashSet<ShardId>>,
    factory: Arc<dyn ShardFactory>,
    connect_info: RwLock<ShardConnectInfo>,
}

impl std::fmt::Debug for ShardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRegistry")
            .field("shards", &self.shard_ids())
            .field("factory", &"<dyn ShardFactory>")
            .finish()
    }
}

impl ShardRegistry {
    pub fn new(factory: Arc<dyn ShardFactory>, connect_info: ShardConnectInfo) -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            cancelled: Mutex::new(HashSet::new()),
            factory,
            connect_info: RwLock::new(connect_info),
        }
    }

    /// Register the shard if needed and run its handshake.
    ///
    /// A shard that is already registered keeps its handle and is not
    /// identified a second time. A failed handshake unregisters the handle
    /// so the next identify builds a fresh one.
    #[instrument(skip(self), level = "debug")]
    pub async fn identify(
        &self,
        shard_id: ShardId,
    ) -> Result<Arc<dyn ShardConnection>, GatewayError> {
        let shard = {
            let mut shards = self.shards.write();
            if let Some(existing) = shards.get(&shard_id) {
                debug!(shard_id, "identify requested for existing shard");
                return Ok(existing.clone());
            }
            let shard = self.factory.create(shard_id, &self.connect_info.read());
            shards.insert(shard_id, shard.clone());
            shard
        };
        self.cancelled.lock().remove(&shard_id);

        debug!(shard_id, "identifying new shard");
        if let Err(source) = shard.identify().await {
            warn!(shard_id, error = %source, "shard identify failed");
            let mut shards = self.shards.write();
            if shards
                .get(&shard_id)
                .is_some_and(|current| Arc::ptr_eq(current, &shard))
            {
                shards.remove(&shard_id);
            }
            return Err(GatewayError::Connection { shard_id, source });
        }
        Ok(shard)
    }

    /// Remove the shard and shut its connection down.
    ///
    /// Unknown shard ids are ignored. Pending spawn admissions for the id
    /// are cancelled either way.
    pub async fn kill(&self, shard_id: ShardId) -> Result<(), GatewayError> {
        self.cancelled.lock().insert(shard_id);
        let Some(shard) = self.shards.write().remove(&shard_id) else {
            debug!(shard_id, "kill requested for unknown shard");
            return Ok(());
        };

        debug!(shard_id, "killing shard");
        shard
            .shutdown()
            .await
            .map_err(|source| GatewayError::Connection { shard_id, source })
    }

    /// Ask every shard to close, then wait out the grace period.
    ///
    /// Returns after `grace` whether or not every shard confirmed.
    pub async fn shutdown(&self, code: u16, reason: &str, grace: Duration) {
        let shards = self.handles();
        info!(count = shards.len(), code, reason, "closing all shards");
        for shard in shards {
            let reason = reason.to_string();
            tokio::spawn(async move {
                if let Err(err) = shard.close(code, &reason).await {
                    warn!(shard_id = shard.id(), error = %err, "shard close failed");
                }
            });
        }
        tokio::time::sleep(grace).await;
    }

    pub fn get(&self, shard_id: ShardId) -> Result<Arc<dyn ShardConnection>, GatewayError> {
        self.shards
            .read()
            .get(&shard_id)
            .cloned()
            .ok_or(GatewayError::ShardNotFound(shard_id))
    }

    pub fn contains(&self, shard_id: ShardId) -> bool {
        self.shards.read().contains_key(&shard_id)
    }

    pub fn len(&self) -> usize {
        self.shards.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.read().is_empty()
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.shards.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn handles(&self) -> Vec<Arc<dyn ShardConnection>> {
        self.shards.read().values().cloned().collect()
    }

    pub(crate) fn is_cancelled(&self, shard_id: ShardId) -> bool {
        self.cancelled.lock().contains(&shard_id)
    }

    pub(crate) fn clear_cancelled(&self) {
        self.cancelled.lock().clear();
    }

    pub(crate) fn set_connect_info(&self, info: ShardConnectInfo) {
        *self.connect_info.write() = info;
    }
}
