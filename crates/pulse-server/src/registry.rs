//! Connection registry over the shared store.
//!
//! Each live connection has a `conn:<id>` record with an absolute TTL
//! safety net and a membership entry in the `conns` index set. Liveness is
//! heartbeat-driven: a connection that has not pinged within the heartbeat
//! window is dead regardless of its record's TTL, and the background
//! reaper removes it from the index.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pulse_core::settings::ConnectionSettings;
use pulse_core::time::now_millis;
use pulse_store::SharedStore;

use crate::errors::ServerError;

const CONNS_INDEX: &str = "conns";

fn conn_key(connection_id: &str) -> String {
    format!("conn:{connection_id}")
}

/// Stored per-connection record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    /// Connection identifier.
    pub connection_id: String,
    /// Opaque auth context captured at registration (token subject, api
    /// key id, ...). Never empty.
    pub auth_context: String,
    /// Registration time, epoch millis.
    pub connected_at: i64,
    /// Last heartbeat time, epoch millis.
    pub last_heartbeat: i64,
}

/// Registry stats for the operational surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    /// Registered connections (live or not yet reaped).
    pub registered: usize,
    /// Connections within the heartbeat window.
    pub live: usize,
}

/// Shared-store-backed connection registry.
pub struct ConnectionRegistry {
    store: Arc<dyn SharedStore>,
    settings: ConnectionSettings,
}

impl ConnectionRegistry {
    /// Build a registry over `store`.
    pub fn new(store: Arc<dyn SharedStore>, settings: ConnectionSettings) -> Self {
        Self { store, settings }
    }

    fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.settings.record_ttl_secs)
    }

    /// Register a new connection. The auth context must be non-empty.
    pub async fn register(&self, connection_id: &str, auth_context: &str) -> Result<(), ServerError> {
        if auth_context.trim().is_empty() {
            return Err(ServerError::MissingAuthContext);
        }
        let now = now_millis();
        let record = ConnectionRecord {
            connection_id: connection_id.to_owned(),
            auth_context: auth_context.to_owned(),
            connected_at: now,
            last_heartbeat: now,
        };
        self.write_record(&record).await?;
        let _ = self.store.sadd(CONNS_INDEX, connection_id).await?;
        info!(connection_id, "connection registered");
        Ok(())
    }

    /// Record a heartbeat, refreshing the record TTL.
    ///
    /// Unknown connections error so the caller can tell the client to
    /// reconnect instead of silently accepting pings into the void.
    pub async fn heartbeat(&self, connection_id: &str) -> Result<(), ServerError> {
        let Some(mut record) = self.record(connection_id).await? else {
            return Err(ServerError::UnknownConnection(connection_id.to_owned()));
        };
        record.last_heartbeat = now_millis();
        self.write_record(&record).await?;
        Ok(())
    }

    /// Remove a connection. Room membership must be cleaned up first so a
    /// routing pass never resolves a member without a record.
    pub async fn deregister(&self, connection_id: &str) -> Result<(), ServerError> {
        let _ = self.store.srem(CONNS_INDEX, connection_id).await?;
        let _ = self.store.del(&conn_key(connection_id)).await?;
        info!(connection_id, "connection deregistered");
        Ok(())
    }

    /// Whether a connection exists and heartbeated within the window.
    pub async fn is_live(&self, connection_id: &str) -> Result<bool, ServerError> {
        match self.record(connection_id).await? {
            Some(record) => Ok(self.within_window(&record)),
            None => Ok(false),
        }
    }

    /// The stored record for a connection.
    pub async fn record(
        &self,
        connection_id: &str,
    ) -> Result<Option<ConnectionRecord>, ServerError> {
        let Some(raw) = self.store.get(&conn_key(connection_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(connection_id, error = %e, "unparsable connection record, discarding");
                let _ = self.store.del(&conn_key(connection_id)).await?;
                Ok(None)
            }
        }
    }

    /// All registered connection ids.
    pub async fn connection_ids(&self) -> Result<Vec<String>, ServerError> {
        Ok(self.store.smembers(CONNS_INDEX).await?)
    }

    /// Registered ids past the heartbeat window. Read-only sweep.
    pub async fn dead_connections(&self) -> Result<Vec<String>, ServerError> {
        let mut dead = Vec::new();
        for connection_id in self.connection_ids().await? {
            let live = match self.record(&connection_id).await? {
                Some(record) => self.within_window(&record),
                // Record expired but the index entry lingered.
                None => false,
            };
            if !live {
                dead.push(connection_id);
            }
        }
        Ok(dead)
    }

    /// Sweep the index and drop connections past the heartbeat window.
    /// Returns the ids that were reaped. Callers holding room or queue
    /// state should clean it up per id first, the way the reaper task
    /// does.
    pub async fn reap(&self) -> Result<Vec<String>, ServerError> {
        let reaped = self.dead_connections().await?;
        for connection_id in &reaped {
            self.deregister(connection_id).await?;
        }
        if !reaped.is_empty() {
            info!(count = reaped.len(), "reaped dead connections");
        }
        Ok(reaped)
    }

    /// Spawn the periodic reaper. `on_reaped` runs for each dead id
    /// before its record is dropped, so room membership and offline
    /// queues are cleaned up while the registration still exists.
    pub fn spawn_reaper<F, Fut>(self: Arc<Self>, on_reaped: F) -> JoinHandle<()>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let interval = Duration::from_millis(self.settings.reaper_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                let _ = ticker.tick().await;
                match self.dead_connections().await {
                    Ok(dead) => {
                        for connection_id in dead {
                            on_reaped(connection_id.clone()).await;
                            if let Err(e) = self.deregister(&connection_id).await {
                                warn!(connection_id, error = %e, "deregister after cleanup failed");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "reaper sweep failed"),
                }
                debug!("reaper sweep complete");
            }
        })
    }

    /// Registry stats for the operational surface.
    pub async fn stats(&self) -> Result<ConnectionStats, ServerError> {
        let ids = self.connection_ids().await?;
        let mut stats = ConnectionStats {
            registered: ids.len(),
            live: 0,
        };
        for id in ids {
            if let Some(record) = self.record(&id).await?
                && self.within_window(&record)
            {
                stats.live += 1;
            }
        }
        Ok(stats)
    }

    fn within_window(&self, record: &ConnectionRecord) -> bool {
        let age = now_millis().saturating_sub(record.last_heartbeat);
        age <= self.settings.heartbeat_timeout_ms as i64
    }

    async fn write_record(&self, record: &ConnectionRecord) -> Result<(), ServerError> {
        let raw = serde_json::to_string(record).unwrap_or_default();
        self.store
            .set(&conn_key(&record.connection_id), &raw, Some(self.record_ttl()))
            .await?;
        Ok(())
    }
}
