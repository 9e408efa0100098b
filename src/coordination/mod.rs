// =============================================================================
// Coordination Store — cross-process state, locks, and the control channel
// =============================================================================
//
// All state shared between the supervisor and its workers travels through
// this abstraction; nothing crosses process boundaries via shared memory.
// The production backend is Redis; an in-memory backend with virtual TTLs
// backs tests and local development.
//
// Locks use the canonical SET NX PX shape with a UUID holder value and
// check-and-set refresh/release, so a process that lost its lock can never
// refresh or release someone else's.
// =============================================================================

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default timeout wrapped around every store round-trip.
pub const STORE_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors surfaced by the coordination layer. Callers branch on the kind:
/// transient backend trouble is retried or degraded around, codec errors are
/// bugs in stored payloads.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("store operation timed out")]
    Timeout,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The verbs the engine needs from its coordination backend.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// SET with optional TTL; `only_if_absent` maps to NX. Returns whether
    /// the value was written.
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        only_if_absent: bool,
    ) -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn del(&self, key: &str) -> StoreResult<()>;
    async fn exists(&self, key: &str) -> StoreResult<bool>;
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Check-and-set TTL refresh: extends `key` iff it still holds
    /// `expected`. Returns whether the refresh applied.
    async fn refresh(&self, key: &str, expected: &str, ttl: Duration) -> StoreResult<bool>;

    /// Check-and-set delete: removes `key` iff it still holds `expected`.
    /// Returns whether the key was removed.
    async fn release(&self, key: &str, expected: &str) -> StoreResult<bool>;

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()>;
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;
    async fn srem(&self, key: &str, member: &str) -> StoreResult<()>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;
    async fn hgetall(&self, key: &str) -> StoreResult<Vec<(String, String)>>;
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<()>;

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()>;

    /// Subscribe on an independent connection. The returned receiver yields
    /// raw message payloads; delivery is at-most-once and subscribers must
    /// tolerate duplicates and garbage.
    async fn subscribe(&self, channel: &str) -> StoreResult<tokio::sync::mpsc::Receiver<String>>;
}

/// Shared handle alias used throughout the engine.
pub type Store = Arc<dyn CoordinationStore>;

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

/// Read a key and decode it as JSON.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn CoordinationStore,
    key: &str,
) -> StoreResult<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode a value as JSON and write it, with an optional TTL.
pub async fn set_json<T: Serialize>(
    store: &dyn CoordinationStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> StoreResult<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw, ttl, false).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Key schema
// ---------------------------------------------------------------------------

/// Every coordination key the engine touches, in one place.
pub mod keys {
    pub const SUPERVISOR_LOCK: &str = "supervisor:lock";
    pub const WORKERS_SET: &str = "workers";
    /// Hash of pair id -> JSON `PairConfig`, owned by the supervisor.
    pub const PAIR_CONFIGS: &str = "pair_configs";
    pub const CONTROL_CHANNEL: &str = "control";

    pub fn worker_lock(pair_id: &str) -> String {
        format!("worker:{pair_id}:lock")
    }

    pub fn worker_heartbeat(pair_id: &str) -> String {
        format!("worker:{pair_id}:heartbeat")
    }

    pub fn worker_state(pair_id: &str) -> String {
        format!("worker:{pair_id}:state")
    }

    pub fn worker_restarting(pair_id: &str) -> String {
        format!("worker:{pair_id}:restarting")
    }

    pub fn pair_positions(pair_id: &str) -> String {
        format!("pair:{pair_id}:positions")
    }

    pub fn pair_optimizer(pair_id: &str) -> String {
        format!("pair:{pair_id}:optimizer")
    }

    pub fn pair_epoch(pair_id: &str) -> String {
        format!("pair:{pair_id}:epoch")
    }

    pub fn pair_regime_suppress(pair_id: &str) -> String {
        format!("pair:{pair_id}:regime_suppress")
    }

    pub fn pair_candle_cursor(pair_id: &str) -> String {
        format!("pair:{pair_id}:candle_cursor")
    }

    /// All per-pair keys a departing worker leaves behind, for cleanup.
    pub fn pair_scoped(pair_id: &str) -> Vec<String> {
        vec![
            worker_lock(pair_id),
            worker_heartbeat(pair_id),
            worker_state(pair_id),
            worker_restarting(pair_id),
            pair_positions(pair_id),
            pair_optimizer(pair_id),
            pair_epoch(pair_id),
            pair_regime_suppress(pair_id),
            pair_candle_cursor(pair_id),
        ]
    }
}

// ---------------------------------------------------------------------------
// Control channel
// ---------------------------------------------------------------------------

/// Messages on the `control` channel. Receivers treat delivery as
/// at-most-once and idempotent; anything unparseable is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "SHUTDOWN")]
    Shutdown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pair_id: Option<String>,
    },
    #[serde(rename = "RESTART")]
    Restart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pair_id: Option<String>,
    },
    #[serde(rename = "CONFIG_CHANGED")]
    ConfigChanged,
}

impl ControlMessage {
    /// Parse a raw channel payload; malformed messages become `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    /// True when the message targets this pair (untargeted messages target
    /// everyone).
    pub fn targets(&self, pair_id: &str) -> bool {
        match self {
            Self::Shutdown { pair_id: t } | Self::Restart { pair_id: t } => {
                t.as_deref().map_or(true, |t| t == pair_id)
            }
            Self::ConfigChanged => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Distributed lock
// ---------------------------------------------------------------------------

/// A named lock held with a UUID holder value and refreshed under
/// check-and-set, so refresh and release only ever act on our own hold.
pub struct DistributedLock {
    store: Store,
    key: String,
    holder: String,
    ttl: Duration,
}

impl DistributedLock {
    pub fn new(store: Store, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            holder: Uuid::new_v4().to_string(),
            ttl,
        }
    }

    /// Try to take the lock. Fails when someone else holds it.
    pub async fn acquire(&self) -> StoreResult<bool> {
        self.store
            .set(&self.key, &self.holder, Some(self.ttl), true)
            .await
    }

    /// Extend our hold. Returns false when the lock is no longer ours —
    /// the caller must treat that as fatal.
    pub async fn refresh(&self) -> StoreResult<bool> {
        self.store.refresh(&self.key, &self.holder, self.ttl).await
    }

    /// Release our hold. A false return means someone else owns it now.
    pub async fn release(&self) -> StoreResult<bool> {
        self.store.release(&self.key, &self.holder).await
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_message_wire_format() {
        let msg = ControlMessage::Shutdown {
            pair_id: Some("weth-usdc".into()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"SHUTDOWN\""));
        assert_eq!(ControlMessage::parse(&json), Some(msg));
    }

    #[test]
    fn malformed_control_messages_are_dropped() {
        assert_eq!(ControlMessage::parse("not json"), None);
        assert_eq!(ControlMessage::parse("{\"type\":\"EXPLODE\"}"), None);
        assert_eq!(ControlMessage::parse("{}"), None);
    }

    #[test]
    fn targeting_semantics() {
        let broadcast = ControlMessage::Shutdown { pair_id: None };
        assert!(broadcast.targets("a"));
        assert!(broadcast.targets("b"));

        let targeted = ControlMessage::Restart {
            pair_id: Some("a".into()),
        };
        assert!(targeted.targets("a"));
        assert!(!targeted.targets("b"));

        assert!(ControlMessage::ConfigChanged.targets("anything"));
    }

    #[test]
    fn key_schema_shapes() {
        assert_eq!(keys::worker_lock("p1"), "worker:p1:lock");
        assert_eq!(keys::worker_heartbeat("p1"), "worker:p1:heartbeat");
        assert_eq!(keys::pair_positions("p1"), "pair:p1:positions");
        assert_eq!(keys::pair_optimizer("p1"), "pair:p1:optimizer");
        assert!(keys::pair_scoped("p1").len() >= 8);
    }
}
