// =============================================================================
// Event Sink — buffered fire-and-forget stream ingestion
// =============================================================================
//
// Emitters never wait on the network: entries land in per-stream buffers and
// a background task flushes them every five seconds, at most 100 entries per
// stream per flush. The buffers are bounded at 10 000 entries total with
// drop-oldest overflow, so a dead backend degrades observability but never
// the trading loop.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::coordination::redis::RedisStore;

/// Flush cadence.
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
/// Entries shipped per stream per flush.
const BATCH_PER_STREAM: usize = 100;
/// Total buffered entries across all streams before drop-oldest kicks in.
const HARD_CAP: usize = 10_000;

/// The streams the engine publishes.
pub mod streams {
    pub const CANDLES: &str = "candles";
    pub const POOL_SNAPSHOTS: &str = "pool_snapshots";
    pub const POOL_ANALYSES: &str = "pool_analyses";
    pub const PAIR_ALLOCATIONS: &str = "pair_allocations";
    pub const EPOCH_SNAPSHOTS: &str = "epoch_snapshots";
    pub const TX_LOG: &str = "tx_log";
    pub const POSITIONS: &str = "positions";
    pub const OPTIMIZER_STATE: &str = "optimizer_state";
}

/// Where flushed entries go.
#[async_trait]
pub trait StreamBackend: Send + Sync {
    async fn append(&self, stream: &str, entries: &[Value]) -> anyhow::Result<()>;
}

/// Production backend: one XADD per entry onto a Redis stream.
#[async_trait]
impl StreamBackend for RedisStore {
    async fn append(&self, stream: &str, entries: &[Value]) -> anyhow::Result<()> {
        for entry in entries {
            self.xadd(stream, &entry.to_string()).await?;
        }
        Ok(())
    }
}

/// Backend that discards everything; for tooling and tests that do not care
/// about observability output.
pub struct NullBackend;

#[async_trait]
impl StreamBackend for NullBackend {
    async fn append(&self, _stream: &str, _entries: &[Value]) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Inner {
    backend: Arc<dyn StreamBackend>,
    buffers: Mutex<HashMap<String, VecDeque<Value>>>,
}

/// Cheap-to-clone sink handle.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<Inner>,
}

impl EventSink {
    /// Build a sink and start its background flush task. The task holds only
    /// a weak handle and exits when the last sink clone is dropped.
    pub fn new(backend: Arc<dyn StreamBackend>) -> Self {
        let inner = Arc::new(Inner {
            backend,
            buffers: Mutex::new(HashMap::new()),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(FLUSH_INTERVAL).await;
                match weak.upgrade() {
                    Some(inner) => flush_inner(&inner).await,
                    None => break,
                }
            }
            debug!("event sink flush task ended");
        });

        Self { inner }
    }

    /// Queue one entry. Never blocks, never fails; overflow drops the oldest
    /// buffered entry.
    pub fn emit(&self, stream: &str, entry: Value) {
        let mut buffers = self.inner.buffers.lock();

        let total: usize = buffers.values().map(VecDeque::len).sum();
        if total >= HARD_CAP {
            // Drop the oldest entry from the fullest stream.
            if let Some((_, buf)) = buffers
                .iter_mut()
                .max_by_key(|(_, b)| b.len())
                .filter(|(_, b)| !b.is_empty())
            {
                buf.pop_front();
            }
        }

        buffers
            .entry(stream.to_string())
            .or_default()
            .push_back(entry);
    }

    /// Serialize and queue one entry. Unserializable values are dropped with
    /// a warning (a bug, not an operational condition).
    pub fn emit_json<T: Serialize>(&self, stream: &str, entry: &T) {
        match serde_json::to_value(entry) {
            Ok(value) => self.emit(stream, value),
            Err(e) => warn!(stream, error = %e, "dropping unserializable event"),
        }
    }

    /// Flush everything currently buffered (used at shutdown).
    pub async fn flush(&self) {
        loop {
            flush_inner(&self.inner).await;
            let drained = self
                .inner
                .buffers
                .lock()
                .values()
                .all(VecDeque::is_empty);
            if drained {
                break;
            }
        }
    }

    #[cfg(test)]
    fn buffered_total(&self) -> usize {
        self.inner.buffers.lock().values().map(VecDeque::len).sum()
    }
}

/// One flush pass: up to [`BATCH_PER_STREAM`] entries per stream.
async fn flush_inner(inner: &Inner) {
    let batches: Vec<(String, Vec<Value>)> = {
        let mut buffers = inner.buffers.lock();
        buffers
            .iter_mut()
            .filter(|(_, buf)| !buf.is_empty())
            .map(|(stream, buf)| {
                let take = buf.len().min(BATCH_PER_STREAM);
                let batch: Vec<Value> = buf.drain(..take).collect();
                (stream.clone(), batch)
            })
            .collect()
    };

    for (stream, batch) in batches {
        if let Err(e) = inner.backend.append(&stream, &batch).await {
            // Fire-and-forget: the batch is lost, the loop is not.
            warn!(stream = %stream, dropped = batch.len(), error = %e, "event flush failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Capturing backend for assertions.
    #[derive(Default)]
    struct CaptureBackend {
        seen: Mutex<Vec<(String, usize)>>,
        fail: bool,
    }

    #[async_trait]
    impl StreamBackend for CaptureBackend {
        async fn append(&self, stream: &str, entries: &[Value]) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("backend down");
            }
            self.seen.lock().push((stream.to_string(), entries.len()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn emit_then_flush_reaches_backend() {
        let backend = Arc::new(CaptureBackend::default());
        let sink = EventSink::new(backend.clone());

        sink.emit(streams::CANDLES, json!({"ts": 1}));
        sink.emit(streams::CANDLES, json!({"ts": 2}));
        sink.emit(streams::TX_LOG, json!({"tx": "0xabc"}));
        sink.flush().await;

        let seen = backend.seen.lock().clone();
        assert_eq!(seen.len(), 2);
        let candles = seen.iter().find(|(s, _)| s == streams::CANDLES).unwrap();
        assert_eq!(candles.1, 2);
        assert_eq!(sink.buffered_total(), 0);
    }

    #[tokio::test]
    async fn flush_batches_are_capped_per_stream() {
        let backend = Arc::new(CaptureBackend::default());
        let sink = EventSink::new(backend.clone());

        for i in 0..250 {
            sink.emit(streams::CANDLES, json!({ "i": i }));
        }
        sink.flush().await;

        let seen = backend.seen.lock().clone();
        // 250 entries drain as 100 + 100 + 50.
        assert_eq!(
            seen.iter().map(|(_, n)| n).sum::<usize>(),
            250
        );
        assert!(seen.iter().all(|(_, n)| *n <= BATCH_PER_STREAM));
    }

    #[tokio::test]
    async fn hard_cap_drops_oldest() {
        let backend = Arc::new(CaptureBackend {
            fail: true, // never drains
            ..Default::default()
        });
        let sink = EventSink::new(backend);

        for i in 0..(HARD_CAP + 500) {
            sink.emit(streams::CANDLES, json!({ "i": i }));
        }
        assert!(sink.buffered_total() <= HARD_CAP + 1);
    }

    #[tokio::test]
    async fn backend_failure_does_not_propagate() {
        let backend = Arc::new(CaptureBackend {
            fail: true,
            ..Default::default()
        });
        let sink = EventSink::new(backend);
        sink.emit(streams::TX_LOG, json!({"tx": 1}));
        // Flush must complete despite the failing backend (batch is dropped).
        sink.flush().await;
        assert_eq!(sink.buffered_total(), 0);
    }

    #[tokio::test]
    async fn emit_json_serializes_structs() {
        #[derive(Serialize)]
        struct Row {
            a: u32,
        }
        let backend = Arc::new(CaptureBackend::default());
        let sink = EventSink::new(backend.clone());
        sink.emit_json(streams::POSITIONS, &Row { a: 7 });
        sink.flush().await;
        assert_eq!(backend.seen.lock().len(), 1);
    }
}
