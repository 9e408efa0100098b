// =============================================================================
// In-Memory Coordination Store — virtual TTLs, for tests and local runs
// =============================================================================
//
// Implements the full store contract inside one process. TTLs are evaluated
// lazily against the wall clock on every access, so an expired key behaves
// exactly as if the backend had reaped it.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{CoordinationStore, StoreResult};

/// Buffered messages per subscriber before the channel drops sends.
const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Default)]
struct Inner {
    strings: HashMap<String, (String, Option<Instant>)>,
    sets: HashMap<String, HashSet<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
}

impl Inner {
    /// Drop the key when its deadline has passed; returns whether it is live.
    fn live(&mut self, key: &str) -> bool {
        match self.strings.get(key) {
            Some((_, Some(deadline))) if *deadline <= Instant::now() => {
                self.strings.remove(key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}

/// Process-local store backend.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        only_if_absent: bool,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        if only_if_absent && inner.live(key) {
            return Ok(false);
        }
        let deadline = ttl.map(|t| Instant::now() + t);
        inner
            .strings
            .insert(key.to_string(), (value.to_string(), deadline));
        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.inner.lock();
        if !inner.live(key) {
            return Ok(None);
        }
        Ok(inner.strings.get(key).map(|(v, _)| v.clone()))
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.strings.remove(key);
        inner.sets.remove(key);
        inner.hashes.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        Ok(inner.live(key)
            || inner.sets.contains_key(key)
            || inner.hashes.contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        if !inner.live(key) {
            return Ok(false);
        }
        if let Some(entry) = inner.strings.get_mut(key) {
            entry.1 = Some(Instant::now() + ttl);
            return Ok(true);
        }
        Ok(false)
    }

    async fn refresh(&self, key: &str, expected: &str, ttl: Duration) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        if !inner.live(key) {
            return Ok(false);
        }
        match inner.strings.get_mut(key) {
            Some((value, deadline)) if value == expected => {
                *deadline = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        if !inner.live(key) {
            return Ok(false);
        }
        match inner.strings.get(key) {
            Some((value, _)) if value == expected => {
                inner.strings.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        self.inner
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .sets
            .get(key)
            .map(|s| {
                let mut v: Vec<String> = s.iter().cloned().collect();
                v.sort();
                v
            })
            .unwrap_or_default())
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        if let Some(set) = self.inner.lock().sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.inner
            .lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self
            .inner
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> StoreResult<Vec<(String, String)>> {
        Ok(self
            .inner
            .lock()
            .hashes
            .get(key)
            .map(|h| {
                let mut v: Vec<(String, String)> =
                    h.iter().map(|(k, val)| (k.clone(), val.clone())).collect();
                v.sort();
                v
            })
            .unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<()> {
        if let Some(h) = self.inner.lock().hashes.get_mut(key) {
            h.remove(field);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let senders: Vec<mpsc::Sender<String>> = {
            let inner = self.inner.lock();
            inner
                .subscribers
                .get(channel)
                .map(|subs| subs.clone())
                .unwrap_or_default()
        };
        for tx in senders {
            let _ = tx.send(message.to_string()).await;
        }
        // Reap subscribers whose receivers are gone.
        if let Some(subs) = self.inner.lock().subscribers.get_mut(channel) {
            subs.retain(|tx| !tx.is_closed());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.inner
            .lock()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
