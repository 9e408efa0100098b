// =============================================================================
// Redis Coordination Store — production backend
// =============================================================================
//
// One multiplexed `ConnectionManager` (auto-reconnecting, cheap to clone)
// serves all request/response verbs; every subscriber gets its own dedicated
// pub/sub connection, since a subscribing connection cannot serve commands.
//
// Lock refresh and release are Lua check-and-set scripts so the read and the
// write happen atomically on the server.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{CoordinationStore, StoreError, StoreResult, STORE_TIMEOUT};

/// Buffered messages per subscriber before back-pressure drops sends.
const SUBSCRIBER_BUFFER: usize = 64;

const REFRESH_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  return 0
end"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end"#;

/// Redis-backed store. Clone-friendly handle.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect and build the shared connection manager.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(|e| StoreError::Backend(e.to_string()))?;
        let manager = timed(client.get_connection_manager()).await?;
        debug!(url, "redis coordination store connected");
        Ok(Self { client, manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Append one JSON payload to a Redis stream (used by the event sink).
    pub async fn xadd(&self, stream: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        timed(
            redis::cmd("XADD")
                .arg(stream)
                .arg("*")
                .arg("payload")
                .arg(payload)
                .query_async::<_, String>(&mut conn),
        )
        .await?;
        Ok(())
    }
}

/// Wrap a backend future with the store timeout and error mapping.
async fn timed<T, F>(fut: F) -> StoreResult<T>
where
    F: Future<Output = Result<T, redis::RedisError>>,
{
    match tokio::time::timeout(STORE_TIMEOUT, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(StoreError::Backend(e.to_string())),
        Err(_) => Err(StoreError::Timeout),
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        only_if_absent: bool,
    ) -> StoreResult<bool> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        if only_if_absent {
            cmd.arg("NX");
        }
        // With NX the reply is nil when the key already exists.
        let reply: Option<String> = timed(cmd.query_async(&mut conn)).await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        timed(redis::cmd("GET").arg(key).query_async(&mut conn)).await
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        timed(redis::cmd("DEL").arg(key).query_async::<_, i64>(&mut conn)).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let n: i64 = timed(redis::cmd("EXISTS").arg(key).query_async(&mut conn)).await?;
        Ok(n > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn();
        let applied: i64 = timed(
            redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn),
        )
        .await?;
        Ok(applied == 1)
    }

    async fn refresh(&self, key: &str, expected: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn();
        let applied: i64 = timed(
            Script::new(REFRESH_SCRIPT)
                .key(key)
                .arg(expected)
                .arg(ttl.as_millis() as u64)
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(applied == 1)
    }

    async fn release(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = timed(
            Script::new(RELEASE_SCRIPT)
                .key(key)
                .arg(expected)
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(removed == 1)
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        timed(
            redis::cmd("SADD")
                .arg(key)
                .arg(member)
                .query_async::<_, i64>(&mut conn),
        )
        .await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let mut members: Vec<String> =
            timed(redis::cmd("SMEMBERS").arg(key).query_async(&mut conn)).await?;
        members.sort();
        Ok(members)
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        timed(
            redis::cmd("SREM")
                .arg(key)
                .arg(member)
                .query_async::<_, i64>(&mut conn),
        )
        .await?;
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        timed(
            redis::cmd("HSET")
                .arg(key)
                .arg(field)
                .arg(value)
                .query_async::<_, i64>(&mut conn),
        )
        .await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        timed(redis::cmd("HGET").arg(key).arg(field).query_async(&mut conn)).await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<Vec<(String, String)>> {
        let mut conn = self.conn();
        let map: std::collections::HashMap<String, String> =
            timed(redis::cmd("HGETALL").arg(key).query_async(&mut conn)).await?;
        let mut entries: Vec<(String, String)> = map.into_iter().collect();
        entries.sort();
        Ok(entries)
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        timed(
            redis::cmd("HDEL")
                .arg(key)
                .arg(field)
                .query_async::<_, i64>(&mut conn),
        )
        .await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        timed(
            redis::cmd("PUBLISH")
                .arg(channel)
                .arg(message)
                .query_async::<_, i64>(&mut conn),
        )
        .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<mpsc::Receiver<String>> {
        // Dedicated connection: a subscribing connection cannot multiplex
        // regular commands.
        let mut pubsub = timed(self.client.get_async_pubsub()).await?;
        timed(pubsub.subscribe(channel)).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "unreadable pub/sub payload dropped");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break; // Receiver gone; the subscription ends with it.
                }
            }
            debug!(channel = %channel, "pub/sub stream ended");
        });

        Ok(rx)
    }
}
