//! Redis-backed coordination store.
//!
//! The multi-instance backend: every hub pointed at the same Redis shares
//! one key space and one pub/sub bus, so fan-out crosses process and host
//! boundaries.
//!
//! Commands go through a [`ConnectionManager`], which reconnects on its own
//! after a dropped connection. Each subscription holds a dedicated pub/sub
//! connection whose messages are forwarded into a local broadcast channel;
//! when that connection drops the [`Subscription`] ends and the caller
//! resubscribes.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::{Client, RedisError, RedisResult, aio::ConnectionManager};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{CoordinationStore, StoreError, Subscription, broker::CHANNEL_CAPACITY};

/// Upper bound on one Redis round trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Keys fetched per `SCAN` step.
const SCAN_BATCH: usize = 100;

/// Coordination store on a shared Redis server.
///
/// Clone is cheap; clones share the managed connection.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisStore {
    /// Connect to `url` (`redis://host:port[/db]`).
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the URL is invalid or the server
    /// cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(unavailable)?;
        let conn = bounded(DEFAULT_COMMAND_TIMEOUT, client.get_connection_manager()).await?;
        tracing::info!(url = %redacted(url), "Connected to Redis");
        Ok(Self { client, conn, timeout: DEFAULT_COMMAND_TIMEOUT })
    }

    /// Use a different bound on each command.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, StoreError> {
        let mut conn = self.conn.clone();
        bounded(self.timeout, cmd.query_async(&mut conn)).await
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value.as_ref());
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg((ttl.as_millis() as u64).max(1));
        }
        let _: () = self.query(&cmd).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let value: Option<Vec<u8>> = self.query(redis::cmd("GET").arg(key)).await?;
        Ok(value.map(Bytes::from))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed: u64 = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>, StoreError> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut keys = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .query(redis::cmd("SCAN").arg(cursor).arg("MATCH").arg(&pattern).arg("COUNT").arg(SCAN_BATCH))
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();

        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            // Expired or deleted since the scan
            if let Some(value) = self.get(&key).await? {
                found.push((key, value));
            }
        }
        Ok(found)
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, StoreError> {
        self.query(redis::cmd("PUBLISH").arg(channel).arg(payload.as_ref())).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut pubsub = bounded(self.timeout, self.client.get_async_pubsub()).await?;
        bounded(self.timeout, pubsub.subscribe(channel)).await?;

        let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
        let lifetime = CancellationToken::new();
        tokio::spawn(forward(channel.to_string(), pubsub, tx, lifetime.clone()));

        Ok(Subscription::new(channel, rx).broken_by(lifetime.clone()).with_guard(lifetime.drop_guard()))
    }
}

/// Pump one pub/sub connection into the subscription's channel until either
/// side goes away.
async fn forward(
    channel: String,
    pubsub: redis::aio::PubSub,
    tx: broadcast::Sender<Bytes>,
    lifetime: CancellationToken,
) {
    let mut messages = pubsub.into_on_message();
    loop {
        let next = tokio::select! {
            () = lifetime.cancelled() => break,
            next = messages.next() => next,
        };
        let Some(message) = next else {
            tracing::warn!(%channel, "Redis subscription connection closed");
            break;
        };
        // No receiver only means the subscription is being dropped
        let _ = tx.send(Bytes::copy_from_slice(message.get_payload_bytes()));
    }
    lifetime.cancel();
}

async fn bounded<T>(timeout: Duration, op: impl Future<Output = RedisResult<T>>) -> Result<T, StoreError> {
    match tokio::time::timeout(timeout, op).await {
        Ok(result) => result.map_err(unavailable),
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

fn unavailable(e: RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Escape glob metacharacters so a key prefix matches literally.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// URL with any password replaced, for logs.
fn redacted(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}://***{}", &url[..scheme], &url[at..]),
        _ => url.to_string(),
    }
}
