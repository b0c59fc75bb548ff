use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, timeout};
use tracing::{debug, info};

use crate::error::StoreError;

// Count after the increment, and seconds until the counter expires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub ttl_secs: u64,
}

/// Atomic increment-with-expiry. Implementations return in bounded time and
/// never retry internally.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn increment_and_bound(&self, key: &str, window_secs: u64) -> Result<WindowCount, StoreError>;

    // connectivity probe for /health
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct RedisCounterStore {
    connection_manager: ConnectionManager,
    call_timeout: Duration,
}

impl RedisCounterStore {
    // connect + ping, both bounded by call_timeout
    pub async fn connect(url: &str, call_timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection_manager = timeout(call_timeout, client.get_connection_manager())
            .await
            .map_err(|_| StoreError::Timeout(call_timeout))??;

        let store = Self {
            connection_manager,
            call_timeout,
        };
        store.ping().await?;
        info!(url = %url, "Connected to redis counter store");
        Ok(store)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_and_bound(&self, key: &str, window_secs: u64) -> Result<WindowCount, StoreError> {
        let expire_secs = i64::try_from(window_secs).map_err(|_| StoreError::WindowOutOfRange(window_secs))?;
        let mut conn = self.connection_manager.clone();

        // MULTI/EXEC: concurrent increments from any instance serialize here
        let mut pipe = redis::pipe();
        pipe.atomic()
            .incr(key, 1u64)
            .expire(key, expire_secs)
            .ignore()
            .ttl(key);

        let (count, ttl): (u64, i64) = timeout(self.call_timeout, pipe.query_async(&mut conn))
            .await
            .map_err(|_| StoreError::Timeout(self.call_timeout))??;

        Ok(WindowCount {
            count,
            ttl_secs: if ttl > 0 { ttl as u64 } else { window_secs },
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection_manager.clone();
        let pong: String = timeout(self.call_timeout, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| StoreError::Timeout(self.call_timeout))??;

        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected PING reply: {}", pong)))
        }
    }
}

// Counter entry - count plus the instant it stops counting
#[derive(Debug, Clone, Copy)]
struct MemoryEntry {
    count: u64,
    expires_at: Instant,
}

// In-process store with the redis one's semantics, shared by Arc only
#[derive(Default)]
pub struct MemoryCounterStore {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, key: &str) -> Option<u64> {
        self.entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.count)
    }

    // returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_and_bound(&self, key: &str, window_secs: u64) -> Result<WindowCount, StoreError> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(Duration::from_secs(window_secs))
            .ok_or(StoreError::WindowOutOfRange(window_secs))?;

        // the shard lock makes read-modify-write atomic per key
        let mut entry = self.entries.entry(key.to_string()).or_insert(MemoryEntry {
            count: 0,
            expires_at,
        });

        if entry.expires_at <= now {
            entry.count = 0;
        }
        entry.count += 1;
        entry.expires_at = expires_at;

        Ok(WindowCount {
            count: entry.count,
            ttl_secs: window_secs,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// Periodic purge of expired in-memory counters
pub async fn memory_sweeper(store: Arc<MemoryCounterStore>, sweep_interval: Duration) {
    let mut interval = interval(sweep_interval);

    info!("Memory counter sweeper started (interval: {:?})", sweep_interval);

    loop {
        interval.tick().await;

        let removed = store.purge_expired();
        if removed > 0 {
            debug!(removed = removed, remaining = store.len(), "Purged expired counters");
        }
    }
}
