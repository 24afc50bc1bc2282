//! Cache client pool and the in-process cache backend.
//!
//! Request handling talks to the cache through a [`CacheHandle`] acquired from
//! the [`CachePool`] once per request. The handle holds a pool permit that is
//! released when it is dropped, so every exit path gives it back.
//!
//! The default backend is moka with per-entry expiry: writes with an explicit
//! TTL keep it, writes without one fall back to the pool's default policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{ConsoleError, Result};

/// Expiry for cached user records.
pub const USER_TTL: Duration = Duration::from_secs(3600);
/// Expiry for login sessions (7 days).
pub const SESSION_TTL: Duration = Duration::from_secs(604_800);
/// Key holding the ids of guilds the bot is connected to.
pub const CONNECTED_GUILDS_KEY: &str = "connected_guilds";

/// Key for the cached user of an access token.
pub fn user_key(token: &str) -> String {
    format!("{}:user", token)
}

/// Key for the cached member guild list of an access token.
pub fn guilds_key(token: &str) -> String {
    format!("{}:guilds", token)
}

/// Key for the stored OAuth token of a session cookie.
pub fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

/// Key for a guild's saved settings of the named kind.
pub fn guild_config_key(guild_id: u64, name: &str) -> String {
    format!("guild:{}:{}", guild_id, name)
}

/// Statistics about cache performance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of live entries.
    pub entries: u64,
    /// Total cache hits.
    pub hits: u64,
    /// Total cache misses.
    pub misses: u64,
    /// Cache hit rate (0.0 to 1.0).
    pub hit_rate: f64,
}

/// Storage contract the pipeline relies on.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch raw bytes. `Ok(None)` is a miss.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store raw bytes. `None` applies the backend's default expiry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Remove a key. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Backend statistics, if the backend tracks them.
    fn stats(&self) -> Option<CacheStats> {
        None
    }
}

/// Internal statistics tracker.
#[derive(Clone)]
struct StatsTracker {
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl StatsTracker {
    fn new() -> Self {
        Self {
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn hit_rate(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[derive(Clone)]
struct CacheEntry {
    value: Arc<Vec<u8>>,
    ttl: Duration,
}

/// Each entry expires after its own TTL.
struct EntryExpiry;

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process cache backend using moka.
#[derive(Clone)]
pub struct MokaBackend {
    cache: Cache<String, CacheEntry>,
    default_ttl: Duration,
    stats_tracker: StatsTracker,
}

impl MokaBackend {
    /// Create a backend holding at most `max_capacity` entries.
    pub fn new(max_capacity: u64, default_ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(EntryExpiry)
                .build(),
            default_ttl,
            stats_tracker: StatsTracker::new(),
        }
    }

    /// Run pending maintenance so entry counts are accurate.
    pub async fn sync(&self) {
        self.cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl CacheBackend for MokaBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entry = self.cache.get(key).await;
        self.stats_tracker.record(entry.is_some());
        Ok(entry.map(|e| e.value.as_ref().clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let entry = CacheEntry {
            value: Arc::new(value),
            ttl: ttl.unwrap_or(self.default_ttl),
        };
        self.cache.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    fn stats(&self) -> Option<CacheStats> {
        let hits = self.stats_tracker.hits.load(Ordering::Relaxed);
        let misses = self.stats_tracker.misses.load(Ordering::Relaxed);
        Some(CacheStats {
            entries: self.cache.entry_count(),
            hits,
            misses,
            hit_rate: StatsTracker::hit_rate(hits, misses),
        })
    }
}

/// Bounded pool of cache clients.
pub struct CachePool {
    backend: Arc<dyn CacheBackend>,
    permits: Arc<Semaphore>,
    max_clients: usize,
    acquire_timeout: Duration,
}

impl CachePool {
    /// Create a pool handing out at most `max_clients` handles at once.
    pub fn new(backend: Arc<dyn CacheBackend>, max_clients: usize, acquire_timeout: Duration) -> Self {
        Self {
            backend,
            permits: Arc::new(Semaphore::new(max_clients)),
            max_clients,
            acquire_timeout,
        }
    }

    /// Acquire a client, waiting at most the configured timeout.
    pub async fn acquire(&self) -> Result<CacheHandle> {
        let permit = tokio::time::timeout(self.acquire_timeout, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| ConsoleError::CachePool("timed out waiting for a cache client".to_string()))?
            .map_err(|_| ConsoleError::CachePool("cache pool is closed".to_string()))?;

        Ok(CacheHandle {
            backend: self.backend.clone(),
            _permit: permit,
        })
    }

    /// Stop handing out clients. Outstanding handles stay valid.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Clients not currently checked out.
    pub fn available_clients(&self) -> usize {
        self.permits.available_permits()
    }

    /// Pool size.
    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Statistics of the underlying backend.
    pub fn stats(&self) -> Option<CacheStats> {
        self.backend.stats()
    }
}

/// A checked out cache client. Returned to the pool on drop.
pub struct CacheHandle {
    backend: Arc<dyn CacheBackend>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle").finish_non_exhaustive()
    }
}

impl CacheHandle {
    /// Read and decode a JSON value. `Ok(None)` is a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Encode and store a JSON value.
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.backend.set(key, bytes, ttl).await
    }

    /// Remove a key.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(key).await
    }
}
