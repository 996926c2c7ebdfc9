//! Shared client pool keyed by logical name.
//!
//! Settings are registered up front; [`ClientPool::get_or_create_producer`]
//! and [`ClientPool::get_or_create_consumer`] then hand out shared
//! instances, building one lazily on first use. Requesting a name with no
//! registered settings is an error, never a silent default.
//!
//! The pool is an explicit object: callers construct it, share it by
//! cloning, and shut it down. There is no process-global registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::consumer::Consumer;
use crate::error::{Error, Result};
use crate::metrics::ClientMetrics;
use crate::producer::Producer;
use crate::settings::{ConsumerSettings, ProducerSettings};
use crate::transport::BrokerConnector;

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Entry count the pool aims to stay under.
    pub max_size: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self { max_size: 16 }
    }
}

impl PoolSettings {
    fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::InvalidSettings(
                "pool max_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Size at which an insert triggers eviction.
    fn high_water(&self) -> usize {
        (self.max_size * 9).div_ceil(10)
    }

    /// Size eviction shrinks the pool to.
    fn target_size(&self) -> usize {
        (self.max_size / 2).max(1)
    }
}

// ============================================================================
// Entries
// ============================================================================

enum PoolClient {
    Producer(Producer),
    Consumer(Consumer),
}

impl PoolClient {
    fn kind(&self) -> &'static str {
        match self {
            Self::Producer(_) => "producer",
            Self::Consumer(_) => "consumer",
        }
    }

    async fn dispose(self, name: &str) {
        let result = match &self {
            Self::Producer(producer) => producer.close().await,
            Self::Consumer(consumer) => consumer.unsubscribe().await,
        };
        if let Err(error) = result {
            warn!(name, kind = self.kind(), %error, "failed to dispose pooled client");
        }
    }
}

struct PoolEntry {
    client: PoolClient,
    access_count: AtomicU64,
    last_access: AtomicU64,
}

impl PoolEntry {
    fn new(client: PoolClient, now: u64) -> Self {
        Self {
            client,
            access_count: AtomicU64::new(1),
            last_access: AtomicU64::new(now),
        }
    }

    fn touch(&self, now: u64) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.last_access.store(now, Ordering::Relaxed);
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Named registry of shared producers and consumers.
pub struct ClientPool {
    inner: Arc<PoolInner>,
}

impl Clone for ClientPool {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct PoolInner {
    connector: Arc<dyn BrokerConnector>,
    settings: PoolSettings,
    producer_settings: RwLock<HashMap<String, ProducerSettings>>,
    consumer_settings: RwLock<HashMap<String, ConsumerSettings>>,
    entries: RwLock<HashMap<String, PoolEntry>>,
    /// Serializes lazy construction so concurrent first requests for a name
    /// build one client, not several.
    creation: Mutex<()>,
    started: Instant,
    closed: AtomicBool,
    stats: PoolStats,
}

impl ClientPool {
    pub fn new(connector: Arc<dyn BrokerConnector>, settings: PoolSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                settings,
                producer_settings: RwLock::new(HashMap::new()),
                consumer_settings: RwLock::new(HashMap::new()),
                entries: RwLock::new(HashMap::new()),
                creation: Mutex::new(()),
                started: Instant::now(),
                closed: AtomicBool::new(false),
                stats: PoolStats::default(),
            }),
        })
    }

    /// Register producer settings under their name. Names are unique across
    /// producers and consumers.
    pub fn register_producer(&self, settings: ProducerSettings) -> Result<()> {
        self.ensure_open()?;
        settings.validate()?;
        let name = settings.name.clone();
        if self.inner.consumer_settings.read().contains_key(&name) {
            return Err(Error::InvalidSettings(format!(
                "client name {name} is already registered as a consumer"
            )));
        }
        self.inner.producer_settings.write().insert(name, settings);
        Ok(())
    }

    /// Register consumer settings under their name.
    pub fn register_consumer(&self, settings: ConsumerSettings) -> Result<()> {
        self.ensure_open()?;
        settings.validate()?;
        let name = settings.name.clone();
        if self.inner.producer_settings.read().contains_key(&name) {
            return Err(Error::InvalidSettings(format!(
                "client name {name} is already registered as a producer"
            )));
        }
        self.inner.consumer_settings.write().insert(name, settings);
        Ok(())
    }

    /// Shared producer for `name`, connecting one on first use.
    pub async fn get_or_create_producer(&self, name: &str) -> Result<Producer> {
        self.ensure_open()?;
        if let Some(producer) = self.inner.lookup_producer(name) {
            return Ok(producer);
        }

        let _creating = self.inner.creation.lock().await;
        self.ensure_open()?;
        if let Some(producer) = self.inner.lookup_producer(name) {
            return Ok(producer);
        }

        let settings = self
            .inner
            .producer_settings
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownClient(name.to_string()))?;
        self.inner.record_miss();

        let producer = Producer::connect(self.inner.connector.as_ref(), settings).await?;
        let evicted = self.inner.insert(name, PoolClient::Producer(producer.clone()));
        drop(_creating);

        self.inner.dispose_evicted(evicted).await;
        Ok(producer)
    }

    /// Shared consumer for `name`, connecting one on first use. The caller
    /// still subscribes it.
    pub async fn get_or_create_consumer(&self, name: &str) -> Result<Consumer> {
        self.ensure_open()?;
        if let Some(consumer) = self.inner.lookup_consumer(name) {
            return Ok(consumer);
        }

        let _creating = self.inner.creation.lock().await;
        self.ensure_open()?;
        if let Some(consumer) = self.inner.lookup_consumer(name) {
            return Ok(consumer);
        }

        let settings = self
            .inner
            .consumer_settings
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownClient(name.to_string()))?;
        self.inner.record_miss();

        let consumer = Consumer::connect(self.inner.connector.as_ref(), settings).await?;
        let evicted = self.inner.insert(name, PoolClient::Consumer(consumer.clone()));
        drop(_creating);

        self.inner.dispose_evicted(evicted).await;
        Ok(consumer)
    }

    /// Drop and dispose the pooled instance for `name`, if any. Settings
    /// stay registered, so the next request rebuilds it.
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let entry = {
            let mut entries = self.inner.entries.write();
            let entry = entries.remove(name);
            ClientMetrics::set_pool_size(entries.len());
            entry
        };
        if let Some(entry) = entry {
            entry.client.dispose(name).await;
        }
        Ok(())
    }

    /// Dispose every pooled instance and refuse further requests.
    /// Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Wait out any in-flight creation before draining.
        let _creating = self.inner.creation.lock().await;
        let drained: Vec<(String, PoolEntry)> = {
            let mut entries = self.inner.entries.write();
            let drained = entries.drain().collect();
            ClientMetrics::set_pool_size(0);
            drained
        };
        drop(_creating);

        let count = drained.len();
        for (name, entry) in drained {
            entry.client.dispose(&name).await;
        }
        info!(clients = count, "client pool shut down");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            hits: self.inner.stats.hits.load(Ordering::Relaxed),
            misses: self.inner.stats.misses.load(Ordering::Relaxed),
            evictions: self.inner.stats.evictions.load(Ordering::Relaxed),
            size: self.len(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }
        Ok(())
    }
}

impl PoolInner {
    fn now(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }

    fn lookup_producer(&self, name: &str) -> Option<Producer> {
        let entries = self.entries.read();
        let entry = entries.get(name)?;
        match &entry.client {
            PoolClient::Producer(producer) => {
                entry.touch(self.now());
                self.record_hit();
                Some(producer.clone())
            }
            PoolClient::Consumer(_) => None,
        }
    }

    fn lookup_consumer(&self, name: &str) -> Option<Consumer> {
        let entries = self.entries.read();
        let entry = entries.get(name)?;
        match &entry.client {
            PoolClient::Consumer(consumer) => {
                entry.touch(self.now());
                self.record_hit();
                Some(consumer.clone())
            }
            PoolClient::Producer(_) => None,
        }
    }

    fn record_hit(&self) {
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        ClientMetrics::increment_pool_hits();
    }

    fn record_miss(&self) {
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        ClientMetrics::increment_pool_misses();
    }

    /// Insert a freshly built client and, if the pool crossed its high-water
    /// mark, pick eviction victims. Victims are returned for disposal
    /// outside the lock.
    fn insert(&self, name: &str, client: PoolClient) -> Vec<(String, PoolClient)> {
        let mut entries = self.entries.write();
        entries.insert(name.to_string(), PoolEntry::new(client, self.now()));

        let evicted = self.evict_locked(&mut entries, name);
        ClientMetrics::set_pool_size(entries.len());
        evicted
    }

    /// Shrink to the target size, least-used entries first. `protected` is
    /// the entry being handed out right now and is never a victim.
    fn evict_locked(
        &self,
        entries: &mut HashMap<String, PoolEntry>,
        protected: &str,
    ) -> Vec<(String, PoolClient)> {
        if entries.len() < self.settings.high_water() {
            return Vec::new();
        }
        let excess = entries.len().saturating_sub(self.settings.target_size());
        if excess == 0 {
            return Vec::new();
        }

        let mut ranked: Vec<(String, u64, u64)> = entries
            .iter()
            .filter(|(name, _)| name.as_str() != protected)
            .map(|(name, entry)| {
                (
                    name.clone(),
                    entry.access_count.load(Ordering::Relaxed),
                    entry.last_access.load(Ordering::Relaxed),
                )
            })
            .collect();
        ranked.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        let mut evicted = Vec::new();
        for (name, _, _) in ranked.into_iter().take(excess) {
            if let Some(entry) = entries.remove(&name) {
                evicted.push((name, entry.client));
            }
        }
        if !evicted.is_empty() {
            self.stats
                .evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            ClientMetrics::increment_pool_evictions(evicted.len() as u64);
            debug!(
                evicted = evicted.len(),
                remaining = entries.len(),
                "evicted least-used pooled clients"
            );
        }
        evicted
    }

    async fn dispose_evicted(&self, evicted: Vec<(String, PoolClient)>) {
        for (name, client) in evicted {
            client.dispose(&name).await;
        }
    }
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("size", &self.len())
            .field("max_size", &self.inner.settings.max_size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Default)]
struct PoolStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

// ============================================================================
// Tests
// ============================================================================
