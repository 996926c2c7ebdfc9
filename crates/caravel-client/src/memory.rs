//! In-process broker implementation of the transport boundary.
//!
//! Backs local development and the test suites: partitioned append logs,
//! Kafka-compatible key routing, per-group committed offsets, and a
//! transaction model close to the real thing — transactional records are
//! appended immediately at real offsets, the last stable offset (LSO) holds
//! `ReadCommitted` fetches back until commit, and aborted records stay in
//! the log as tombstones every fetch skips.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use caravel_core::hash::partition_for_key;
use caravel_core::{ConsumedRecord, Headers, Receipt, Record, TopicPartition};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::{BrokerConnector, BrokerTransport, IsolationLevel, TransportConfig};

const DEFAULT_PARTITIONS: u32 = 4;

// ============================================================================
// Log storage
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Committed,
    /// Part of an open transaction; invisible to `ReadCommitted` fetches.
    Open,
    /// Part of an aborted transaction; skipped by every fetch.
    Aborted,
}

#[derive(Debug, Clone)]
struct LogEntry {
    key: Option<String>,
    value: Bytes,
    headers: Headers,
    timestamp: DateTime<Utc>,
    state: EntryState,
}

#[derive(Debug, Default)]
struct PartitionLog {
    entries: Vec<LogEntry>,
    /// Offsets of open-transaction entries; the smallest bounds the LSO.
    open: BTreeSet<i64>,
}

impl PartitionLog {
    fn high_watermark(&self) -> i64 {
        self.entries.len() as i64
    }

    /// Last stable offset: everything below it is commit-or-abort decided.
    fn last_stable_offset(&self) -> i64 {
        self.open
            .iter()
            .next()
            .copied()
            .unwrap_or_else(|| self.high_watermark())
    }
}

#[derive(Debug, Default)]
struct TopicLog {
    partitions: Vec<PartitionLog>,
}

#[derive(Debug, Default)]
struct TxnEntry {
    open: bool,
    /// `(topic, partition, offset)` of records appended by the open
    /// transaction, flipped in one pass at commit/abort.
    records: Vec<(String, i32, i64)>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
    /// group → partition → committed (next-to-read) offset.
    committed: HashMap<String, HashMap<TopicPartition, i64>>,
    /// Registered transactional ids.
    txns: HashMap<String, TxnEntry>,
}

impl BrokerState {
    fn ensure_topic(&mut self, topic: &str, partitions: u32) -> &mut TopicLog {
        self.topics.entry(topic.to_string()).or_insert_with(|| {
            let partitions = partitions.max(1);
            TopicLog {
                partitions: (0..partitions).map(|_| PartitionLog::default()).collect(),
            }
        })
    }
}

// ============================================================================
// Broker hub
// ============================================================================

/// A shared in-process broker.
///
/// Clone-cheap: handles produced by [`BrokerConnector::connect`] all point
/// at the same log state. Topics are auto-created on first use with
/// [`default_partitions`](Self::with_default_partitions) partitions.
#[derive(Clone)]
pub struct InMemoryBroker {
    hub: Arc<Hub>,
}

struct Hub {
    state: RwLock<BrokerState>,
    /// Wakes parked fetchers when new data becomes readable.
    data: Notify,
    default_partitions: u32,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_default_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_default_partitions(partitions: u32) -> Self {
        Self {
            hub: Arc::new(Hub {
                state: RwLock::new(BrokerState::default()),
                data: Notify::new(),
                default_partitions: partitions.max(1),
            }),
        }
    }

    /// Pre-create a topic with an explicit partition count. No-op when the
    /// topic already exists.
    pub fn create_topic(&self, topic: &str, partitions: u32) {
        let mut state = self.hub.state.write();
        state.ensure_topic(topic, partitions);
    }

    /// Committed (transaction-decided) records of a topic, in partition
    /// order. Test-facing introspection.
    pub fn committed_records(&self, topic: &str) -> Vec<ConsumedRecord> {
        let state = self.hub.state.read();
        let Some(log) = state.topics.get(topic) else {
            return Vec::new();
        };
        let mut records = Vec::new();
        for (partition, plog) in log.partitions.iter().enumerate() {
            for (offset, entry) in plog.entries.iter().enumerate() {
                if entry.state == EntryState::Committed {
                    records.push(ConsumedRecord {
                        topic: topic.to_string(),
                        partition: partition as i32,
                        offset: offset as i64,
                        key: entry.key.clone(),
                        value: entry.value.clone(),
                        headers: entry.headers.clone(),
                        timestamp: entry.timestamp,
                    });
                }
            }
        }
        records
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self, config: &TransportConfig) -> Result<Arc<dyn BrokerTransport>> {
        Ok(Arc::new(InMemoryTransport {
            hub: self.hub.clone(),
            config: config.clone(),
            connected: AtomicBool::new(true),
            positions: parking_lot::Mutex::new(HashMap::new()),
        }))
    }
}

// ============================================================================
// Transport handle
// ============================================================================

/// One connection to an [`InMemoryBroker`], bound to its
/// [`TransportConfig`]'s group / transactional id.
pub struct InMemoryTransport {
    hub: Arc<Hub>,
    config: TransportConfig,
    connected: AtomicBool,
    /// Consumer fetch positions, lazily seeded from the group's committed
    /// offsets.
    positions: parking_lot::Mutex<HashMap<TopicPartition, i64>>,
}

impl InMemoryTransport {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::Disconnected)
        }
    }

    fn txn_id(&self) -> Result<&str> {
        self.config
            .transactional_id
            .as_deref()
            .ok_or_else(|| Error::Transaction("no transactional id configured".into()))
    }

    fn group_id(&self) -> Result<&str> {
        self.config
            .group_id
            .as_deref()
            .ok_or_else(|| Error::Broker("no consumer group bound to this connection".into()))
    }

    /// One non-blocking scan across the subscribed topics.
    fn try_fetch_once(&self) -> Result<Option<ConsumedRecord>> {
        let group = self.group_id()?.to_string();
        let mut positions = self.positions.lock();
        let mut state = self.hub.state.write();

        let default_partitions = self.hub.default_partitions;
        for topic in self.config.topics.clone() {
            state.ensure_topic(&topic, default_partitions);
            let committed = state.committed.get(&group).cloned().unwrap_or_default();
            let log = match state.topics.get(&topic) {
                Some(log) => log,
                None => continue,
            };
            for (partition, plog) in log.partitions.iter().enumerate() {
                let tp = TopicPartition::new(topic.clone(), partition as i32);
                let cursor = positions
                    .entry(tp.clone())
                    .or_insert_with(|| committed.get(&tp).copied().unwrap_or(0));

                let readable_to = match self.config.isolation {
                    IsolationLevel::ReadUncommitted => plog.high_watermark(),
                    IsolationLevel::ReadCommitted => plog.last_stable_offset(),
                };

                while *cursor < readable_to {
                    let offset = *cursor;
                    *cursor += 1;
                    let entry = &plog.entries[offset as usize];
                    // Aborted tombstones are consumed silently.
                    if entry.state == EntryState::Aborted {
                        continue;
                    }
                    return Ok(Some(ConsumedRecord {
                        topic: topic.clone(),
                        partition: partition as i32,
                        offset,
                        key: entry.key.clone(),
                        value: entry.value.clone(),
                        headers: entry.headers.clone(),
                        timestamp: entry.timestamp,
                    }));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl BrokerTransport for InMemoryTransport {
    async fn produce(&self, topic: &str, record: Record) -> Result<Receipt> {
        self.ensure_connected()?;

        let in_txn = match self.config.transactional_id.as_deref() {
            Some(id) => {
                let state = self.hub.state.read();
                let entry = state
                    .txns
                    .get(id)
                    .ok_or_else(|| Error::Transaction(format!("transactional id not initialized: {id}")))?;
                if !entry.open {
                    return Err(Error::Transaction(
                        "produce outside an open transaction".into(),
                    ));
                }
                true
            }
            None => false,
        };

        let timestamp = record.timestamp.unwrap_or_else(Utc::now);
        let mut state = self.hub.state.write();
        let default_partitions = self.hub.default_partitions;
        let num_partitions = {
            let log = state.ensure_topic(topic, default_partitions);
            log.partitions.len() as u32
        };

        let partition = match record.partition {
            Some(p) => {
                if p < 0 || p as u32 >= num_partitions {
                    return Err(Error::Broker(format!(
                        "partition {p} out of range for topic {topic}"
                    )));
                }
                p
            }
            None => match record.key.as_deref() {
                Some(key) => partition_for_key(key.as_bytes(), num_partitions) as i32,
                None => (rand::random::<u32>() % num_partitions) as i32,
            },
        };

        let log = state.ensure_topic(topic, default_partitions);
        let plog = &mut log.partitions[partition as usize];
        let offset = plog.high_watermark();
        plog.entries.push(LogEntry {
            key: record.key,
            value: record.value,
            headers: record.headers,
            timestamp,
            state: if in_txn {
                EntryState::Open
            } else {
                EntryState::Committed
            },
        });
        if in_txn {
            plog.open.insert(offset);
            let id = self.txn_id()?.to_string();
            if let Some(entry) = state.txns.get_mut(&id) {
                entry.records.push((topic.to_string(), partition, offset));
            }
        }
        drop(state);

        self.hub.data.notify_waiters();
        Ok(Receipt {
            topic: topic.to_string(),
            partition,
            offset,
            timestamp,
        })
    }

    async fn fetch(&self) -> Result<Option<ConsumedRecord>> {
        self.ensure_connected()?;
        let deadline = tokio::time::Instant::now() + self.config.fetch_max_wait;

        loop {
            // Register for wakeups before scanning so a produce landing
            // between scan and park is never missed.
            let notified = self.hub.data.notified();
            tokio::pin!(notified);

            self.ensure_connected()?;
            if let Some(record) = self.try_fetch_once()? {
                return Ok(Some(record));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.ensure_connected()?;
        let group = self.group_id()?.to_string();
        let mut state = self.hub.state.write();
        state
            .committed
            .entry(group)
            .or_default()
            .insert(TopicPartition::new(topic, partition), offset);
        Ok(())
    }

    async fn committed(&self, topic: &str, partition: i32) -> Result<Option<i64>> {
        self.ensure_connected()?;
        let group = self.group_id()?.to_string();
        let state = self.hub.state.read();
        Ok(state
            .committed
            .get(&group)
            .and_then(|offsets| offsets.get(&TopicPartition::new(topic, partition)))
            .copied())
    }

    async fn init_transactions(&self, _timeout: Duration) -> Result<()> {
        self.ensure_connected()?;
        let id = self.txn_id()?.to_string();
        let mut state = self.hub.state.write();
        state.txns.entry(id).or_default();
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.ensure_connected()?;
        let id = self.txn_id()?.to_string();
        let mut state = self.hub.state.write();
        let entry = state
            .txns
            .get_mut(&id)
            .ok_or_else(|| Error::Transaction(format!("transactional id not initialized: {id}")))?;
        if entry.open {
            return Err(Error::Transaction(format!(
                "transaction already in progress for {id}"
            )));
        }
        entry.open = true;
        entry.records.clear();
        Ok(())
    }

    async fn commit_transaction(&self, _timeout: Duration) -> Result<()> {
        self.ensure_connected()?;
        let id = self.txn_id()?.to_string();
        let mut state = self.hub.state.write();
        let records = {
            let entry = state
                .txns
                .get_mut(&id)
                .ok_or_else(|| Error::Transaction(format!("transactional id not initialized: {id}")))?;
            if !entry.open {
                return Err(Error::Transaction(format!("no open transaction for {id}")));
            }
            entry.open = false;
            std::mem::take(&mut entry.records)
        };
        let count = records.len();
        for (topic, partition, offset) in records {
            if let Some(log) = state.topics.get_mut(&topic) {
                let plog = &mut log.partitions[partition as usize];
                plog.entries[offset as usize].state = EntryState::Committed;
                plog.open.remove(&offset);
            }
        }
        drop(state);

        debug!(txn_id = %id, records = count, "transaction committed");
        self.hub.data.notify_waiters();
        Ok(())
    }

    async fn abort_transaction(&self, _timeout: Duration) -> Result<()> {
        self.ensure_connected()?;
        let id = self.txn_id()?.to_string();
        let mut state = self.hub.state.write();
        let records = {
            let entry = state
                .txns
                .get_mut(&id)
                .ok_or_else(|| Error::Transaction(format!("transactional id not initialized: {id}")))?;
            if !entry.open {
                return Err(Error::Transaction(format!("no open transaction for {id}")));
            }
            entry.open = false;
            std::mem::take(&mut entry.records)
        };
        let count = records.len();
        for (topic, partition, offset) in records {
            if let Some(log) = state.topics.get_mut(&topic) {
                let plog = &mut log.partitions[partition as usize];
                plog.entries[offset as usize].state = EntryState::Aborted;
                plog.open.remove(&offset);
            }
        }
        drop(state);

        debug!(txn_id = %id, records = count, "transaction aborted");
        self.hub.data.notify_waiters();
        Ok(())
    }

    async fn watermarks(&self, topic: &str, partition: i32) -> Result<(i64, i64)> {
        self.ensure_connected()?;
        let mut state = self.hub.state.write();
        let default_partitions = self.hub.default_partitions;
        let log = state.ensure_topic(topic, default_partitions);
        let plog = log
            .partitions
            .get(partition as usize)
            .ok_or_else(|| Error::Broker(format!("partition {partition} out of range for topic {topic}")))?;
        // No retention in this broker, so the low watermark never moves.
        Ok((0, plog.high_watermark()))
    }

    async fn partitions_for(&self, topic: &str) -> Result<Vec<i32>> {
        self.ensure_connected()?;
        let mut state = self.hub.state.write();
        let default_partitions = self.hub.default_partitions;
        let log = state.ensure_topic(topic, default_partitions);
        Ok((0..log.partitions.len() as i32).collect())
    }

    async fn flush(&self) -> Result<()> {
        // Appends are synchronous here; nothing is ever buffered.
        self.ensure_connected()
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        // Wake parked fetchers so they observe the closed connection.
        self.hub.data.notify_waiters();
        Ok(())
    }
}
