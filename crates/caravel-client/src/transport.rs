//! The broker transport boundary.
//!
//! Everything below the delivery engine — wire protocol, connection
//! management, broker metadata — lives behind [`BrokerTransport`]. The
//! engine never reimplements broker plumbing; it drives an injected
//! transport configured through [`TransportConfig`], which is what the
//! delivery strategies write their acknowledgment / idempotence / isolation
//! requirements into.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use caravel_core::{ConsumedRecord, Receipt, Record};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Producer acknowledgment level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Acks {
    /// No acknowledgment wait (fire-and-forget).
    None,
    /// Leader-only acknowledgment.
    #[default]
    Leader,
    /// All in-sync replicas must acknowledge.
    All,
}

impl Acks {
    /// Kafka-style config value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Acks::None => "0",
            Acks::Leader => "1",
            Acks::All => "all",
        }
    }
}

/// Consumer read isolation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// All records, including those from open transactions.
    #[default]
    ReadUncommitted,
    /// Only records from committed transactions.
    ReadCommitted,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "read_uncommitted",
            IsolationLevel::ReadCommitted => "read_committed",
        }
    }
}

/// Transport configuration, written by the delivery strategies and consumed
/// by a [`BrokerConnector`] when establishing a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Consumer group; `None` for producer connections.
    pub group_id: Option<String>,
    /// Topics a consumer connection fetches from.
    pub topics: Vec<String>,
    pub acks: Acks,
    pub enable_idempotence: bool,
    /// Maximum unacknowledged in-flight requests.
    pub max_in_flight: usize,
    /// Transport-level send retries.
    pub retries: u32,
    pub retry_backoff: Duration,
    /// Transactional id; set only for transactional producer connections.
    pub transactional_id: Option<String>,
    pub transaction_timeout: Duration,
    pub isolation: IsolationLevel,
    /// Timer-driven offset commit, independent of processing.
    pub auto_commit: bool,
    pub auto_commit_interval: Duration,
    /// Upper bound on how long a single `fetch` may wait for data.
    pub fetch_max_wait: Duration,
    /// Per-call timeout for produce requests.
    pub request_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            group_id: None,
            topics: Vec::new(),
            acks: Acks::Leader,
            enable_idempotence: false,
            max_in_flight: 5,
            retries: 3,
            retry_backoff: Duration::from_millis(100),
            transactional_id: None,
            transaction_timeout: Duration::from_secs(60),
            isolation: IsolationLevel::ReadUncommitted,
            auto_commit: false,
            auto_commit_interval: Duration::from_secs(5),
            fetch_max_wait: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// A live, configured connection to the broker.
///
/// Implementations are group-bound (consumer side) and transaction-bound
/// (producer side) by the [`TransportConfig`] they were connected with.
/// After [`disconnect`](Self::disconnect) every call fails with
/// [`Error::Disconnected`](crate::Error::Disconnected).
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Append one record, honoring the configured acknowledgment level.
    async fn produce(&self, topic: &str, record: Record) -> Result<Receipt>;

    /// Pull the next record for the bound group, waiting up to
    /// `fetch_max_wait`. `None` means nothing new (or an end-of-stream
    /// marker the caller should skip).
    async fn fetch(&self) -> Result<Option<ConsumedRecord>>;

    /// Commit the group's position for one partition. The committed offset
    /// is the NEXT offset to read, i.e. `record.offset + 1`.
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;

    /// Last committed position for one partition, if any.
    async fn committed(&self, topic: &str, partition: i32) -> Result<Option<i64>>;

    /// Register the bound transactional id with the broker.
    async fn init_transactions(&self, timeout: Duration) -> Result<()>;

    async fn begin_transaction(&self) -> Result<()>;

    async fn commit_transaction(&self, timeout: Duration) -> Result<()>;

    async fn abort_transaction(&self, timeout: Duration) -> Result<()>;

    /// `(low, high)` watermarks for one partition; `high` is the next
    /// offset to be written.
    async fn watermarks(&self, topic: &str, partition: i32) -> Result<(i64, i64)>;

    async fn partitions_for(&self, topic: &str) -> Result<Vec<i32>>;

    /// Wait until buffered sends are acknowledged.
    async fn flush(&self) -> Result<()>;

    /// Force-close the connection. Idempotent.
    async fn disconnect(&self) -> Result<()>;
}

/// Builds configured transport connections.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, config: &TransportConfig) -> Result<Arc<dyn BrokerTransport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acks_config_values() {
        assert_eq!(Acks::None.as_str(), "0");
        assert_eq!(Acks::Leader.as_str(), "1");
        assert_eq!(Acks::All.as_str(), "all");
    }

    #[test]
    fn isolation_config_values() {
        assert_eq!(IsolationLevel::ReadUncommitted.as_str(), "read_uncommitted");
        assert_eq!(IsolationLevel::ReadCommitted.as_str(), "read_committed");
    }

    #[test]
    fn config_defaults_are_conservative() {
        let config = TransportConfig::default();
        assert_eq!(config.acks, Acks::Leader);
        assert!(!config.enable_idempotence);
        assert!(!config.auto_commit);
        assert_eq!(config.isolation, IsolationLevel::ReadUncommitted);
        assert!(config.transactional_id.is_none());
    }
}
