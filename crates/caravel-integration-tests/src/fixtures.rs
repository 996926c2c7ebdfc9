//! Test fixtures for integration tests
//!
//! Provides reusable test infrastructure including:
//! - An in-memory broker the whole suite runs against
//! - Settings presets tuned for fast test turnaround
//! - Test data generators

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use caravel_client::{
    BrokerConnector, ClientPool, Consumer, ConsumerSettings, DeliverySemantics, InMemoryBroker,
    PoolSettings, Producer, ProducerSettings,
};
use caravel_core::ConsumedRecord;

// ============================================================================
// TestBroker - in-memory broker
// ============================================================================

/// An in-memory broker for testing
pub struct TestBroker {
    broker: Arc<InMemoryBroker>,
}

impl TestBroker {
    /// Start a broker whose topics default to a single partition
    pub fn start() -> Self {
        Self::with_partitions(1)
    }

    /// Start a broker whose topics default to `partitions` partitions
    pub fn with_partitions(partitions: u32) -> Self {
        Self {
            broker: Arc::new(InMemoryBroker::with_default_partitions(partitions)),
        }
    }

    /// Connector handle for producers, consumers, and pools
    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        self.broker.clone()
    }

    pub fn create_topic(&self, topic: &str, partitions: u32) {
        self.broker.create_topic(topic, partitions);
    }

    /// Committed (transaction-visible) records currently held by a topic
    pub fn committed_records(&self, topic: &str) -> Vec<ConsumedRecord> {
        self.broker.committed_records(topic)
    }

    pub async fn connect_producer(&self, settings: ProducerSettings) -> Result<Producer> {
        Ok(Producer::connect(self.broker.as_ref(), settings).await?)
    }

    pub async fn connect_consumer(&self, settings: ConsumerSettings) -> Result<Consumer> {
        Ok(Consumer::connect(self.broker.as_ref(), settings).await?)
    }

    /// Pool backed by this broker
    pub fn pool(&self, max_size: usize) -> Result<ClientPool> {
        Ok(ClientPool::new(self.connector(), PoolSettings { max_size })?)
    }
}

// ============================================================================
// Settings presets
// ============================================================================

/// Producer settings with backoffs short enough for tests
pub fn producer_settings(name: &str, delivery: DeliverySemantics) -> ProducerSettings {
    ProducerSettings {
        name: name.to_string(),
        delivery,
        enable_idempotence: delivery != DeliverySemantics::AtMostOnce,
        retry_backoff: Duration::from_millis(5),
        retry_backoff_max: Duration::from_millis(50),
        ..Default::default()
    }
}

/// Transactional producer settings with a fixed transactional id
pub fn transactional_producer_settings(name: &str, transactional_id: &str) -> ProducerSettings {
    ProducerSettings {
        transactional_id: Some(transactional_id.to_string()),
        ..producer_settings(name, DeliverySemantics::ExactlyOnce)
    }
}

/// Consumer settings with timers short enough for tests
pub fn consumer_settings(
    name: &str,
    group: &str,
    topic: &str,
    delivery: DeliverySemantics,
) -> ConsumerSettings {
    ConsumerSettings {
        name: name.to_string(),
        group_id: group.to_string(),
        topics: vec![topic.to_string()],
        delivery,
        channel_capacity: 64,
        workers: Some(2),
        retry_backoff: Duration::from_millis(5),
        retry_backoff_max: Duration::from_millis(50),
        auto_commit_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

// ============================================================================
// Test Data Generators
// ============================================================================

pub mod test_data {
    use caravel_core::Record;

    /// Generate a batch of records with sequential values
    pub fn generate_records(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| Record::new(format!("message-{}", i)))
            .collect()
    }

    /// Generate keyed records; keys cycle so partitioning stays stable
    pub fn generate_keyed_records(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| Record::new(format!("value-{}", i)).with_key(format!("key-{}", i % 10)))
            .collect()
    }
}
