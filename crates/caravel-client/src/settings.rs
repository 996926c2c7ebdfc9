//! Per-instance configuration for producers and consumers.
//!
//! Settings are read-only after construction: the delivery guarantee is
//! chosen once per instance and cannot change for that instance's lifetime.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Delivery semantics
// ============================================================================

/// The delivery guarantee an instance operates under.
///
/// `DeadLetter` behaves exactly like `AtLeastOnce`; it differs only in that
/// permanently failing records are additionally published to
/// `<topic><dead_letter_suffix>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliverySemantics {
    /// Fire-and-forget: no acknowledgment wait, no retries, loss possible.
    AtMostOnce,
    /// Full-replica acknowledgment, idempotent retries, duplicates possible
    /// downstream of the broker.
    #[default]
    AtLeastOnce,
    /// Transactional production and committed-only reads.
    ExactlyOnce,
    /// `AtLeastOnce` plus dead-letter routing on permanent failure.
    DeadLetter,
}

impl DeliverySemantics {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliverySemantics::AtMostOnce => "at-most-once",
            DeliverySemantics::AtLeastOnce => "at-least-once",
            DeliverySemantics::ExactlyOnce => "exactly-once",
            DeliverySemantics::DeadLetter => "dead-letter",
        }
    }
}

impl std::fmt::Display for DeliverySemantics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliverySemantics {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "at-most-once" => Ok(DeliverySemantics::AtMostOnce),
            "at-least-once" => Ok(DeliverySemantics::AtLeastOnce),
            "exactly-once" => Ok(DeliverySemantics::ExactlyOnce),
            "dead-letter" => Ok(DeliverySemantics::DeadLetter),
            other => Err(Error::InvalidSettings(format!(
                "unknown delivery semantics: {other}"
            ))),
        }
    }
}

// ============================================================================
// Producer settings
// ============================================================================

/// Producer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerSettings {
    /// Logical instance name (pool key, logging identity).
    pub name: String,
    /// Delivery guarantee for every publish through this instance.
    pub delivery: DeliverySemantics,
    /// Attach a per-record duplicate-detection header under `AtLeastOnce`.
    pub enable_idempotence: bool,
    /// Transport-level retry budget for acknowledged sends.
    pub max_retries: u32,
    /// Initial retry backoff.
    pub retry_backoff: Duration,
    /// Backoff growth cap.
    pub retry_backoff_max: Duration,
    /// Transactional id; required (and only meaningful) for `ExactlyOnce`.
    pub transactional_id: Option<String>,
    /// Broker-call timeout for transaction commit/abort.
    pub transaction_timeout: Duration,
    /// Per-publish broker-call timeout.
    pub request_timeout: Duration,
    /// Suffix appended to the original topic for dead-letter publishes.
    pub dead_letter_suffix: String,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            name: "producer".to_string(),
            delivery: DeliverySemantics::AtLeastOnce,
            enable_idempotence: false,
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(5),
            transactional_id: None,
            transaction_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            dead_letter_suffix: ".DLT".to_string(),
        }
    }
}

impl ProducerSettings {
    pub fn builder() -> ProducerSettingsBuilder {
        ProducerSettingsBuilder::default()
    }

    /// Fire-and-forget preset.
    pub fn at_most_once(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delivery: DeliverySemantics::AtMostOnce,
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Acknowledged preset with idempotent retries.
    pub fn at_least_once(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delivery: DeliverySemantics::AtLeastOnce,
            enable_idempotence: true,
            ..Default::default()
        }
    }

    /// Transactional preset.
    pub fn exactly_once(name: impl Into<String>, transactional_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delivery: DeliverySemantics::ExactlyOnce,
            enable_idempotence: true,
            transactional_id: Some(transactional_id.into()),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidSettings("producer name is empty".into()));
        }
        if self.retry_backoff > self.retry_backoff_max {
            return Err(Error::InvalidSettings(
                "retry_backoff exceeds retry_backoff_max".into(),
            ));
        }
        if self.delivery == DeliverySemantics::ExactlyOnce
            && self
                .transactional_id
                .as_deref()
                .map_or(true, |id| id.is_empty())
        {
            return Err(Error::InvalidSettings(
                "exactly-once delivery requires a transactional_id".into(),
            ));
        }
        if self.transaction_timeout.is_zero() {
            return Err(Error::InvalidSettings(
                "transaction_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`ProducerSettings`].
#[derive(Default)]
pub struct ProducerSettingsBuilder {
    settings: ProducerSettings,
}

impl ProducerSettingsBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.settings.name = name.into();
        self
    }

    pub fn delivery(mut self, delivery: DeliverySemantics) -> Self {
        self.settings.delivery = delivery;
        self
    }

    pub fn enable_idempotence(mut self, enabled: bool) -> Self {
        self.settings.enable_idempotence = enabled;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.settings.max_retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.settings.retry_backoff = backoff;
        self
    }

    pub fn retry_backoff_max(mut self, backoff: Duration) -> Self {
        self.settings.retry_backoff_max = backoff;
        self
    }

    pub fn transactional_id(mut self, id: impl Into<String>) -> Self {
        self.settings.transactional_id = Some(id.into());
        self
    }

    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.settings.transaction_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.settings.request_timeout = timeout;
        self
    }

    pub fn dead_letter_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.settings.dead_letter_suffix = suffix.into();
        self
    }

    pub fn build(self) -> Result<ProducerSettings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

// ============================================================================
// Consumer settings
// ============================================================================

/// Consumer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSettings {
    /// Logical instance name (pool key, logging identity).
    pub name: String,
    /// Consumer group id.
    pub group_id: String,
    /// Subscribed topics.
    pub topics: Vec<String>,
    /// Delivery guarantee for record processing.
    pub delivery: DeliverySemantics,
    /// Bounded-queue capacity between ingestion and workers.
    pub channel_capacity: usize,
    /// Processing worker count; `None` sizes to half the available
    /// processors, minimum 1.
    pub workers: Option<usize>,
    /// Bound on ingestion backoff growth (exponent cap).
    pub max_retries: u32,
    /// Initial retry backoff.
    pub retry_backoff: Duration,
    /// Backoff growth cap.
    pub retry_backoff_max: Duration,
    /// Commit cadence under `AtMostOnce` auto-acknowledge.
    pub auto_commit_interval: Duration,
    /// Suffix appended to the original topic for dead-letter routing.
    pub dead_letter_suffix: String,
    /// Grace period for pipeline drain on unsubscribe before the transport
    /// is force-closed.
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            name: "consumer".to_string(),
            group_id: String::new(),
            topics: Vec::new(),
            delivery: DeliverySemantics::AtLeastOnce,
            channel_capacity: 1024,
            workers: None,
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(5),
            auto_commit_interval: Duration::from_secs(5),
            dead_letter_suffix: ".DLT".to_string(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ConsumerSettings {
    pub fn builder() -> ConsumerSettingsBuilder {
        ConsumerSettingsBuilder::default()
    }

    /// Effective worker-pool size.
    pub fn worker_count(&self) -> usize {
        match self.workers {
            Some(n) => n.max(1),
            None => std::thread::available_parallelism()
                .map(|n| n.get() / 2)
                .unwrap_or(1)
                .max(1),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidSettings("consumer name is empty".into()));
        }
        if self.group_id.is_empty() {
            return Err(Error::InvalidSettings("group_id is required".into()));
        }
        if self.topics.is_empty() {
            return Err(Error::InvalidSettings(
                "at least one topic is required".into(),
            ));
        }
        if self.topics.iter().any(|t| t.is_empty()) {
            return Err(Error::InvalidSettings("topic names must be non-empty".into()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::InvalidSettings(
                "channel_capacity must be at least 1".into(),
            ));
        }
        if self.workers == Some(0) {
            return Err(Error::InvalidSettings("workers must be at least 1".into()));
        }
        if self.retry_backoff > self.retry_backoff_max {
            return Err(Error::InvalidSettings(
                "retry_backoff exceeds retry_backoff_max".into(),
            ));
        }
        if self.delivery == DeliverySemantics::DeadLetter && self.dead_letter_suffix.is_empty() {
            return Err(Error::InvalidSettings(
                "dead-letter delivery requires a dead_letter_suffix".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`ConsumerSettings`].
#[derive(Default)]
pub struct ConsumerSettingsBuilder {
    settings: ConsumerSettings,
}

impl ConsumerSettingsBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.settings.name = name.into();
        self
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.settings.group_id = group_id.into();
        self
    }

    pub fn topics(mut self, topics: Vec<String>) -> Self {
        self.settings.topics = topics;
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.settings.topics.push(topic.into());
        self
    }

    pub fn delivery(mut self, delivery: DeliverySemantics) -> Self {
        self.settings.delivery = delivery;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.settings.channel_capacity = capacity;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.settings.workers = Some(workers);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.settings.max_retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.settings.retry_backoff = backoff;
        self
    }

    pub fn retry_backoff_max(mut self, backoff: Duration) -> Self {
        self.settings.retry_backoff_max = backoff;
        self
    }

    pub fn auto_commit_interval(mut self, interval: Duration) -> Self {
        self.settings.auto_commit_interval = interval;
        self
    }

    pub fn dead_letter_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.settings.dead_letter_suffix = suffix.into();
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.settings.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ConsumerSettings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_defaults() {
        let settings = ProducerSettings::default();
        assert_eq!(settings.delivery, DeliverySemantics::AtLeastOnce);
        assert!(!settings.enable_idempotence);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.dead_letter_suffix, ".DLT");
        settings.validate().unwrap();
    }

    #[test]
    fn producer_builder_chain() {
        let settings = ProducerSettings::builder()
            .name("orders")
            .delivery(DeliverySemantics::AtLeastOnce)
            .enable_idempotence(true)
            .max_retries(7)
            .retry_backoff(Duration::from_millis(50))
            .build()
            .unwrap();

        assert_eq!(settings.name, "orders");
        assert!(settings.enable_idempotence);
        assert_eq!(settings.max_retries, 7);
    }

    #[test]
    fn exactly_once_requires_transactional_id() {
        let err = ProducerSettings::builder()
            .name("orders")
            .delivery(DeliverySemantics::ExactlyOnce)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSettings(_)));

        ProducerSettings::builder()
            .name("orders")
            .delivery(DeliverySemantics::ExactlyOnce)
            .transactional_id("orders-txn-1")
            .build()
            .unwrap();
    }

    #[test]
    fn exactly_once_preset_is_valid() {
        let settings = ProducerSettings::exactly_once("payments", "payments-txn");
        settings.validate().unwrap();
        assert!(settings.enable_idempotence);
        assert_eq!(settings.transactional_id.as_deref(), Some("payments-txn"));
    }

    #[test]
    fn backoff_ordering_is_validated() {
        let err = ProducerSettings::builder()
            .name("p")
            .retry_backoff(Duration::from_secs(10))
            .retry_backoff_max(Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSettings(_)));
    }

    #[test]
    fn consumer_requires_group_and_topics() {
        let err = ConsumerSettings::builder().name("c").build().unwrap_err();
        assert!(matches!(err, Error::InvalidSettings(_)));

        let err = ConsumerSettings::builder()
            .name("c")
            .group_id("g1")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSettings(_)));

        ConsumerSettings::builder()
            .name("c")
            .group_id("g1")
            .topic("orders")
            .build()
            .unwrap();
    }

    #[test]
    fn consumer_rejects_zero_capacity_and_zero_workers() {
        let err = ConsumerSettings::builder()
            .name("c")
            .group_id("g1")
            .topic("orders")
            .channel_capacity(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSettings(_)));

        let err = ConsumerSettings::builder()
            .name("c")
            .group_id("g1")
            .topic("orders")
            .workers(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSettings(_)));
    }

    #[test]
    fn worker_count_has_floor_of_one() {
        let settings = ConsumerSettings {
            group_id: "g".into(),
            topics: vec!["t".into()],
            workers: None,
            ..Default::default()
        };
        assert!(settings.worker_count() >= 1);

        let pinned = ConsumerSettings {
            workers: Some(4),
            ..settings
        };
        assert_eq!(pinned.worker_count(), 4);
    }

    #[test]
    fn semantics_parse_and_display() {
        use std::str::FromStr;

        assert_eq!(
            DeliverySemantics::from_str("at-least-once").unwrap(),
            DeliverySemantics::AtLeastOnce
        );
        assert_eq!(
            DeliverySemantics::from_str("EXACTLY_ONCE").unwrap(),
            DeliverySemantics::ExactlyOnce
        );
        assert!(DeliverySemantics::from_str("best-effort").is_err());
        assert_eq!(DeliverySemantics::DeadLetter.to_string(), "dead-letter");
    }
}
