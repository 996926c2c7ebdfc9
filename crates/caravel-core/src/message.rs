//! Record and header types shared by the producer and consumer sides.
//!
//! Outbound [`Record`]s are constructed fresh per publish call; inbound
//! [`ConsumedRecord`]s are immutable once read from the broker, except for
//! the diagnostic headers attached on permanent processing failure.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Header carrying the trace id attached to every published record.
pub const HEADER_TRACE_ID: &str = "caravel-trace-id";
/// Header carrying the correlation id attached to every published record.
pub const HEADER_CORRELATION_ID: &str = "caravel-correlation-id";
/// Header carrying the producer-side RFC 3339 timestamp.
pub const HEADER_PRODUCED_AT: &str = "caravel-produced-at";
/// Header carrying the duplicate-detection key for idempotent publishes.
pub const HEADER_IDEMPOTENCE_KEY: &str = "caravel-idempotence-key";

/// Diagnostic headers attached when a record is escalated after permanent
/// processing failure.
pub const HEADER_FAILURE_TOPIC: &str = "caravel-failure-original-topic";
pub const HEADER_FAILURE_PARTITION: &str = "caravel-failure-original-partition";
pub const HEADER_FAILURE_OFFSET: &str = "caravel-failure-original-offset";
pub const HEADER_FAILURE_ERROR_TYPE: &str = "caravel-failure-error-type";
pub const HEADER_FAILURE_ERROR_MESSAGE: &str = "caravel-failure-error-message";
pub const HEADER_FAILURE_ATTEMPTS: &str = "caravel-failure-attempts";
pub const HEADER_FAILURE_AT: &str = "caravel-failure-at";

/// An ordered `String → bytes` header mapping.
///
/// Iteration preserves insertion order. [`insert`](Self::insert) overwrites
/// an existing key in place (keeping its position); [`append`](Self::append)
/// always adds a new entry, so a key may appear more than once.
/// [`get`](Self::get) returns the first value for a key.
///
/// # Example
/// ```
/// # use caravel_core::message::Headers;
/// let mut headers = Headers::new();
/// headers.insert("source", b"billing".to_vec());
/// headers.append("source", b"retry".to_vec());
/// headers.insert("source", b"audit".to_vec()); // overwrites the first entry
/// assert_eq!(headers.get("source"), Some(&b"audit".to_vec()));
/// assert_eq!(headers.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, Vec<u8>)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Set `key` to `value`, overwriting the first existing entry in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    /// Add an entry without touching existing ones with the same key.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.0.push((key.into(), value.into()));
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Vec<u8>> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// First value under `key`, decoded as UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Vec<u8>)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An outbound record, built fresh for each publish call.
///
/// The key drives partition routing; records without a key (and without an
/// explicit partition) are spread round-robin style by the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub key: Option<String>,
    pub value: Bytes,
    pub headers: Headers,
    /// Explicit partition override; `None` routes by key hash.
    pub partition: Option<i32>,
    /// Producer-assigned timestamp; `None` lets the broker assign one.
    pub timestamp: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            key: None,
            value: value.into(),
            headers: Headers::new(),
            partition: None,
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(key, value);
        self
    }
}

/// A record read from the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    /// Monotonic within the partition.
    pub offset: i64,
    pub key: Option<String>,
    pub value: Bytes,
    pub headers: Headers,
    pub timestamp: DateTime<Utc>,
}

impl ConsumedRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition {
            topic: self.topic.clone(),
            partition: self.partition,
        }
    }
}

/// Broker acknowledgment for a published record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Receipt {
    pub topic: String,
    pub partition: i32,
    /// Assigned offset, or -1 when the delivery mode does not wait for one.
    pub offset: i64,
    pub timestamp: DateTime<Utc>,
}

/// A `(topic, partition)` pair, usable as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Write-once diagnostic context attached to a record escalated after
/// permanent processing failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureInfo {
    pub error_type: String,
    pub error_message: String,
    /// Handler invocations performed before escalation (1 when no retry ran).
    pub attempt_count: u32,
    pub failed_at: DateTime<Utc>,
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
}

impl FailureInfo {
    pub fn new(
        error_type: impl Into<String>,
        error_message: impl Into<String>,
        attempt_count: u32,
        record: &ConsumedRecord,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            attempt_count,
            failed_at: Utc::now(),
            original_topic: record.topic.clone(),
            original_partition: record.partition,
            original_offset: record.offset,
        }
    }

    /// Flatten into the well-known diagnostic headers. Values are written
    /// with overwrite semantics so re-escalation never stacks duplicates.
    pub fn apply_to(&self, headers: &mut Headers) {
        headers.insert(HEADER_FAILURE_TOPIC, self.original_topic.as_bytes());
        headers.insert(
            HEADER_FAILURE_PARTITION,
            self.original_partition.to_string(),
        );
        headers.insert(HEADER_FAILURE_OFFSET, self.original_offset.to_string());
        headers.insert(HEADER_FAILURE_ERROR_TYPE, self.error_type.as_bytes());
        headers.insert(HEADER_FAILURE_ERROR_MESSAGE, self.error_message.as_bytes());
        headers.insert(HEADER_FAILURE_ATTEMPTS, self.attempt_count.to_string());
        headers.insert(HEADER_FAILURE_AT, self.failed_at.to_rfc3339());
    }
}
