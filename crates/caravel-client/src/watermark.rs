//! Partition watermark queries and drain tracking.
//!
//! The high watermark is the broker-reported next offset to be written, so
//! summing it across partitions approximates total message count. Totals
//! are queried live on every call, never cached.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use caravel_core::TopicPartition;

use crate::consumer::Consumer;
use crate::error::Result;
use crate::transport::BrokerTransport;

/// Cadence for re-checking the total during [`WatermarkMonitor::flush`].
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Point-in-time watermarks of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionWatermark {
    pub partition: TopicPartition,
    /// Earliest offset still present.
    pub low: i64,
    /// Next offset to be written.
    pub high: i64,
    /// The group's committed position, when the monitor queries one (see
    /// [`WatermarkMonitor::with_consumed_positions`]).
    pub consumed: Option<i64>,
}

impl PartitionWatermark {
    /// Records currently held by the partition.
    pub fn depth(&self) -> i64 {
        self.high - self.low
    }

    /// Records the group has yet to consume. Without a committed position
    /// the whole retained range counts.
    pub fn lag(&self) -> i64 {
        self.high - self.consumed.unwrap_or(self.low)
    }
}

/// Live watermark view over a fixed set of topics.
pub struct WatermarkMonitor {
    transport: Arc<dyn BrokerTransport>,
    topics: Vec<String>,
    query_consumed: bool,
}

impl WatermarkMonitor {
    pub fn new<I, S>(transport: Arc<dyn BrokerTransport>, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            transport,
            topics: topics.into_iter().map(Into::into).collect(),
            query_consumed: false,
        }
    }

    /// Monitor the topics a consumer is subscribed to, over the consumer's
    /// own connection (so committed-offset queries see its group).
    pub fn for_consumer(consumer: &Consumer) -> Self {
        Self::new(consumer.transport(), consumer.settings().topics.clone())
            .with_consumed_positions()
    }

    /// Also snapshot the committed position of each partition. The
    /// connection must be group-bound or watermark queries will fail the
    /// way [`BrokerTransport::committed`] fails.
    pub fn with_consumed_positions(mut self) -> Self {
        self.query_consumed = true;
        self
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Watermarks for every partition of every monitored topic.
    pub async fn partition_watermarks(&self) -> Result<Vec<PartitionWatermark>> {
        let mut out = Vec::new();
        for topic in &self.topics {
            for partition in self.transport.partitions_for(topic).await? {
                let (low, high) = self.transport.watermarks(topic, partition).await?;
                let consumed = if self.query_consumed {
                    self.transport.committed(topic, partition).await?
                } else {
                    None
                };
                out.push(PartitionWatermark {
                    partition: TopicPartition::new(topic.clone(), partition),
                    low,
                    high,
                    consumed,
                });
            }
        }
        Ok(out)
    }

    /// Sum of high watermarks across all monitored partitions, a proxy for
    /// total message count.
    pub async fn total_messages_in_topics(&self) -> Result<i64> {
        let mut total = 0i64;
        for topic in &self.topics {
            for partition in self.transport.partitions_for(topic).await? {
                let (_, high) = self.transport.watermarks(topic, partition).await?;
                total += high;
            }
        }
        Ok(total)
    }

    /// Broker-side lag: `high watermark - committed offset`, summed across
    /// partitions. Requires a group-bound connection (see
    /// [`for_consumer`](Self::for_consumer)); partitions with no committed
    /// offset count from their low watermark.
    pub async fn total_lag(&self) -> Result<i64> {
        let mut lag = 0i64;
        for topic in &self.topics {
            for partition in self.transport.partitions_for(topic).await? {
                let (low, high) = self.transport.watermarks(topic, partition).await?;
                let committed = self
                    .transport
                    .committed(topic, partition)
                    .await?
                    .unwrap_or(low);
                lag += high - committed;
            }
        }
        Ok(lag)
    }

    /// Poll [`total_messages_in_topics`](Self::total_messages_in_topics)
    /// until it reaches zero or `timeout` elapses. Returns whether the
    /// topics drained.
    ///
    /// The total is the literal high-watermark sum, which only reaches
    /// zero for topics that have never held data (or were truncated), not
    /// for topics that were consumed; use [`total_lag`](Self::total_lag)
    /// to wait on consumption progress instead.
    pub async fn flush(&self, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let total = self.total_messages_in_topics().await?;
            if total == 0 {
                return Ok(true);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                debug!(total, "flush timed out with messages remaining");
                return Ok(false);
            }
            let wait = FLUSH_POLL_INTERVAL.min(deadline - now);
            tokio::time::sleep(wait).await;
        }
    }
}

impl std::fmt::Debug for WatermarkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatermarkMonitor")
            .field("topics", &self.topics)
            .field("query_consumed", &self.query_consumed)
            .finish()
    }
}
