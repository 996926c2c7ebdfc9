//! Producing client bound to one delivery guarantee.
//!
//! A [`Producer`] is created from [`ProducerSettings`], connects once, and
//! routes every publish through the strategy its guarantee selected. Clones
//! share the connection, the strategy, and the stats.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use caravel_core::{
    Receipt, Record, HEADER_CORRELATION_ID, HEADER_IDEMPOTENCE_KEY, HEADER_PRODUCED_AT,
    HEADER_TRACE_ID,
};

use crate::error::{Error, Result};
use crate::metrics::ClientMetrics;
use crate::settings::ProducerSettings;
use crate::strategy::ProducerStrategy;
use crate::transport::{BrokerConnector, BrokerTransport, TransportConfig};
use crate::txn::TransactionalSession;

/// Producing client handle. Cheap to clone.
pub struct Producer {
    inner: Arc<ProducerInner>,
}

struct ProducerInner {
    settings: ProducerSettings,
    transport: Arc<dyn BrokerTransport>,
    strategy: ProducerStrategy,
    stats: ProducerStats,
    closed: AtomicBool,
}

impl Clone for Producer {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Producer {
    /// Connect to the broker and bind the strategy for
    /// `settings.delivery`.
    pub async fn connect(
        connector: &dyn BrokerConnector,
        settings: ProducerSettings,
    ) -> Result<Self> {
        settings.validate()?;

        let mut config = TransportConfig::default();
        ProducerStrategy::apply(&settings, &mut config);
        let transport = connector.connect(&config).await?;
        let strategy = ProducerStrategy::new(&settings, transport.clone())?;

        info!(
            name = %settings.name,
            delivery = settings.delivery.as_str(),
            "producer connected"
        );

        Ok(Self {
            inner: Arc::new(ProducerInner {
                settings,
                transport,
                strategy,
                stats: ProducerStats::default(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.settings.name
    }

    pub fn settings(&self) -> &ProducerSettings {
        &self.inner.settings
    }

    /// The underlying connection. Needed for raw sends inside
    /// [`execute_in_transaction`](Self::execute_in_transaction).
    pub fn transport(&self) -> Arc<dyn BrokerTransport> {
        self.inner.transport.clone()
    }

    /// The transaction session, when this producer is transactional.
    pub fn session(&self) -> Option<&TransactionalSession> {
        self.inner.strategy.session()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    /// Publish one record.
    ///
    /// What "published" means depends on the guarantee: fire-and-forget
    /// returns before the broker confirms (receipt offset is `-1`),
    /// acknowledged waits for confirmation with retries, transactional
    /// wraps the send in its own commit.
    pub async fn publish(&self, topic: &str, record: Record) -> Result<Receipt> {
        self.ensure_open()?;
        let mut record = record;
        self.decorate(&mut record);

        let started = Instant::now();
        let result = self.inner.strategy.publish(topic, record).await;
        ClientMetrics::record_publish_latency(started.elapsed());

        match &result {
            Ok(receipt) => {
                self.inner.stats.published.fetch_add(1, Ordering::Relaxed);
                ClientMetrics::increment_records_published(
                    self.inner.settings.delivery.as_str(),
                    1,
                );
                debug!(
                    topic,
                    partition = receipt.partition,
                    offset = receipt.offset,
                    "record published"
                );
            }
            Err(err) => {
                self.inner.stats.errors.fetch_add(1, Ordering::Relaxed);
                ClientMetrics::increment_publish_errors();
                warn!(topic, error = %err, "publish failed");
            }
        }
        result
    }

    /// Publish a batch by fanning out individual publishes. Outcomes are
    /// independent per record: one rejected record does not stop the rest,
    /// and each record stays individually addressable on the broker. Under
    /// exactly-once each record commits in its own transaction.
    pub async fn publish_batch(
        &self,
        topic: &str,
        records: Vec<Record>,
    ) -> Result<Vec<Result<Receipt>>> {
        self.ensure_open()?;

        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            outcomes.push(self.publish(topic, record).await);
        }

        let failed = outcomes.iter().filter(|o| o.is_err()).count();
        debug!(
            topic,
            records = outcomes.len(),
            failed,
            "batch publish finished"
        );
        Ok(outcomes)
    }

    /// Publish to the dead-letter companion of `original_topic`, formed by
    /// appending the configured suffix.
    pub async fn publish_to_dead_letter(
        &self,
        original_topic: &str,
        record: Record,
    ) -> Result<Receipt> {
        let topic = format!(
            "{original_topic}{}",
            self.inner.settings.dead_letter_suffix
        );
        let receipt = self.publish(&topic, record).await?;
        self.inner.stats.dead_letters.fetch_add(1, Ordering::Relaxed);
        ClientMetrics::increment_dead_letters_published();
        Ok(receipt)
    }

    /// Run `op` inside one broker transaction on this producer's session.
    ///
    /// Sends inside the closure must go through [`transport`](Self::transport):
    /// [`publish`](Self::publish) opens its own transaction and would wait
    /// forever on the session lock this call already holds.
    pub async fn execute_in_transaction<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T>> + Send,
        T: Send,
    {
        match self.inner.strategy.session() {
            Some(session) => session.execute_in_transaction(op).await,
            None => Err(Error::InvalidSettings(format!(
                "producer {} is not transactional",
                self.inner.settings.name
            ))),
        }
    }

    /// Wait until every record handed to the transport has been sent.
    pub async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.inner.transport.flush().await
    }

    /// Flush and disconnect. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(err) = self.inner.transport.flush().await {
            warn!(name = %self.inner.settings.name, error = %err, "flush during close failed");
        }
        self.inner.transport.disconnect().await?;
        info!(name = %self.inner.settings.name, "producer closed");
        Ok(())
    }

    pub fn stats(&self) -> ProducerStatsSnapshot {
        ProducerStatsSnapshot {
            published: self.inner.stats.published.load(Ordering::Relaxed),
            errors: self.inner.stats.errors.load(Ordering::Relaxed),
            dead_letters: self.inner.stats.dead_letters.load(Ordering::Relaxed),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(Error::Disconnected);
        }
        Ok(())
    }

    /// Stamp tracing and idempotence headers without clobbering
    /// caller-set values.
    fn decorate(&self, record: &mut Record) {
        if !record.headers.contains_key(HEADER_TRACE_ID) {
            record
                .headers
                .insert(HEADER_TRACE_ID, Uuid::new_v4().to_string().into_bytes());
        }
        if !record.headers.contains_key(HEADER_CORRELATION_ID) {
            record.headers.insert(
                HEADER_CORRELATION_ID,
                Uuid::new_v4().to_string().into_bytes(),
            );
        }
        record.headers.insert(
            HEADER_PRODUCED_AT,
            Utc::now().timestamp_millis().to_string().into_bytes(),
        );
        if self.inner.settings.enable_idempotence
            && !record.headers.contains_key(HEADER_IDEMPOTENCE_KEY)
        {
            record.headers.insert(
                HEADER_IDEMPOTENCE_KEY,
                Uuid::new_v4().to_string().into_bytes(),
            );
        }
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("name", &self.inner.settings.name)
            .field("delivery", &self.inner.settings.delivery)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Default)]
struct ProducerStats {
    published: AtomicU64,
    errors: AtomicU64,
    dead_letters: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct ProducerStatsSnapshot {
    pub published: u64,
    pub errors: u64,
    pub dead_letters: u64,
}
