//! Consuming pipeline: one ingestion loop, a bounded queue, N processing
//! workers.
//!
//! The ingestion loop pulls records from the transport one at a time and
//! writes them into the bounded queue; a full queue blocks the loop rather
//! than dropping records. Workers read from the queue, run the caller's
//! [`RecordHandler`], and acknowledge through the strategy hook. Within a
//! partition records reach the queue in broker order, but workers complete
//! concurrently, so commit order across partitions is not guaranteed.
//!
//! Handler failures are retried exactly once (after a backoff) when the
//! error is classified transient. A record that still fails is escalated:
//! diagnostic headers are attached, the record goes to the dead-letter
//! topic when one is configured, and the offset is committed either way so
//! an unprocessable record cannot wedge the partition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use caravel_core::{BoundedQueue, ConsumedRecord, FailureInfo, Record, TopicPartition};

use crate::backoff::backoff_delay;
use crate::error::{Error, HandlerError, Result};
use crate::metrics::ClientMetrics;
use crate::producer::Producer;
use crate::settings::{ConsumerSettings, DeliverySemantics, ProducerSettings};
use crate::strategy::ConsumerStrategy;
use crate::transport::{BrokerConnector, BrokerTransport, TransportConfig};

/// Caller-supplied record processor.
///
/// Return [`HandlerError::InvalidInput`], [`HandlerError::InvalidOperation`],
/// or [`HandlerError::Malformed`] for failures that a retry cannot fix;
/// anything else is treated as transient and retried once.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: &ConsumedRecord) -> std::result::Result<(), HandlerError>;
}

/// Consuming client handle. Cheap to clone; all clones share the pipeline.
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    settings: ConsumerSettings,
    strategy: ConsumerStrategy,
    transport: Arc<dyn BrokerTransport>,
    queue: Arc<BoundedQueue<ConsumedRecord>>,
    /// Companion producer for permanent failures, present only under
    /// dead-letter delivery.
    dead_letter: Option<Producer>,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    /// Next offset to commit per partition, maintained by ingestion.
    /// Only the auto-commit timer reads it.
    positions: parking_lot::Mutex<HashMap<TopicPartition, i64>>,
    running: AtomicBool,
    closed: AtomicBool,
    stats: ConsumerStats,
}

impl Clone for Consumer {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Consumer {
    /// Connect to the broker, join the configured group, and prepare the
    /// pipeline for `settings.delivery`. Processing starts on
    /// [`subscribe`](Self::subscribe).
    pub async fn connect(
        connector: &dyn BrokerConnector,
        settings: ConsumerSettings,
    ) -> Result<Self> {
        settings.validate()?;

        let strategy = ConsumerStrategy::for_semantics(settings.delivery);
        let mut config = TransportConfig {
            group_id: Some(settings.group_id.clone()),
            topics: settings.topics.clone(),
            ..Default::default()
        };
        strategy.apply(&settings, &mut config);
        let transport = connector.connect(&config).await?;

        let dead_letter = if settings.delivery == DeliverySemantics::DeadLetter {
            let producer_settings = ProducerSettings {
                name: format!("{}-dead-letter", settings.name),
                delivery: DeliverySemantics::AtLeastOnce,
                enable_idempotence: true,
                dead_letter_suffix: settings.dead_letter_suffix.clone(),
                ..Default::default()
            };
            Some(Producer::connect(connector, producer_settings).await?)
        } else {
            None
        };

        let queue = Arc::new(BoundedQueue::new(settings.channel_capacity));
        let (shutdown, _) = watch::channel(false);

        info!(
            name = %settings.name,
            group = %settings.group_id,
            delivery = settings.delivery.as_str(),
            topics = ?settings.topics,
            "consumer connected"
        );

        Ok(Self {
            inner: Arc::new(ConsumerInner {
                settings,
                strategy,
                transport,
                queue,
                dead_letter,
                shutdown,
                tasks: parking_lot::Mutex::new(Vec::new()),
                positions: parking_lot::Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                stats: ConsumerStats::default(),
            }),
        })
    }

    /// Start the pipeline: one ingestion loop, the worker pool, and (under
    /// at-most-once) the auto-commit timer. Runs until
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, handler: Arc<dyn RecordHandler>) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Other(format!(
                "consumer {} is already subscribed",
                self.inner.settings.name
            )));
        }

        let workers = self.inner.settings.worker_count();
        let mut handles = Vec::with_capacity(workers + 2);

        let ingestion_inner = Arc::clone(&self.inner);
        let ingestion_shutdown = self.inner.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            ingestion_task(ingestion_inner, ingestion_shutdown).await;
        }));

        for worker in 0..workers {
            let worker_inner = Arc::clone(&self.inner);
            let worker_handler = Arc::clone(&handler);
            let worker_shutdown = self.inner.shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                worker_task(worker_inner, worker_handler, worker_shutdown, worker).await;
            }));
        }

        if self.inner.strategy.auto_commit() {
            let commit_inner = Arc::clone(&self.inner);
            let commit_shutdown = self.inner.shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                auto_commit_task(commit_inner, commit_shutdown).await;
            }));
        }

        self.inner.tasks.lock().extend(handles);
        info!(
            name = %self.inner.settings.name,
            group = %self.inner.settings.group_id,
            workers,
            "consumer subscribed"
        );
        Ok(())
    }

    /// Stop the pipeline: close the queue to new writes, raise the
    /// cancellation signal, and wait up to the configured shutdown timeout
    /// for the tasks to drain. If the timeout elapses the transport is
    /// force-disconnected and the remaining tasks are aborted. Safe to call
    /// more than once.
    pub async fn unsubscribe(&self) -> Result<()> {
        let was_running = self.inner.running.swap(false, Ordering::SeqCst);
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.queue.close();
        let _ = self.inner.shutdown.send(true);

        if was_running {
            let mut handles: Vec<JoinHandle<()>> =
                self.inner.tasks.lock().drain(..).collect();
            let deadline =
                tokio::time::Instant::now() + self.inner.settings.shutdown_timeout;
            let mut timed_out = false;

            for handle in &mut handles {
                let remaining =
                    deadline.saturating_duration_since(tokio::time::Instant::now());
                match tokio::time::timeout(remaining, &mut *handle).await {
                    Ok(Ok(())) => {}
                    Ok(Err(join_err)) => {
                        warn!(
                            name = %self.inner.settings.name,
                            error = %join_err,
                            "pipeline task ended abnormally"
                        );
                    }
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                }
            }

            if timed_out {
                warn!(
                    name = %self.inner.settings.name,
                    timeout = ?self.inner.settings.shutdown_timeout,
                    "pipeline did not drain in time; force-disconnecting"
                );
                let _ = self.inner.transport.disconnect().await;
                for handle in &handles {
                    handle.abort();
                }
            } else {
                self.inner.transport.disconnect().await?;
            }
        } else {
            self.inner.transport.disconnect().await?;
        }

        if let Some(dead_letter) = &self.inner.dead_letter {
            if let Err(err) = dead_letter.close().await {
                warn!(
                    name = %self.inner.settings.name,
                    error = %err,
                    "dead-letter producer close failed"
                );
            }
        }

        info!(name = %self.inner.settings.name, "consumer unsubscribed");
        Ok(())
    }

    /// Records pulled from the broker but not yet handed to a worker.
    /// Distinct from broker-side lag.
    pub fn pending_in_queue(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.inner.settings.name
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.inner.settings
    }

    /// The underlying connection, shared with watermark queries.
    pub fn transport(&self) -> Arc<dyn BrokerTransport> {
        self.inner.transport.clone()
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            received: self.inner.stats.received.load(Ordering::Relaxed),
            processed: self.inner.stats.processed.load(Ordering::Relaxed),
            retried: self.inner.stats.retried.load(Ordering::Relaxed),
            permanently_failed: self.inner.stats.failed.load(Ordering::Relaxed),
            dead_lettered: self.inner.stats.dead_lettered.load(Ordering::Relaxed),
            offsets_committed: self.inner.stats.committed.load(Ordering::Relaxed),
            queue_depth: self.inner.queue.len(),
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("name", &self.inner.settings.name)
            .field("group", &self.inner.settings.group_id)
            .field("delivery", &self.inner.settings.delivery)
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// Ingestion Task
// ============================================================================

/// Single loop pulling records from the transport into the bounded queue.
/// Backpressure: a full queue parks this loop until a worker drains.
async fn ingestion_task(inner: Arc<ConsumerInner>, mut shutdown: watch::Receiver<bool>) {
    let mut failures = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let fetched = tokio::select! {
            result = inner.transport.fetch() => result,
            _ = shutdown.changed() => continue,
        };

        match fetched {
            Ok(Some(record)) => {
                failures = 0;
                inner.stats.received.fetch_add(1, Ordering::Relaxed);
                ClientMetrics::increment_records_received();

                if inner.strategy.auto_commit() {
                    let mut positions = inner.positions.lock();
                    positions.insert(record.topic_partition(), record.offset + 1);
                }

                if inner.queue.send(record).await.is_err() {
                    break;
                }
                ClientMetrics::set_queue_depth(&inner.settings.name, inner.queue.len());
            }
            Ok(None) => {
                // Nothing within the fetch window; poll again.
            }
            Err(Error::Disconnected) => {
                debug!(
                    consumer = %inner.settings.name,
                    "transport disconnected; stopping ingestion"
                );
                break;
            }
            Err(err) if err.is_retryable() => {
                let exponent = failures.min(inner.settings.max_retries);
                let delay = backoff_delay(
                    exponent,
                    inner.settings.retry_backoff,
                    inner.settings.retry_backoff_max,
                );
                failures = failures.saturating_add(1);
                warn!(
                    consumer = %inner.settings.name,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "fetch failed, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(err) => {
                error!(
                    consumer = %inner.settings.name,
                    error = %err,
                    "fetch failed with non-retryable error; stopping ingestion"
                );
                break;
            }
        }
    }

    debug!(consumer = %inner.settings.name, "ingestion loop stopped");
}

// ============================================================================
// Processing Workers
// ============================================================================

/// Worker loop: drains the queue until it is closed and empty. Shutdown
/// does not skip queued records; it only abandons in-progress retry waits.
async fn worker_task(
    inner: Arc<ConsumerInner>,
    handler: Arc<dyn RecordHandler>,
    mut shutdown: watch::Receiver<bool>,
    worker: usize,
) {
    while let Some(record) = inner.queue.recv().await {
        ClientMetrics::set_queue_depth(&inner.settings.name, inner.queue.len());
        process_record(&inner, handler.as_ref(), &record, &mut shutdown).await;
    }
    debug!(consumer = %inner.settings.name, worker, "worker stopped");
}

/// Run the handler for one record: at most one retry for transient
/// failures, then escalation. The offset is committed on success and on
/// permanent failure alike; only an abandoned retry leaves it uncommitted
/// for redelivery.
async fn process_record(
    inner: &ConsumerInner,
    handler: &dyn RecordHandler,
    record: &ConsumedRecord,
    shutdown: &mut watch::Receiver<bool>,
) {
    let started = Instant::now();
    let first = handler.handle(record).await;
    ClientMetrics::record_handler_latency(started.elapsed());

    let failure = match first {
        Ok(()) => None,
        Err(err) if err.is_retryable() => {
            inner.stats.retried.fetch_add(1, Ordering::Relaxed);
            ClientMetrics::increment_handler_retries();
            let delay = backoff_delay(
                0,
                inner.settings.retry_backoff,
                inner.settings.retry_backoff_max,
            );
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "handler failed, retrying once"
            );

            if *shutdown.borrow() {
                debug!(
                    topic = %record.topic,
                    offset = record.offset,
                    "retry abandoned during shutdown"
                );
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    debug!(
                        topic = %record.topic,
                        offset = record.offset,
                        "retry abandoned during shutdown"
                    );
                    return;
                }
            }

            let retried = Instant::now();
            let second = handler.handle(record).await;
            ClientMetrics::record_handler_latency(retried.elapsed());
            match second {
                Ok(()) => None,
                Err(err) => Some((err, 2)),
            }
        }
        Err(err) => Some((err, 1)),
    };

    match failure {
        None => {
            inner.stats.processed.fetch_add(1, Ordering::Relaxed);
            ClientMetrics::increment_records_processed();
            commit_processed(inner, record).await;
        }
        Some((err, attempts)) => {
            inner.stats.failed.fetch_add(1, Ordering::Relaxed);
            ClientMetrics::increment_permanent_failures();
            error!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                attempts,
                error = %err,
                "record permanently failed"
            );
            escalate(inner, record, &err, attempts).await;
            // Committed regardless of the dead-letter outcome so one poison
            // record cannot stall the partition.
            commit_processed(inner, record).await;
        }
    }
}

async fn commit_processed(inner: &ConsumerInner, record: &ConsumedRecord) {
    match inner
        .strategy
        .after_process(&inner.transport, &record.topic, record.partition, record.offset)
        .await
    {
        Ok(()) => {
            if !inner.strategy.auto_commit() {
                inner.stats.committed.fetch_add(1, Ordering::Relaxed);
                ClientMetrics::increment_offsets_committed();
            }
        }
        Err(err) => {
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %err,
                "offset commit failed"
            );
        }
    }
}

/// Attach failure diagnostics and, when configured, route the record to
/// the dead-letter topic. A failed dead-letter publish is logged; the
/// caller commits the offset either way.
async fn escalate(
    inner: &ConsumerInner,
    record: &ConsumedRecord,
    err: &HandlerError,
    attempts: u32,
) {
    let Some(dead_letter) = inner.dead_letter.as_ref() else {
        return;
    };

    let failure = FailureInfo::new(err.kind(), err.to_string(), attempts, record);
    let mut dlq_record = Record::new(record.value.clone());
    dlq_record.key = record.key.clone();
    dlq_record.headers = record.headers.clone();
    failure.apply_to(&mut dlq_record.headers);

    match dead_letter
        .publish_to_dead_letter(&record.topic, dlq_record)
        .await
    {
        Ok(receipt) => {
            inner.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
            info!(
                topic = %receipt.topic,
                offset = receipt.offset,
                original_topic = %record.topic,
                original_offset = record.offset,
                "record routed to dead letter"
            );
        }
        Err(publish_err) => {
            error!(
                topic = %record.topic,
                offset = record.offset,
                error = %publish_err,
                "dead-letter publish failed; offset is committed anyway"
            );
        }
    }
}

// ============================================================================
// Auto-Commit Task
// ============================================================================

/// Timer-driven offset commit for at-most-once delivery. Commits whatever
/// ingestion has pulled, independent of handler outcomes, and flushes one
/// final time on shutdown.
async fn auto_commit_task(inner: Arc<ConsumerInner>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(inner.settings.auto_commit_interval);
    let mut last_committed: HashMap<TopicPartition, i64> = HashMap::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                commit_positions(&inner, &mut last_committed).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    commit_positions(&inner, &mut last_committed).await;
                    break;
                }
            }
        }
    }

    debug!(consumer = %inner.settings.name, "auto-commit loop stopped");
}

async fn commit_positions(
    inner: &ConsumerInner,
    last_committed: &mut HashMap<TopicPartition, i64>,
) {
    let snapshot: Vec<(TopicPartition, i64)> = {
        let positions = inner.positions.lock();
        positions
            .iter()
            .map(|(tp, offset)| (tp.clone(), *offset))
            .collect()
    };

    for (tp, offset) in snapshot {
        if last_committed.get(&tp) == Some(&offset) {
            continue;
        }
        match inner.transport.commit(&tp.topic, tp.partition, offset).await {
            Ok(()) => {
                inner.stats.committed.fetch_add(1, Ordering::Relaxed);
                ClientMetrics::increment_offsets_committed();
                last_committed.insert(tp, offset);
            }
            Err(err) => {
                warn!(
                    consumer = %inner.settings.name,
                    partition = %tp,
                    offset,
                    error = %err,
                    "auto-commit failed"
                );
            }
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Default)]
struct ConsumerStats {
    received: AtomicU64,
    processed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    committed: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct ConsumerStatsSnapshot {
    pub received: u64,
    pub processed: u64,
    pub retried: u64,
    pub permanently_failed: u64,
    pub dead_lettered: u64,
    pub offsets_committed: u64,
    pub queue_depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;
    use caravel_core::{HEADER_FAILURE_ATTEMPTS, HEADER_FAILURE_OFFSET};
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct Collecting {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RecordHandler for Collecting {
        async fn handle(&self, record: &ConsumedRecord) -> std::result::Result<(), HandlerError> {
            let value = String::from_utf8_lossy(&record.value).into_owned();
            self.seen.lock().push(value);
            Ok(())
        }
    }

    /// Fails the first `failures` invocations per record value, then
    /// succeeds.
    struct FlakyHandler {
        failures: u32,
        attempts: Mutex<HashMap<String, u32>>,
        retryable: bool,
    }

    #[async_trait]
    impl RecordHandler for FlakyHandler {
        async fn handle(&self, record: &ConsumedRecord) -> std::result::Result<(), HandlerError> {
            let value = String::from_utf8_lossy(&record.value).into_owned();
            let mut attempts = self.attempts.lock();
            let seen = attempts.entry(value).or_insert(0);
            *seen += 1;
            if *seen <= self.failures {
                if self.retryable {
                    Err(HandlerError::Other("transient".into()))
                } else {
                    Err(HandlerError::InvalidInput("unparseable".into()))
                }
            } else {
                Ok(())
            }
        }
    }

    /// Blocks in the handler until a permit is released.
    struct GatedHandler {
        gate: Arc<Semaphore>,
        entered: AtomicU64,
    }

    #[async_trait]
    impl RecordHandler for GatedHandler {
        async fn handle(&self, _record: &ConsumedRecord) -> std::result::Result<(), HandlerError> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            let permit = self.gate.acquire().await.unwrap();
            permit.forget();
            Ok(())
        }
    }

    fn test_settings(group: &str, delivery: DeliverySemantics) -> ConsumerSettings {
        ConsumerSettings {
            name: format!("{group}-consumer"),
            group_id: group.to_string(),
            topics: vec!["orders".to_string()],
            delivery,
            channel_capacity: 64,
            workers: Some(2),
            retry_backoff: Duration::from_millis(5),
            retry_backoff_max: Duration::from_millis(20),
            auto_commit_interval: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    async fn publish_values(broker: &InMemoryBroker, values: &[&str]) {
        let producer = Producer::connect(broker, ProducerSettings::at_least_once("seed"))
            .await
            .unwrap();
        for value in values {
            producer
                .publish("orders", Record::new(value.to_string()))
                .await
                .unwrap();
        }
        producer.close().await.unwrap();
    }

    async fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
        while !check() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn pipeline_processes_and_commits() {
        let broker = InMemoryBroker::with_default_partitions(1);
        publish_values(&broker, &["a", "b", "c"]).await;

        // One worker keeps commit order deterministic for the final assert.
        let mut settings = test_settings("g1", DeliverySemantics::AtLeastOnce);
        settings.workers = Some(1);
        let consumer = Consumer::connect(&broker, settings).await.unwrap();
        let handler = Arc::new(Collecting {
            seen: Mutex::new(Vec::new()),
        });
        consumer.subscribe(handler.clone()).unwrap();

        wait_until(2_000, || consumer.stats().processed == 3).await;
        consumer.unsubscribe().await.unwrap();

        let mut seen = handler.seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);

        // Offsets committed after processing: next-to-read is 3.
        let checker = broker
            .connect(&TransportConfig {
                group_id: Some("g1".to_string()),
                topics: vec!["orders".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(checker.committed("orders", 0).await.unwrap(), Some(3));

        let stats = consumer.stats();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.offsets_committed, 3);
        assert_eq!(stats.permanently_failed, 0);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once_and_recovers() {
        let broker = InMemoryBroker::with_default_partitions(1);
        publish_values(&broker, &["a"]).await;

        let consumer = Consumer::connect(
            &broker,
            test_settings("g2", DeliverySemantics::AtLeastOnce),
        )
        .await
        .unwrap();
        consumer
            .subscribe(Arc::new(FlakyHandler {
                failures: 1,
                attempts: Mutex::new(HashMap::new()),
                retryable: true,
            }))
            .unwrap();

        wait_until(2_000, || consumer.stats().processed == 1).await;
        consumer.unsubscribe().await.unwrap();

        let stats = consumer.stats();
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.permanently_failed, 0);
        assert_eq!(stats.offsets_committed, 1);
    }

    #[tokio::test]
    async fn non_retryable_failure_skips_the_retry() {
        let broker = InMemoryBroker::with_default_partitions(1);
        publish_values(&broker, &["bad"]).await;

        let consumer = Consumer::connect(
            &broker,
            test_settings("g3", DeliverySemantics::AtLeastOnce),
        )
        .await
        .unwrap();
        consumer
            .subscribe(Arc::new(FlakyHandler {
                failures: u32::MAX,
                attempts: Mutex::new(HashMap::new()),
                retryable: false,
            }))
            .unwrap();

        wait_until(2_000, || consumer.stats().permanently_failed == 1).await;
        consumer.unsubscribe().await.unwrap();

        let stats = consumer.stats();
        assert_eq!(stats.retried, 0);
        assert_eq!(stats.processed, 0);
        // The offset is still committed so the record is not redelivered.
        assert_eq!(stats.offsets_committed, 1);
    }

    #[tokio::test]
    async fn permanent_failure_routes_to_the_dead_letter_topic() {
        let broker = InMemoryBroker::with_default_partitions(1);
        publish_values(&broker, &["poison"]).await;

        let consumer = Consumer::connect(
            &broker,
            test_settings("g4", DeliverySemantics::DeadLetter),
        )
        .await
        .unwrap();
        consumer
            .subscribe(Arc::new(FlakyHandler {
                failures: u32::MAX,
                attempts: Mutex::new(HashMap::new()),
                retryable: true,
            }))
            .unwrap();

        wait_until(2_000, || consumer.stats().dead_lettered == 1).await;
        consumer.unsubscribe().await.unwrap();

        let stats = consumer.stats();
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.permanently_failed, 1);

        let dead = broker.committed_records("orders.DLT");
        assert_eq!(dead.len(), 1);
        assert_eq!(&dead[0].value[..], b"poison");
        assert_eq!(dead[0].headers.get_str(HEADER_FAILURE_ATTEMPTS), Some("2"));
        assert_eq!(dead[0].headers.get_str(HEADER_FAILURE_OFFSET), Some("0"));
    }

    #[tokio::test]
    async fn auto_ack_commits_even_when_processing_fails() {
        let broker = InMemoryBroker::with_default_partitions(1);
        publish_values(&broker, &["lost"]).await;

        let consumer = Consumer::connect(
            &broker,
            test_settings("g5", DeliverySemantics::AtMostOnce),
        )
        .await
        .unwrap();
        consumer
            .subscribe(Arc::new(FlakyHandler {
                failures: u32::MAX,
                attempts: Mutex::new(HashMap::new()),
                retryable: false,
            }))
            .unwrap();

        // The timer commits what was ingested, regardless of the handler.
        wait_until(2_000, || consumer.stats().offsets_committed >= 1).await;
        let transport = consumer.transport();
        assert_eq!(transport.committed("orders", 0).await.unwrap(), Some(1));
        consumer.unsubscribe().await.unwrap();

        assert_eq!(consumer.stats().processed, 0);
        assert!(consumer.stats().permanently_failed >= 1);
    }

    #[tokio::test]
    async fn backpressure_bounds_the_queue() {
        let broker = InMemoryBroker::with_default_partitions(1);
        publish_values(&broker, &["1", "2", "3", "4", "5", "6"]).await;

        let mut settings = test_settings("g6", DeliverySemantics::AtLeastOnce);
        settings.channel_capacity = 2;
        settings.workers = Some(1);
        let consumer = Consumer::connect(&broker, settings).await.unwrap();

        let gate = Arc::new(Semaphore::new(0));
        let handler = Arc::new(GatedHandler {
            gate: gate.clone(),
            entered: AtomicU64::new(0),
        });
        consumer.subscribe(handler.clone()).unwrap();

        // One record is in the worker, at most two wait in the queue; the
        // rest stay on the broker.
        wait_until(2_000, || handler.entered.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(consumer.pending_in_queue() <= 2);
        // 1 in the worker + 2 queued + at most 1 parked in the full-queue
        // send; the rest never left the broker.
        assert!(consumer.stats().received <= 4);

        gate.add_permits(6);
        wait_until(2_000, || consumer.stats().processed == 6).await;
        consumer.unsubscribe().await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_drains_and_is_idempotent() {
        let broker = InMemoryBroker::with_default_partitions(1);
        publish_values(&broker, &["a", "b", "c", "d"]).await;

        let consumer = Consumer::connect(
            &broker,
            test_settings("g7", DeliverySemantics::AtLeastOnce),
        )
        .await
        .unwrap();
        let handler = Arc::new(Collecting {
            seen: Mutex::new(Vec::new()),
        });
        consumer.subscribe(handler).unwrap();

        // Wait until all four records are past ingestion (processed or
        // sitting in the queue), then shut down.
        wait_until(2_000, || {
            let stats = consumer.stats();
            stats.processed + stats.queue_depth as u64 == 4
        })
        .await;
        consumer.unsubscribe().await.unwrap();

        // Everything already pulled was processed before shutdown finished.
        assert_eq!(consumer.stats().processed, 4);
        assert!(!consumer.is_running());

        consumer.unsubscribe().await.unwrap();
        let err = consumer
            .subscribe(Arc::new(Collecting {
                seen: Mutex::new(Vec::new()),
            }))
            .unwrap_err();
        assert!(matches!(err, Error::Disconnected));
    }

    #[tokio::test]
    async fn unsubscribe_force_closes_when_a_handler_hangs() {
        let broker = InMemoryBroker::with_default_partitions(1);
        publish_values(&broker, &["stuck"]).await;

        let mut settings = test_settings("g9", DeliverySemantics::AtLeastOnce);
        settings.shutdown_timeout = Duration::from_millis(100);
        settings.workers = Some(1);
        let consumer = Consumer::connect(&broker, settings).await.unwrap();

        // The gate is never released, so the worker hangs in the handler
        // past the shutdown timeout.
        let handler = Arc::new(GatedHandler {
            gate: Arc::new(Semaphore::new(0)),
            entered: AtomicU64::new(0),
        });
        consumer.subscribe(handler.clone()).unwrap();
        wait_until(2_000, || handler.entered.load(Ordering::SeqCst) == 1).await;

        let started = tokio::time::Instant::now();
        consumer.unsubscribe().await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "force-close must not wait on the hung handler"
        );
        assert_eq!(consumer.stats().processed, 0);
        assert!(!consumer.is_running());
    }

    #[tokio::test]
    async fn subscribing_twice_is_an_error() {
        let broker = InMemoryBroker::new();
        let consumer = Consumer::connect(
            &broker,
            test_settings("g8", DeliverySemantics::AtLeastOnce),
        )
        .await
        .unwrap();

        let handler = || {
            Arc::new(Collecting {
                seen: Mutex::new(Vec::new()),
            })
        };
        consumer.subscribe(handler()).unwrap();
        assert!(matches!(
            consumer.subscribe(handler()),
            Err(Error::Other(_))
        ));
        consumer.unsubscribe().await.unwrap();
    }
}
