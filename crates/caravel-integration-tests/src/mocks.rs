//! Mock implementations for testing

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use caravel_client::{
    BrokerConnector, BrokerTransport, HandlerError, RecordHandler, Result, TransportConfig,
};
use caravel_core::{ConsumedRecord, Receipt, Record};
use parking_lot::Mutex;

// ============================================================================
// Fault-injecting transport
// ============================================================================

/// Shared fault plan armed by tests and consumed by [`FlakyTransport`].
///
/// Each counter is the number of upcoming calls of that kind that fail
/// with a retryable broker error before the transport behaves again.
#[derive(Debug, Default)]
pub struct FaultPlan {
    produce: AtomicU32,
    commit: AtomicU32,
    commit_transaction: AtomicU32,
    abort_transaction: AtomicU32,
    fetch: AtomicU32,
}

impl FaultPlan {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_produce(&self, times: u32) {
        self.produce.store(times, Ordering::SeqCst);
    }

    pub fn fail_commit(&self, times: u32) {
        self.commit.store(times, Ordering::SeqCst);
    }

    pub fn fail_commit_transaction(&self, times: u32) {
        self.commit_transaction.store(times, Ordering::SeqCst);
    }

    pub fn fail_abort_transaction(&self, times: u32) {
        self.abort_transaction.store(times, Ordering::SeqCst);
    }

    pub fn fail_fetch(&self, times: u32) {
        self.fetch.store(times, Ordering::SeqCst);
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn injected(what: &str) -> caravel_client::Error {
        caravel_client::Error::Broker(format!("injected {what} fault"))
    }
}

/// Connector decorating another connector's transports with a [`FaultPlan`].
pub struct FlakyConnector {
    inner: Arc<dyn BrokerConnector>,
    plan: Arc<FaultPlan>,
}

impl FlakyConnector {
    pub fn new(inner: Arc<dyn BrokerConnector>, plan: Arc<FaultPlan>) -> Self {
        Self { inner, plan }
    }
}

#[async_trait]
impl BrokerConnector for FlakyConnector {
    async fn connect(&self, config: &TransportConfig) -> Result<Arc<dyn BrokerTransport>> {
        let transport = self.inner.connect(config).await?;
        Ok(Arc::new(FlakyTransport {
            inner: transport,
            plan: self.plan.clone(),
        }))
    }
}

/// Transport decorator that fails calls according to its [`FaultPlan`] and
/// otherwise delegates.
pub struct FlakyTransport {
    inner: Arc<dyn BrokerTransport>,
    plan: Arc<FaultPlan>,
}

#[async_trait]
impl BrokerTransport for FlakyTransport {
    async fn produce(&self, topic: &str, record: Record) -> Result<Receipt> {
        if FaultPlan::take(&self.plan.produce) {
            return Err(FaultPlan::injected("produce"));
        }
        self.inner.produce(topic, record).await
    }

    async fn fetch(&self) -> Result<Option<ConsumedRecord>> {
        if FaultPlan::take(&self.plan.fetch) {
            return Err(FaultPlan::injected("fetch"));
        }
        self.inner.fetch().await
    }

    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        if FaultPlan::take(&self.plan.commit) {
            return Err(FaultPlan::injected("commit"));
        }
        self.inner.commit(topic, partition, offset).await
    }

    async fn committed(&self, topic: &str, partition: i32) -> Result<Option<i64>> {
        self.inner.committed(topic, partition).await
    }

    async fn init_transactions(&self, timeout: Duration) -> Result<()> {
        self.inner.init_transactions(timeout).await
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.inner.begin_transaction().await
    }

    async fn commit_transaction(&self, timeout: Duration) -> Result<()> {
        if FaultPlan::take(&self.plan.commit_transaction) {
            return Err(FaultPlan::injected("commit_transaction"));
        }
        self.inner.commit_transaction(timeout).await
    }

    async fn abort_transaction(&self, timeout: Duration) -> Result<()> {
        if FaultPlan::take(&self.plan.abort_transaction) {
            return Err(FaultPlan::injected("abort_transaction"));
        }
        self.inner.abort_transaction(timeout).await
    }

    async fn watermarks(&self, topic: &str, partition: i32) -> Result<(i64, i64)> {
        self.inner.watermarks(topic, partition).await
    }

    async fn partitions_for(&self, topic: &str) -> Result<Vec<i32>> {
        self.inner.partitions_for(topic).await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }
}

// ============================================================================
// Record handlers
// ============================================================================

/// Handler that records every value it sees
#[derive(Default)]
pub struct CollectingHandler {
    values: Mutex<Vec<String>>,
    count: AtomicU64,
}

impl CollectingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn values(&self) -> Vec<String> {
        self.values.lock().clone()
    }
}

#[async_trait]
impl RecordHandler for CollectingHandler {
    async fn handle(&self, record: &ConsumedRecord) -> std::result::Result<(), HandlerError> {
        self.values
            .lock()
            .push(String::from_utf8_lossy(&record.value).to_string());
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Handler that blocks on a semaphore until the test releases permits
pub struct GatedHandler {
    gate: tokio::sync::Semaphore,
    entered: AtomicU64,
    finished: AtomicU64,
}

impl GatedHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: tokio::sync::Semaphore::new(0),
            entered: AtomicU64::new(0),
            finished: AtomicU64::new(0),
        })
    }

    /// Let `count` blocked (or future) records through
    pub fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }

    pub fn entered(&self) -> u64 {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordHandler for GatedHandler {
    async fn handle(&self, _record: &ConsumedRecord) -> std::result::Result<(), HandlerError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| HandlerError::Other("gate closed".to_string()))?;
        permit.forget();
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Handler that fails its first `failures` calls, transiently or not
pub struct FailingHandler {
    failures: AtomicU32,
    attempts: AtomicU64,
    succeeded: AtomicU64,
    retryable: bool,
}

impl FailingHandler {
    /// Fails `failures` times with a retryable error, then succeeds
    pub fn transient(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicU32::new(failures),
            attempts: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            retryable: true,
        })
    }

    /// Fails `failures` times with a non-retryable error, then succeeds
    pub fn permanent(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicU32::new(failures),
            attempts: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            retryable: false,
        })
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordHandler for FailingHandler {
    async fn handle(&self, _record: &ConsumedRecord) -> std::result::Result<(), HandlerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            if self.retryable {
                return Err(HandlerError::Other("simulated outage".to_string()));
            }
            return Err(HandlerError::InvalidInput("unparseable payload".to_string()));
        }
        self.succeeded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
