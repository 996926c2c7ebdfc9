//! Transactional coordinator for exactly-once production.
//!
//! One [`TransactionalSession`] guards one transactional producer. Every
//! transition runs under a single serializing lock, so concurrent callers
//! block rather than interleave and at most one transaction is ever open
//! per session.
//!
//! ```text
//! NotInitialized --init--> Ready --begin--> InTransaction --commit--> Ready
//!                                           InTransaction --abort---> Ready
//! ```
//!
//! Failures during init or begin move the session to `Error`, terminal
//! until an explicit [`reset`](TransactionalSession::reset). A failed
//! commit inside [`execute_in_transaction`](TransactionalSession::execute_in_transaction)
//! triggers an abort: when the abort lands the session recovers to `Ready`
//! and the original commit error is the one the caller sees; when the abort
//! fails too, the session is `Error`.
//!
//! Note on the consumer half of exactly-once: the read side commits offsets
//! with a plain offset commit, not inside the producing transaction. True
//! end-to-end exactly-once requires the caller to enlist the offset commit
//! and any downstream write in one transaction; this coordinator exposes
//! the hooks but does not span side effects it does not own.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metrics::ClientMetrics;
use crate::transport::BrokerTransport;

/// Lifecycle of a transactional session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// No broker-side transactional registration yet.
    NotInitialized,
    /// Registered; no transaction open.
    Ready,
    /// A transaction is open.
    InTransaction,
    /// A transition failed and was not recovered by an abort; terminal
    /// until [`TransactionalSession::reset`].
    Error,
}

impl TxnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnState::NotInitialized => "NotInitialized",
            TxnState::Ready => "Ready",
            TxnState::InTransaction => "InTransaction",
            TxnState::Error => "Error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnState::Error)
    }

    pub fn can_begin(&self) -> bool {
        matches!(self, TxnState::Ready)
    }

    pub fn can_commit(&self) -> bool {
        matches!(self, TxnState::InTransaction)
    }

    pub fn can_abort(&self) -> bool {
        matches!(self, TxnState::InTransaction)
    }
}

impl std::fmt::Display for TxnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialized transaction state machine over one transport connection.
pub struct TransactionalSession {
    transport: Arc<dyn BrokerTransport>,
    transactional_id: String,
    timeout: Duration,
    state: Mutex<TxnState>,
    stats: TxnStats,
}

impl TransactionalSession {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        transactional_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            transactional_id: transactional_id.into(),
            timeout,
            state: Mutex::new(TxnState::NotInitialized),
            stats: TxnStats::default(),
        }
    }

    pub async fn state(&self) -> TxnState {
        *self.state.lock().await
    }

    pub fn transactional_id(&self) -> &str {
        &self.transactional_id
    }

    /// Run `op` inside a transaction: initialize on first use, begin, run,
    /// commit on success, abort on any error and rethrow the original.
    ///
    /// The serializing lock is held end to end, so concurrent callers queue
    /// up rather than interleave their transactions.
    pub async fn execute_in_transaction<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut state = self.state.lock().await;
        self.init_locked(&mut state).await?;
        self.begin_locked(&mut state).await?;

        match op().await {
            Ok(value) => match self.commit_locked(&mut state).await {
                Ok(()) => Ok(value),
                Err(commit_err) => {
                    // The commit failure is what the caller must see; the
                    // abort is cleanup and never masks it.
                    self.abort_quietly(&mut state).await;
                    Err(commit_err)
                }
            },
            Err(op_err) => {
                self.abort_quietly(&mut state).await;
                Err(op_err)
            }
        }
    }

    /// Register the transactional id with the broker if not done yet.
    pub async fn ensure_ready(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.init_locked(&mut state).await
    }

    pub async fn begin(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.init_locked(&mut state).await?;
        self.begin_locked(&mut state).await
    }

    pub async fn commit(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match self.commit_locked(&mut state).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if !matches!(err, Error::TransactionState { .. }) {
                    *state = TxnState::Error;
                }
                Err(err)
            }
        }
    }

    /// Abort the open transaction.
    ///
    /// Broker failures during abort are logged and swallowed (the session
    /// moves to `Error`); only calling this in a state with nothing to
    /// abort returns an error.
    pub async fn abort(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.can_abort() {
            return Err(Error::TransactionState {
                current: state.as_str(),
                expected: TxnState::InTransaction.as_str(),
            });
        }
        self.abort_quietly(&mut state).await;
        Ok(())
    }

    /// Caller-acknowledged recovery from the terminal `Error` state.
    pub async fn reset(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.is_terminal() {
            return Err(Error::TransactionState {
                current: state.as_str(),
                expected: TxnState::Error.as_str(),
            });
        }
        *state = TxnState::NotInitialized;
        debug!(txn_id = %self.transactional_id, "transactional session reset");
        Ok(())
    }

    pub fn stats(&self) -> TxnStatsSnapshot {
        TxnStatsSnapshot {
            begun: self.stats.begun.load(Ordering::Relaxed),
            committed: self.stats.committed.load(Ordering::Relaxed),
            aborted: self.stats.aborted.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }

    async fn init_locked(&self, state: &mut TxnState) -> Result<()> {
        match *state {
            TxnState::NotInitialized => {
                match self.transport.init_transactions(self.timeout).await {
                    Ok(()) => {
                        *state = TxnState::Ready;
                        debug!(txn_id = %self.transactional_id, "transactional id initialized");
                        Ok(())
                    }
                    Err(err) => {
                        *state = TxnState::Error;
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        Err(err)
                    }
                }
            }
            TxnState::Error => Err(Error::TransactionState {
                current: state.as_str(),
                expected: TxnState::Ready.as_str(),
            }),
            _ => Ok(()),
        }
    }

    async fn begin_locked(&self, state: &mut TxnState) -> Result<()> {
        if !state.can_begin() {
            return Err(Error::TransactionState {
                current: state.as_str(),
                expected: TxnState::Ready.as_str(),
            });
        }
        match self.transport.begin_transaction().await {
            Ok(()) => {
                *state = TxnState::InTransaction;
                self.stats.begun.fetch_add(1, Ordering::Relaxed);
                ClientMetrics::increment_transactions_begun();
                Ok(())
            }
            Err(err) => {
                *state = TxnState::Error;
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Commit the open transaction. On broker failure the state is left to
    /// the caller: [`execute_in_transaction`](Self::execute_in_transaction)
    /// recovers via abort, [`commit`](Self::commit) marks `Error`.
    async fn commit_locked(&self, state: &mut TxnState) -> Result<()> {
        if !state.can_commit() {
            return Err(Error::TransactionState {
                current: state.as_str(),
                expected: TxnState::InTransaction.as_str(),
            });
        }
        self.transport.commit_transaction(self.timeout).await?;
        *state = TxnState::Ready;
        self.stats.committed.fetch_add(1, Ordering::Relaxed);
        ClientMetrics::increment_transactions_committed();
        Ok(())
    }

    async fn abort_quietly(&self, state: &mut TxnState) {
        match self.transport.abort_transaction(self.timeout).await {
            Ok(()) => {
                *state = TxnState::Ready;
                self.stats.aborted.fetch_add(1, Ordering::Relaxed);
                ClientMetrics::increment_transactions_aborted();
                debug!(txn_id = %self.transactional_id, "transaction aborted");
            }
            Err(err) => {
                *state = TxnState::Error;
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    txn_id = %self.transactional_id,
                    error = %err,
                    "abort failed; session requires reset"
                );
            }
        }
    }
}

impl std::fmt::Debug for TransactionalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalSession")
            .field("transactional_id", &self.transactional_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Default)]
struct TxnStats {
    begun: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct TxnStatsSnapshot {
    pub begun: u64,
    pub committed: u64,
    pub aborted: u64,
    pub failed: u64,
}
