//! Delivery strategies, one per guarantee level.
//!
//! Each [`DeliverySemantics`] maps to exactly one producer-side and one
//! consumer-side strategy. The set is closed: adding a guarantee means
//! adding a variant here, and every `match` below is exhaustive so the
//! compiler walks you to each site that must decide.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use caravel_core::{Receipt, Record};

use crate::backoff::backoff_delay;
use crate::error::{Error, Result};
use crate::settings::{ConsumerSettings, DeliverySemantics, ProducerSettings};
use crate::transport::{Acks, BrokerTransport, IsolationLevel, TransportConfig};
use crate::txn::TransactionalSession;

// ============================================================================
// Producer side
// ============================================================================

/// How a producer gets records onto the broker.
pub enum ProducerStrategy {
    /// `AtMostOnce`: dispatch in the background, never await broker
    /// acknowledgment. Receipts carry offset `-1` and send failures are
    /// logged, not surfaced.
    FireAndForget { transport: Arc<dyn BrokerTransport> },
    /// `AtLeastOnce` and `DeadLetter`: await full acknowledgment and retry
    /// transient failures with exponential backoff.
    Acknowledged {
        transport: Arc<dyn BrokerTransport>,
        max_retries: u32,
        backoff: Duration,
        backoff_max: Duration,
    },
    /// `ExactlyOnce`: every publish runs as its own broker transaction,
    /// begin, produce, commit, serialized through one session.
    Transactional {
        transport: Arc<dyn BrokerTransport>,
        session: TransactionalSession,
    },
}

impl ProducerStrategy {
    /// Fold the delivery guarantee into the transport connection settings.
    /// Runs before the connection exists, so it is an associated fn.
    pub fn apply(settings: &ProducerSettings, config: &mut TransportConfig) {
        config.request_timeout = settings.request_timeout;
        match settings.delivery {
            DeliverySemantics::AtMostOnce => {
                config.acks = Acks::None;
                config.enable_idempotence = false;
                config.retries = 0;
            }
            DeliverySemantics::AtLeastOnce | DeliverySemantics::DeadLetter => {
                config.acks = Acks::All;
                config.enable_idempotence = settings.enable_idempotence;
                config.retries = settings.max_retries;
                config.retry_backoff = settings.retry_backoff;
            }
            DeliverySemantics::ExactlyOnce => {
                config.acks = Acks::All;
                config.enable_idempotence = true;
                config.retries = settings.max_retries;
                config.retry_backoff = settings.retry_backoff;
                config.transactional_id = settings.transactional_id.clone();
                config.transaction_timeout = settings.transaction_timeout;
            }
        }
    }

    /// Build the strategy for a connected transport.
    pub fn new(settings: &ProducerSettings, transport: Arc<dyn BrokerTransport>) -> Result<Self> {
        match settings.delivery {
            DeliverySemantics::AtMostOnce => Ok(Self::FireAndForget { transport }),
            DeliverySemantics::AtLeastOnce | DeliverySemantics::DeadLetter => {
                Ok(Self::Acknowledged {
                    transport,
                    max_retries: settings.max_retries,
                    backoff: settings.retry_backoff,
                    backoff_max: settings.retry_backoff_max,
                })
            }
            DeliverySemantics::ExactlyOnce => {
                let id = settings.transactional_id.clone().ok_or_else(|| {
                    Error::InvalidSettings(
                        "exactly-once delivery requires a transactional id".into(),
                    )
                })?;
                let session =
                    TransactionalSession::new(transport.clone(), id, settings.transaction_timeout);
                Ok(Self::Transactional { transport, session })
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::FireAndForget { .. } => "fire-and-forget",
            Self::Acknowledged { .. } => "acknowledged",
            Self::Transactional { .. } => "transactional",
        }
    }

    /// The transaction session, when this strategy runs one.
    pub fn session(&self) -> Option<&TransactionalSession> {
        match self {
            Self::Transactional { session, .. } => Some(session),
            _ => None,
        }
    }

    pub async fn publish(&self, topic: &str, record: Record) -> Result<Receipt> {
        match self {
            Self::FireAndForget { transport } => {
                let partition = record.partition.unwrap_or(-1);
                let transport = transport.clone();
                let send_topic = topic.to_string();
                tokio::spawn(async move {
                    if let Err(err) = transport.produce(&send_topic, record).await {
                        debug!(topic = %send_topic, error = %err, "fire-and-forget send failed");
                    }
                });
                Ok(Receipt {
                    topic: topic.to_string(),
                    partition,
                    offset: -1,
                    timestamp: Utc::now(),
                })
            }
            Self::Acknowledged {
                transport,
                max_retries,
                backoff,
                backoff_max,
            } => {
                let mut attempt = 0u32;
                loop {
                    match transport.produce(topic, record.clone()).await {
                        Ok(receipt) => return Ok(receipt),
                        Err(err) if err.is_retryable() && attempt < *max_retries => {
                            let delay = backoff_delay(attempt, *backoff, *backoff_max);
                            warn!(
                                topic,
                                attempt = attempt + 1,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "publish failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
            Self::Transactional { transport, session } => {
                session
                    .execute_in_transaction(|| async { transport.produce(topic, record).await })
                    .await
            }
        }
    }
}

impl std::fmt::Debug for ProducerStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

// ============================================================================
// Consumer side
// ============================================================================

/// How a consumer acknowledges progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStrategy {
    /// `AtMostOnce`: offsets are committed on a timer regardless of
    /// processing outcome. Records in flight at a crash are lost.
    AutoAck,
    /// `AtLeastOnce` and `DeadLetter`: the offset is committed only after
    /// the handler finishes, so a crash replays unprocessed records.
    CommitAfterProcess,
    /// `ExactlyOnce`: fetches are isolated to committed records and the
    /// offset is committed after processing. The offset commit itself is a
    /// plain commit, not part of a broker transaction, so processing with
    /// external side effects is still at-least-once across a crash; true
    /// end-to-end exactly-once needs the side effect and the offset in one
    /// transaction.
    CommittedReadCommit,
}

impl ConsumerStrategy {
    pub fn for_semantics(delivery: DeliverySemantics) -> Self {
        match delivery {
            DeliverySemantics::AtMostOnce => Self::AutoAck,
            DeliverySemantics::AtLeastOnce | DeliverySemantics::DeadLetter => {
                Self::CommitAfterProcess
            }
            DeliverySemantics::ExactlyOnce => Self::CommittedReadCommit,
        }
    }

    pub fn isolation(&self) -> IsolationLevel {
        match self {
            Self::CommittedReadCommit => IsolationLevel::ReadCommitted,
            _ => IsolationLevel::ReadUncommitted,
        }
    }

    /// Whether offsets ride a timer instead of processing completion.
    pub fn auto_commit(&self) -> bool {
        matches!(self, Self::AutoAck)
    }

    pub fn apply(&self, settings: &ConsumerSettings, config: &mut TransportConfig) {
        config.isolation = self.isolation();
        config.auto_commit = self.auto_commit();
        config.auto_commit_interval = settings.auto_commit_interval;
    }

    /// Acknowledge one processed record. Commits the next-to-read offset;
    /// a no-op under [`AutoAck`](Self::AutoAck).
    pub async fn after_process(
        &self,
        transport: &Arc<dyn BrokerTransport>,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<()> {
        match self {
            Self::AutoAck => Ok(()),
            Self::CommitAfterProcess | Self::CommittedReadCommit => {
                transport.commit(topic, partition, offset + 1).await
            }
        }
    }
}
