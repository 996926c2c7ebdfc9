//! Transactional Session Integration Tests
//!
//! Exercises the transactional producer session: per-publish transactions,
//! multi-send transactions, state-machine guards, and recovery when the
//! broker fails a commit.
//!
//! Run with: cargo test -p caravel-integration-tests --test transactions -- --nocapture

use anyhow::Result;
use caravel_client::{DeliverySemantics, Error, Producer, Record, TxnState};
use caravel_integration_tests::fixtures::*;
use caravel_integration_tests::helpers::*;
use caravel_integration_tests::mocks::{CollectingHandler, FaultPlan, FlakyConnector};
use tracing::info;

// =============================================================================
// TRANSACTION SCOPE
// =============================================================================

/// Test that one transaction can span sends to multiple topics and lands
/// them atomically
#[tokio::test]
async fn test_transaction_spans_topics() -> Result<()> {
    init_tracing();

    let broker = TestBroker::start();
    let orders = unique_topic_name("txn-orders");
    let audit = unique_topic_name("txn-audit");

    let producer = broker
        .connect_producer(transactional_producer_settings("txn-producer", "txn-span"))
        .await?;

    let transport = producer.transport();
    producer
        .execute_in_transaction(|| {
            let transport = transport.clone();
            let orders = orders.clone();
            let audit = audit.clone();
            async move {
                transport.produce(&orders, Record::new("order-7")).await?;
                transport.produce(&audit, Record::new("order-7-created")).await?;
                Ok(())
            }
        })
        .await?;

    assert_eq!(broker.committed_records(&orders).len(), 1);
    assert_eq!(broker.committed_records(&audit).len(), 1);

    let session = producer.session().expect("transactional producer");
    assert_eq!(session.stats().committed, 1);
    assert_eq!(session.state().await, TxnState::Ready);

    producer.close().await?;
    info!("Transaction spans topics test passed");
    Ok(())
}

/// Test that a failing operation aborts the transaction and leaves
/// nothing visible
#[tokio::test]
async fn test_failed_operation_rolls_back() -> Result<()> {
    init_tracing();

    let broker = TestBroker::start();
    let topic = unique_topic_name("txn-rollback");

    let producer = broker
        .connect_producer(transactional_producer_settings(
            "rollback-producer",
            "txn-rollback",
        ))
        .await?;

    let transport = producer.transport();
    let result: caravel_client::Result<()> = producer
        .execute_in_transaction(|| {
            let transport = transport.clone();
            let topic = topic.clone();
            async move {
                transport.produce(&topic, Record::new("phantom")).await?;
                Err(Error::Other("handler bailed".to_string()))
            }
        })
        .await;

    assert!(matches!(result, Err(Error::Other(ref m)) if m == "handler bailed"));
    assert!(
        broker.committed_records(&topic).is_empty(),
        "aborted sends stay invisible"
    );

    let session = producer.session().expect("transactional producer");
    assert_eq!(session.stats().aborted, 1);
    assert_eq!(session.state().await, TxnState::Ready);

    // The session is immediately usable again.
    producer.publish(&topic, Record::new("real")).await?;
    assert_eq!(broker.committed_records(&topic).len(), 1);

    producer.close().await?;
    info!("Rollback test passed");
    Ok(())
}

// =============================================================================
// COMMIT FAILURE RECOVERY
// =============================================================================

/// Test that a broker-side commit failure triggers an abort, surfaces the
/// original commit error, and leaves the session ready
#[tokio::test]
async fn test_commit_failure_aborts_and_surfaces_original_error() -> Result<()> {
    init_tracing();

    let broker = TestBroker::start();
    let topic = unique_topic_name("txn-commit-fail");

    let plan = FaultPlan::new();
    let connector = FlakyConnector::new(broker.connector(), plan.clone());
    let producer = Producer::connect(
        &connector,
        transactional_producer_settings("flaky-producer", "txn-flaky"),
    )
    .await?;

    plan.fail_commit_transaction(1);
    let error = producer
        .publish(&topic, Record::new("unlucky"))
        .await
        .expect_err("commit was injected to fail");
    assert!(
        matches!(error, Error::Broker(ref m) if m.contains("injected commit_transaction fault")),
        "the commit error surfaces, not the abort outcome: {error}"
    );

    let session = producer.session().expect("transactional producer");
    assert_eq!(session.stats().aborted, 1, "failed commit was aborted");
    assert_eq!(session.state().await, TxnState::Ready);
    assert!(broker.committed_records(&topic).is_empty());

    // Next publish goes through unharmed.
    let receipt = producer.publish(&topic, Record::new("lucky")).await?;
    assert_eq!(receipt.offset, 1, "aborted record still consumed an offset");
    assert_eq!(broker.committed_records(&topic).len(), 1);

    producer.close().await?;
    info!("Commit failure recovery test passed");
    Ok(())
}

// =============================================================================
// STATE MACHINE GUARDS
// =============================================================================

/// Test that committing outside a transaction is rejected as a state error
#[tokio::test]
async fn test_commit_outside_transaction_is_a_state_error() -> Result<()> {
    init_tracing();

    let broker = TestBroker::start();
    let producer = broker
        .connect_producer(transactional_producer_settings(
            "guard-producer",
            "txn-guard-commit",
        ))
        .await?;

    let session = producer.session().expect("transactional producer");
    let error = session.commit().await.expect_err("nothing to commit");
    assert!(
        matches!(error, Error::TransactionState { expected, .. } if expected == "InTransaction")
    );

    producer.close().await?;
    info!("Commit guard test passed");
    Ok(())
}

/// Test that beginning twice without committing is rejected, and that an
/// abort returns the session to ready
#[tokio::test]
async fn test_begin_twice_is_a_state_error() -> Result<()> {
    init_tracing();

    let broker = TestBroker::start();
    let producer = broker
        .connect_producer(transactional_producer_settings(
            "double-begin-producer",
            "txn-guard-begin",
        ))
        .await?;

    let session = producer.session().expect("transactional producer");
    session.ensure_ready().await?;
    session.begin().await?;
    assert_eq!(session.state().await, TxnState::InTransaction);

    let error = session.begin().await.expect_err("already in a transaction");
    assert!(
        matches!(error, Error::TransactionState { current, expected }
            if current == "InTransaction" && expected == "Ready")
    );

    session.abort().await?;
    assert_eq!(session.state().await, TxnState::Ready);

    producer.close().await?;
    info!("Begin guard test passed");
    Ok(())
}

// =============================================================================
// READ-COMMITTED CONSUMPTION
// =============================================================================

/// Test that an exactly-once consumer only sees committed records
#[tokio::test]
async fn test_exactly_once_consumer_skips_aborted_records() -> Result<()> {
    init_tracing();

    let broker = TestBroker::start();
    let topic = unique_topic_name("txn-read-committed");
    let group = unique_consumer_group("txn-read-committed");

    let producer = broker
        .connect_producer(transactional_producer_settings(
            "rc-producer",
            "txn-read-committed",
        ))
        .await?;

    producer.publish(&topic, Record::new("committed-1")).await?;

    // Stage a record, then fail the operation so the transaction aborts.
    let transport = producer.transport();
    let aborted: caravel_client::Result<()> = producer
        .execute_in_transaction(|| {
            let transport = transport.clone();
            let topic = topic.clone();
            async move {
                transport.produce(&topic, Record::new("aborted")).await?;
                Err(Error::Other("simulated failure".to_string()))
            }
        })
        .await;
    assert!(aborted.is_err());

    producer.publish(&topic, Record::new("committed-2")).await?;

    let consumer = broker
        .connect_consumer(consumer_settings(
            "rc-consumer",
            &group,
            &topic,
            DeliverySemantics::ExactlyOnce,
        ))
        .await?;
    let handler = CollectingHandler::new();
    consumer.subscribe(handler.clone())?;

    wait_for_condition(|| {
        let handler = handler.clone();
        async move { handler.count() >= 2 }
    })
    .await?;

    let values = handler.values();
    assert!(values.contains(&"committed-1".to_string()));
    assert!(values.contains(&"committed-2".to_string()));
    assert!(
        !values.iter().any(|v| v == "aborted"),
        "aborted record must never reach the handler"
    );

    consumer.unsubscribe().await?;
    producer.close().await?;
    info!("Read-committed consumption test passed");
    Ok(())
}

// =============================================================================
// CONCURRENCY
// =============================================================================

/// Test that concurrent transactional publishes on one shared producer
/// serialize onto the session without losing records
#[tokio::test]
async fn test_concurrent_publishes_serialize_on_the_session() -> Result<()> {
    init_tracing();

    let broker = TestBroker::start();
    let topic = unique_topic_name("txn-concurrent");

    let producer = broker
        .connect_producer(transactional_producer_settings(
            "concurrent-producer",
            "txn-concurrent",
        ))
        .await?;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let producer = producer.clone();
        let topic = topic.clone();
        tasks.push(tokio::spawn(async move {
            producer
                .publish(&topic, Record::new(format!("event-{i}")))
                .await
        }));
    }
    for task in tasks {
        task.await??;
    }

    let session = producer.session().expect("transactional producer");
    assert_eq!(session.stats().committed, 8);
    assert_eq!(broker.committed_records(&topic).len(), 8);

    producer.close().await?;
    info!("Concurrent transactional publish test passed");
    Ok(())
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Test that exactly-once settings without a transactional id are rejected
/// at construction time
#[tokio::test]
async fn test_exactly_once_requires_a_transactional_id() -> Result<()> {
    init_tracing();

    let broker = TestBroker::start();
    let error = broker
        .connect_producer(producer_settings(
            "no-id-producer",
            DeliverySemantics::ExactlyOnce,
        ))
        .await
        .expect_err("missing transactional id");

    let error = error.downcast::<Error>()?;
    assert!(matches!(error, Error::InvalidSettings(_)));
    info!("Transactional id requirement test passed");
    Ok(())
}

/// Test that a non-transactional producer refuses execute_in_transaction
#[tokio::test]
async fn test_execute_requires_a_transactional_producer() -> Result<()> {
    init_tracing();

    let broker = TestBroker::start();
    let producer = broker
        .connect_producer(producer_settings(
            "plain-producer",
            DeliverySemantics::AtLeastOnce,
        ))
        .await?;

    let result: caravel_client::Result<()> = producer
        .execute_in_transaction(|| async { Ok(()) })
        .await;
    assert!(matches!(result, Err(Error::InvalidSettings(_))));

    producer.close().await?;
    info!("Execute guard test passed");
    Ok(())
}
