//! Watermark and Drain Integration Tests
//!
//! Exercises live watermark totals across topics, broker-side lag as
//! consumers commit, and the flush drain-wait.
//!
//! Run with: cargo test -p caravel-integration-tests --test watermark -- --nocapture

use std::time::Duration;

use anyhow::Result;
use caravel_client::{DeliverySemantics, Record, WatermarkMonitor};
use caravel_integration_tests::fixtures::*;
use caravel_integration_tests::helpers::*;
use caravel_integration_tests::mocks::CollectingHandler;
use tracing::info;

/// Test that totals sum live high watermarks across every monitored topic
#[tokio::test]
async fn test_totals_track_published_counts() -> Result<()> {
    init_tracing();

    let broker = TestBroker::start();
    let orders = unique_topic_name("wm-orders");
    let audit = unique_topic_name("wm-audit");

    let producer = broker
        .connect_producer(producer_settings(
            "wm-producer",
            DeliverySemantics::AtLeastOnce,
        ))
        .await?;

    for outcome in producer
        .publish_batch(&orders, test_data::generate_records(5))
        .await?
    {
        outcome.expect("publish succeeded");
    }
    for outcome in producer
        .publish_batch(&audit, test_data::generate_records(3))
        .await?
    {
        outcome.expect("publish succeeded");
    }

    let monitor = WatermarkMonitor::new(producer.transport(), [orders.clone(), audit.clone()]);
    assert_eq!(monitor.total_messages_in_topics().await?, 8);

    // Totals are live: another publish moves the next query.
    producer
        .publish(&orders, Record::new("one-more"))
        .await?;
    assert_eq!(monitor.total_messages_in_topics().await?, 9);

    producer.close().await?;
    info!("Watermark totals test passed");
    Ok(())
}

/// Test that broker-side lag drops to zero as a consumer processes and
/// commits
#[tokio::test]
async fn test_lag_drains_as_the_consumer_commits() -> Result<()> {
    init_tracing();

    let broker = TestBroker::start();
    let topic = unique_topic_name("wm-lag");
    let group = unique_consumer_group("wm-lag");

    let producer = broker
        .connect_producer(producer_settings(
            "lag-producer",
            DeliverySemantics::AtLeastOnce,
        ))
        .await?;
    for outcome in producer
        .publish_batch(&topic, test_data::generate_records(4))
        .await?
    {
        outcome.expect("publish succeeded");
    }

    let consumer = broker
        .connect_consumer(consumer_settings(
            "lag-consumer",
            &group,
            &topic,
            DeliverySemantics::AtLeastOnce,
        ))
        .await?;
    let monitor = WatermarkMonitor::for_consumer(&consumer);
    assert_eq!(
        monitor.total_lag().await?,
        4,
        "nothing committed yet, full backlog"
    );

    let handler = CollectingHandler::new();
    consumer.subscribe(handler.clone())?;

    wait_for_condition(|| {
        let monitor = &monitor;
        async move { monitor.total_lag().await.ok() == Some(0) }
    })
    .await?;
    assert_eq!(handler.count(), 4);

    consumer.unsubscribe().await?;
    producer.close().await?;
    info!("Lag drain test passed");
    Ok(())
}

/// Test that flush returns promptly for empty topics and times out while
/// records remain
#[tokio::test]
async fn test_flush_waits_on_the_high_watermark_total() -> Result<()> {
    init_tracing();

    let broker = TestBroker::start();
    let empty_topic = unique_topic_name("wm-empty");
    let busy_topic = unique_topic_name("wm-busy");
    broker.create_topic(&empty_topic, 1);

    let producer = broker
        .connect_producer(producer_settings(
            "flush-producer",
            DeliverySemantics::AtLeastOnce,
        ))
        .await?;

    let empty_monitor = WatermarkMonitor::new(producer.transport(), [empty_topic]);
    assert!(
        empty_monitor.flush(Duration::from_millis(500)).await?,
        "empty topics drain immediately"
    );

    producer
        .publish(&busy_topic, Record::new("still-here"))
        .await?;
    let busy_monitor = WatermarkMonitor::new(producer.transport(), [busy_topic]);
    assert!(
        !busy_monitor.flush(Duration::from_millis(250)).await?,
        "high watermarks never fall, so populated topics time out"
    );

    producer.close().await?;
    info!("Flush test passed");
    Ok(())
}
