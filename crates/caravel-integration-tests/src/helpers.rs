//! Test helpers and utilities

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{sleep, timeout};

/// Initialize tracing for tests (call once at start of test)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("caravel_client=debug".parse().unwrap())
                .add_directive("caravel_core=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();

    while start.elapsed() < timeout_duration {
        if condition().await {
            return Ok(());
        }
        sleep(poll_interval).await;
    }

    anyhow::bail!("Condition not met within {:?}", timeout_duration)
}

/// Wait for a condition with default timeout (10s) and poll interval (10ms)
pub async fn wait_for_condition<F, Fut>(condition: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    wait_for(
        condition,
        Duration::from_secs(10),
        Duration::from_millis(10),
    )
    .await
}

/// Assert that a future completes within the given timeout
pub async fn assert_completes_within<F, Fut, T>(future: F, duration: Duration) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    timeout(duration, future())
        .await
        .unwrap_or_else(|_| panic!("Operation did not complete within {:?}", duration))
}

/// Generate a unique topic name for tests
pub fn unique_topic_name(prefix: &str) -> String {
    let uuid = uuid::Uuid::new_v4().to_string();
    format!("{}-{}", prefix, &uuid[..8])
}

/// Generate a unique consumer group name
pub fn unique_consumer_group(prefix: &str) -> String {
    let uuid = uuid::Uuid::new_v4().to_string();
    format!("{}-cg-{}", prefix, &uuid[..8])
}

/// Generate a unique client name
pub fn unique_client_name(prefix: &str) -> String {
    let uuid = uuid::Uuid::new_v4().to_string();
    format!("{}-{}", prefix, &uuid[..8])
}
