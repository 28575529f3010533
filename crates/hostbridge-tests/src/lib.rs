//! Integration test helpers: an in-process mock execution host and a few
//! polling utilities.

pub mod harness;

use std::time::Duration;

use anyhow::{Result, bail};
use hostbridge::HostBridge;

use crate::harness::host::MockHost;

/// Install a test-friendly subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hostbridge=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// A bridge connected to `host` and joined to `channel`.
pub async fn joined_bridge(host: &MockHost, channel: &str) -> Result<HostBridge> {
    let bridge = HostBridge::new(host.config());
    bridge.connect();
    bridge.wait_connected(Duration::from_secs(5)).await?;
    bridge.join(channel).await?;
    Ok(bridge)
}
