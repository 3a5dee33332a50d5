//! Shared helpers for the cross-crate tests

pub mod test_harness;

pub use test_harness::{ControlPlaneFixture, TestHarness};

use std::time::{Duration, Instant};

/// Poll `condition` every 10ms until it holds or `timeout` elapses
pub async fn wait_for_condition<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
