//! Waiting on background work.
//!
//! Connects, backoff timers and resolutions finish on spawned tasks, so a
//! test re-reads what it cares about on a fixed tick. Under a paused tokio
//! clock every tick also moves virtual time forward, which is what lets a
//! backoff of several seconds elapse instantly.

use std::time::Duration;

use tokio::time::{Instant, sleep};
use wayfinder_types::ConnectivityState;

const TICK: Duration = Duration::from_millis(10);

/// Re-reads `read` every tick until it yields a value or `within` has passed.
///
/// `read` runs at least once, and once more at the end of the window.
pub async fn wait_for<T>(within: Duration, mut read: impl FnMut() -> Option<T>) -> Option<T> {
    let give_up = Instant::now() + within;
    loop {
        if let Some(value) = read() {
            return Some(value);
        }
        if Instant::now() >= give_up {
            return None;
        }
        sleep(TICK).await;
    }
}

/// Waits until `state` reports `expected`.
///
/// ```no_run
/// # async fn example(subchannel_state: impl FnMut() -> wayfinder_types::ConnectivityState) {
/// use std::time::Duration;
///
/// use wayfinder_test_utils::wait_for_state;
/// use wayfinder_types::ConnectivityState;
///
/// wait_for_state(Duration::from_secs(1), ConnectivityState::Ready, subchannel_state)
///     .await
///     .unwrap();
/// # }
/// ```
///
/// # Errors
///
/// Returns the last state seen when `expected` did not show up in time.
pub async fn wait_for_state(
    within: Duration,
    expected: ConnectivityState,
    mut state: impl FnMut() -> ConnectivityState,
) -> Result<(), ConnectivityState> {
    let mut last = state();
    if last == expected {
        return Ok(());
    }
    let reached = wait_for(within, || {
        last = state();
        (last == expected).then_some(())
    })
    .await;
    reached.ok_or(last)
}
