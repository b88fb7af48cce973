//! Waiting for connections to drain.

use std::time::Duration;

use tokio::time::Instant;

use crate::net::ConnectionTracker;
use crate::resilience::backoff::calculate_backoff;

const POLL_BASE_MS: u64 = 1;
const POLL_MAX_MS: u64 = 500;

/// Poll `tracker` until no connection is left or `deadline` passes.
///
/// The poll interval starts at 1ms and doubles up to 500ms, with jitter.
/// Returns false if the deadline passed first.
pub async fn wait_until_drained(tracker: &ConnectionTracker, deadline: Option<Instant>) -> bool {
    let mut attempt: u32 = 1;
    loop {
        if tracker.is_empty() {
            return true;
        }

        let mut delay = calculate_backoff(attempt, POLL_BASE_MS, POLL_MAX_MS);
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    remaining = tracker.active_count(),
                    "Shutdown deadline passed with connections still open"
                );
                return false;
            }
            delay = delay.min(deadline - now);
        }

        tracing::trace!(
            remaining = tracker.active_count(),
            delay_ms = delay.as_millis() as u64,
            "Waiting for connections to drain"
        );
        tokio::time::sleep(delay.max(Duration::from_millis(POLL_BASE_MS))).await;
        attempt = attempt.saturating_add(1);
    }
}
