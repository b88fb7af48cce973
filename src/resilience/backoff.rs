//! Exponential backoff.

use std::time::Duration;
use rand::Rng;

/// First delay after a temporary accept failure.
pub const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(5);

/// Upper bound for accept retry delays.
pub const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Calculate exponential backoff delay with jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    // Apply jitter (0 to 10% of the delay)
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

/// Retry schedule for temporary accept errors.
///
/// Each consecutive failure doubles the delay, starting at
/// [`ACCEPT_BACKOFF_BASE`] and capped at [`ACCEPT_BACKOFF_MAX`]. A successful
/// accept resets it.
#[derive(Debug, Clone, Default)]
pub struct AcceptBackoff {
    current: Duration,
}

impl AcceptBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay to wait before the next retry.
    pub fn next_delay(&mut self) -> Duration {
        self.current = if self.current.is_zero() {
            ACCEPT_BACKOFF_BASE
        } else {
            (self.current * 2).min(ACCEPT_BACKOFF_MAX)
        };
        self.current
    }

    /// Forget previous failures.
    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let b1 = calculate_backoff(1, 100, 2000);
        assert!(b1.as_millis() >= 100);

        let b2 = calculate_backoff(2, 100, 2000);
        assert!(b2.as_millis() >= 200);

        let max = calculate_backoff(10, 100, 1000);
        assert!(max.as_millis() >= 1000);
        assert!(max.as_millis() < 1100);
    }

    #[test]
    fn accept_backoff_doubles_and_caps() {
        let mut backoff = AcceptBackoff::new();
        let delays: Vec<u128> = (0..10).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 320, 640, 1000, 1000]);
    }

    #[test]
    fn accept_backoff_resets_after_success() {
        let mut backoff = AcceptBackoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
    }
}
