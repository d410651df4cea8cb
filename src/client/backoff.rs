//! Reconnect backoff: exponential with full jitter.

use rand::Rng;
use std::time::Duration;

pub const INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const MAX_DELAY: Duration = Duration::from_secs(30);

/// Exponential dial backoff. Base delays start at 1s and double to a 30s
/// cap; the applied delay takes full jitter in [0.5×, 1.5×]. Reset whenever
/// a handshake reaches Active.
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            cap,
            current: initial,
        }
    }

    /// The next base delay; doubles afterwards, saturating at the cap.
    pub fn advance(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.cap);
        base
    }

    /// Full jitter: uniform in [0.5×, 1.5×].
    pub fn with_jitter(base: Duration) -> Duration {
        let factor: f64 = rand::rng().random_range(0.5..1.5);
        base.mul_f64(factor)
    }

    /// The delay to sleep before the next dial attempt.
    pub fn next_delay(&mut self) -> Duration {
        Self::with_jitter(self.advance())
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_DELAY, MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delays_are_monotonic_and_capped() {
        let mut backoff = Backoff::default();
        let mut prev = Duration::ZERO;
        for _ in 0..10 {
            let d = backoff.advance();
            assert!(d >= prev);
            assert!(d <= MAX_DELAY);
            prev = d;
        }
        assert_eq!(backoff.advance(), MAX_DELAY);
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = Backoff::default();
        for _ in 0..6 {
            backoff.advance();
        }
        backoff.reset();
        assert_eq!(backoff.advance(), INITIAL_DELAY);
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let d = Backoff::with_jitter(base);
            assert!(d >= base / 2);
            assert!(d <= base * 3 / 2);
        }
    }

    #[test]
    fn worst_case_delay_bounded() {
        let mut backoff = Backoff::default();
        for _ in 0..20 {
            let d = backoff.next_delay();
            assert!(d <= MAX_DELAY * 3 / 2);
        }
    }
}
