//! Stream session policy
//!
//! Reconnect/backoff parameters and keepalive timings for venue streams.
//! Backoff is exponential with jitter so a venue-wide disconnect does not
//! thundering-herd every adapter back at once.

use std::time::Duration;

/// Per-venue stream behavior. Venues with stricter rate limits get the
/// conservative profile.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Reconnect attempts before the stream is declared permanently dead.
    pub max_retries: u32,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    /// Symbols per connection; the universe is truncated to this upstream.
    pub max_symbols_per_connection: usize,
    /// Symbols per subscribe frame.
    pub subscribe_batch_size: usize,
    pub inter_batch_delay: Duration,
}

impl StreamConfig {
    pub fn standard() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            max_retries: 10,
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(10),
            max_symbols_per_connection: 200,
            subscribe_batch_size: 200,
            inter_batch_delay: Duration::from_millis(250),
        }
    }

    /// For venues that disconnect aggressively on reconnect storms.
    pub fn conservative() -> Self {
        Self {
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(120),
            max_retries: 5,
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(10),
            max_symbols_per_connection: 50,
            subscribe_batch_size: 10,
            inter_batch_delay: Duration::from_millis(500),
        }
    }
}

/// Exponential backoff with ±30% jitter.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
    rng_state: u64,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x9E3779B9),
        }
    }

    /// xorshift64; cheap and good enough for jitter.
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.as_secs_f64() * 2.0_f64.powi(self.attempt as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let jitter = (self.next_random() * 2.0 - 1.0) * 0.3 * capped;
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs_f64((capped + jitter).max(0.05))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_respects_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let mut last = Duration::ZERO;
        for _ in 0..4 {
            last = backoff.next_delay();
        }
        // Fourth delay is 8s nominal; jitter keeps it within ±30%.
        assert!(last >= Duration::from_secs_f64(8.0 * 0.7));
        assert!(last <= Duration::from_secs_f64(8.0 * 1.3));

        for _ in 0..20 {
            last = backoff.next_delay();
        }
        assert!(last <= Duration::from_secs_f64(60.0 * 1.3));
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        let first = backoff.next_delay();
        assert!(first <= Duration::from_secs_f64(1.3));
    }
}
