// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnection Backoff
//!
//! Geometric delay computation for the reconnection supervisor. The delay
//! doubles on each consecutive failed attempt from a base value, capped at a
//! maximum, with proportional random jitter layered on top. State is reset
//! whenever a session opens successfully.

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Tracks consecutive connection failures and computes the next retry delay.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(cfg: &BackoffConfig) -> Backoff {
        Backoff {
            base: Duration::from_millis(cfg.base_ms),
            max: Duration::from_millis(cfg.max_ms),
            jitter: cfg.jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Returns the delay to wait before the next attempt and advances the
    /// attempt counter.
    ///
    /// The geometric component never exceeds the configured cap; jitter adds
    /// at most `jitter * delay` on top of it.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(32);
        let doubled = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter == 0.0 {
            return doubled;
        }

        let spread = doubled.as_secs_f64() * self.jitter * rand::thread_rng().gen::<f64>();
        doubled + Duration::from_secs_f64(spread)
    }

    /// Number of consecutive failed attempts so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Clears the failure streak after a successful open.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(base_ms: u64, max_ms: u64, jitter: f64) -> BackoffConfig {
        BackoffConfig {
            base_ms,
            max_ms,
            jitter,
        }
    }

    #[test]
    fn doubles_until_the_cap() {
        let mut backoff = Backoff::new(&cfg(1_000, 8_000, 0.0));

        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_millis() as u64).collect();

        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 8_000]);
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn jitter_stays_proportional() {
        let mut backoff = Backoff::new(&cfg(1_000, 8_000, 0.5));

        for expected in [1_000u64, 2_000, 4_000, 8_000] {
            let delay = backoff.next_delay().as_millis() as u64;
            assert!(delay >= expected, "delay {delay} below geometric floor {expected}");
            assert!(
                delay <= expected + expected / 2,
                "delay {delay} above jitter ceiling for {expected}"
            );
        }
    }

    #[test]
    fn reset_restarts_the_curve() {
        let mut backoff = Backoff::new(&cfg(100, 800, 0.0));

        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let mut backoff = Backoff::new(&cfg(1_000, 30_000, 0.0));

        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_millis(30_000));
        }
    }
}
