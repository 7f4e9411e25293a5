//! Shared rate-limited warning facility (§7, §10.1). Every "rate-limited
//! warning" disposition in the error-handling design goes through one
//! `RateLimiter` instance owned by the engine, keyed by a short token so
//! unrelated call sites (a parse-error storm on one flow, a meter
//! exhaustion storm on another) don't starve each other's visibility.

use std::time::{Duration, Instant};

use fxhash::FxHashMap;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A token-bucket limiter: each key gets `burst` tokens, refilled at one
/// token per `period`. `allow` is `true` (and consumes a token) at most
/// `burst` times per `period` window per key.
pub struct RateLimiter {
    burst: f64,
    period: Duration,
    buckets: FxHashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(burst: u32, period: Duration) -> Self {
        Self { burst: burst as f64, period, buckets: FxHashMap::default() }
    }

    pub fn allow(&mut self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&mut self, key: &str, now: Instant) -> bool {
        let burst = self.burst;
        let period = self.period;
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket { tokens: burst, last_refill: now });
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if elapsed > Duration::ZERO {
            let refill = elapsed.as_secs_f64() / period.as_secs_f64() * burst;
            bucket.tokens = (bucket.tokens + refill).min(burst);
            bucket.last_refill = now;
        }
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }
}

/// Logs `msg` at `warn` level through `limiter` under `key`, matching the
/// `if limiter.allow("parse-error") { log::warn!(...) }` pattern described
/// in §10.1.
#[macro_export]
macro_rules! rl_warn {
    ($limiter:expr, $key:expr, $($arg:tt)*) => {
        if $limiter.allow($key) {
            log::warn!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bursts_then_throttles() {
        let mut rl = RateLimiter::new(2, Duration::from_secs(60));
        assert!(rl.allow("k"));
        assert!(rl.allow("k"));
        assert!(!rl.allow("k"));
    }

    #[test]
    fn keys_are_independent() {
        let mut rl = RateLimiter::new(1, Duration::from_secs(60));
        assert!(rl.allow("a"));
        assert!(rl.allow("b"));
        assert!(!rl.allow("a"));
    }

    #[test]
    fn refills_over_time() {
        let mut rl = RateLimiter::new(1, Duration::from_millis(10));
        let t0 = Instant::now();
        assert!(rl.allow_at("k", t0));
        assert!(!rl.allow_at("k", t0));
        assert!(rl.allow_at("k", t0 + Duration::from_millis(20)));
    }
}
