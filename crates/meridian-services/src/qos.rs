//! QoS — byte-rate token buckets for the bandwidth limits.
//!
//! One bucket per direction. A rate of 0 means unlimited. Capacity is one
//! second of traffic, so a bucket never bursts beyond its configured rate.
//! A request larger than the capacity is admitted whenever the bucket is
//! full, so oversize chunks still make progress.

use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug)]
struct State {
    tokens: f64,
    rate: f64,
    last_refill: Instant,
}

impl State {
    fn refill(&mut self, now: Instant) {
        if self.rate > 0.0 {
            let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
        }
        self.last_refill = now;
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<State>,
}

impl TokenBucket {
    /// `rate` in bytes per second. 0 = unlimited.
    pub fn new(rate: u64) -> Self {
        Self {
            state: Mutex::new(State {
                tokens: rate as f64,
                rate: rate as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> u64 {
        self.state.lock().map(|s| s.rate as u64).unwrap_or(0)
    }

    /// Change the rate. Time up to now is credited at the old rate, then the
    /// balance is clamped to the new capacity.
    pub fn set_rate(&self, rate: u64) {
        self.set_rate_at(rate, Instant::now());
    }

    pub fn set_rate_at(&self, rate: u64, now: Instant) {
        if let Ok(mut s) = self.state.lock() {
            s.refill(now);
            s.rate = rate as f64;
            s.tokens = s.tokens.min(s.rate);
            if rate == 0 {
                s.tokens = 0.0;
            }
        }
    }

    /// Take `bytes` tokens if available. Returns false if the caller should
    /// hold off.
    pub fn try_take(&self, bytes: u64) -> bool {
        self.try_take_at(bytes, Instant::now())
    }

    pub fn try_take_at(&self, bytes: u64, now: Instant) -> bool {
        let Ok(mut s) = self.state.lock() else {
            return true;
        };
        if s.rate <= 0.0 {
            return true;
        }

        s.refill(now);

        let want = (bytes as f64).min(s.rate);
        if s.tokens >= want {
            s.tokens -= want;
            true
        } else {
            false
        }
    }

    /// Tokens currently available. Unlimited buckets report `f64::INFINITY`.
    pub fn tokens(&self) -> f64 {
        match self.state.lock() {
            Ok(s) if s.rate > 0.0 => s.tokens,
            _ => f64::INFINITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn zero_rate_is_unlimited() {
        let bucket = TokenBucket::new(0);
        for _ in 0..1000 {
            assert!(bucket.try_take(1 << 20));
        }
        assert!(bucket.tokens().is_infinite());
    }

    #[test]
    fn bucket_depletes_then_refills() {
        let bucket = TokenBucket::new(1000);
        let t0 = Instant::now();
        assert!(bucket.try_take_at(600, t0));
        assert!(!bucket.try_take_at(600, t0));
        assert!(bucket.try_take_at(400, t0));

        // half a second later, 500 bytes available
        assert!(!bucket.try_take_at(600, t0 + Duration::from_millis(500)));
        assert!(bucket.try_take_at(500, t0 + Duration::from_millis(500)));
    }

    #[test]
    fn oversize_request_needs_full_bucket() {
        let bucket = TokenBucket::new(100);
        let t0 = Instant::now();
        assert!(bucket.try_take_at(5000, t0));
        assert!(!bucket.try_take_at(5000, t0 + Duration::from_millis(500)));
        assert!(bucket.try_take_at(5000, t0 + Duration::from_secs(1)));
    }

    #[test]
    fn set_rate_changes_limit() {
        let bucket = TokenBucket::new(0);
        bucket.set_rate(10);
        assert_eq!(bucket.rate(), 10);
        assert!(!bucket.try_take(10));
        bucket.set_rate(0);
        assert!(bucket.try_take(1_000_000));
    }

    #[test]
    fn rate_change_credits_elapsed_time_at_old_rate() {
        let bucket = TokenBucket::new(100);
        let t0 = Instant::now();
        assert!(bucket.try_take_at(100, t0));

        // 1s idle at 100 B/s refills 100 bytes, not 10_000
        let t1 = t0 + Duration::from_secs(1);
        bucket.set_rate_at(10_000, t1);
        assert_eq!(bucket.tokens(), 100.0);
        assert!(!bucket.try_take_at(200, t1));
        assert!(bucket.try_take_at(100, t1));

        // from here the new rate applies
        assert!(bucket.try_take_at(5_000, t1 + Duration::from_millis(500)));
    }
}
