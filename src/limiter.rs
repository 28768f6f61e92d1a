use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Non-blocking token bucket: `qps` tokens per second, at most `burst` banked.
#[derive(Debug)]
pub struct RateLimiter {
    qps: f64,
    burst: f64,
    state: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(qps: u32, burst: u32) -> Self {
        Self::starting_at(qps, burst, Instant::now())
    }

    pub fn starting_at(qps: u32, burst: u32, now: Instant) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: f64::from(qps.max(1)),
            burst,
            state: Mutex::new(Bucket {
                tokens: burst,
                last_refill: now,
            }),
        }
    }

    pub fn try_accept(&self) -> bool {
        self.try_accept_at(Instant::now())
    }

    pub fn try_accept_at(&self, now: Instant) -> bool {
        let mut bucket = self.state.lock();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if elapsed > Duration::ZERO {
            bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.qps).min(self.burst);
            bucket.last_refill = now;
        }

        if bucket.tokens < 1.0 {
            return false;
        }
        bucket.tokens -= 1.0;
        true
    }
}
