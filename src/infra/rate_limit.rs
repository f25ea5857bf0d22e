//! Token-bucket rate limiting for chain RPC pools.
//!
//! One bucket per method family. `take()` never fails: callers wait
//! cooperatively until a token is available, so rate pressure shows up as
//! latency rather than errors.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Poll interval while waiting for a token.
const WAIT_SLICE: Duration = Duration::from_millis(50);

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket granting one permit per call at a bounded refill rate with
/// bounded burst.
pub struct TokenBucket {
    name: String,
    rps_max: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket refilling at `rps_max` tokens/second. Burst capacity
    /// defaults to `rps_max`.
    pub fn new(name: impl Into<String>, rps_max: f64) -> Self {
        Self::with_burst(name, rps_max, rps_max)
    }

    pub fn with_burst(name: impl Into<String>, rps_max: f64, burst: f64) -> Self {
        let burst = burst.max(1.0);
        Self {
            name: name.into(),
            rps_max: rps_max.max(f64::MIN_POSITIVE),
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take one token, waiting cooperatively until one is available.
    pub async fn take(&self) {
        loop {
            if self.try_take().await {
                return;
            }
            tokio::time::sleep(WAIT_SLICE).await;
        }
    }

    /// Take one token if available right now.
    pub async fn try_take(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rps_max).min(self.burst);
            state.last_refill = now;
        }
    }
}
