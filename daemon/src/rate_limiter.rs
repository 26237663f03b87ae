//! Per-key token bucket, per spec.md §5: "Platform-X endpoints are limited
//! to one call per account per 5s for listing and one call per order per 3s
//! for chat reads; implementations enforce this with a per-key token
//! bucket." Hand-rolled rather than a crate dependency, the same way the
//! teacher reaches for a small focused helper instead of a heavyweight
//! dependency for a single gate.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(HashMap::new()),
        }
    }

    /// True if `key` may proceed now; if so, records the call time so the
    /// next check respects `min_interval`.
    pub async fn try_acquire(&self, key: &str) -> bool {
        let mut last_call = self.last_call.lock().await;
        let now = Instant::now();
        match last_call.get(key) {
            Some(last) if now.duration_since(*last) < self.min_interval => false,
            _ => {
                last_call.insert(key.to_string(), now);
                true
            }
        }
    }
}
