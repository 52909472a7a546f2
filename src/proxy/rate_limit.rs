//! Per-client request budgets for the edge proxy.
//!
//! Each zone is a leaky bucket per client address: every admitted request
//! adds one unit of "excess", which drains at the configured rate. A request
//! is admitted while the drained excess does not exceed `burst`, so a fresh
//! client can fire `burst + 1` requests back to back before being throttled.

use crate::proxy::config::RateLimitConfig;
use dashmap::DashMap;
use std::{
    net::IpAddr,
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    excess: f64,
    last: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    rate_per_sec: f64,
    burst: f64,
    buckets: DashMap<IpAddr, Bucket>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            rate_per_sec: config.rate_per_second(),
            burst: f64::from(config.burst),
            buckets: DashMap::new(),
        }
    }

    /// Admit or reject one request from `client`.
    pub fn check(&self, client: IpAddr) -> bool {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: IpAddr, now: Instant) -> bool {
        let mut entry = self.buckets.entry(client).or_insert(Bucket {
            excess: 0.0,
            last: now,
        });
        let bucket = entry.value_mut();

        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        let drained = (bucket.excess - elapsed * self.rate_per_sec).max(0.0);
        bucket.last = now;

        if drained > self.burst {
            bucket.excess = drained;
            return false;
        }
        bucket.excess = drained + 1.0;
        true
    }

    /// Time for a full bucket to drain back to zero.
    pub fn idle_after(&self) -> Duration {
        Duration::from_secs_f64((self.burst + 1.0) / self.rate_per_sec)
    }

    /// Forget clients whose buckets have fully drained.
    pub fn prune(&self) {
        self.prune_at(Instant::now());
    }

    fn prune_at(&self, now: Instant) {
        let idle = self.idle_after();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last) < idle);
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }
}
