//! Per-source-address token buckets.
//!
//! Buckets are created on the first datagram from an address and evicted once
//! idle. The bucket map is split into shards by address so that a flood from
//! one range does not serialize every other client behind a single lock.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

const SHARD_COUNT: usize = 16;

/// Result of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Dropped; `consecutive` counts drops since the last admitted request
    Dropped { consecutive: u32 },
}

#[derive(Debug, Clone)]
struct RateBucket {
    tokens: f64,
    last_refill: Instant,
    consecutive_drops: u32,
}

impl RateBucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            consecutive_drops: 0,
        }
    }

    fn refill(&mut self, capacity: f64, refill_rate: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, capacity: f64, refill_rate: f64, now: Instant) -> Admission {
        self.refill(capacity, refill_rate, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.consecutive_drops = 0;
            Admission::Admitted
        } else {
            self.consecutive_drops = self.consecutive_drops.saturating_add(1);
            Admission::Dropped {
                consecutive: self.consecutive_drops,
            }
        }
    }
}

pub struct RateLimiter {
    shards: Vec<Mutex<HashMap<IpAddr, RateBucket>>>,
    capacity: f64,
    refill_rate: f64,
    idle_ttl: Duration,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_rate: f64, idle_ttl: Duration) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            capacity: f64::from(capacity),
            refill_rate,
            idle_ttl,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.capacity, config.refill_rate, config.idle_ttl())
    }

    fn shard(&self, ip: &IpAddr) -> &Mutex<HashMap<IpAddr, RateBucket>> {
        let mut hasher = DefaultHasher::new();
        ip.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }

    /// Takes one token for `ip` if available
    pub async fn check(&self, ip: IpAddr, now: Instant) -> Admission {
        let mut shard = self.shard(&ip).lock().await;
        shard
            .entry(ip)
            .or_insert_with(|| RateBucket::new(self.capacity, now))
            .try_take(self.capacity, self.refill_rate, now)
    }

    /// Tokens currently available to `ip`, if it has a bucket
    pub async fn tokens(&self, ip: IpAddr, now: Instant) -> Option<f64> {
        let mut shard = self.shard(&ip).lock().await;
        shard.get_mut(&ip).map(|bucket| {
            bucket.refill(self.capacity, self.refill_rate, now);
            bucket.tokens
        })
    }

    /// Evicts buckets idle for longer than the idle TTL
    pub async fn sweep(&self, now: Instant) -> usize {
        let mut evicted = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().await;
            let before = shard.len();
            shard.retain(|_, bucket| {
                now.saturating_duration_since(bucket.last_refill) <= self.idle_ttl
            });
            evicted += before - shard.len();
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.lock().await.len();
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([203, 0, 113, last])
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_up_to_capacity() {
        let limiter = RateLimiter::new(10, 1.0, Duration::from_secs(60));
        let now = Instant::now();

        let admitted = {
            let mut count = 0;
            for _ in 0..200 {
                if limiter.check(ip(1), now).await == Admission::Admitted {
                    count += 1;
                }
            }
            count
        };

        assert_eq!(admitted, 10);
        let tokens = limiter.tokens(ip(1), now).await.unwrap();
        assert!(tokens >= 0.0);
        assert_approx_eq!(tokens, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_over_time() {
        let limiter = RateLimiter::new(2, 4.0, Duration::from_secs(60));
        let start = Instant::now();

        assert_eq!(limiter.check(ip(2), start).await, Admission::Admitted);
        assert_eq!(limiter.check(ip(2), start).await, Admission::Admitted);
        assert_eq!(
            limiter.check(ip(2), start).await,
            Admission::Dropped { consecutive: 1 }
        );
        assert_eq!(
            limiter.check(ip(2), start).await,
            Admission::Dropped { consecutive: 2 }
        );

        let later = start + Duration::from_millis(250);
        assert_approx_eq!(limiter.tokens(ip(2), later).await.unwrap(), 1.0);
        assert_eq!(limiter.check(ip(2), later).await, Admission::Admitted);

        let much_later = start + Duration::from_secs(10);
        assert_approx_eq!(limiter.tokens(ip(2), much_later).await.unwrap(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buckets_are_per_address() {
        let limiter = RateLimiter::new(1, 0.0, Duration::from_secs(60));
        let now = Instant::now();

        assert_eq!(limiter.check(ip(3), now).await, Admission::Admitted);
        assert!(matches!(limiter.check(ip(3), now).await, Admission::Dropped { .. }));
        assert_eq!(limiter.check(ip(4), now).await, Admission::Admitted);
        assert_eq!(limiter.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_idle_buckets() {
        let limiter = RateLimiter::new(5, 1.0, Duration::from_secs(30));
        let start = Instant::now();

        limiter.check(ip(5), start).await;
        limiter.check(ip(6), start + Duration::from_secs(20)).await;

        let evicted = limiter.sweep(start + Duration::from_secs(40)).await;
        assert_eq!(evicted, 1);
        assert_eq!(limiter.len().await, 1);
        assert!(limiter.tokens(ip(5), start).await.is_none());
    }
}
