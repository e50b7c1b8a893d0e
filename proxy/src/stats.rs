//! Process-wide counters, logged periodically.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    pub requests: AtomicU64,
    pub decode_errors: AtomicU64,
    pub rate_limited: AtomicU64,
    pub denied: AtomicU64,
    pub challenges_issued: AtomicU64,
    pub cache_fresh: AtomicU64,
    pub cache_stale_served: AtomicU64,
    pub cache_miss: AtomicU64,
    pub dropped_unavailable: AtomicU64,
    pub polls_ok: AtomicU64,
    pub polls_failed: AtomicU64,
    pub replies: AtomicU64,
    pub reply_bytes: AtomicU64,
}

/// Point-in-time copy of [`Stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub decode_errors: u64,
    pub rate_limited: u64,
    pub denied: u64,
    pub challenges_issued: u64,
    pub cache_fresh: u64,
    pub cache_stale_served: u64,
    pub cache_miss: u64,
    pub dropped_unavailable: u64,
    pub polls_ok: u64,
    pub polls_failed: u64,
    pub replies: u64,
    pub reply_bytes: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            requests: load(&self.requests),
            decode_errors: load(&self.decode_errors),
            rate_limited: load(&self.rate_limited),
            denied: load(&self.denied),
            challenges_issued: load(&self.challenges_issued),
            cache_fresh: load(&self.cache_fresh),
            cache_stale_served: load(&self.cache_stale_served),
            cache_miss: load(&self.cache_miss),
            dropped_unavailable: load(&self.dropped_unavailable),
            polls_ok: load(&self.polls_ok),
            polls_failed: load(&self.polls_failed),
            replies: load(&self.replies),
            reply_bytes: load(&self.reply_bytes),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requests={} replies={} ({} bytes) fresh={} stale={} miss={} unavailable={} \
             challenges={} rate_limited={} denied={} decode_errors={} polls_ok={} polls_failed={}",
            self.requests,
            self.replies,
            self.reply_bytes,
            self.cache_fresh,
            self.cache_stale_served,
            self.cache_miss,
            self.dropped_unavailable,
            self.challenges_issued,
            self.rate_limited,
            self.denied,
            self.decode_errors,
            self.polls_ok,
            self.polls_failed
        )
    }
}
