//! Source-address denylist.
//!
//! [`PacketFilter`] is the seam for a kernel-level filter (e.g. an XDP map)
//! that drops abusive sources before they reach userspace. [`Denylist`] is the
//! in-process implementation used when no such filter is attached.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

pub trait PacketFilter: Send + Sync {
    /// Denies `addr` for `duration`
    fn add(&self, addr: IpAddr, duration: Duration);
    fn contains(&self, addr: IpAddr) -> bool;
}

#[derive(Debug, Default)]
pub struct Denylist {
    entries: Mutex<HashMap<IpAddr, Instant>>,
}

impl Denylist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_at(&self, addr: IpAddr, duration: Duration, now: Instant) {
        let expires_at = now + duration;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(addr).or_insert(expires_at);
        *entry = (*entry).max(expires_at);
    }

    pub fn contains_at(&self, addr: IpAddr, now: Instant) -> bool {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(&addr).is_some_and(|&expires_at| expires_at > now)
    }

    /// Drops expired entries, returning how many were removed
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PacketFilter for Denylist {
    fn add(&self, addr: IpAddr, duration: Duration) {
        self.add_at(addr, duration, Instant::now());
    }

    fn contains(&self, addr: IpAddr) -> bool {
        self.contains_at(addr, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> IpAddr {
        "198.51.100.23".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires() {
        let denylist = Denylist::new();
        denylist.add(addr(), Duration::from_secs(5));
        assert!(denylist.contains(addr()));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!denylist.contains(addr()));
        assert_eq!(denylist.sweep(Instant::now()), 1);
        assert!(denylist.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_longer_ban_wins() {
        let denylist = Denylist::new();
        let now = Instant::now();
        denylist.add_at(addr(), Duration::from_secs(60), now);
        denylist.add_at(addr(), Duration::from_secs(1), now);

        assert!(denylist.contains_at(addr(), now + Duration::from_secs(30)));
        assert_eq!(denylist.len(), 1);
    }

    #[test]
    fn test_usable_as_trait_object() {
        let filter: Box<dyn PacketFilter> = Box::new(Denylist::new());
        let other: IpAddr = "192.0.2.9".parse().unwrap();
        filter.add(addr(), Duration::from_secs(60));
        assert!(filter.contains(addr()));
        assert!(!filter.contains(other));
    }
}
