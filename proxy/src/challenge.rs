//! Challenge handling on both sides of the proxy.
//!
//! [`ChallengeStore`] tracks the challenge a backend issued to the proxy.
//! [`ClientChallenges`] issues the proxy's own challenges to clients so that
//! cached player and rule lists are only sent to addresses that can receive.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::time::Duration;

use shared::{QueryType, EMPTY_CHALLENGE};
use tokio::time::Instant;

/// How long a backend challenge is trusted before an unchallenged request is sent again
pub const CHALLENGE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    NoChallenge,
    ChallengeRequested,
    ChallengeValid { value: i32, issued_at: Instant },
    Expired { value: i32 },
}

/// What a new challenge from the backend did to the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeUpdate {
    Issued,
    Unchanged,
    Changed { previous: i32 },
}

/// Challenge exchange state for a single backend
#[derive(Debug)]
pub struct ChallengeStore {
    state: ChallengeState,
    ttl: Duration,
}

impl ChallengeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: ChallengeState::NoChallenge,
            ttl,
        }
    }

    /// Current state, with TTL expiry applied
    pub fn state(&mut self, now: Instant) -> ChallengeState {
        if let ChallengeState::ChallengeValid { value, issued_at } = self.state {
            if now.saturating_duration_since(issued_at) >= self.ttl {
                self.state = ChallengeState::Expired { value };
            }
        }
        self.state
    }

    /// Challenge to attach to the next request for `query`.
    ///
    /// Returns `None` when an unchallenged request should be sent instead.
    /// Only queries that always need a challenge move the store into
    /// `ChallengeRequested`.
    pub fn challenge_for(&mut self, query: QueryType, now: Instant) -> Option<i32> {
        match self.state(now) {
            ChallengeState::ChallengeValid { value, .. } => Some(value),
            _ if query.requires_challenge() => {
                self.state = ChallengeState::ChallengeRequested;
                None
            }
            _ => None,
        }
    }

    /// Records a challenge received from the backend
    pub fn on_challenge(&mut self, value: i32, now: Instant) -> ChallengeUpdate {
        let update = match self.state(now) {
            ChallengeState::ChallengeValid { value: current, .. } if current == value => {
                ChallengeUpdate::Unchanged
            }
            ChallengeState::ChallengeValid { value: previous, .. }
            | ChallengeState::Expired { value: previous }
                if previous != value =>
            {
                ChallengeUpdate::Changed { previous }
            }
            _ => ChallengeUpdate::Issued,
        };
        self.state = ChallengeState::ChallengeValid {
            value,
            issued_at: now,
        };
        update
    }

    /// Marks the stored challenge as unusable; the next query goes out unchallenged
    pub fn invalidate(&mut self) {
        self.state = match self.state {
            ChallengeState::ChallengeValid { value, .. } | ChallengeState::Expired { value } => {
                ChallengeState::Expired { value }
            }
            _ => ChallengeState::NoChallenge,
        };
    }

    pub fn reset(&mut self) {
        self.state = ChallengeState::NoChallenge;
    }
}

impl Default for ChallengeStore {
    fn default() -> Self {
        Self::new(CHALLENGE_TTL)
    }
}

/// Proxy-issued challenges, derived per client IP from a process secret
#[derive(Debug)]
pub struct ClientChallenges {
    secret: u64,
}

impl ClientChallenges {
    pub fn new() -> Self {
        Self::with_secret(rand::random())
    }

    pub fn with_secret(secret: u64) -> Self {
        Self { secret }
    }

    pub fn challenge_for(&self, ip: IpAddr) -> i32 {
        let mut hasher = DefaultHasher::new();
        self.secret.hash(&mut hasher);
        ip.hash(&mut hasher);
        let value = hasher.finish() as i32;
        // The empty value would read as "no challenge" on the way back.
        if value == EMPTY_CHALLENGE {
            0
        } else {
            value
        }
    }

    pub fn verify(&self, ip: IpAddr, challenge: Option<i32>) -> bool {
        challenge == Some(self.challenge_for(ip))
    }
}

impl Default for ClientChallenges {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_unchallenged_then_valid() {
        let mut store = ChallengeStore::default();
        let now = Instant::now();

        assert_eq!(store.state(now), ChallengeState::NoChallenge);
        assert_eq!(store.challenge_for(QueryType::Players, now), None);
        assert_eq!(store.state(now), ChallengeState::ChallengeRequested);

        assert_eq!(store.on_challenge(0xBEEF, now), ChallengeUpdate::Issued);
        assert_eq!(store.challenge_for(QueryType::Players, now), Some(0xBEEF));
        assert_eq!(store.challenge_for(QueryType::Info, now), Some(0xBEEF));
    }

    #[tokio::test(start_paused = true)]
    async fn test_info_never_needs_challenge() {
        let mut store = ChallengeStore::default();
        let now = Instant::now();

        assert_eq!(store.challenge_for(QueryType::Info, now), None);
        assert_eq!(store.state(now), ChallengeState::NoChallenge);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_forces_new_handshake() {
        let mut store = ChallengeStore::new(Duration::from_secs(10));
        let start = Instant::now();
        store.on_challenge(7, start);

        let later = start + Duration::from_secs(10);
        assert_eq!(store.state(later), ChallengeState::Expired { value: 7 });
        assert_eq!(store.challenge_for(QueryType::Rules, later), None);
        assert_eq!(store.state(later), ChallengeState::ChallengeRequested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_challenge_is_reported() {
        let mut store = ChallengeStore::default();
        let now = Instant::now();

        store.on_challenge(1, now);
        assert_eq!(store.on_challenge(1, now), ChallengeUpdate::Unchanged);
        assert_eq!(
            store.on_challenge(2, now),
            ChallengeUpdate::Changed { previous: 1 }
        );
        assert_eq!(store.challenge_for(QueryType::Players, now), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_reset() {
        let mut store = ChallengeStore::default();
        let now = Instant::now();

        store.invalidate();
        assert_eq!(store.state(now), ChallengeState::NoChallenge);

        store.on_challenge(5, now);
        store.invalidate();
        assert_eq!(store.state(now), ChallengeState::Expired { value: 5 });
        assert_eq!(store.challenge_for(QueryType::Players, now), None);

        store.reset();
        assert_eq!(store.state(now), ChallengeState::NoChallenge);
    }

    #[test]
    fn test_client_challenges_are_per_address() {
        let challenges = ClientChallenges::with_secret(42);
        let a: IpAddr = "192.0.2.1".parse().unwrap();
        let b: IpAddr = "192.0.2.2".parse().unwrap();

        let value = challenges.challenge_for(a);
        assert_eq!(value, challenges.challenge_for(a));
        assert_ne!(value, EMPTY_CHALLENGE);
        assert!(challenges.verify(a, Some(value)));
        assert!(!challenges.verify(a, None));
        assert!(!challenges.verify(b, Some(value)) || challenges.challenge_for(b) == value);
    }

    #[test]
    fn test_client_challenges_depend_on_secret() {
        let ip: IpAddr = "198.51.100.7".parse().unwrap();
        let first = ClientChallenges::with_secret(1).challenge_for(ip);
        let second = ClientChallenges::with_secret(2).challenge_for(ip);
        assert_ne!(first, second);
    }
}
