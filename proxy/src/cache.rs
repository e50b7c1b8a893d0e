//! Latest backend response per (backend, query type).
//!
//! Entries are immutable and replaced wholesale by newer responses. Refreshes
//! go through a [`SingleFlight`] registry so that keep-alive polling and client
//! misses never put two identical queries in flight against one backend.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use shared::QueryType;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::BackendId;
use crate::error::RefreshError;
use crate::poller::BackendPoller;
use crate::single_flight::{Flight, SingleFlight};

const SHARD_COUNT: usize = 8;

pub type CacheKey = (BackendId, QueryType);
pub type RefreshOutcome = Result<Arc<CachedResponse>, RefreshError>;

#[derive(Debug, PartialEq, Eq)]
pub struct CachedResponse {
    pub backend: BackendId,
    pub query: QueryType,
    /// Complete logical response, starting with the single-packet header
    pub payload: Vec<u8>,
    pub fetched_at: Instant,
    pub source_addr: SocketAddr,
}

impl CachedResponse {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.fetched_at)
    }
}

#[derive(Debug, Clone)]
pub enum Lookup {
    Fresh(Arc<CachedResponse>),
    /// Past `max_staleness` but still the best data known
    Stale {
        response: Arc<CachedResponse>,
        backend_unreachable: bool,
    },
    Miss,
}

#[derive(Debug, Default)]
struct Slot {
    latest: Option<Arc<CachedResponse>>,
    /// Set when the last poll exhausted its retries
    unreachable_since: Option<Instant>,
}

pub struct ResponseCache {
    shards: Vec<RwLock<HashMap<CacheKey, Slot>>>,
    flights: Arc<SingleFlight<CacheKey, RefreshOutcome>>,
    pollers: HashMap<BackendId, Arc<BackendPoller>>,
    max_staleness: Duration,
    eviction_ttl: Duration,
}

impl ResponseCache {
    pub fn new(
        pollers: Vec<Arc<BackendPoller>>,
        max_staleness: Duration,
        eviction_ttl: Duration,
    ) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            flights: Arc::new(SingleFlight::new()),
            pollers: pollers
                .into_iter()
                .map(|poller| (poller.backend().id, poller))
                .collect(),
            max_staleness,
            eviction_ttl,
        }
    }

    fn shard(&self, key: &CacheKey) -> &RwLock<HashMap<CacheKey, Slot>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }

    pub async fn get(&self, backend: BackendId, query: QueryType) -> Lookup {
        self.get_at(backend, query, Instant::now()).await
    }

    pub async fn get_at(&self, backend: BackendId, query: QueryType, now: Instant) -> Lookup {
        let key = (backend, query);
        let shard = self.shard(&key).read().await;
        let Some(slot) = shard.get(&key) else {
            return Lookup::Miss;
        };
        match &slot.latest {
            Some(response) if response.age(now) < self.max_staleness => {
                Lookup::Fresh(Arc::clone(response))
            }
            Some(response) => Lookup::Stale {
                response: Arc::clone(response),
                backend_unreachable: slot.unreachable_since.is_some(),
            },
            None => Lookup::Miss,
        }
    }

    /// Replaces the entry for the response's key
    pub async fn store(&self, response: CachedResponse) -> Arc<CachedResponse> {
        let key = (response.backend, response.query);
        let response = Arc::new(response);
        let mut shard = self.shard(&key).write().await;
        let slot = shard.entry(key).or_default();
        slot.latest = Some(Arc::clone(&response));
        slot.unreachable_since = None;
        response
    }

    pub async fn mark_unreachable(&self, backend: BackendId, query: QueryType, now: Instant) {
        let key = (backend, query);
        let mut shard = self.shard(&key).write().await;
        let slot = shard.entry(key).or_default();
        slot.unreachable_since.get_or_insert(now);
    }

    pub async fn is_unreachable(&self, backend: BackendId, query: QueryType) -> bool {
        let key = (backend, query);
        let shard = self.shard(&key).read().await;
        shard
            .get(&key)
            .is_some_and(|slot| slot.unreachable_since.is_some())
    }

    /// Triggers a poll for the key, or joins the one already running
    pub async fn begin_refresh(
        self: &Arc<Self>,
        backend: BackendId,
        query: QueryType,
    ) -> Flight<RefreshOutcome> {
        let cache = Arc::clone(self);
        let flight = self
            .flights
            .join((backend, query), move || async move {
                cache.fetch(backend, query).await
            })
            .await;
        if !flight.is_leader() {
            debug!("Joined in-flight {} poll for backend {:?}", query, backend);
        }
        flight
    }

    /// Triggers or joins a poll and waits for its outcome
    pub async fn refresh(self: &Arc<Self>, backend: BackendId, query: QueryType) -> RefreshOutcome {
        self.begin_refresh(backend, query)
            .await
            .wait()
            .await
            .unwrap_or(Err(RefreshError::BackendUnavailable))
    }

    async fn fetch(&self, backend: BackendId, query: QueryType) -> RefreshOutcome {
        let poller = self
            .pollers
            .get(&backend)
            .ok_or(RefreshError::UnknownBackend)?;

        match poller.poll(query).await {
            Ok(polled) => Ok(self
                .store(CachedResponse {
                    backend,
                    query,
                    payload: polled.payload,
                    fetched_at: Instant::now(),
                    source_addr: polled.source_addr,
                })
                .await),
            Err(RefreshError::BackendUnavailable) => {
                self.mark_unreachable(backend, query, Instant::now()).await;
                Err(RefreshError::BackendUnavailable)
            }
            Err(e) => Err(e),
        }
    }

    /// Drops last-known-good data older than the eviction TTL
    pub async fn evict_expired(&self, now: Instant) -> usize {
        let mut evicted = 0;
        for shard in &self.shards {
            let mut shard = shard.write().await;
            let before = shard.len();
            shard.retain(|_, slot| {
                slot.latest
                    .as_ref()
                    .is_some_and(|response| response.age(now) <= self.eviction_ttl)
            });
            evicted += before - shard.len();
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.read().await.len();
        }
        total
    }
}
