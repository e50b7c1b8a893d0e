//! Wires frontends, pollers and background tasks into one running proxy

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info};
use shared::QueryType;
use tokio::task::JoinSet;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use crate::cache::ResponseCache;
use crate::challenge::ClientChallenges;
use crate::config::{Backend, Config};
use crate::denylist::{Denylist, PacketFilter};
use crate::error::ProxyError;
use crate::frontend::{Frontend, FrontendSettings, SharedState};
use crate::poller::BackendPoller;
use crate::rate_limit::RateLimiter;
use crate::stats::Stats;

pub struct Proxy {
    backends: Vec<Backend>,
    frontends: Vec<Arc<Frontend>>,
    state: SharedState,
    denylist: Arc<Denylist>,
    sweep_interval: Duration,
    stats_interval: Duration,
}

impl Proxy {
    /// Validates the config and binds one client socket per backend
    pub async fn bind(config: Config) -> Result<Self, ProxyError> {
        config.validate()?;

        let stats = Arc::new(Stats::new());
        let backends = config.backends();
        let pollers = backends
            .iter()
            .map(|backend| Arc::new(BackendPoller::new(backend.clone(), Arc::clone(&stats))))
            .collect();
        let denylist = Arc::new(Denylist::new());

        let state = SharedState {
            cache: Arc::new(ResponseCache::new(
                pollers,
                config.max_staleness(),
                config.cache_idle_eviction_ttl(),
            )),
            limiter: Arc::new(RateLimiter::from_config(&config.rate_limit)),
            filter: Arc::clone(&denylist) as Arc<dyn PacketFilter>,
            challenges: Arc::new(ClientChallenges::new()),
            stats,
        };

        let settings = FrontendSettings::from_config(&config);
        let mut frontends = Vec::with_capacity(backends.len());
        for backend in &backends {
            frontends.push(Frontend::bind(backend, state.clone(), settings.clone()).await?);
        }

        Ok(Self {
            backends,
            frontends,
            state,
            denylist,
            sweep_interval: config.sweep_interval(),
            stats_interval: config.stats_interval(),
        })
    }

    /// Client-facing addresses, in backend order
    pub fn local_addrs(&self) -> Result<Vec<SocketAddr>, ProxyError> {
        self.frontends
            .iter()
            .map(|frontend| frontend.local_addr())
            .collect()
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.state.stats)
    }

    pub fn cache(&self) -> Arc<ResponseCache> {
        Arc::clone(&self.state.cache)
    }

    pub fn denylist(&self) -> Arc<Denylist> {
        Arc::clone(&self.denylist)
    }

    /// Runs until every task has exited, which only happens on panic
    pub async fn run(self) -> Result<(), ProxyError> {
        let mut tasks = JoinSet::new();

        for frontend in &self.frontends {
            tasks.spawn(Arc::clone(frontend).run());
        }

        for backend in &self.backends {
            for query in QueryType::ALL {
                tasks.spawn(keep_alive(
                    Arc::clone(&self.state.cache),
                    backend.clone(),
                    query,
                ));
            }
        }

        tasks.spawn(sweep(
            self.state.clone(),
            Arc::clone(&self.denylist),
            self.sweep_interval,
        ));
        tasks.spawn(report_stats(Arc::clone(&self.state.stats), self.stats_interval));

        info!("Proxy running for {} backend(s)", self.backends.len());

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Proxy task failed: {}", e);
            }
        }
        Ok(())
    }
}

/// Polls one (backend, query) pair on its own cadence, regardless of demand
async fn keep_alive(cache: Arc<ResponseCache>, backend: Backend, query: QueryType) {
    let mut ticker = interval(backend.poll_interval_for(query));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if let Err(e) = cache.refresh(backend.id, query).await {
            debug!("[{}] Keep-alive {} poll failed: {}", backend.name, query, e);
        }
    }
}

async fn sweep(state: SharedState, denylist: Arc<Denylist>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick fires immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let now = Instant::now();
        let buckets = state.limiter.sweep(now).await;
        let denied = denylist.sweep(now);
        let evicted = state.cache.evict_expired(now).await;
        if buckets + denied + evicted > 0 {
            debug!(
                "Swept {} rate buckets, {} denylist entries, {} cache entries",
                buckets, denied, evicted
            );
        }
    }
}

async fn report_stats(stats: Arc<Stats>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        info!("Stats: {}", stats.snapshot());
    }
}
