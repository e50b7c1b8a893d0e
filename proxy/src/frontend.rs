//! Client-facing socket for one backend.
//!
//! Every datagram goes through the same pipeline: denylist, decode, rate
//! limit, client challenge, cache lookup, reply. Anything that fails a step is
//! dropped without a reply; the proxy never fabricates error packets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use shared::{
    challenge_response, decode_request, encode_response, hex_preview, QueryType, MAX_DATAGRAM_SIZE,
};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::time::{timeout, Instant};

use crate::cache::{CachedResponse, Lookup, ResponseCache};
use crate::challenge::ClientChallenges;
use crate::config::{AbuseConfig, Backend, Config};
use crate::denylist::PacketFilter;
use crate::error::ProxyError;
use crate::rate_limit::{Admission, RateLimiter};
use crate::stats::Stats;

#[derive(Debug, Clone)]
pub struct FrontendSettings {
    pub max_packet_size: usize,
    pub client_timeout: Duration,
    pub require_info_challenge: bool,
    pub max_pending_clients: usize,
    pub abuse: Option<AbuseConfig>,
}

impl FrontendSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_packet_size: config.max_packet_size,
            client_timeout: config.client_timeout(),
            require_info_challenge: config.require_info_challenge,
            max_pending_clients: config.max_pending_clients,
            abuse: config.abuse.clone(),
        }
    }
}

/// State shared by every frontend of a proxy
#[derive(Clone)]
pub struct SharedState {
    pub cache: Arc<ResponseCache>,
    pub limiter: Arc<RateLimiter>,
    pub filter: Arc<dyn PacketFilter>,
    pub challenges: Arc<ClientChallenges>,
    pub stats: Arc<Stats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Denied,
    Malformed,
    RateLimited,
}

/// What to do with one inbound datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Drop(DropReason),
    /// Reply with the proxy's challenge for this client
    Challenge(i32),
    Serve(QueryType),
}

pub struct Frontend {
    backend: Backend,
    socket: Arc<UdpSocket>,
    state: SharedState,
    settings: FrontendSettings,
    pending: Arc<Semaphore>,
}

impl Frontend {
    pub async fn bind(
        backend: &Backend,
        state: SharedState,
        settings: FrontendSettings,
    ) -> Result<Arc<Self>, ProxyError> {
        let socket = UdpSocket::bind(backend.listen).await?;
        info!(
            "[{}] Listening on {} for backend {}",
            backend.name,
            socket.local_addr()?,
            backend.address
        );

        Ok(Arc::new(Self {
            backend: backend.clone(),
            socket: Arc::new(socket),
            state,
            pending: Arc::new(Semaphore::new(settings.max_pending_clients)),
            settings,
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.socket.local_addr()?)
    }

    /// Receives client datagrams until the socket fails permanently
    pub async fn run(self: Arc<Self>) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((len, addr)) => self.handle(&buffer[..len], addr).await,
                Err(e) => {
                    error!("[{}] Error receiving packet: {}", self.backend.name, e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    pub async fn handle(self: &Arc<Self>, data: &[u8], addr: SocketAddr) {
        Stats::incr(&self.state.stats.requests);
        match self.admit(data, addr).await {
            Verdict::Drop(_) => {}
            Verdict::Challenge(value) => {
                self.send_datagrams(&[challenge_response(value)], addr).await;
            }
            Verdict::Serve(query) => self.serve(query, addr).await,
        }
    }

    /// Validates a datagram and decides whether it deserves an answer
    pub async fn admit(&self, data: &[u8], addr: SocketAddr) -> Verdict {
        let stats = &self.state.stats;
        let ip = addr.ip();

        if self.state.filter.contains(ip) {
            Stats::incr(&stats.denied);
            return Verdict::Drop(DropReason::Denied);
        }

        let request = match decode_request(data) {
            Ok(request) => request,
            Err(e) => {
                Stats::incr(&stats.decode_errors);
                debug!(
                    "[{}] Broken request from {} ({}): {}",
                    self.backend.name,
                    addr,
                    e,
                    hex_preview(data, 32)
                );
                return Verdict::Drop(DropReason::Malformed);
            }
        };

        let admission = self.state.limiter.check(ip, Instant::now()).await;
        if let Admission::Dropped { consecutive } = admission {
            Stats::incr(&stats.rate_limited);
            debug!("[{}] Rate limited {} ({} in a row)", self.backend.name, ip, consecutive);
            if let Some(abuse) = &self.settings.abuse {
                if consecutive >= abuse.drop_threshold {
                    warn!(
                        "[{}] Denying {} for {:?} after {} dropped requests",
                        self.backend.name,
                        ip,
                        abuse.ban_duration(),
                        consecutive
                    );
                    self.state.filter.add(ip, abuse.ban_duration());
                }
            }
            return Verdict::Drop(DropReason::RateLimited);
        }

        let needs_challenge =
            request.query.requires_challenge() || self.settings.require_info_challenge;
        if needs_challenge && !self.state.challenges.verify(ip, request.challenge) {
            Stats::incr(&stats.challenges_issued);
            return Verdict::Challenge(self.state.challenges.challenge_for(ip));
        }

        Verdict::Serve(request.query)
    }

    async fn serve(self: &Arc<Self>, query: QueryType, addr: SocketAddr) {
        let stats = &self.state.stats;
        let stale = match self.state.cache.get(self.backend.id, query).await {
            Lookup::Fresh(response) => {
                Stats::incr(&stats.cache_fresh);
                self.reply(&response, addr).await;
                return;
            }
            Lookup::Stale {
                response,
                backend_unreachable: true,
            } => {
                // Known to be down: answer now and let the poll retry in the background.
                drop(self.state.cache.begin_refresh(self.backend.id, query).await);
                self.serve_stale(&response, addr).await;
                return;
            }
            Lookup::Stale { response, .. } => Some(response),
            Lookup::Miss => {
                Stats::incr(&stats.cache_miss);
                debug!("[{}] Cache miss for {}", self.backend.name, query);
                None
            }
        };

        let Ok(permit) = Arc::clone(&self.pending).try_acquire_owned() else {
            match stale {
                Some(response) => self.serve_stale(&response, addr).await,
                None => Stats::incr(&stats.dropped_unavailable),
            }
            return;
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            this.await_refresh(query, stale, addr).await;
        });
    }

    /// Waits on the shared refresh for this client only, up to the client timeout
    async fn await_refresh(
        &self,
        query: QueryType,
        stale: Option<Arc<CachedResponse>>,
        addr: SocketAddr,
    ) {
        let flight = self.state.cache.begin_refresh(self.backend.id, query).await;
        let outcome = timeout(self.settings.client_timeout, flight.wait()).await;

        if let Ok(Some(Ok(response))) = outcome {
            self.reply(&response, addr).await;
            return;
        }

        match stale {
            Some(response) => self.serve_stale(&response, addr).await,
            None => {
                Stats::incr(&self.state.stats.dropped_unavailable);
                debug!(
                    "[{}] No {} data for {}, dropping request",
                    self.backend.name, query, addr
                );
            }
        }
    }

    async fn serve_stale(&self, response: &CachedResponse, addr: SocketAddr) {
        Stats::incr(&self.state.stats.cache_stale_served);
        info!(
            "[{}] Serving stale {} to {} (age {:?})",
            self.backend.name,
            response.query,
            addr,
            response.age(Instant::now())
        );
        self.reply(response, addr).await;
    }

    async fn reply(&self, response: &CachedResponse, addr: SocketAddr) {
        match encode_response(
            &response.payload,
            self.settings.max_packet_size,
            rand::random(),
        ) {
            Ok(datagrams) => self.send_datagrams(&datagrams, addr).await,
            Err(e) => warn!(
                "[{}] Cannot encode {} reply: {}",
                self.backend.name, response.query, e
            ),
        }
    }

    async fn send_datagrams(&self, datagrams: &[Vec<u8>], addr: SocketAddr) {
        let stats = &self.state.stats;
        for datagram in datagrams {
            if let Err(e) = self.socket.send_to(datagram, addr).await {
                error!("[{}] Failed to send reply to {}: {}", self.backend.name, addr, e);
                return;
            }
            Stats::add(&stats.reply_bytes, datagram.len() as u64);
        }
        Stats::incr(&stats.replies);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendId;
    use crate::denylist::Denylist;
    use shared::encode_request;

    fn backend() -> Backend {
        Backend {
            id: BackendId(0),
            name: "test".to_string(),
            listen: "127.0.0.1:0".parse().unwrap(),
            address: "127.0.0.1:9".parse().unwrap(),
            poll_interval: Duration::from_secs(1),
            players_poll_interval: Duration::from_secs(1),
            rules_poll_interval: Duration::from_secs(1),
            timeout: Duration::from_millis(100),
            socket_lifetime: Duration::from_secs(300),
        }
    }

    fn settings(capacity_abuse: Option<u32>) -> FrontendSettings {
        FrontendSettings {
            max_packet_size: 1400,
            client_timeout: Duration::from_millis(100),
            require_info_challenge: false,
            max_pending_clients: 16,
            abuse: capacity_abuse.map(|drop_threshold| AbuseConfig {
                drop_threshold,
                ban_duration_ms: 60_000,
            }),
        }
    }

    async fn frontend(capacity: u32, abuse: Option<u32>) -> (Arc<Frontend>, Arc<Denylist>) {
        frontend_with(capacity, settings(abuse)).await
    }

    async fn frontend_with(
        capacity: u32,
        settings: FrontendSettings,
    ) -> (Arc<Frontend>, Arc<Denylist>) {
        let denylist = Arc::new(Denylist::new());
        let state = SharedState {
            cache: Arc::new(ResponseCache::new(
                Vec::new(),
                Duration::from_secs(5),
                Duration::from_secs(60),
            )),
            limiter: Arc::new(RateLimiter::new(capacity, 0.0, Duration::from_secs(60))),
            filter: Arc::clone(&denylist) as Arc<dyn PacketFilter>,
            challenges: Arc::new(ClientChallenges::with_secret(7)),
            stats: Arc::new(Stats::new()),
        };
        let frontend = Frontend::bind(&backend(), state, settings).await.unwrap();
        (frontend, denylist)
    }

    fn client() -> SocketAddr {
        "192.0.2.10:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_info_is_served_without_challenge() {
        let (frontend, _) = frontend(10, None).await;
        let verdict = frontend.admit(&encode_request(QueryType::Info, None), client()).await;
        assert_eq!(verdict, Verdict::Serve(QueryType::Info));
    }

    #[tokio::test]
    async fn test_players_requires_proxy_challenge() {
        let (frontend, _) = frontend(10, None).await;
        let expected = frontend.state.challenges.challenge_for(client().ip());

        let verdict = frontend
            .admit(&encode_request(QueryType::Players, None), client())
            .await;
        assert_eq!(verdict, Verdict::Challenge(expected));

        let verdict = frontend
            .admit(&encode_request(QueryType::Players, Some(expected ^ 1)), client())
            .await;
        assert_eq!(verdict, Verdict::Challenge(expected));

        let verdict = frontend
            .admit(&encode_request(QueryType::Rules, Some(expected)), client())
            .await;
        assert_eq!(verdict, Verdict::Serve(QueryType::Rules));
        assert_eq!(frontend.state.stats.snapshot().challenges_issued, 2);
    }

    #[tokio::test]
    async fn test_malformed_is_dropped() {
        let (frontend, _) = frontend(10, None).await;
        let verdict = frontend.admit(b"\xFF\xFF\xFF\xFFZ", client()).await;
        assert_eq!(verdict, Verdict::Drop(DropReason::Malformed));
        assert_eq!(frontend.state.stats.snapshot().decode_errors, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_escalates_to_denylist() {
        let (frontend, denylist) = frontend(2, Some(3)).await;
        let request = encode_request(QueryType::Info, None);

        let mut verdicts = Vec::new();
        for _ in 0..7 {
            verdicts.push(frontend.admit(&request, client()).await);
        }

        assert_eq!(verdicts[0], Verdict::Serve(QueryType::Info));
        assert_eq!(verdicts[1], Verdict::Serve(QueryType::Info));
        assert_eq!(verdicts[2], Verdict::Drop(DropReason::RateLimited));
        assert_eq!(verdicts[4], Verdict::Drop(DropReason::RateLimited));
        assert_eq!(verdicts[5], Verdict::Drop(DropReason::Denied));
        assert_eq!(verdicts[6], Verdict::Drop(DropReason::Denied));
        assert!(denylist.contains(client().ip()));

        let snapshot = frontend.state.stats.snapshot();
        assert_eq!(snapshot.rate_limited, 3);
        assert_eq!(snapshot.denied, 2);
    }

    #[tokio::test]
    async fn test_unknown_backend_miss_gets_no_reply() {
        let (frontend, _) = frontend(10, None).await;
        let local = frontend.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let runner = tokio::spawn(Arc::clone(&frontend).run());
        client
            .send_to(&encode_request(QueryType::Info, None), local)
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let received = timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
        assert!(received.is_err());
        assert_eq!(frontend.state.stats.snapshot().dropped_unavailable, 1);
        runner.abort();
    }

    fn cached_info(fetched_at: Instant) -> CachedResponse {
        CachedResponse {
            backend: BackendId(0),
            query: QueryType::Info,
            payload: vec![0xFF, 0xFF, 0xFF, 0xFF, b'I', 0x11, b'x', 0],
            fetched_at,
            source_addr: "127.0.0.1:27015".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_info_challenge_when_required() {
        let mut settings = settings(None);
        settings.require_info_challenge = true;
        let (frontend, _) = frontend_with(10, settings).await;
        let local = frontend.local_addr().unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let runner = tokio::spawn(Arc::clone(&frontend).run());

        let request = encode_request(QueryType::Info, None);
        socket.send_to(&request, local).await.unwrap();
        let mut buf = [0u8; 64];
        let (len, _) = timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        let expected = frontend.state.challenges.challenge_for(socket.local_addr().unwrap().ip());
        assert_eq!(&buf[..len], &challenge_response(expected)[..]);
        assert!(len <= request.len());

        let verdict = frontend
            .admit(
                &encode_request(QueryType::Info, Some(expected)),
                socket.local_addr().unwrap(),
            )
            .await;
        assert_eq!(verdict, Verdict::Serve(QueryType::Info));
        runner.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_frontend_serves_stale_at_once() {
        let mut settings = settings(None);
        settings.max_pending_clients = 0;
        let (frontend, _) = frontend_with(10, settings).await;
        let stored = frontend.state.cache.store(cached_info(Instant::now())).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        frontend
            .handle(
                &encode_request(QueryType::Info, None),
                socket.local_addr().unwrap(),
            )
            .await;

        let mut buf = [0u8; 64];
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &stored.payload[..]);

        let snapshot = frontend.state.stats.snapshot();
        assert_eq!(snapshot.cache_stale_served, 1);
        assert_eq!(snapshot.replies, 1);
        assert_eq!(snapshot.dropped_unavailable, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_frontend_drops_miss() {
        let mut settings = settings(None);
        settings.max_pending_clients = 0;
        let (frontend, _) = frontend_with(10, settings).await;

        frontend
            .handle(&encode_request(QueryType::Info, None), client())
            .await;

        let snapshot = frontend.state.stats.snapshot();
        assert_eq!(snapshot.cache_miss, 1);
        assert_eq!(snapshot.dropped_unavailable, 1);
        assert_eq!(snapshot.replies, 0);
    }
}
