//! UDP conversation with one backend game server.
//!
//! A poller owns a single connected socket per backend. Queries against the
//! same backend are serialized on that socket. A late answer to an earlier
//! query of another type is recognized by its opcode and skipped. The socket
//! is re-opened after its configured lifetime, resetting the challenge
//! exchange with it.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use shared::info::InfoSummary;
use shared::{
    decode_response, encode_request, hex_preview, CodecError, QueryType, Reassembler, Response,
    MAX_DATAGRAM_SIZE, SPLIT_PACKET_HEADER,
};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};

use crate::challenge::{ChallengeStore, ChallengeUpdate};
use crate::config::Backend;
use crate::error::{ProxyError, RefreshError};
use crate::stats::Stats;

/// Extra attempts after a timed-out round-trip
pub const MAX_TIMEOUT_RETRIES: u32 = 2;

/// Upper bound on how long fragments of one split response are buffered
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(3);

/// A partial split response never outlives the poll that could complete it
fn reassembly_timeout(backend: &Backend) -> Duration {
    REASSEMBLY_TIMEOUT.min(backend.timeout * (MAX_TIMEOUT_RETRIES + 1))
}

/// A successful poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledResponse {
    pub payload: Vec<u8>,
    pub source_addr: SocketAddr,
}

/// A complete answer to one request
enum Reply {
    Payload(Vec<u8>),
    Challenge(i32),
}

struct Link {
    socket: Option<UdpSocket>,
    opened_at: Instant,
    challenge: ChallengeStore,
    reassembler: Reassembler,
    buf: Vec<u8>,
}

pub struct BackendPoller {
    backend: Backend,
    link: Mutex<Link>,
    stats: Arc<Stats>,
}

impl BackendPoller {
    pub fn new(backend: Backend, stats: Arc<Stats>) -> Self {
        Self {
            link: Mutex::new(Link {
                socket: None,
                opened_at: Instant::now(),
                challenge: ChallengeStore::default(),
                reassembler: Reassembler::new(reassembly_timeout(&backend)),
                buf: vec![0u8; MAX_DATAGRAM_SIZE],
            }),
            backend,
            stats,
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Queries the backend, retrying timed-out round-trips a bounded number
    /// of times. Protocol errors fail the poll immediately.
    pub async fn poll(&self, query: QueryType) -> Result<PolledResponse, RefreshError> {
        let mut link = self.link.lock().await;

        for attempt in 0..=MAX_TIMEOUT_RETRIES {
            let start = Instant::now();
            match self.round_trip(&mut link, query).await {
                Ok(payload) => {
                    Stats::incr(&self.stats.polls_ok);
                    self.log_success(query, &payload, start.elapsed());
                    return Ok(PolledResponse {
                        payload,
                        source_addr: self.backend.address,
                    });
                }
                Err(ProxyError::BackendTimeout(_)) => {
                    debug!(
                        "[{}] {} attempt {} timed out",
                        self.backend.name,
                        query,
                        attempt + 1
                    );
                }
                Err(ProxyError::Io(e)) => {
                    debug!(
                        "[{}] {} attempt {} failed: {}",
                        self.backend.name,
                        query,
                        attempt + 1,
                        e
                    );
                    link.socket = None;
                }
                Err(e) => {
                    Stats::incr(&self.stats.polls_failed);
                    warn!("[{}] {} poll failed: {}", self.backend.name, query, e);
                    return Err(RefreshError::BackendProtocol(e.to_string()));
                }
            }
        }

        Stats::incr(&self.stats.polls_failed);
        warn!(
            "[{}] {} poll failed: {}",
            self.backend.name,
            query,
            ProxyError::BackendUnavailable(self.backend.address.to_string())
        );
        Err(RefreshError::BackendUnavailable)
    }

    /// One request, plus at most one immediate retry carrying a challenge
    async fn round_trip(&self, link: &mut Link, query: QueryType) -> Result<Vec<u8>, ProxyError> {
        self.ensure_socket(link).await?;

        let challenge = link.challenge.challenge_for(query, Instant::now());
        let value = match self.exchange(link, query, challenge).await? {
            Reply::Payload(payload) => return Ok(payload),
            Reply::Challenge(value) => value,
        };

        let update = link.challenge.on_challenge(value, Instant::now());
        if let ChallengeUpdate::Changed { previous } = update {
            warn!(
                "[{}] Challenge number changed: {} -> {}",
                self.backend.name, previous, value
            );
        }

        match self.exchange(link, query, Some(value)).await? {
            Reply::Payload(payload) => Ok(payload),
            Reply::Challenge(again) => {
                link.challenge.invalidate();
                Err(ProxyError::BackendProtocol {
                    backend: self.backend.name.clone(),
                    reason: format!("challenge {} rejected, server asked for {}", value, again),
                })
            }
        }
    }

    /// Sends one request and waits for the complete answer to it
    async fn exchange(
        &self,
        link: &mut Link,
        query: QueryType,
        challenge: Option<i32>,
    ) -> Result<Reply, ProxyError> {
        let Link {
            socket,
            reassembler,
            buf,
            ..
        } = link;
        let Some(socket) = socket.as_ref() else {
            return Err(ProxyError::BackendUnavailable(self.backend.name.clone()));
        };

        // Answers already queued for earlier, timed-out requests.
        while socket.try_recv(&mut buf[..]).is_ok() {}

        socket.send(&encode_request(query, challenge)).await?;
        let deadline = Instant::now() + self.backend.timeout;

        loop {
            let len = match timeout_at(deadline, socket.recv(&mut buf[..])).await {
                Ok(result) => result?,
                Err(_) => return Err(ProxyError::BackendTimeout(self.backend.name.clone())),
            };

            let now = Instant::now().into_std();
            for id in reassembler.sweep(now) {
                debug!("[{}] Abandoned split response {}", self.backend.name, id);
            }

            let decoded = match decode_response(&buf[..len], query) {
                Ok(Response::Fragment(fragment)) => match reassembler.accept(fragment, now) {
                    Ok(Some(message)) => decode_response(&message, query),
                    Ok(None) => continue,
                    Err(e) => {
                        debug!("[{}] Dropping split response: {}", self.backend.name, e);
                        continue;
                    }
                },
                other => other,
            };

            match decoded {
                Ok(Response::Payload(payload)) => return Ok(Reply::Payload(payload)),
                Ok(Response::ChallengeRequired(value)) => return Ok(Reply::Challenge(value)),
                Ok(Response::Fragment(_)) => {
                    return Err(self.protocol_error(CodecError::BadMagic(SPLIT_PACKET_HEADER)));
                }
                Err(CodecError::UnexpectedResponse { got, .. }) => {
                    let Some(late) = QueryType::from_response_opcode(got) else {
                        return Err(self.protocol_error(CodecError::UnexpectedResponse {
                            expected: query,
                            got,
                        }));
                    };
                    debug!(
                        "[{}] Skipping late {} reply while waiting for {}",
                        self.backend.name, late, query
                    );
                }
                Err(e) => debug!(
                    "[{}] Dropping malformed datagram ({}): {}",
                    self.backend.name,
                    e,
                    hex_preview(&buf[..len], 32)
                ),
            }
        }
    }

    async fn ensure_socket(&self, link: &mut Link) -> Result<(), ProxyError> {
        let now = Instant::now();
        let expired = now.saturating_duration_since(link.opened_at) >= self.backend.socket_lifetime;
        if link.socket.is_some() && !expired {
            return Ok(());
        }

        if link.socket.is_some() {
            debug!("[{}] Backend socket lifetime reached, reconnecting", self.backend.name);
        }

        let bind_addr: SocketAddr = if self.backend.address.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.backend.address).await?;
        debug!(
            "[{}] Connected to {} (local port {})",
            self.backend.name,
            self.backend.address,
            socket.local_addr()?.port()
        );

        link.socket = Some(socket);
        link.opened_at = now;
        link.challenge.reset();
        link.reassembler.clear();
        Ok(())
    }

    fn protocol_error(&self, e: CodecError) -> ProxyError {
        ProxyError::BackendProtocol {
            backend: self.backend.name.clone(),
            reason: e.to_string(),
        }
    }

    fn log_success(&self, query: QueryType, payload: &[u8], elapsed: Duration) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        match query {
            QueryType::Info => match InfoSummary::parse(payload) {
                Ok(summary) => debug!(
                    "[{}] Got {} in {:?}: {}",
                    self.backend.name, query, elapsed, summary
                ),
                Err(_) => debug!(
                    "[{}] Got {} ({} bytes) in {:?}",
                    self.backend.name,
                    query,
                    payload.len(),
                    elapsed
                ),
            },
            _ => debug!(
                "[{}] Got {} ({} bytes) in {:?}",
                self.backend.name,
                query,
                payload.len(),
                elapsed
            ),
        }
    }
}
