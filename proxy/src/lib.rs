//! # Source Query Proxy
//!
//! A caching UDP proxy for the Source engine query protocol (A2S). It answers
//! `A2S_INFO`, `A2S_PLAYERS` and `A2S_RULES` on behalf of one or more game
//! servers so that those servers never talk to arbitrary internet clients,
//! and cannot be used to reflect or amplify traffic.
//!
//! ## Request Path
//!
//! Each backend gets its own client-facing socket ([`frontend`]). A datagram
//! is checked against the denylist, decoded, charged against its source's
//! token bucket and, for queries that need it, against a proxy-issued
//! challenge. Admitted requests are answered from the [`cache`]; a miss or a
//! stale entry triggers a refresh that all concurrent clients share.
//!
//! ## Backend Path
//!
//! A [`poller`] owns one socket per backend and performs the challenge
//! handshake and multi-packet reassembly. It runs on a fixed cadence per
//! query type (keep-alive) as well as on demand. Both triggers go through the
//! same [`single_flight`] registry, so one backend never sees two identical
//! queries in flight.
//!
//! ## Failure Behavior
//!
//! Clients get the freshest data known, stale data when the backend is
//! down, or no reply at all. The proxy never invents an error packet.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use proxy::{Config, Proxy};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(Path::new("proxy.toml"))?;
//!     let proxy = Proxy::bind(config).await?;
//!     println!("Serving on {:?}", proxy.local_addrs()?);
//!     proxy.run().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod challenge;
pub mod config;
pub mod denylist;
pub mod error;
pub mod frontend;
pub mod poller;
pub mod proxy;
pub mod rate_limit;
pub mod single_flight;
pub mod stats;

pub use config::{Backend, BackendId, Config};
pub use error::{ProxyError, RefreshError};
pub use proxy::Proxy;
