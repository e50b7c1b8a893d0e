//! Diagnostic A2S client: queries a server (or the proxy) once and prints
//! what came back.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use log::{debug, warn};
use shared::info::InfoSummary;
use shared::{
    decode_response, encode_request, hex_preview, QueryType, Reassembler, Response,
    MAX_DATAGRAM_SIZE,
};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const MAX_CHALLENGE_ROUNDS: usize = 3;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Query {
    Info,
    Players,
    Rules,
}

impl From<Query> for QueryType {
    fn from(query: Query) -> Self {
        match query {
            Query::Info => QueryType::Info,
            Query::Players => QueryType::Players,
            Query::Rules => QueryType::Rules,
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server or proxy address
    addr: SocketAddr,
    #[clap(short, long, value_enum, default_value = "info")]
    query: Query,
    /// How long to wait for each reply
    #[clap(short, long, default_value = "2000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    let query = QueryType::from(args.query);

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(args.addr).await?;
    debug!("Querying {} from {}", args.addr, socket.local_addr()?);

    let started = Instant::now();
    let payload = query_once(&socket, query, Duration::from_millis(args.timeout_ms)).await?;
    let elapsed = started.elapsed();

    println!(
        "{} from {}: {} bytes in {:?}",
        query,
        args.addr,
        payload.len(),
        elapsed
    );
    if query == QueryType::Info {
        match InfoSummary::parse(&payload) {
            Ok(summary) => println!("{}", summary),
            Err(e) => warn!("Cannot parse INFO body: {}", e),
        }
    }
    println!("{}", hex_preview(&payload, 64));

    Ok(())
}

/// Runs the challenge handshake and reassembly until a full response arrives
async fn query_once(
    socket: &UdpSocket,
    query: QueryType,
    reply_timeout: Duration,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut reassembler = Reassembler::new(reply_timeout);
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut challenge = None;

    for _ in 0..MAX_CHALLENGE_ROUNDS {
        socket.send(&encode_request(query, challenge)).await?;

        loop {
            let len = timeout(reply_timeout, socket.recv(&mut buf))
                .await
                .map_err(|_| format!("no reply within {:?}", reply_timeout))??;

            match decode_response(&buf[..len], query) {
                Ok(Response::Payload(payload)) => return Ok(payload),
                Ok(Response::ChallengeRequired(value)) => {
                    debug!("Got challenge {}", value);
                    challenge = Some(value);
                    break;
                }
                Ok(Response::Fragment(fragment)) => {
                    debug!(
                        "Fragment {}/{} of message {}",
                        fragment.index + 1,
                        fragment.total,
                        fragment.id
                    );
                    if let Some(message) = reassembler.accept(fragment, Instant::now())? {
                        return match decode_response(&message, query)? {
                            Response::Payload(payload) => Ok(payload),
                            other => Err(format!("unexpected reply {:?}", other).into()),
                        };
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    Err(format!("server kept issuing challenges after {} rounds", MAX_CHALLENGE_ROUNDS).into())
}
