//! # A2S Codec
//!
//! Wire codec for the Source engine server query protocol (A2S). This crate is
//! shared by the proxy and its diagnostic client and performs no I/O: it turns
//! datagrams into typed values and back.
//!
//! ## Framing
//!
//! Every datagram starts with a 4-byte header:
//! - `FF FF FF FF` marks a complete single-packet message, followed by an
//!   opcode byte and the message body.
//! - `FE FF FF FF` marks one fragment of a split message, followed by a
//!   request id, fragment count, fragment index and the sender's maximum
//!   packet size. Fragments are reassembled by [`Reassembler`] into the same
//!   logical message a single packet would carry.
//!
//! All multi-byte integers are little-endian.

mod error;
pub mod info;
mod query;
mod response;
mod split;

pub use error::CodecError;
pub use query::{decode_request, encode_request, Request};
pub use response::{challenge_response, decode_response, Response};
pub use split::{encode_response, Fragment, Reassembler};

use std::fmt;

/// Header of a complete single-packet message
pub const SINGLE_PACKET_HEADER: u32 = 0xFFFF_FFFF;
/// Header of one fragment of a split message
pub const SPLIT_PACKET_HEADER: u32 = 0xFFFF_FFFE;

/// Bytes taken by the single-packet header plus opcode
pub const SINGLE_PACKET_PREFIX_LEN: usize = 5;
/// Bytes taken by a split fragment header (header, id, total, index, size)
pub const SPLIT_HEADER_LEN: usize = 12;

/// Challenge value sent when no challenge is known yet
pub const EMPTY_CHALLENGE: i32 = -1;

/// Fixed payload of an `A2S_INFO` request
pub const INFO_REQUEST_PAYLOAD: &[u8] = b"Source Engine Query\0";

/// Default maximum datagram size used when splitting responses
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1400;
/// Largest payload a single UDP datagram can carry over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

pub const OPCODE_INFO_REQUEST: u8 = b'T';
pub const OPCODE_PLAYERS_REQUEST: u8 = b'U';
pub const OPCODE_RULES_REQUEST: u8 = b'V';

pub const OPCODE_INFO_RESPONSE: u8 = b'I';
pub const OPCODE_PLAYERS_RESPONSE: u8 = b'D';
pub const OPCODE_RULES_RESPONSE: u8 = b'E';
pub const OPCODE_CHALLENGE_RESPONSE: u8 = b'A';

/// The three queries the proxy understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryType {
    Info,
    Players,
    Rules,
}

impl QueryType {
    pub const ALL: [QueryType; 3] = [QueryType::Info, QueryType::Players, QueryType::Rules];

    pub fn request_opcode(self) -> u8 {
        match self {
            QueryType::Info => OPCODE_INFO_REQUEST,
            QueryType::Players => OPCODE_PLAYERS_REQUEST,
            QueryType::Rules => OPCODE_RULES_REQUEST,
        }
    }

    pub fn response_opcode(self) -> u8 {
        match self {
            QueryType::Info => OPCODE_INFO_RESPONSE,
            QueryType::Players => OPCODE_PLAYERS_RESPONSE,
            QueryType::Rules => OPCODE_RULES_RESPONSE,
        }
    }

    pub fn from_request_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            OPCODE_INFO_REQUEST => Some(QueryType::Info),
            OPCODE_PLAYERS_REQUEST => Some(QueryType::Players),
            OPCODE_RULES_REQUEST => Some(QueryType::Rules),
            _ => None,
        }
    }

    pub fn from_response_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            OPCODE_INFO_RESPONSE => Some(QueryType::Info),
            OPCODE_PLAYERS_RESPONSE => Some(QueryType::Players),
            OPCODE_RULES_RESPONSE => Some(QueryType::Rules),
            _ => None,
        }
    }

    /// Whether the protocol always requires a challenge for this query.
    ///
    /// Newer servers may also demand one for `A2S_INFO`; that case is handled
    /// by reacting to a challenge response rather than probing up front.
    pub fn requires_challenge(self) -> bool {
        !matches!(self, QueryType::Info)
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryType::Info => "A2S_INFO",
            QueryType::Players => "A2S_PLAYERS",
            QueryType::Rules => "A2S_RULES",
        };
        f.write_str(name)
    }
}

/// Renders at most `limit` bytes as hex for log lines
pub fn hex_preview(data: &[u8], limit: usize) -> String {
    let mut out: String = data
        .iter()
        .take(limit)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ");
    if data.len() > limit {
        out.push_str(" ..");
    }
    out
}
