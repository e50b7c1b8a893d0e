//! Client requests: `A2S_INFO`, `A2S_PLAYERS` and `A2S_RULES`.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    CodecError, QueryType, EMPTY_CHALLENGE, INFO_REQUEST_PAYLOAD, SINGLE_PACKET_HEADER,
    SINGLE_PACKET_PREFIX_LEN,
};

/// A decoded client request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub query: QueryType,
    /// `None` when the request carried no challenge or the empty value
    pub challenge: Option<i32>,
}

/// Encodes a request datagram.
///
/// Challenge-requiring queries always carry a challenge field; `None` (or
/// [`EMPTY_CHALLENGE`]) is written as the empty value. `A2S_INFO` only
/// carries one when given.
pub fn encode_request(query: QueryType, challenge: Option<i32>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SINGLE_PACKET_PREFIX_LEN + INFO_REQUEST_PAYLOAD.len() + 4);
    // Writes into a Vec cannot fail.
    let _ = buf.write_u32::<LittleEndian>(SINGLE_PACKET_HEADER);
    buf.push(query.request_opcode());

    match query {
        QueryType::Info => {
            buf.extend_from_slice(INFO_REQUEST_PAYLOAD);
            if let Some(value) = challenge {
                let _ = buf.write_i32::<LittleEndian>(value);
            }
        }
        QueryType::Players | QueryType::Rules => {
            let _ = buf.write_i32::<LittleEndian>(challenge.unwrap_or(EMPTY_CHALLENGE));
        }
    }

    buf
}

/// Decodes a single-packet request datagram.
///
/// Split requests are not part of the protocol and fail with `BadMagic`.
pub fn decode_request(data: &[u8]) -> Result<Request, CodecError> {
    let mut cursor = Cursor::new(data);
    let header = cursor.read_u32::<LittleEndian>()?;
    if header != SINGLE_PACKET_HEADER {
        return Err(CodecError::BadMagic(header));
    }

    let opcode = cursor.read_u8()?;
    let query =
        QueryType::from_request_opcode(opcode).ok_or(CodecError::UnsupportedOpcode(opcode))?;

    let challenge = match query {
        QueryType::Info => {
            let mut payload = [0u8; INFO_REQUEST_PAYLOAD.len()];
            cursor.read_exact(&mut payload)?;
            if payload[..] != *INFO_REQUEST_PAYLOAD {
                return Err(CodecError::InvalidRequestPayload);
            }
            let remaining = data.len() - cursor.position() as usize;
            match remaining {
                0 => None,
                4 => Some(cursor.read_i32::<LittleEndian>()?),
                _ => return Err(CodecError::InvalidRequestPayload),
            }
        }
        QueryType::Players | QueryType::Rules => {
            let value = cursor.read_i32::<LittleEndian>()?;
            if cursor.position() as usize != data.len() {
                return Err(CodecError::InvalidRequestPayload);
            }
            Some(value)
        }
    };

    Ok(Request {
        query,
        challenge: challenge.filter(|&value| value != EMPTY_CHALLENGE),
    })
}
