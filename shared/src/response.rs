//! Backend responses and the challenge reply.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::split::Fragment;
use crate::{
    CodecError, QueryType, OPCODE_CHALLENGE_RESPONSE, SINGLE_PACKET_HEADER, SPLIT_PACKET_HEADER,
};

/// Outcome of decoding a datagram received from a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// A complete response of the expected type, including its header
    Payload(Vec<u8>),
    /// The server wants this challenge echoed before it answers
    ChallengeRequired(i32),
    /// One piece of a split response; feed it to a [`crate::Reassembler`]
    Fragment(Fragment),
}

/// Decodes a backend datagram, or a reassembled split message, against the
/// query it is supposed to answer.
pub fn decode_response(data: &[u8], expected: QueryType) -> Result<Response, CodecError> {
    let mut cursor = Cursor::new(data);
    let header = cursor.read_u32::<LittleEndian>()?;

    match header {
        SINGLE_PACKET_HEADER => {
            let opcode = cursor.read_u8()?;
            if opcode == OPCODE_CHALLENGE_RESPONSE {
                let value = cursor.read_i32::<LittleEndian>()?;
                return Ok(Response::ChallengeRequired(value));
            }
            if opcode != expected.response_opcode() {
                return Err(CodecError::UnexpectedResponse {
                    expected,
                    got: opcode,
                });
            }
            Ok(Response::Payload(data.to_vec()))
        }
        SPLIT_PACKET_HEADER => Fragment::decode(data).map(Response::Fragment),
        other => Err(CodecError::BadMagic(other)),
    }
}

/// Builds the 9-byte challenge response (`FF FF FF FF 41` + value)
pub fn challenge_response(value: i32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    let _ = buf.write_u32::<LittleEndian>(SINGLE_PACKET_HEADER);
    buf.push(OPCODE_CHALLENGE_RESPONSE);
    let _ = buf.write_i32::<LittleEndian>(value);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn info_payload(body: &[u8]) -> Vec<u8> {
        let mut data = vec![0xFF, 0xFF, 0xFF, 0xFF, b'I'];
        data.extend_from_slice(body);
        data
    }

    #[test]
    fn test_decode_payload_keeps_full_message() {
        let data = info_payload(b"\x11server\0map\0");
        let decoded = assert_ok!(decode_response(&data, QueryType::Info));
        assert_eq!(decoded, Response::Payload(data));
    }

    #[test]
    fn test_decode_challenge() {
        let data = challenge_response(0xBEEF);
        assert_eq!(data.len(), 9);
        for query in QueryType::ALL {
            let decoded = assert_ok!(decode_response(&data, query));
            assert_eq!(decoded, Response::ChallengeRequired(0xBEEF));
        }
    }

    #[test]
    fn test_decode_unexpected_opcode() {
        let data = info_payload(b"x");
        assert_eq!(
            decode_response(&data, QueryType::Rules),
            Err(CodecError::UnexpectedResponse {
                expected: QueryType::Rules,
                got: b'I'
            })
        );
    }

    #[test]
    fn test_decode_truncated_challenge() {
        let data = [0xFF, 0xFF, 0xFF, 0xFF, b'A', 1, 2];
        assert_eq!(decode_response(&data, QueryType::Players), Err(CodecError::Truncated));
    }

    #[test]
    fn test_decode_bad_magic() {
        let data = [0x00, 0x01, 0x02, 0x03, b'I'];
        assert_eq!(
            decode_response(&data, QueryType::Info),
            Err(CodecError::BadMagic(0x0302_0100))
        );
    }
}
