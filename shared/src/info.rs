//! Minimal `A2S_INFO` body parsing, used for log lines and diagnostics.
//!
//! The proxy never rewrites responses; it only peeks at the leading fields.

use std::fmt;
use std::io::{BufRead, Cursor};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::{CodecError, OPCODE_INFO_RESPONSE, SINGLE_PACKET_HEADER};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoSummary {
    pub protocol: u8,
    pub name: String,
    pub map: String,
    pub folder: String,
    pub game: String,
    pub app_id: u16,
    pub players: u8,
    pub max_players: u8,
    pub bots: u8,
}

impl InfoSummary {
    /// Parses the fixed leading fields of a complete `A2S_INFO` response
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(data);
        let header = cursor.read_u32::<LittleEndian>()?;
        if header != SINGLE_PACKET_HEADER {
            return Err(CodecError::BadMagic(header));
        }
        let opcode = cursor.read_u8()?;
        if opcode != OPCODE_INFO_RESPONSE {
            return Err(CodecError::UnsupportedOpcode(opcode));
        }

        Ok(InfoSummary {
            protocol: cursor.read_u8()?,
            name: read_cstring(&mut cursor)?,
            map: read_cstring(&mut cursor)?,
            folder: read_cstring(&mut cursor)?,
            game: read_cstring(&mut cursor)?,
            app_id: cursor.read_u16::<LittleEndian>()?,
            players: cursor.read_u8()?,
            max_players: cursor.read_u8()?,
            bots: cursor.read_u8()?,
        })
    }
}

impl fmt::Display for InfoSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\" map={} game={} players={}/{} bots={}",
            self.name, self.map, self.game, self.players, self.max_players, self.bots
        )
    }
}

fn read_cstring(cursor: &mut Cursor<&[u8]>) -> Result<String, CodecError> {
    let mut bytes = Vec::new();
    cursor.read_until(0, &mut bytes)?;
    if bytes.pop() != Some(0) {
        return Err(CodecError::Truncated);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn sample_info() -> Vec<u8> {
        let mut data = vec![0xFF, 0xFF, 0xFF, 0xFF, b'I', 17];
        data.extend_from_slice(b"My Server\0de_dust2\0csgo\0Counter-Strike\0");
        data.extend_from_slice(&730u16.to_le_bytes());
        data.extend_from_slice(&[12, 24, 2, b'd', b'l', 0, 1]);
        data
    }

    #[test]
    fn test_parse_summary() {
        let summary = assert_ok!(InfoSummary::parse(&sample_info()));
        assert_eq!(summary.protocol, 17);
        assert_eq!(summary.name, "My Server");
        assert_eq!(summary.map, "de_dust2");
        assert_eq!(summary.folder, "csgo");
        assert_eq!(summary.game, "Counter-Strike");
        assert_eq!(summary.app_id, 730);
        assert_eq!(summary.players, 12);
        assert_eq!(summary.max_players, 24);
        assert_eq!(summary.bots, 2);
        assert_eq!(
            summary.to_string(),
            "\"My Server\" map=de_dust2 game=Counter-Strike players=12/24 bots=2"
        );
    }

    #[test]
    fn test_parse_truncated_string() {
        let data = [0xFF, 0xFF, 0xFF, 0xFF, b'I', 17, b'n', b'o'];
        assert_eq!(InfoSummary::parse(&data), Err(CodecError::Truncated));
    }

    #[test]
    fn test_parse_wrong_opcode() {
        let data = [0xFF, 0xFF, 0xFF, 0xFF, b'D', 0];
        assert_eq!(InfoSummary::parse(&data), Err(CodecError::UnsupportedOpcode(b'D')));
    }
}
