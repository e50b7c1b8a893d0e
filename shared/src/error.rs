use thiserror::Error;

use crate::QueryType;

/// Errors produced while decoding or encoding A2S datagrams.
///
/// Every variant is local to a single datagram: callers drop the offending
/// bytes and carry on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("datagram truncated")]
    Truncated,
    #[error("bad packet header {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported opcode {0:#04x}")]
    UnsupportedOpcode(u8),
    #[error("compressed split responses are not supported")]
    UnsupportedCompression,
    #[error("split response {0} timed out before all fragments arrived")]
    ReassemblyTimeout(i32),
    #[error("split response {id} is inconsistent: {reason}")]
    ReassemblyGap { id: i32, reason: &'static str },
    #[error("invalid request payload")]
    InvalidRequestPayload,
    #[error("payload of {len} bytes needs more than 255 fragments at size {max_packet_size}")]
    PayloadTooLarge { len: usize, max_packet_size: usize },
    #[error("expected {expected:?} response, got opcode {got:#04x}")]
    UnexpectedResponse { expected: QueryType, got: u8 },
}

impl From<std::io::Error> for CodecError {
    // Cursor reads only fail when they run out of bytes.
    fn from(_: std::io::Error) -> Self {
        CodecError::Truncated
    }
}
