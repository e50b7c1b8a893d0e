//! Split (multi-packet) framing: fragmenting encoder and reassembly buffers.

use std::collections::HashMap;
use std::io::Cursor;
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{CodecError, SPLIT_HEADER_LEN, SPLIT_PACKET_HEADER};

/// High bit of the request id marks a bzip2-compressed response
const COMPRESSED_FLAG: u32 = 0x8000_0000;

/// Upper bound on concurrently buffered split responses per reassembler
const MAX_PENDING_MESSAGES: usize = 64;

/// One fragment of a split response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub id: i32,
    pub total: u8,
    pub index: u8,
    pub max_packet_size: u16,
    pub body: Vec<u8>,
}

impl Fragment {
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(data);
        let header = cursor.read_u32::<LittleEndian>()?;
        if header != SPLIT_PACKET_HEADER {
            return Err(CodecError::BadMagic(header));
        }

        let raw_id = cursor.read_u32::<LittleEndian>()?;
        if raw_id & COMPRESSED_FLAG != 0 {
            return Err(CodecError::UnsupportedCompression);
        }
        let id = raw_id as i32;
        let total = cursor.read_u8()?;
        let index = cursor.read_u8()?;
        let max_packet_size = cursor.read_u16::<LittleEndian>()?;

        if total == 0 {
            return Err(CodecError::ReassemblyGap {
                id,
                reason: "zero fragment count",
            });
        }
        if index >= total {
            return Err(CodecError::ReassemblyGap {
                id,
                reason: "fragment index out of range",
            });
        }

        Ok(Fragment {
            id,
            total,
            index,
            max_packet_size,
            body: data[SPLIT_HEADER_LEN..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SPLIT_HEADER_LEN + self.body.len());
        let _ = buf.write_u32::<LittleEndian>(SPLIT_PACKET_HEADER);
        let _ = buf.write_i32::<LittleEndian>(self.id);
        buf.push(self.total);
        buf.push(self.index);
        let _ = buf.write_u16::<LittleEndian>(self.max_packet_size);
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// Splits a complete response into the datagrams to put on the wire.
///
/// A payload that fits in `max_packet_size` is sent as is. Larger payloads are
/// cut into the minimum number of ordered fragments tagged with `request_id`.
pub fn encode_response(
    payload: &[u8],
    max_packet_size: usize,
    request_id: i32,
) -> Result<Vec<Vec<u8>>, CodecError> {
    if payload.len() <= max_packet_size {
        return Ok(vec![payload.to_vec()]);
    }

    let too_large = CodecError::PayloadTooLarge {
        len: payload.len(),
        max_packet_size,
    };
    if max_packet_size <= SPLIT_HEADER_LEN {
        return Err(too_large);
    }

    let chunk_size = max_packet_size - SPLIT_HEADER_LEN;
    let total = payload.len().div_ceil(chunk_size);
    if total > u8::MAX as usize {
        return Err(too_large);
    }

    let id = request_id & !(COMPRESSED_FLAG as i32);
    let size_field = max_packet_size.min(u16::MAX as usize) as u16;

    Ok(payload
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| {
            Fragment {
                id,
                total: total as u8,
                index: index as u8,
                max_packet_size: size_field,
                body: chunk.to_vec(),
            }
            .encode()
        })
        .collect())
}

struct PendingMessage {
    total: u8,
    fragments: Vec<Option<Vec<u8>>>,
    received: usize,
    started_at: Instant,
}

impl PendingMessage {
    fn new(total: u8, started_at: Instant) -> Self {
        Self {
            total,
            fragments: vec![None; total as usize],
            received: 0,
            started_at,
        }
    }
}

/// Buffers fragments by request id until a split response is complete.
///
/// Fragments may arrive in any order. A set is abandoned when it outlives the
/// reassembly timeout or when a fragment contradicts what was buffered.
pub struct Reassembler {
    timeout: Duration,
    pending: HashMap<i32, PendingMessage>,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: HashMap::new(),
        }
    }

    /// Buffers a fragment, returning the whole message once every piece is in.
    pub fn accept(
        &mut self,
        fragment: Fragment,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, CodecError> {
        let id = fragment.id;

        if let Some(pending) = self.pending.get(&id) {
            if now.saturating_duration_since(pending.started_at) > self.timeout {
                self.pending.remove(&id);
                return Err(CodecError::ReassemblyTimeout(id));
            }
            if pending.total != fragment.total {
                self.pending.remove(&id);
                return Err(CodecError::ReassemblyGap {
                    id,
                    reason: "fragment count changed",
                });
            }
        } else if self.pending.len() >= MAX_PENDING_MESSAGES {
            self.evict_oldest();
        }

        let pending = self
            .pending
            .entry(id)
            .or_insert_with(|| PendingMessage::new(fragment.total, now));

        let index = fragment.index as usize;
        match &pending.fragments[index] {
            Some(existing) if *existing == fragment.body => return Ok(None),
            Some(_) => {
                self.pending.remove(&id);
                return Err(CodecError::ReassemblyGap {
                    id,
                    reason: "conflicting duplicate fragment",
                });
            }
            None => {}
        }
        pending.fragments[index] = Some(fragment.body);
        pending.received += 1;

        if pending.received < pending.total as usize {
            return Ok(None);
        }

        let Some(complete) = self.pending.remove(&id) else {
            return Ok(None);
        };
        Ok(Some(complete.fragments.into_iter().flatten().flatten().collect()))
    }

    /// Drops every partial set older than the timeout, returning their ids.
    pub fn sweep(&mut self, now: Instant) -> Vec<i32> {
        let timeout = self.timeout;
        let expired: Vec<i32> = self
            .pending
            .iter()
            .filter(|(_, pending)| now.saturating_duration_since(pending.started_at) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.pending.remove(id);
        }
        expired
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, pending)| pending.started_at)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            self.pending.remove(&id);
        }
    }
}
