use bitflags::bitflags;
use sha2::{Digest, Sha256};

use super::bytes::ByteReader;

/// `u32 message_id | u32 seq | i32 payload_len | u64 payload_hash | u8 flags`
pub const ENVELOPE_HEADER_SIZE: usize = 21;

bitflags! {
    /// Unknown bits are retained on decode. 0x04 is reserved.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnvelopeFlags: u8 {
        const SHARD = 0x02;
        const CANARY = 0x08;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Envelope {
    pub message_id: u32,
    pub seq: u32,
    pub payload_len: i32,
    pub payload_hash: u64,
    pub flags: EnvelopeFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("frame of {len} bytes is shorter than the 21-byte header")]
    TooShort { len: usize },
    #[error("negative payload length {0}")]
    NegativeLength(i32),
    #[error("payload truncated: header declares {expected} bytes, {available} available")]
    Truncated { expected: usize, available: usize },
}

impl Envelope {
    /// Describes `payload` as a whole: its length and digest. Shard frames reuse the
    /// descriptor of the full payload they belong to.
    pub fn describe(message_id: u32, seq: u32, payload: &[u8], flags: EnvelopeFlags) -> Self {
        Self {
            message_id,
            seq,
            payload_len: i32::try_from(payload.len()).unwrap_or(i32::MAX),
            payload_hash: hash64(payload),
            flags,
        }
    }

    pub fn is_shard(&self) -> bool {
        self.flags.contains(EnvelopeFlags::SHARD)
    }

    pub fn is_canary(&self) -> bool {
        self.flags.contains(EnvelopeFlags::CANARY)
    }

    pub fn payload_len(&self) -> usize {
        usize::try_from(self.payload_len).unwrap_or(0)
    }

    pub fn verifies(&self, payload: &[u8]) -> bool {
        payload.len() == self.payload_len() && hash64(payload) == self.payload_hash
    }

    pub fn pack(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_SIZE + payload.len());
        out.extend_from_slice(&self.message_id.to_le_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.extend_from_slice(&self.payload_len.to_le_bytes());
        out.extend_from_slice(&self.payload_hash.to_le_bytes());
        out.push(self.flags.bits());
        out.extend_from_slice(payload);
        out
    }

    /// Shard frames return everything after the header. Other frames return exactly
    /// `payload_len` bytes; trailing bytes are ignored.
    pub fn try_unpack(bytes: &[u8]) -> Result<(Self, Vec<u8>), EnvelopeError> {
        let too_short = EnvelopeError::TooShort { len: bytes.len() };
        let mut reader = ByteReader::new(bytes);
        let message_id = reader.read_u32().ok_or(too_short.clone())?;
        let seq = reader.read_u32().ok_or(too_short.clone())?;
        let payload_len = reader.read_i32().ok_or(too_short.clone())?;
        let payload_hash = reader.read_u64().ok_or(too_short.clone())?;
        let flags = reader.read_u8().ok_or(too_short)?;

        let env = Self {
            message_id,
            seq,
            payload_len,
            payload_hash,
            flags: EnvelopeFlags::from_bits_retain(flags),
        };

        if env.is_shard() {
            return Ok((env, reader.rest().to_vec()));
        }

        if payload_len < 0 {
            return Err(EnvelopeError::NegativeLength(payload_len));
        }

        let expected = env.payload_len();
        let available = reader.remaining();
        let body = reader
            .read_bytes(expected)
            .ok_or(EnvelopeError::Truncated {
                expected,
                available,
            })?;

        Ok((env, body.to_vec()))
    }
}

/// First eight bytes of SHA-256, read little-endian. The empty slice hashes like any
/// other input.
pub fn hash64(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

/// Hex dump of the first `max` bytes, for log lines.
pub fn preview_bytes(bytes: &[u8], max: usize) -> String {
    let mut out = String::with_capacity(max.min(bytes.len()) * 3 + 8);
    for (i, b) in bytes.iter().take(max).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{b:02X}"));
    }
    if bytes.len() > max {
        out.push_str(&format!(" .. (+{})", bytes.len() - max));
    }
    out
}
