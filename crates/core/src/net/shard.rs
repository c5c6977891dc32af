use std::collections::HashMap;

use super::bytes::ByteReader;

/// `u16 total | u16 index | u32 data_len`
pub const SHARD_HEADER_SIZE: usize = 8;
pub const SHARD_BUFFER_TIMEOUT_SECONDS: f64 = 2.0;

/// Connection id used for reassembly sessions on the receiving client.
pub const LOCAL_CLIENT_CONNECTION: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    pub total: u16,
    pub index: u16,
    pub data_length: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShardError {
    #[error("shard body of {len} bytes is shorter than its header")]
    TooShort { len: usize },
    #[error("shard declares {declared} data bytes, {available} available")]
    Truncated { declared: usize, available: usize },
    #[error("shard index {index} out of range for total {total}")]
    IndexOutOfRange { index: u16, total: u16 },
}

impl ShardInfo {
    pub fn data_len(&self) -> usize {
        self.data_length as usize
    }

    pub fn encode(&self) -> Vec<u8> {
        let len = self.data_len().min(self.data.len());
        let mut out = Vec::with_capacity(SHARD_HEADER_SIZE + len);
        out.extend_from_slice(&self.total.to_le_bytes());
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&(len as u32).to_le_bytes());
        out.extend_from_slice(&self.data[..len]);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ShardError> {
        let too_short = ShardError::TooShort { len: bytes.len() };
        let mut reader = ByteReader::new(bytes);
        let total = reader.read_u16().ok_or(too_short.clone())?;
        let index = reader.read_u16().ok_or(too_short.clone())?;
        let data_length = reader.read_u32().ok_or(too_short)?;

        if index >= total {
            return Err(ShardError::IndexOutOfRange { index, total });
        }

        let declared = data_length as usize;
        let available = reader.remaining();
        let data = reader
            .read_bytes(declared)
            .ok_or(ShardError::Truncated {
                declared,
                available,
            })?;

        Ok(Self {
            total,
            index,
            data_length,
            data: data.to_vec(),
        })
    }
}

/// Geometry of one sharded payload. Receivers infer it from the shards they hold
/// and the envelope's payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLayout {
    pub data_shards: usize,
    pub parity_shards: usize,
    pub pad_size: usize,
    pub last_len: Option<usize>,
}

impl ShardLayout {
    /// `pad_size` is the largest shard length seen: parity shards and every data shard
    /// but the last are exactly that long. Returns `None` until the guess is consistent.
    pub fn infer(total: usize, payload_len: usize, slots: &[Option<ShardInfo>]) -> Option<Self> {
        let pad_size = slots
            .iter()
            .flatten()
            .map(ShardInfo::data_len)
            .max()
            .filter(|pad| *pad > 0)?;
        if payload_len == 0 {
            return None;
        }

        let data_shards = payload_len.div_ceil(pad_size);
        if data_shards > total {
            return None;
        }

        Some(Self {
            data_shards,
            parity_shards: total - data_shards,
            pad_size,
            last_len: Some(payload_len - (data_shards - 1) * pad_size),
        })
    }

    pub fn missing_data(&self, slots: &[Option<ShardInfo>]) -> Vec<usize> {
        (0..self.data_shards)
            .filter(|i| slots.get(*i).is_none_or(Option::is_none))
            .collect()
    }

    pub fn recovered_len(&self, index: usize) -> usize {
        if index + 1 == self.data_shards {
            self.last_len.unwrap_or(self.pad_size).min(self.pad_size)
        } else {
            self.pad_size
        }
    }
}

/// Concatenates data shards `[0, data_shards)`. `None` if any is missing.
pub fn reassemble(slots: &[Option<ShardInfo>], data_shards: usize) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    for slot in slots.iter().take(data_shards) {
        let shard = slot.as_ref()?;
        let len = shard.data_len().min(shard.data.len());
        out.extend_from_slice(&shard.data[..len]);
    }
    if slots.len() < data_shards {
        return None;
    }
    Some(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardBufferKey {
    pub connection_id: i32,
    pub message_id: u32,
}

impl ShardBufferKey {
    pub fn new(connection_id: i32, message_id: u32) -> Self {
        Self {
            connection_id,
            message_id,
        }
    }

    pub fn for_local_client(message_id: u32) -> Self {
        Self::new(LOCAL_CLIENT_CONNECTION, message_id)
    }
}

#[derive(Debug)]
struct ShardBuffer {
    slots: Vec<Option<ShardInfo>>,
    first_seen: f64,
}

/// Reassembly sessions keyed by `(connection, message)`. Buffers are owned here until
/// the caller forgets them or they expire.
#[derive(Debug, Default)]
pub struct ShardRegistry {
    buffers: HashMap<ShardBufferKey, ShardBuffer>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resizes an existing buffer to `total`, since the sender may change shard counts
    /// between keyframes.
    pub fn get_or_create(
        &mut self,
        key: ShardBufferKey,
        total: usize,
        now: f64,
    ) -> &mut Vec<Option<ShardInfo>> {
        let buffer = self.buffers.entry(key).or_insert_with(|| ShardBuffer {
            slots: Vec::with_capacity(total),
            first_seen: now,
        });
        buffer.slots.resize(total, None);
        &mut buffer.slots
    }

    pub fn slots(&self, key: &ShardBufferKey) -> Option<&[Option<ShardInfo>]> {
        self.buffers.get(key).map(|b| b.slots.as_slice())
    }

    pub fn total_count(&self, key: &ShardBufferKey) -> Option<usize> {
        self.buffers.get(key).map(|b| b.slots.len())
    }

    pub fn received_count(&self, key: &ShardBufferKey) -> usize {
        self.buffers
            .get(key)
            .map_or(0, |b| b.slots.iter().flatten().count())
    }

    pub fn forget(&mut self, key: &ShardBufferKey) -> Option<Vec<Option<ShardInfo>>> {
        self.buffers.remove(key).map(|b| b.slots)
    }

    pub fn collect_expired(&self, now: f64, timeout: f64) -> Vec<ShardBufferKey> {
        let mut expired: Vec<ShardBufferKey> = self
            .buffers
            .iter()
            .filter(|(_, b)| now - b.first_seen > timeout)
            .map(|(k, _)| *k)
            .collect();
        expired.sort();
        expired
    }

    pub fn contains_connection(&self, connection_id: i32) -> bool {
        self.buffers.keys().any(|k| k.connection_id == connection_id)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}
