use std::collections::HashMap;

use stride::net::{ConnectionId, ShardInfo};

pub const FULL_RETRY_SECONDS: f64 = 0.6;
pub const FULL_RETRY_MAX: u32 = 4;

/// Outstanding keyframe for one connection. `shards` is set when the keyframe last went
/// out through FEC.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryRecord {
    pub payload: Vec<u8>,
    pub shards: Option<Vec<ShardInfo>>,
    pub seq: u32,
    pub state_hash: u64,
    pub message_id: u32,
    pub last_sent_at: f64,
    pub retry_count: u32,
}

/// Keyframes must arrive, deltas may be lost. Every full sent to a connection replaces
/// that connection's record until it is acked or abandoned.
#[derive(Debug, Default)]
pub struct RetryManager {
    records: HashMap<ConnectionId, RetryRecord>,
}

impl RetryManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        conn: ConnectionId,
        payload: Vec<u8>,
        shards: Option<Vec<ShardInfo>>,
        seq: u32,
        state_hash: u64,
        message_id: u32,
        now: f64,
    ) {
        self.records.insert(
            conn,
            RetryRecord {
                payload,
                shards,
                seq,
                state_hash,
                message_id,
                last_sent_at: now,
                retry_count: 0,
            },
        );
    }

    pub fn get(&self, conn: ConnectionId) -> Option<&RetryRecord> {
        self.records.get(&conn)
    }

    pub fn get_mut(&mut self, conn: ConnectionId) -> Option<&mut RetryRecord> {
        self.records.get_mut(&conn)
    }

    /// Connections whose keyframe has waited `interval` and still has retries left.
    pub fn collect_due(&self, now: f64, interval: f64, max_retries: u32) -> Vec<ConnectionId> {
        let mut due: Vec<ConnectionId> = self
            .records
            .iter()
            .filter(|(_, r)| r.retry_count < max_retries && now - r.last_sent_at >= interval)
            .map(|(conn, _)| *conn)
            .collect();
        due.sort_unstable();
        due
    }

    /// Connections that used every retry and waited one more interval.
    pub fn collect_exhausted(&self, now: f64, interval: f64, max_retries: u32) -> Vec<ConnectionId> {
        let mut exhausted: Vec<ConnectionId> = self
            .records
            .iter()
            .filter(|(_, r)| r.retry_count >= max_retries && now - r.last_sent_at >= interval)
            .map(|(conn, _)| *conn)
            .collect();
        exhausted.sort_unstable();
        exhausted
    }

    pub fn mark_sent(&mut self, conn: ConnectionId, now: f64) {
        if let Some(record) = self.records.get_mut(&conn) {
            record.last_sent_at = now;
            record.retry_count += 1;
        }
    }

    pub fn clear(&mut self, conn: ConnectionId) -> Option<RetryRecord> {
        self.records.remove(&conn)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
