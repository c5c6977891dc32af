use stride::net::{ClientRpc, Envelope, EnvelopeFlags, FecCodec};

/// `len` bytes where byte `i` is `i & 0xFF`.
pub fn canary_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i & 0xFF) as u8).collect()
}

/// Periodic transport probe. Receivers verify canary frames and drop them before any
/// snapshot decoding.
#[derive(Debug, Clone)]
pub struct CanaryEmitter {
    payload: Vec<u8>,
    shard_size: usize,
    parity: usize,
    interval: f64,
    next_at: f64,
}

impl CanaryEmitter {
    pub fn new(len: usize, shard_size: usize, parity: usize, interval: f64) -> Self {
        Self {
            payload: canary_payload(len.max(1)),
            shard_size: shard_size.max(64),
            parity,
            interval: interval.max(0.25),
            next_at: 0.0,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// True once per interval.
    pub fn poll(&mut self, now: f64) -> bool {
        if now < self.next_at {
            return false;
        }
        self.next_at = now + self.interval;
        true
    }

    /// Sharded when parity is configured, raw otherwise.
    pub fn frames(&self, message_id: u32, seq: u32, codec: &dyn FecCodec) -> Vec<ClientRpc> {
        if self.parity == 0 {
            let env = Envelope::describe(message_id, seq, &self.payload, EnvelopeFlags::CANARY);
            return vec![ClientRpc::TargetSnapshot {
                env: env.pack(&self.payload),
                state_hash: 0,
            }];
        }

        let env = Envelope::describe(
            message_id,
            seq,
            &self.payload,
            EnvelopeFlags::SHARD | EnvelopeFlags::CANARY,
        );
        codec
            .build_shards(&self.payload, self.shard_size, self.parity)
            .iter()
            .map(|shard| ClientRpc::TargetShard {
                env: env.pack(&shard.encode()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use stride::net::{ReedSolomon, ShardInfo};

    use super::*;

    #[test]
    fn payload_counts_bytes() {
        let payload = canary_payload(300);
        assert_eq!(payload[0], 0);
        assert_eq!(payload[255], 255);
        assert_eq!(payload[256], 0);
        assert_eq!(payload[299], 43);
    }

    #[test]
    fn sharded_frames_are_flagged() {
        let emitter = CanaryEmitter::new(2048, 1024, 2, 2.0);
        let frames = emitter.frames(7, 1, &ReedSolomon);
        assert_eq!(frames.len(), 4);
        for frame in frames {
            let ClientRpc::TargetShard { env } = frame else {
                panic!("expected shard");
            };
            let (env, body) = Envelope::try_unpack(&env).unwrap();
            assert!(env.is_canary() && env.is_shard());
            assert_eq!(env.payload_len(), 2048);
            assert!(ShardInfo::decode(&body).is_ok());
        }
    }

    #[test]
    fn raw_frame_verifies() {
        let emitter = CanaryEmitter::new(100, 1024, 0, 2.0);
        let frames = emitter.frames(3, 1, &ReedSolomon);
        let [ClientRpc::TargetSnapshot { env, .. }] = frames.as_slice() else {
            panic!("expected one raw frame");
        };
        let (env, body) = Envelope::try_unpack(env).unwrap();
        assert!(env.is_canary() && !env.is_shard());
        assert!(env.verifies(&body));
    }

    #[test]
    fn polls_once_per_interval() {
        let mut emitter = CanaryEmitter::new(16, 1024, 0, 1.0);
        assert!(emitter.poll(0.0));
        assert!(!emitter.poll(0.5));
        assert!(emitter.poll(1.0));
    }
}
