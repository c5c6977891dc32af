use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, trace};

use stride::net::{
    AnchorState, ConnectionId, Envelope, FecCodec, FecError, PackedKind, PackedSnapshot,
    SHARD_BUFFER_TIMEOUT_SECONDS, ServerRpc, ShardBufferKey, ShardInfo, ShardLayout,
    ShardRegistry, SnapshotError, reassemble,
};
use stride::{
    FULL_REQUEST_COOLDOWN_SECONDS, FULL_REQUEST_DISABLE_THRESHOLD, FULL_REQUEST_WINDOW_SECONDS,
    MovementConfig, MovementSnapshot, Telemetry, state_hash,
};

use crate::warn_limit::WarnLimiter;

/// Message ids remembered after completion so stragglers don't reopen a buffer.
pub const COMPLETED_MESSAGE_MEMORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedSnapshot {
    pub snap: MovementSnapshot,
    pub kind: PackedKind,
}

impl DecodedSnapshot {
    pub fn is_full(&self) -> bool {
        self.kind == PackedKind::Full
    }
}

/// Cooldown and escalation for full snapshot requests.
#[derive(Debug, Clone, Default)]
struct FullRequestPolicy {
    last_request_at: Option<f64>,
    window_start: Option<f64>,
    window_count: u32,
    fec_disable_requested: bool,
}

impl FullRequestPolicy {
    /// `None` while cooling down, otherwise the `prefer_no_fec` to send.
    fn admit(&mut self, now: f64, prefer_no_fec: bool) -> Option<bool> {
        if self
            .last_request_at
            .is_some_and(|t| now - t < FULL_REQUEST_COOLDOWN_SECONDS)
        {
            return None;
        }
        self.last_request_at = Some(now);

        if self
            .window_start
            .is_none_or(|start| now - start > FULL_REQUEST_WINDOW_SECONDS)
        {
            self.window_start = Some(now);
            self.window_count = 0;
            self.fec_disable_requested = false;
        }
        self.window_count += 1;

        if !self.fec_disable_requested && self.window_count >= FULL_REQUEST_DISABLE_THRESHOLD {
            self.fec_disable_requested = true;
            return Some(true);
        }
        Some(prefer_no_fec)
    }

    fn note_success(&mut self, now: f64) {
        self.window_start = Some(now);
        self.window_count = 0;
        self.fec_disable_requested = false;
    }
}

/// Where a payload came from, which decides acking and hash checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Target { state_hash: Option<u64> },
    Observers,
}

/// Turns envelope frames about one actor into snapshots.
///
/// Handles shard reassembly and FEC recovery, envelope verification, packed snapshot
/// decoding against the current anchor, and deciding when to ask the server for a
/// fresh keyframe. Acks and requests queue up until [`drain_requests`].
///
/// [`drain_requests`]: SnapshotReceiver::drain_requests
pub struct SnapshotReceiver {
    actor: ConnectionId,
    cell_size: i32,
    fec: Arc<dyn FecCodec>,
    telemetry: Arc<dyn Telemetry>,
    registry: ShardRegistry,
    envelopes: HashMap<u32, Envelope>,
    completed: VecDeque<u32>,
    anchor: AnchorState,
    base: MovementSnapshot,
    policy: FullRequestPolicy,
    warnings: WarnLimiter,
    requests: VecDeque<ServerRpc>,
}

impl SnapshotReceiver {
    pub fn new(
        actor: ConnectionId,
        config: &MovementConfig,
        fec: Arc<dyn FecCodec>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            actor,
            cell_size: config.broadcast.cell_size,
            fec,
            telemetry,
            registry: ShardRegistry::new(),
            envelopes: HashMap::new(),
            completed: VecDeque::with_capacity(COMPLETED_MESSAGE_MEMORY),
            anchor: AnchorState::default(),
            base: MovementSnapshot::default(),
            policy: FullRequestPolicy::default(),
            warnings: WarnLimiter::default(),
            requests: VecDeque::new(),
        }
    }

    pub fn actor(&self) -> ConnectionId {
        self.actor
    }

    pub fn anchor(&self) -> AnchorState {
        self.anchor
    }

    pub fn base(&self) -> Option<&MovementSnapshot> {
        self.anchor.have.then_some(&self.base)
    }

    pub fn open_shard_buffers(&self) -> usize {
        self.registry.len()
    }

    pub fn drain_requests(&mut self) -> Vec<ServerRpc> {
        self.requests.drain(..).collect()
    }

    /// Forgets the anchor and every partial message.
    pub fn reset(&mut self) {
        self.registry.clear();
        self.envelopes.clear();
        self.completed.clear();
        self.anchor = AnchorState::default();
        self.base = MovementSnapshot::default();
    }

    /// Queues a full snapshot request unless one went out too recently. Returns whether
    /// it was queued.
    pub fn request_full(&mut self, now: f64, prefer_no_fec: bool) -> bool {
        let Some(prefer_no_fec) = self.policy.admit(now, prefer_no_fec) else {
            self.telemetry.increment("pack.full_request_cooldown", 1);
            trace!("actor {} full request suppressed by cooldown", self.actor);
            return false;
        };
        self.telemetry.increment("pack.full_request", 1);
        debug!(
            "actor {} requesting full snapshot (prefer_no_fec={prefer_no_fec}, window count {})",
            self.actor, self.policy.window_count
        );
        self.requests
            .push_back(ServerRpc::RequestFullSnapshot { prefer_no_fec });
        true
    }

    /// A raw keyframe addressed to this client. `state_hash` is the server's digest of
    /// the snapshot it encoded.
    pub fn on_target_snapshot(
        &mut self,
        frame: &[u8],
        state_hash: u64,
        now: f64,
    ) -> Option<DecodedSnapshot> {
        let (env, payload) = self.unpack_envelope(frame, now, true)?;
        if env.is_shard() {
            return self.accept_shard(env, &payload, now);
        }
        self.accept_raw(
            &env,
            &payload,
            Route::Target {
                state_hash: Some(state_hash),
            },
            now,
        )
    }

    pub fn on_observers_snapshot(&mut self, frame: &[u8], now: f64) -> Option<DecodedSnapshot> {
        let (env, payload) = self.unpack_envelope(frame, now, true)?;
        self.accept_raw(&env, &payload, Route::Observers, now)
    }

    /// One shard of a keyframe. Returns the snapshot once the message is complete.
    pub fn on_shard(&mut self, frame: &[u8], now: f64) -> Option<DecodedSnapshot> {
        let (env, payload) = self.unpack_envelope(frame, now, false)?;
        if !env.is_shard() {
            return self.accept_raw(&env, &payload, Route::Target { state_hash: None }, now);
        }
        self.accept_shard(env, &payload, now)
    }

    /// Expires shard buffers that never completed.
    pub fn tick(&mut self, now: f64) {
        for key in self
            .registry
            .collect_expired(now, SHARD_BUFFER_TIMEOUT_SECONDS)
        {
            let received = self.registry.received_count(&key);
            self.registry.forget(&key);
            let env = self.envelopes.remove(&key.message_id);
            self.mark_completed(key.message_id);
            self.telemetry.increment("pack.shards_timeout", 1);

            if env.is_some_and(|e| e.is_canary()) {
                self.telemetry.increment("canary.bad", 1);
                debug!(
                    "actor {} canary message {} timed out with {received} shards",
                    self.actor, key.message_id
                );
                continue;
            }
            debug!(
                "actor {} message {} timed out with {received} shards",
                self.actor, key.message_id
            );
            self.request_full(now, true);
        }
    }

    fn unpack_envelope(
        &mut self,
        frame: &[u8],
        now: f64,
        request_on_failure: bool,
    ) -> Option<(Envelope, Vec<u8>)> {
        match Envelope::try_unpack(frame) {
            Ok(unpacked) => Some(unpacked),
            Err(err) => {
                self.telemetry.increment("pack.unpack_fail", 1);
                self.warnings.warn(
                    now,
                    format_args!("actor {} malformed envelope: {err}", self.actor),
                );
                if request_on_failure {
                    self.request_full(now, true);
                }
                None
            }
        }
    }

    fn is_completed(&self, message_id: u32) -> bool {
        self.completed.contains(&message_id)
    }

    fn mark_completed(&mut self, message_id: u32) {
        if self.is_completed(message_id) {
            return;
        }
        if self.completed.len() == COMPLETED_MESSAGE_MEMORY {
            self.completed.pop_front();
        }
        self.completed.push_back(message_id);
    }

    fn finish_message(&mut self, message_id: u32) {
        let key = ShardBufferKey::for_local_client(message_id);
        self.registry.forget(&key);
        self.envelopes.remove(&message_id);
        self.mark_completed(message_id);
    }

    fn accept_shard(&mut self, env: Envelope, body: &[u8], now: f64) -> Option<DecodedSnapshot> {
        let message_id = env.message_id;
        if self.is_completed(message_id) {
            trace!("actor {} late shard for message {message_id}", self.actor);
            return None;
        }

        let shard = match ShardInfo::decode(body) {
            Ok(shard) => shard,
            Err(err) => {
                self.telemetry.increment("pack.unpack_fail", 1);
                self.warnings.warn(
                    now,
                    format_args!("actor {} bad shard in message {message_id}: {err}", self.actor),
                );
                return None;
            }
        };
        self.telemetry.increment("pack.shards_received", 1);

        let key = ShardBufferKey::for_local_client(message_id);
        let total = usize::from(shard.total);
        let index = usize::from(shard.index);
        let slots = self.registry.get_or_create(key, total, now);
        if let Some(slot) = slots.get_mut(index) {
            if slot.is_none() {
                *slot = Some(shard);
            }
        }
        self.envelopes.insert(message_id, env);

        let payload = self.try_complete(&env, key, now)?;
        self.finish_message(message_id);

        if env.is_canary() {
            self.telemetry.increment("canary.ok", 1);
            trace!("actor {} canary message {message_id} ok", self.actor);
            return None;
        }
        self.decode(&payload, Route::Target { state_hash: None }, now)
    }

    /// Reassembles (recovering if needed) once the buffer holds enough shards. `None`
    /// means wait for more, or that the message was given up.
    fn try_complete(&mut self, env: &Envelope, key: ShardBufferKey, now: f64) -> Option<Vec<u8>> {
        let slots = self.registry.slots(&key)?;
        let total = slots.len();
        let layout = ShardLayout::infer(total, env.payload_len(), slots)?;
        let received = slots.iter().flatten().count();
        // pad size is only certain once it can't have come from a short last shard alone
        let exact = received >= 2
            || slots
                .get(layout.data_shards - 1)
                .is_some_and(Option::is_some);

        let missing = layout.missing_data(slots);
        let payload = if missing.is_empty() {
            reassemble(slots, layout.data_shards)?
        } else if !exact {
            return None;
        } else {
            match self.fec.try_recover(slots, &layout) {
                Ok(recovered) => {
                    let count = recovered.len();
                    let slots = self.registry.get_or_create(key, total, now);
                    for shard in recovered {
                        let index = usize::from(shard.index);
                        if let Some(slot) = slots.get_mut(index) {
                            *slot = Some(shard);
                        }
                    }
                    self.telemetry
                        .increment("pack.shards_recovered", count as u64);
                    debug!(
                        "actor {} recovered {count} shards of message {}",
                        self.actor, env.message_id
                    );
                    let slots = self.registry.slots(&key)?;
                    reassemble(slots, layout.data_shards)?
                }
                Err(FecError::Singular) => {
                    self.warnings.warn(
                        now,
                        format_args!(
                            "actor {} message {} could not be recovered",
                            self.actor, env.message_id
                        ),
                    );
                    self.give_up(env, now);
                    return None;
                }
                Err(_) => return None,
            }
        };

        if env.verifies(&payload) {
            return Some(payload);
        }
        if !exact {
            return None;
        }
        if env.is_canary() {
            self.telemetry.increment("canary.bad", 1);
            self.finish_message(env.message_id);
            return None;
        }
        self.telemetry.increment("pack.hash_mismatch", 1);
        self.warnings.warn(
            now,
            format_args!(
                "actor {} message {} failed verification after reassembly",
                self.actor, env.message_id
            ),
        );
        self.give_up(env, now);
        None
    }

    fn give_up(&mut self, env: &Envelope, now: f64) {
        self.finish_message(env.message_id);
        if !env.is_canary() {
            self.request_full(now, true);
        }
    }

    fn accept_raw(
        &mut self,
        env: &Envelope,
        payload: &[u8],
        route: Route,
        now: f64,
    ) -> Option<DecodedSnapshot> {
        if !env.verifies(payload) {
            if env.is_canary() {
                self.telemetry.increment("canary.bad", 1);
                return None;
            }
            self.telemetry.increment("pack.unpack_fail", 1);
            self.warnings.warn(
                now,
                format_args!(
                    "actor {} envelope {} failed verification",
                    self.actor, env.message_id
                ),
            );
            self.request_full(now, true);
            return None;
        }
        if env.is_canary() {
            self.telemetry.increment("canary.ok", 1);
            return None;
        }
        self.decode(payload, route, now)
    }

    fn decode(&mut self, payload: &[u8], route: Route, now: f64) -> Option<DecodedSnapshot> {
        let kind = PackedSnapshot::kind(payload);
        let snap =
            match PackedSnapshot::try_unpack(payload, self.cell_size, &mut self.anchor, &mut self.base)
            {
                Ok(snap) => snap,
                Err(err) => {
                    self.telemetry.increment("pack.unpack_fail", 1);
                    self.warnings
                        .warn(now, format_args!("actor {} {err}", self.actor));
                    let prefer_no_fec = !matches!(
                        err,
                        SnapshotError::MissingAnchor | SnapshotError::BaseMismatch { .. }
                    );
                    self.request_full(now, prefer_no_fec);
                    return None;
                }
            };
        let kind = kind.unwrap_or(PackedKind::Full);
        let decoded = DecodedSnapshot { snap, kind };
        if !decoded.is_full() {
            return Some(decoded);
        }

        self.policy.note_success(now);
        let Route::Target { state_hash: expected } = route else {
            return Some(decoded);
        };

        let local = state_hash(&snap);
        if expected.is_some_and(|h| h != local) {
            self.telemetry.increment("pack.hash_mismatch", 1);
            self.warnings.warn(
                now,
                format_args!(
                    "actor {} state hash mismatch at seq={}: server {:#018x}, local {local:#018x}",
                    self.actor,
                    snap.seq,
                    expected.unwrap_or_default()
                ),
            );
            self.request_full(now, true);
            return Some(decoded);
        }

        self.requests.push_back(ServerRpc::AckFullSnapshot {
            ack_seq: snap.seq,
            client_state_hash: local,
        });
        Some(decoded)
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;
    use stride::net::{EnvelopeFlags, ReedSolomon};
    use stride::{DeltaBounds, MemoryTelemetry};

    use super::*;

    fn snapshot(seq: u32, x: f32) -> MovementSnapshot {
        MovementSnapshot {
            pos: Vec3::new(x, 0.0, 2.0),
            vel: Vec3::new(4.0, 0.0, 0.0),
            server_time: 3.0 + f64::from(seq) * 0.033,
            seq,
            anim_state: 1,
        }
    }

    fn receiver() -> (SnapshotReceiver, Arc<MemoryTelemetry>) {
        let telemetry = Arc::new(MemoryTelemetry::new());
        let rx = SnapshotReceiver::new(
            7,
            &MovementConfig::default(),
            Arc::new(ReedSolomon),
            telemetry.clone(),
        );
        (rx, telemetry)
    }

    fn full_frame(message_id: u32, snap: &MovementSnapshot) -> (Vec<u8>, u64) {
        let payload = PackedSnapshot::pack_full(snap, 0, 0, 128);
        let quantized = PackedSnapshot::quantize(snap, 0, 0, 128);
        let env = Envelope::describe(message_id, snap.seq, &payload, EnvelopeFlags::empty());
        (env.pack(&payload), state_hash(&quantized))
    }

    fn shard_frames(message_id: u32, payload: &[u8], flags: EnvelopeFlags) -> Vec<Vec<u8>> {
        let env = Envelope::describe(message_id, 1, payload, EnvelopeFlags::SHARD | flags);
        ReedSolomon
            .build_shards(payload, 16, 2)
            .iter()
            .map(|s| env.pack(&s.encode()))
            .collect()
    }

    #[test]
    fn full_is_decoded_and_acked() {
        let (mut rx, _) = receiver();
        let snap = snapshot(5, 1.0);
        let (frame, hash) = full_frame(1, &snap);
        let decoded = rx.on_target_snapshot(&frame, hash, 1.0).unwrap();
        assert!(decoded.is_full());
        assert_eq!(decoded.snap.seq, 5);
        assert_eq!(
            rx.drain_requests(),
            vec![ServerRpc::AckFullSnapshot {
                ack_seq: 5,
                client_state_hash: hash
            }]
        );
    }

    #[test]
    fn hash_mismatch_requests_full_without_ack() {
        let (mut rx, telemetry) = receiver();
        let (frame, hash) = full_frame(1, &snapshot(5, 1.0));
        assert!(rx.on_target_snapshot(&frame, hash ^ 1, 1.0).is_some());
        assert_eq!(telemetry.counter("pack.hash_mismatch"), 1);
        assert_eq!(
            rx.drain_requests(),
            vec![ServerRpc::RequestFullSnapshot {
                prefer_no_fec: true
            }]
        );
    }

    #[test]
    fn delta_without_anchor_requests_full() {
        let (mut rx, telemetry) = receiver();
        let base = snapshot(5, 1.0);
        let next = snapshot(6, 1.2);
        let delta = PackedSnapshot::pack_delta(&base, &next, 0, 0, 128, &DeltaBounds::default())
            .unwrap();
        let env = Envelope::describe(9, 6, &delta, EnvelopeFlags::empty());
        assert!(rx.on_observers_snapshot(&env.pack(&delta), 1.0).is_none());
        assert_eq!(telemetry.counter("pack.unpack_fail"), 1);
        assert_eq!(
            rx.drain_requests(),
            vec![ServerRpc::RequestFullSnapshot {
                prefer_no_fec: false
            }]
        );

        let (frame, _) = full_frame(1, &base);
        rx.on_observers_snapshot(&frame, 2.0).unwrap();
        let decoded = rx.on_observers_snapshot(&env.pack(&delta), 2.1).unwrap();
        assert_eq!(decoded.kind, PackedKind::Delta);
        assert_eq!(decoded.snap.seq, 6);
        // observer traffic is never acked
        assert!(rx.drain_requests().is_empty());
    }

    #[test]
    fn corrupted_observer_frame_is_dropped() {
        let (mut rx, telemetry) = receiver();
        let (mut frame, _) = full_frame(1, &snapshot(5, 1.0));
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(rx.on_observers_snapshot(&frame, 1.0).is_none());
        assert_eq!(telemetry.counter("pack.unpack_fail"), 1);
        assert_eq!(rx.drain_requests().len(), 1);
    }

    #[test]
    fn request_cooldown_and_escalation() {
        let (mut rx, telemetry) = receiver();
        assert!(rx.request_full(0.0, false));
        assert!(!rx.request_full(0.5, false));
        assert_eq!(telemetry.counter("pack.full_request_cooldown"), 1);
        assert!(rx.request_full(1.0, false));
        assert!(rx.request_full(2.0, false));
        assert!(rx.request_full(3.0, false));
        let prefer: Vec<bool> = rx
            .drain_requests()
            .into_iter()
            .map(|r| match r {
                ServerRpc::RequestFullSnapshot { prefer_no_fec } => prefer_no_fec,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(prefer, vec![false, false, false, true]);
    }

    #[test]
    fn shards_reassemble_with_losses() {
        let (mut rx, telemetry) = receiver();
        let snap = snapshot(8, 3.0);
        let payload = PackedSnapshot::pack_full(&snap, 0, 0, 128);
        let frames = shard_frames(4, &payload, EnvelopeFlags::empty());
        assert_eq!(frames.len(), 5);

        let mut out = None;
        for (i, frame) in frames.iter().enumerate() {
            if i == 0 || i == 2 {
                continue;
            }
            if let Some(decoded) = rx.on_shard(frame, 1.0) {
                out = Some(decoded);
            }
        }
        let decoded = out.unwrap();
        assert_eq!(decoded.snap.seq, 8);
        assert_eq!(telemetry.counter("pack.shards_recovered"), 2);
        assert_eq!(rx.open_shard_buffers(), 0);
        assert!(matches!(
            rx.drain_requests().as_slice(),
            [ServerRpc::AckFullSnapshot { ack_seq: 8, .. }]
        ));

        // a straggler after completion is ignored
        assert!(rx.on_shard(&frames[0], 1.1).is_none());
        assert_eq!(rx.open_shard_buffers(), 0);
    }

    #[test]
    fn lone_short_shard_waits() {
        let (mut rx, _) = receiver();
        let payload = PackedSnapshot::pack_full(&snapshot(8, 3.0), 0, 0, 128);
        let frames = shard_frames(4, &payload, EnvelopeFlags::empty());
        // index 2 is the short last data shard
        assert!(rx.on_shard(&frames[2], 1.0).is_none());
        assert!(rx.drain_requests().is_empty());
        assert_eq!(rx.open_shard_buffers(), 1);
    }

    #[test]
    fn incomplete_message_times_out() {
        let (mut rx, telemetry) = receiver();
        let payload = PackedSnapshot::pack_full(&snapshot(8, 3.0), 0, 0, 128);
        let frames = shard_frames(4, &payload, EnvelopeFlags::empty());
        rx.on_shard(&frames[1], 1.0);
        rx.tick(2.0);
        assert_eq!(rx.open_shard_buffers(), 1);
        rx.tick(3.5);
        assert_eq!(rx.open_shard_buffers(), 0);
        assert_eq!(telemetry.counter("pack.shards_timeout"), 1);
        assert_eq!(
            rx.drain_requests(),
            vec![ServerRpc::RequestFullSnapshot {
                prefer_no_fec: true
            }]
        );
    }

    #[test]
    fn canaries_are_verified_and_dropped() {
        let (mut rx, telemetry) = receiver();
        let payload: Vec<u8> = (0..40u8).collect();
        for frame in shard_frames(11, &payload, EnvelopeFlags::CANARY) {
            assert!(rx.on_shard(&frame, 1.0).is_none());
        }
        let env = Envelope::describe(12, 1, &payload, EnvelopeFlags::CANARY);
        assert!(rx.on_target_snapshot(&env.pack(&payload), 0, 1.0).is_none());
        assert_eq!(telemetry.counter("canary.ok"), 2);
        assert!(!rx.anchor().have);
        assert!(rx.drain_requests().is_empty());
    }
}
