use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use glam::Vec3;
use log::{debug, warn};

use stride::anticheat::{allowed_step, bound_planar_step, soft_clamp, step_slack};
use stride::interest::{Cell, ChunkInterest, Ring, RingSets};
use stride::movement::{anim_state_for, planar, planar_distance};
use stride::net::{
    ClientPacket, ClientRpc, ConnectionId, Envelope, EnvelopeFlags, FecCodec, InputCommand,
    Outgoing, PackedSnapshot, Recipient, ReedSolomon, ShardInfo,
};
use stride::{
    AntiCheatContext, AntiCheatValidator, FEC_DISABLE_DURATION_SECONDS, GroundSampler,
    MovementConfig, MovementSnapshot, NavMeshProjector, NetClock, RECONCILE_COOLDOWN_SEC,
    SnapshotReplay, Telemetry, integrate_step, state_hash,
};

use crate::canary::CanaryEmitter;
use crate::events::ServerEvent;
use crate::rate_limit::TokenBucket;
use crate::retry::{FULL_RETRY_MAX, FULL_RETRY_SECONDS, RetryManager};

/// Tolerance on ring send times so a 30 Hz input stream feeds a 30 Hz ring.
const SEND_SLOP_SECONDS: f64 = 0.002;

/// Capabilities the host wires into every driver.
#[derive(Clone)]
pub struct ServerServices {
    pub clock: Arc<dyn NetClock>,
    pub telemetry: Arc<dyn Telemetry>,
    pub anti_cheat: Arc<dyn AntiCheatValidator>,
    pub fec: Arc<dyn FecCodec>,
    pub navmesh: Option<Arc<dyn NavMeshProjector>>,
    pub ground: Option<Arc<dyn GroundSampler>>,
}

impl ServerServices {
    pub fn new(
        clock: Arc<dyn NetClock>,
        telemetry: Arc<dyn Telemetry>,
        anti_cheat: Arc<dyn AntiCheatValidator>,
    ) -> Self {
        Self {
            clock,
            telemetry,
            anti_cheat,
            fec: Arc::new(ReedSolomon),
            navmesh: None,
            ground: None,
        }
    }

    pub fn with_fec(mut self, fec: Arc<dyn FecCodec>) -> Self {
        self.fec = fec;
        self
    }

    pub fn with_navmesh(mut self, navmesh: Arc<dyn NavMeshProjector>) -> Self {
        self.navmesh = Some(navmesh);
        self
    }

    pub fn with_ground(mut self, ground: Arc<dyn GroundSampler>) -> Self {
        self.ground = Some(ground);
        self
    }
}

/// Per-observer delta stream. Deltas are taken against `keyframe`, the last full this
/// observer was sent, quantized the way the observer decoded it.
#[derive(Debug, Clone, Copy, Default)]
struct ObserverStream {
    next_send_at: f64,
    keyframe: Option<MovementSnapshot>,
    anchor: (i16, i16),
    since_keyframe: u32,
}

fn anchor_of(cell: Cell) -> (i16, i16) {
    let clamp = |v: i32| v.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
    (clamp(cell.0), clamp(cell.1))
}

/// Authoritative state of one actor and everything the server sends about it.
pub struct ServerDriver {
    conn: ConnectionId,
    config: Arc<MovementConfig>,
    services: ServerServices,
    bucket: TokenBucket,
    last_pos: Vec3,
    last_time: f64,
    last_step: f32,
    last_accepted_seq: u32,
    last_rtt_ms: f64,
    latest: MovementSnapshot,
    owner_since_keyframe: u32,
    last_correction_at: Option<f64>,
    next_message_id: u32,
    retries: RetryManager,
    observers: HashMap<ConnectionId, ObserverStream>,
    fec_suppressed_until: HashMap<ConnectionId, f64>,
    replay: Option<SnapshotReplay>,
    shutting_down: bool,
    pending: VecDeque<Outgoing<ClientPacket>>,
    pending_events: VecDeque<ServerEvent>,
}

impl ServerDriver {
    pub fn new(
        conn: ConnectionId,
        spawn: Vec3,
        config: Arc<MovementConfig>,
        services: ServerServices,
    ) -> Self {
        let now = services.clock.now();
        let replay = config
            .replay
            .enabled
            .then(|| SnapshotReplay::new(&config.replay));
        Self {
            conn,
            bucket: TokenBucket::new(&config.rate_limit),
            last_pos: spawn,
            last_time: now,
            last_step: 0.0,
            last_accepted_seq: 0,
            last_rtt_ms: 0.0,
            latest: MovementSnapshot {
                pos: spawn,
                server_time: now,
                ..Default::default()
            },
            owner_since_keyframe: 0,
            last_correction_at: None,
            next_message_id: 1,
            retries: RetryManager::new(),
            observers: HashMap::new(),
            fec_suppressed_until: HashMap::new(),
            replay,
            shutting_down: false,
            pending: VecDeque::new(),
            pending_events: VecDeque::new(),
            config,
            services,
        }
    }

    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    pub fn position(&self) -> Vec3 {
        self.last_pos
    }

    pub fn latest_snapshot(&self) -> &MovementSnapshot {
        &self.latest
    }

    pub fn last_accepted_seq(&self) -> u32 {
        self.last_accepted_seq
    }

    pub fn last_rtt_ms(&self) -> f64 {
        self.last_rtt_ms
    }

    pub fn retries(&self) -> &RetryManager {
        &self.retries
    }

    pub fn replay(&self) -> Option<&SnapshotReplay> {
        self.replay.as_ref()
    }

    pub fn shutdown(&mut self) {
        self.shutting_down = true;
        self.pending.clear();
    }

    pub fn drain_outgoing(&mut self) -> impl Iterator<Item = Outgoing<ClientPacket>> + '_ {
        self.pending.drain(..)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    /// Ids start at 1 and skip 0 on wrap.
    fn next_message_id(&mut self) -> u32 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        id
    }

    pub fn is_fec_suppressed(&mut self, conn: ConnectionId, now: f64) -> bool {
        match self.fec_suppressed_until.get(&conn) {
            Some(until) if now < *until => true,
            Some(_) => {
                self.fec_suppressed_until.remove(&conn);
                false
            }
            None => false,
        }
    }

    /// Drops everything kept for a connection that went away.
    pub fn forget_connection(&mut self, conn: ConnectionId) {
        self.observers.remove(&conn);
        self.retries.clear(conn);
        self.fec_suppressed_until.remove(&conn);
    }

    /// Rate limiting, integration and anti-cheat for one owner input. Returns the new
    /// authoritative snapshot, or `None` when the input was dropped.
    pub fn accept_input(&mut self, input: &InputCommand) -> Option<MovementSnapshot> {
        if self.shutting_down {
            return None;
        }
        let telemetry = Arc::clone(&self.services.telemetry);
        let now = self.services.clock.now();

        if !self.bucket.try_take(now) {
            telemetry.increment("rate_limit.dropped", 1);
            return None;
        }
        if input.seq <= self.last_accepted_seq {
            telemetry.increment("input.out_of_order", 1);
            debug!(
                "actor {} dropped input seq={} (last accepted {})",
                self.conn, input.seq, self.last_accepted_seq
            );
            return None;
        }

        let one_way = (now - input.client_timestamp).max(0.0);
        let dt = (now - self.last_time).max(one_way).max(0.001);
        self.last_time = now;
        self.last_rtt_ms = one_way * 2000.0;
        let dt_f = dt as f32;

        let config = &self.config;
        let locomotion = &config.locomotion;
        let ac = &config.anti_cheat;
        let ground = self.services.ground.as_deref();
        let last = self.last_pos;
        let dir = input.dir();
        let predicted = input.pred_pos();
        let speed = locomotion.speed(input.running);
        let vertical_intent = dir.y.abs() > 1e-4;

        let mut integrated = integrate_step(last, dir, input.running, dt_f, locomotion);
        integrated.y = if vertical_intent {
            last.y + dir.y * speed * dt_f
        } else {
            predicted.y
        };
        let integrated = locomotion
            .elevation
            .resolve_server(integrated, ground, vertical_intent);
        telemetry.observe(
            "server.predicted_vs_integrated_cm",
            f64::from(integrated.distance(predicted)) * 100.0,
        );

        let slack = step_slack(one_way as f32, ac);
        let allowed = allowed_step(speed, dt_f, slack, ac);
        let corners = input.path_corners();
        let ctx = AntiCheatContext {
            conn: self.conn,
            last_server_pos: last,
            predicted_pos: predicted,
            max_step: allowed,
            path_corners: corners.as_deref().filter(|_| input.is_ctm),
            running: input.running,
            dt: dt_f,
        };

        let mut final_pos = if self.services.anti_cheat.validate_input(&ctx) {
            integrated
        } else {
            let d = planar_distance(predicted, last);
            telemetry.increment("anti_cheat.soft_clamps", 1);
            telemetry.event(
                "anti_cheat.soft_clamp",
                &[("conn", self.conn.to_string())],
                &[
                    ("d", f64::from(d)),
                    ("allowed", f64::from(allowed)),
                    ("rtt_ms", self.last_rtt_ms),
                ],
            );
            debug!(
                "actor {} soft clamp seq={} d={d:.3} allowed={allowed:.3} rtt={:.1}ms",
                self.conn, input.seq, self.last_rtt_ms
            );
            let clamped = if d > allowed {
                soft_clamp(last, predicted, allowed, ac.max_vertical_speed, dt_f)
            } else {
                last
            };
            locomotion
                .elevation
                .resolve_server(clamped, ground, vertical_intent)
        };

        let navmesh = self.services.navmesh.as_deref().filter(|_| ac.validate_navmesh);
        if let Some(projected) =
            navmesh.and_then(|n| n.sample_position(final_pos, ac.navmesh_max_sample_dist))
        {
            let projected = locomotion
                .elevation
                .resolve_server(projected, ground, vertical_intent);
            final_pos = bound_planar_step(last, projected, allowed);
        }

        let max_dy = ac.max_vertical_speed * dt_f;
        final_pos.y = last.y + (final_pos.y - last.y).clamp(-max_dy, max_dy);

        let mut vel = (final_pos - last) / dt_f;
        vel.y = vel.y.clamp(-ac.max_vertical_speed, ac.max_vertical_speed);

        let snap = MovementSnapshot {
            pos: final_pos,
            vel,
            server_time: now,
            seq: input.seq,
            anim_state: anim_state_for(planar(vel).length(), input.running),
        };

        self.last_step = final_pos.distance(last);
        self.last_pos = final_pos;
        self.last_accepted_seq = input.seq;
        self.latest = snap;
        if let Some(replay) = self.replay.as_mut() {
            replay.save(snap);
        }
        Some(snap)
    }

    /// Keyframe decision for the owner, then ring-scheduled delivery to observers.
    /// `interest` must already hold the actor's new cell.
    pub fn publish(&mut self, snap: &MovementSnapshot, interest: &dyn ChunkInterest) {
        if self.shutting_down {
            return;
        }
        let now = self.services.clock.now();
        let broadcast = &self.config.broadcast;

        let mut require_full = self.owner_since_keyframe >= (broadcast.keyframe_every / 2).max(1);
        let recent_reconcile = self
            .last_correction_at
            .is_some_and(|t| now - t < RECONCILE_COOLDOWN_SEC * 1.5);
        if self.last_step > 0.9 * self.config.reconcile.hard_snap_dist && recent_reconcile {
            require_full = true;
            self.services
                .telemetry
                .increment("reconcile.suppressed_in_favor_of_full", 1);
        }

        if require_full {
            self.owner_since_keyframe = 0;
            let anchor = anchor_of(interest.cell_of(snap.pos));
            self.send_full(self.conn, snap, anchor, now);
        } else {
            self.owner_since_keyframe += 1;
            self.send_owner_correction(snap, now);
        }

        self.broadcast(snap, interest, now);
    }

    fn send_owner_correction(&mut self, snap: &MovementSnapshot, now: f64) {
        self.last_correction_at = Some(now);
        self.pending.push_back(Outgoing::reliable(
            Recipient::Connection(self.conn),
            ClientPacket::new(
                self.conn,
                ClientRpc::OwnerCorrection {
                    server_seq: snap.seq,
                    server_pos: snap.pos.to_array(),
                },
            ),
        ));
    }

    fn broadcast(&mut self, snap: &MovementSnapshot, interest: &dyn ChunkInterest, now: f64) {
        let broadcast = &self.config.broadcast;
        if broadcast.force_broadcast_all || interest.actor_cell(self.conn).is_none() {
            let (cx, cy) = anchor_of(interest.cell_of(snap.pos));
            let payload = PackedSnapshot::pack_full(snap, cx, cy, broadcast.cell_size);
            let env = Envelope::describe(self.next_message_id(), snap.seq, &payload, EnvelopeFlags::empty());
            self.pending.push_back(Outgoing::unreliable(
                Recipient::Observers,
                ClientPacket::new(self.conn, ClientRpc::ObserversSnapshot { env: env.pack(&payload) }),
            ));
            self.services.telemetry.increment("pack.full_sent", 1);
            return;
        }

        let rings = RingSets::collect(interest, self.conn, broadcast);
        self.observers.retain(|conn, _| rings.ring_of(*conn).is_some());

        let anchor = anchor_of(interest.cell_of(snap.pos));
        for (ring, observer) in rings.iter() {
            self.send_to_observer(observer, ring, snap, anchor, now);
        }
    }

    fn send_to_observer(
        &mut self,
        observer: ConnectionId,
        ring: Ring,
        snap: &MovementSnapshot,
        anchor: (i16, i16),
        now: f64,
    ) {
        let mut stream = self.observers.get(&observer).copied().unwrap_or_default();
        if now + SEND_SLOP_SECONDS < stream.next_send_at {
            return;
        }
        let broadcast = &self.config.broadcast;
        stream.next_send_at = now + ring.interval(broadcast);

        let delta = match stream.keyframe {
            Some(base)
                if stream.anchor == anchor && stream.since_keyframe < broadcast.keyframe_every =>
            {
                let delta = PackedSnapshot::pack_delta(
                    &base,
                    snap,
                    stream.anchor.0,
                    stream.anchor.1,
                    broadcast.cell_size,
                    &self.config.delta_bounds,
                );
                if delta.is_none() {
                    self.services.telemetry.increment("pack.fallback_count", 1);
                }
                delta
            }
            _ => None,
        };

        match delta {
            Some(payload) => {
                stream.since_keyframe += 1;
                let env = Envelope::describe(self.next_message_id(), snap.seq, &payload, EnvelopeFlags::empty());
                self.pending.push_back(Outgoing::unreliable(
                    Recipient::Connection(observer),
                    ClientPacket::new(self.conn, ClientRpc::ObserversSnapshot { env: env.pack(&payload) }),
                ));
                self.services.telemetry.increment("pack.delta_sent", 1);
            }
            None => {
                stream.keyframe = Some(self.send_full(observer, snap, anchor, now));
                stream.anchor = anchor;
                stream.since_keyframe = 0;
            }
        }
        self.observers.insert(observer, stream);
    }

    /// Packs, frames and records a keyframe for `to`. Returns the snapshot as `to`
    /// will decode it.
    fn send_full(
        &mut self,
        to: ConnectionId,
        snap: &MovementSnapshot,
        (cx, cy): (i16, i16),
        now: f64,
    ) -> MovementSnapshot {
        let cell_size = self.config.broadcast.cell_size;
        let payload = PackedSnapshot::pack_full(snap, cx, cy, cell_size);
        let quantized = PackedSnapshot::quantize(snap, cx, cy, cell_size);
        let hash = state_hash(&quantized);
        let message_id = self.next_message_id();

        let shards = self.frame_full(to, &payload, snap.seq, hash, message_id, None, now);
        self.retries
            .record(to, payload, shards, snap.seq, hash, message_id, now);
        self.services.telemetry.increment("pack.full_sent", 1);
        quantized
    }

    /// Queues a keyframe either as FEC shards or as one raw frame. Returns the shards
    /// when FEC was used.
    #[allow(clippy::too_many_arguments)]
    fn frame_full(
        &mut self,
        to: ConnectionId,
        payload: &[u8],
        seq: u32,
        hash: u64,
        message_id: u32,
        cached: Option<&[ShardInfo]>,
        now: f64,
    ) -> Option<Vec<ShardInfo>> {
        let parity = self
            .config
            .fec
            .parity_shards
            .min(self.services.fec.max_parity());

        if parity == 0 || self.is_fec_suppressed(to, now) {
            let env = Envelope::describe(message_id, seq, payload, EnvelopeFlags::empty());
            self.pending.push_back(Outgoing::reliable(
                Recipient::Connection(to),
                ClientPacket::new(
                    self.conn,
                    ClientRpc::TargetSnapshot {
                        env: env.pack(payload),
                        state_hash: hash,
                    },
                ),
            ));
            return None;
        }

        let shards = match cached {
            Some(shards) => shards.to_vec(),
            None => self
                .services
                .fec
                .build_shards(payload, self.config.fec.shard_size, parity),
        };
        let env = Envelope::describe(message_id, seq, payload, EnvelopeFlags::SHARD);
        for shard in &shards {
            self.pending.push_back(Outgoing::reliable(
                Recipient::Connection(to),
                ClientPacket::new(
                    self.conn,
                    ClientRpc::TargetShard {
                        env: env.pack(&shard.encode()),
                    },
                ),
            ));
        }
        self.services
            .telemetry
            .increment("pack.shards_sent", shards.len() as u64);
        debug!(
            "actor {} full seq={seq} to {to} as {} shards, message {message_id}",
            self.conn,
            shards.len()
        );
        Some(shards)
    }

    /// Retries outstanding keyframes and abandons the ones that ran out of retries.
    pub fn tick(&mut self) {
        if self.shutting_down {
            return;
        }
        let now = self.services.clock.now();

        for conn in self
            .retries
            .collect_exhausted(now, FULL_RETRY_SECONDS, FULL_RETRY_MAX)
        {
            let Some(record) = self.retries.clear(conn) else {
                continue;
            };
            self.services.telemetry.increment("pack.retry_abandoned", 1);
            debug!(
                "actor {} abandoned full seq={} to {conn} after {} retries",
                self.conn, record.seq, record.retry_count
            );
            self.pending_events.push_back(ServerEvent::RetryAbandoned {
                actor: self.conn,
                conn,
                seq: record.seq,
            });
            if conn == self.conn {
                self.owner_since_keyframe = self.config.broadcast.keyframe_every;
            } else if let Some(stream) = self.observers.get_mut(&conn) {
                stream.keyframe = None;
            }
        }

        for conn in self
            .retries
            .collect_due(now, FULL_RETRY_SECONDS, FULL_RETRY_MAX)
        {
            let Some(record) = self.retries.get(conn).cloned() else {
                continue;
            };
            let message_id = self.next_message_id();
            let shards = self.frame_full(
                conn,
                &record.payload,
                record.seq,
                record.state_hash,
                message_id,
                record.shards.as_deref(),
                now,
            );
            if let Some(entry) = self.retries.get_mut(conn) {
                entry.message_id = message_id;
                if shards.is_some() {
                    entry.shards = shards;
                }
            }
            self.retries.mark_sent(conn, now);
            self.services.telemetry.increment("pack.full_retry", 1);
            debug!(
                "actor {} retry full seq={} to {conn} (attempt {})",
                self.conn,
                record.seq,
                record.retry_count + 1
            );
        }
    }

    /// Sends the latest snapshot to observers that have never received this actor.
    pub fn publish_to_new_observers(&mut self, interest: &dyn ChunkInterest) {
        if self.shutting_down || self.config.broadcast.force_broadcast_all {
            return;
        }
        let now = self.services.clock.now();
        let rings = RingSets::collect(interest, self.conn, &self.config.broadcast);
        let anchor = anchor_of(interest.cell_of(self.latest.pos));
        let snap = self.latest;
        for (ring, observer) in rings.iter() {
            if !self.observers.contains_key(&observer) {
                self.send_to_observer(observer, ring, &snap, anchor, now);
            }
        }
    }

    pub fn on_ack(&mut self, from: ConnectionId, ack_seq: u32, client_state_hash: u64) {
        if self.shutting_down {
            return;
        }
        let Some(record) = self.retries.get(from) else {
            return;
        };
        if ack_seq < record.seq {
            debug!(
                "actor {} stale ack seq={ack_seq} from {from}, outstanding {}",
                self.conn, record.seq
            );
            return;
        }
        if ack_seq == record.seq && client_state_hash != record.state_hash {
            self.services.telemetry.increment("pack.hash_mismatch", 1);
            warn!(
                "actor {} ack from {from} for seq={ack_seq} has state hash {client_state_hash:#018x}, expected {:#018x}",
                self.conn, record.state_hash
            );
            return;
        }
        self.retries.clear(from);
    }

    pub fn on_request_full(
        &mut self,
        from: ConnectionId,
        prefer_no_fec: bool,
        interest: &dyn ChunkInterest,
    ) {
        if self.shutting_down {
            return;
        }
        let now = self.services.clock.now();
        if prefer_no_fec {
            let until = now + FEC_DISABLE_DURATION_SECONDS;
            self.fec_suppressed_until.insert(from, until);
            self.services.telemetry.increment("pack.fec_suppressed", 1);
            debug!("actor {} FEC suppressed for {from} until {until:.2}", self.conn);
            self.pending_events.push_back(ServerEvent::FecSuppressed {
                actor: self.conn,
                conn: from,
                until,
            });
        }

        let snap = self.latest;
        let anchor = anchor_of(interest.cell_of(snap.pos));
        let keyframe = self.send_full(from, &snap, anchor, now);
        if from == self.conn {
            self.owner_since_keyframe = 0;
        } else {
            let stream = self.observers.entry(from).or_default();
            stream.keyframe = Some(keyframe);
            stream.anchor = anchor;
            stream.since_keyframe = 0;
        }
    }

    pub fn send_canary(&mut self, canary: &CanaryEmitter) {
        if self.shutting_down {
            return;
        }
        let message_id = self.next_message_id();
        let frames = canary.frames(message_id, self.latest.seq, self.services.fec.as_ref());
        for rpc in frames {
            self.pending.push_back(Outgoing::reliable(
                Recipient::Connection(self.conn),
                ClientPacket::new(self.conn, rpc),
            ));
        }
    }
}
