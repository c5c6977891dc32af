use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use glam::Vec3;
use log::{debug, info, trace};

use stride::net::{
    ClientPacket, ClientRpc, ConnectionId, FecCodec, Outgoing, Recipient, ReedSolomon,
    ServerPacket, ServerRpc,
};
use stride::{ClockSync, EmaClockSync, GroundSampler, MovementConfig, NetClock, Telemetry};

use crate::config::ClientConfig;
use crate::owner::{MoveIntent, OwnerRuntime};
use crate::receiver::{DecodedSnapshot, SnapshotReceiver};
use crate::remote::{RemoteRenderer, RemoteView};

/// Capabilities the host wires into the client.
#[derive(Clone)]
pub struct ClientServices {
    pub clock: Arc<dyn NetClock>,
    pub telemetry: Arc<dyn Telemetry>,
    pub fec: Arc<dyn FecCodec>,
    pub ground: Option<Arc<dyn GroundSampler>>,
}

impl ClientServices {
    pub fn new(clock: Arc<dyn NetClock>, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            clock,
            telemetry,
            fec: Arc::new(ReedSolomon),
            ground: None,
        }
    }

    pub fn with_fec(mut self, fec: Arc<dyn FecCodec>) -> Self {
        self.fec = fec;
        self
    }

    pub fn with_ground(mut self, ground: Arc<dyn GroundSampler>) -> Self {
        self.ground = Some(ground);
        self
    }
}

pub struct RemoteActor {
    receiver: SnapshotReceiver,
    renderer: RemoteRenderer,
    view: Option<RemoteView>,
}

impl RemoteActor {
    fn new(
        conn: ConnectionId,
        movement: &Arc<MovementConfig>,
        services: &ClientServices,
        rtt: Option<f64>,
    ) -> Self {
        let receiver = SnapshotReceiver::new(
            conn,
            movement,
            Arc::clone(&services.fec),
            Arc::clone(&services.telemetry),
        );
        let mut renderer = RemoteRenderer::new(Arc::clone(movement), rtt);
        if let Some(ground) = &services.ground {
            renderer = renderer.with_ground(Arc::clone(ground));
        }
        Self {
            receiver,
            renderer,
            view: None,
        }
    }

    pub fn receiver(&self) -> &SnapshotReceiver {
        &self.receiver
    }

    pub fn renderer(&self) -> &RemoteRenderer {
        &self.renderer
    }

    pub fn view(&self) -> Option<&RemoteView> {
        self.view.as_ref()
    }
}

/// Client half of the movement sync for one connection: predicts the owned actor,
/// renders everyone else, and keeps the clock offset fresh.
///
/// The host calls [`fixed_tick`](Self::fixed_tick) at the fixed rate,
/// [`render`](Self::render) every frame and [`handle`](Self::handle) for every packet,
/// then ships what [`drain_outgoing`](Self::drain_outgoing) returns.
pub struct MovementClient {
    actor: ConnectionId,
    config: ClientConfig,
    movement: Arc<MovementConfig>,
    services: ClientServices,
    clock_sync: Box<dyn ClockSync>,
    owner: OwnerRuntime,
    owner_rx: SnapshotReceiver,
    remotes: BTreeMap<ConnectionId, RemoteActor>,
    next_ping_at: f64,
    outgoing: VecDeque<Outgoing<ServerPacket>>,
    shutting_down: bool,
}

impl MovementClient {
    pub fn new(
        actor: ConnectionId,
        spawn: Vec3,
        config: ClientConfig,
        services: ClientServices,
    ) -> Self {
        let movement = Arc::new(config.movement.clone().sanitized());
        let mut owner = OwnerRuntime::new(
            spawn,
            Arc::clone(&movement),
            Arc::clone(&services.telemetry),
        );
        if let Some(ground) = &services.ground {
            owner = owner.with_ground(Arc::clone(ground));
        }
        let owner_rx = SnapshotReceiver::new(
            actor,
            &movement,
            Arc::clone(&services.fec),
            Arc::clone(&services.telemetry),
        );
        info!("movement client for actor {actor} at {spawn}");
        Self {
            actor,
            clock_sync: Box::new(EmaClockSync::new(&movement.clock)),
            owner,
            owner_rx,
            remotes: BTreeMap::new(),
            next_ping_at: services.clock.now(),
            outgoing: VecDeque::new(),
            shutting_down: false,
            movement,
            services,
            config,
        }
    }

    pub fn with_clock_sync(mut self, clock_sync: Box<dyn ClockSync>) -> Self {
        self.clock_sync = clock_sync;
        self
    }

    pub fn actor(&self) -> ConnectionId {
        self.actor
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn owner(&self) -> &OwnerRuntime {
        &self.owner
    }

    pub fn position(&self) -> Vec3 {
        self.owner.position()
    }

    /// Receiver for keyframes about this client's own actor.
    pub fn owner_receiver(&self) -> &SnapshotReceiver {
        &self.owner_rx
    }

    pub fn clock_sync(&self) -> &dyn ClockSync {
        self.clock_sync.as_ref()
    }

    pub fn remote(&self, conn: ConnectionId) -> Option<&RemoteActor> {
        self.remotes.get(&conn)
    }

    pub fn remote_view(&self, conn: ConnectionId) -> Option<&RemoteView> {
        self.remotes.get(&conn).and_then(RemoteActor::view)
    }

    pub fn remote_actors(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.remotes.keys().copied()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn drain_outgoing(&mut self) -> impl Iterator<Item = Outgoing<ServerPacket>> + '_ {
        self.outgoing.drain(..)
    }

    fn server_time(&self, now: f64) -> f64 {
        self.clock_sync.client_to_server_time(now)
    }

    fn send(&mut self, actor: ConnectionId, rpc: ServerRpc) {
        self.outgoing.push_back(Outgoing::reliable(
            Recipient::Server,
            ServerPacket::new(actor, rpc),
        ));
    }

    /// Prediction, input sending, correction, pings and shard timeouts for one step.
    pub fn fixed_tick(&mut self, intent: &MoveIntent, dt: f32) {
        if self.shutting_down {
            return;
        }
        let now = self.services.clock.now();

        if now >= self.next_ping_at {
            self.next_ping_at = now + self.movement.clock.ping_interval;
            self.send(self.actor, ServerRpc::PingRequest { client_send: now });
        }

        let server_now = self.server_time(now);
        if let Some(input) = self.owner.fixed_tick(intent, dt, now, server_now) {
            trace!("actor {} input seq={}", self.actor, input.seq);
            self.send(self.actor, ServerRpc::SendInput(input));
        }

        self.owner_rx.tick(now);
        for remote in self.remotes.values_mut() {
            remote.receiver.tick(now);
        }
        self.flush_requests();
    }

    /// Advances every remote actor's presentation by `dt`.
    pub fn render(&mut self, dt: f32) {
        if self.shutting_down {
            return;
        }
        let server_now = self.server_time(self.services.clock.now());
        let mut backoff_sum = 0.0;
        for remote in self.remotes.values_mut() {
            if let Some(view) = remote.renderer.render(dt, server_now) {
                remote.view = Some(view);
            }
            backoff_sum += remote.renderer.backoff();
        }
        if !self.remotes.is_empty() {
            self.services
                .telemetry
                .set_gauge("remote.backoff", backoff_sum / self.remotes.len() as f64);
        }
    }

    pub fn handle(&mut self, packet: ClientPacket) {
        if self.shutting_down {
            return;
        }
        let now = self.services.clock.now();
        let actor = packet.actor;

        match packet.rpc {
            ClientRpc::PingReply {
                client_send,
                server_recv,
                server_send,
            } => {
                self.clock_sync
                    .on_ping_reply(client_send, server_recv, server_send, now);
                let telemetry = &self.services.telemetry;
                telemetry.set_gauge("clock.offset_ms", self.clock_sync.offset_ema_ms());
                telemetry.set_gauge("clock.rtt_ms", self.clock_sync.last_rtt_ms());
            }
            ClientRpc::OwnerCorrection {
                server_seq,
                server_pos,
            } => {
                if actor == self.actor {
                    self.owner
                        .on_owner_correction(server_seq, Vec3::from_array(server_pos), now);
                } else {
                    debug!("owner correction for foreign actor {actor}");
                }
            }
            ClientRpc::TargetSnapshot { env, state_hash } => {
                let decoded = self
                    .receiver_for(actor)
                    .on_target_snapshot(&env, state_hash, now);
                self.deliver(actor, decoded, now);
            }
            ClientRpc::TargetShard { env } => {
                let decoded = self.receiver_for(actor).on_shard(&env, now);
                self.deliver(actor, decoded, now);
            }
            ClientRpc::ObserversSnapshot { env } => {
                if actor == self.actor {
                    trace!("observer frame about own actor ignored");
                } else {
                    let decoded = self.receiver_for(actor).on_observers_snapshot(&env, now);
                    self.deliver(actor, decoded, now);
                }
            }
        }

        self.flush_requests();
    }

    fn receiver_for(&mut self, actor: ConnectionId) -> &mut SnapshotReceiver {
        if actor == self.actor {
            return &mut self.owner_rx;
        }
        let rtt = (self.clock_sync.sample_count() > 0)
            .then(|| self.clock_sync.last_rtt_ms() / 1000.0);
        let movement = &self.movement;
        let services = &self.services;
        &mut self
            .remotes
            .entry(actor)
            .or_insert_with(|| {
                debug!("tracking remote actor {actor}");
                RemoteActor::new(actor, movement, services, rtt)
            })
            .receiver
    }

    fn deliver(&mut self, actor: ConnectionId, decoded: Option<DecodedSnapshot>, now: f64) {
        let Some(decoded) = decoded else {
            return;
        };
        if actor == self.actor {
            if decoded.is_full() {
                self.owner
                    .on_owner_correction(decoded.snap.seq, decoded.snap.pos, now);
            }
            return;
        }
        let server_now = self.server_time(now);
        if let Some(remote) = self.remotes.get_mut(&actor) {
            remote.renderer.push(decoded.snap, server_now);
        }
    }

    fn flush_requests(&mut self) {
        for rpc in self.owner_rx.drain_requests() {
            self.send(self.actor, rpc);
        }
        let mut pending = Vec::new();
        for (conn, remote) in &mut self.remotes {
            pending.extend(
                remote
                    .receiver
                    .drain_requests()
                    .into_iter()
                    .map(|rpc| (*conn, rpc)),
            );
        }
        for (conn, rpc) in pending {
            self.send(conn, rpc);
        }
    }

    /// Drops everything known about a remote actor that left.
    pub fn forget_actor(&mut self, actor: ConnectionId) {
        if self.remotes.remove(&actor).is_some() {
            debug!("forgot remote actor {actor}");
        }
    }

    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        info!("movement client for actor {} shutting down", self.actor);
        self.shutting_down = true;
        self.outgoing.clear();
        self.remotes.clear();
        self.owner_rx.reset();
    }
}

#[cfg(test)]
mod tests {
    use stride::net::{Channel, Envelope, EnvelopeFlags, PackedSnapshot};
    use stride::{DeltaBounds, ManualClock, MemoryTelemetry, MovementSnapshot, state_hash};

    use super::*;

    const DT: f32 = 1.0 / 60.0;

    struct Harness {
        clock: ManualClock,
        telemetry: Arc<MemoryTelemetry>,
        client: MovementClient,
    }

    fn harness() -> Harness {
        let clock = ManualClock::new(10.0);
        let telemetry = Arc::new(MemoryTelemetry::new());
        let services = ClientServices::new(Arc::new(clock.clone()), telemetry.clone());
        let client = MovementClient::new(1, Vec3::ZERO, ClientConfig::default(), services);
        Harness {
            clock,
            telemetry,
            client,
        }
    }

    fn snap(seq: u32, t: f64, x: f32) -> MovementSnapshot {
        MovementSnapshot {
            pos: Vec3::new(x, 0.0, 0.0),
            vel: Vec3::new(4.0, 0.0, 0.0),
            server_time: t,
            seq,
            anim_state: 1,
        }
    }

    fn frame(message_id: u32, seq: u32, payload: &[u8]) -> Vec<u8> {
        Envelope::describe(message_id, seq, payload, EnvelopeFlags::empty()).pack(payload)
    }

    fn rpcs(client: &mut MovementClient) -> Vec<(ConnectionId, ServerRpc)> {
        client
            .drain_outgoing()
            .into_iter()
            .map(|o| {
                assert_eq!(o.to, Recipient::Server);
                assert_eq!(o.channel, Channel::Reliable);
                (o.packet.actor, o.packet.rpc)
            })
            .collect()
    }

    #[test]
    fn inputs_and_pings_go_out() {
        let mut h = harness();
        let intent = MoveIntent::walk(Vec3::X);
        for _ in 0..60 {
            h.client.fixed_tick(&intent, DT);
            h.clock.advance(f64::from(DT));
        }
        let sent = rpcs(&mut h.client);
        let inputs = sent
            .iter()
            .filter(|(_, rpc)| matches!(rpc, ServerRpc::SendInput(_)))
            .count();
        let pings = sent
            .iter()
            .filter(|(_, rpc)| matches!(rpc, ServerRpc::PingRequest { .. }))
            .count();
        assert_eq!(inputs, 30);
        assert_eq!(pings, 1);
        assert!(sent.iter().all(|(actor, _)| *actor == 1));
    }

    #[test]
    fn ping_reply_updates_clock() {
        let mut h = harness();
        h.clock.set(20.1);
        h.client.handle(ClientPacket::new(
            1,
            ClientRpc::PingReply {
                client_send: 20.0,
                server_recv: 25.05,
                server_send: 25.05,
            },
        ));
        assert!((h.client.clock_sync().last_rtt_ms() - 100.0).abs() < 1e-6);
        assert!((h.client.clock_sync().offset_ema_ms() - 5000.0).abs() < 1e-6);
        assert!(h.telemetry.gauge("clock.offset_ms").is_some());
        assert!(h.telemetry.gauge("clock.rtt_ms").is_some());
    }

    #[test]
    fn remote_actor_renders_from_observer_frames() {
        let mut h = harness();
        let base = snap(1, 10.0, 5.0);
        let full = PackedSnapshot::pack_full(&base, 0, 0, 128);
        h.client
            .handle(ClientPacket::new(2, ClientRpc::ObserversSnapshot { env: frame(1, 1, &full) }));

        let next = snap(2, 10.05, 5.2);
        let delta =
            PackedSnapshot::pack_delta(&base, &next, 0, 0, 128, &DeltaBounds::default()).unwrap();
        h.clock.set(10.05);
        h.client
            .handle(ClientPacket::new(2, ClientRpc::ObserversSnapshot { env: frame(2, 2, &delta) }));

        let remote = h.client.remote(2).unwrap();
        assert_eq!(remote.renderer().buffer().len(), 2);

        h.clock.set(10.3);
        h.client.render(DT);
        let view = h.client.remote_view(2).unwrap();
        assert!(view.pos.x > 5.0);
        assert!(h.telemetry.gauge("remote.backoff").is_some());
        assert!(rpcs(&mut h.client).is_empty());
    }

    #[test]
    fn missing_anchor_requests_full_for_that_actor() {
        let mut h = harness();
        let base = snap(1, 10.0, 5.0);
        let delta = PackedSnapshot::pack_delta(
            &base,
            &snap(2, 10.05, 5.2),
            0,
            0,
            128,
            &DeltaBounds::default(),
        )
        .unwrap();
        h.client
            .handle(ClientPacket::new(3, ClientRpc::ObserversSnapshot { env: frame(2, 2, &delta) }));
        assert_eq!(
            rpcs(&mut h.client),
            vec![(
                3,
                ServerRpc::RequestFullSnapshot {
                    prefer_no_fec: false
                }
            )]
        );
    }

    #[test]
    fn own_observer_frames_are_ignored() {
        let mut h = harness();
        let full = PackedSnapshot::pack_full(&snap(1, 10.0, 5.0), 0, 0, 128);
        h.client
            .handle(ClientPacket::new(1, ClientRpc::ObserversSnapshot { env: frame(1, 1, &full) }));
        assert_eq!(h.client.remote_actors().count(), 0);
    }

    #[test]
    fn owner_keyframe_is_acked_and_reconciled() {
        let mut h = harness();
        let server = snap(4, 10.0, 2.0);
        let payload = PackedSnapshot::pack_full(&server, 0, 0, 128);
        let hash = state_hash(&PackedSnapshot::quantize(&server, 0, 0, 128));
        h.client.handle(ClientPacket::new(
            1,
            ClientRpc::TargetSnapshot {
                env: frame(1, 4, &payload),
                state_hash: hash,
            },
        ));
        assert_eq!(
            rpcs(&mut h.client),
            vec![(
                1,
                ServerRpc::AckFullSnapshot {
                    ack_seq: 4,
                    client_state_hash: hash
                }
            )]
        );
        assert_eq!(h.client.owner().reconcile_target(), Some(Vec3::new(2.0, 0.0, 0.0)));
        assert_eq!(h.telemetry.event_count("reconcile.requested"), 1);
    }

    #[test]
    fn shutdown_stops_everything() {
        let mut h = harness();
        h.client.fixed_tick(&MoveIntent::walk(Vec3::X), DT);
        h.client.shutdown();
        assert!(h.client.drain_outgoing().next().is_none());
        h.client.fixed_tick(&MoveIntent::walk(Vec3::X), DT);
        assert!(h.client.drain_outgoing().next().is_none());
        assert!(h.client.is_shutting_down());
    }
}
