use std::collections::BTreeMap;
use std::sync::Arc;

use glam::Vec3;
use log::{debug, trace, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;

use stride::movement::planar_distance;
use stride::net::{ClientPacket, ConnectionId, Outgoing, Recipient, ServerPacket};
use stride::{ManualClock, MemoryTelemetry, MovementConfig, NetClock, SpeedEnvelopeValidator};
use stride_client::{ClientConfig, ClientServices, MoveIntent, MovementClient};
use stride_server::{MovementServer, ServerConfig, ServerServices};

use crate::bots::BotDriver;
use crate::link::{LinkConfig, LinkStats, LossyLink};

/// Returns true to drop a server-to-client packet before it reaches the link.
pub type FaultHook = Box<dyn FnMut(ConnectionId, &ClientPacket) -> bool>;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub clients: usize,
    pub seconds: f64,
    pub tick_rate: u32,
    pub seed: u64,
    pub uplink: LinkConfig,
    pub downlink: LinkConfig,
    pub canary_interval: Option<f64>,
    pub start_time: f64,
    pub movement: MovementConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            clients: 4,
            seconds: 10.0,
            tick_rate: 60,
            seed: 1,
            uplink: LinkConfig::default(),
            downlink: LinkConfig::default(),
            canary_interval: None,
            start_time: 100.0,
            movement: MovementConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.uplink = link;
        self.downlink = link;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ErrorSummary {
    pub samples: u64,
    pub mean: f64,
    pub max: f64,
}

impl ErrorSummary {
    fn record(&mut self, value: f32) {
        let value = f64::from(value);
        self.samples += 1;
        self.mean += (value - self.mean) / self.samples as f64;
        self.max = self.max.max(value);
    }
}

#[derive(Debug, Clone)]
pub struct SimReport {
    pub steps: u64,
    pub simulated_seconds: f64,
    pub clients: usize,
    /// Predicted owner position against the server's authoritative one.
    pub owner_error: ErrorSummary,
    /// Rendered remote position against the server's authoritative one.
    pub remote_error: ErrorSummary,
    pub uplink: LinkStats,
    pub downlink: LinkStats,
    pub faults_injected: u64,
    pub counters: Vec<(String, u64)>,
}

struct SimClient {
    client: MovementClient,
    bot: BotDriver,
}

/// A server and its clients wired through lossy links on one manual clock.
pub struct Simulation {
    config: SimConfig,
    clock: ManualClock,
    telemetry: Arc<MemoryTelemetry>,
    server: MovementServer,
    clients: BTreeMap<ConnectionId, SimClient>,
    uplink: LossyLink<Vec<u8>>,
    downlink: LossyLink<Vec<u8>>,
    rng: StdRng,
    fault: Option<FaultHook>,
    faults_injected: u64,
    owner_error: ErrorSummary,
    remote_error: ErrorSummary,
    steps: u64,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Self {
        let movement = config.movement.clone().sanitized();
        let clock = ManualClock::new(config.start_time);
        let telemetry = Arc::new(MemoryTelemetry::new());

        let services = ServerServices::new(
            Arc::new(clock.clone()),
            telemetry.clone(),
            Arc::new(SpeedEnvelopeValidator::new(&movement.anti_cheat)),
        );
        let server_config = ServerConfig {
            tick_rate: config.tick_rate,
            canary_interval: config.canary_interval,
            ..ServerConfig::with_movement(movement.clone())
        };
        let mut server = MovementServer::new(server_config, services);

        let mut clients = BTreeMap::new();
        for index in 0..config.clients {
            let conn = index as ConnectionId + 1;
            let spawn = Vec3::new(index as f32 * 2.0, 0.0, 0.0);
            if !server.connect(conn, spawn) {
                continue;
            }
            let client_config = ClientConfig {
                fixed_tick_rate: config.tick_rate,
                ..ClientConfig::with_movement(movement.clone())
            };
            let services = ClientServices::new(Arc::new(clock.clone()), telemetry.clone());
            clients.insert(
                conn,
                SimClient {
                    client: MovementClient::new(conn, spawn, client_config, services),
                    bot: BotDriver::new(),
                },
            );
        }

        Self {
            uplink: LossyLink::new(config.uplink, config.seed ^ 0x5eed_0001),
            downlink: LossyLink::new(config.downlink, config.seed ^ 0x5eed_0002),
            rng: StdRng::seed_from_u64(config.seed),
            fault: None,
            faults_injected: 0,
            owner_error: ErrorSummary::default(),
            remote_error: ErrorSummary::default(),
            steps: 0,
            config,
            clock,
            telemetry,
            server,
            clients,
        }
    }

    pub fn with_fault(mut self, fault: FaultHook) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn telemetry(&self) -> &MemoryTelemetry {
        &self.telemetry
    }

    pub fn server(&self) -> &MovementServer {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut MovementServer {
        &mut self.server
    }

    pub fn client(&self, conn: ConnectionId) -> Option<&MovementClient> {
        self.clients.get(&conn).map(|c| &c.client)
    }

    pub fn client_mut(&mut self, conn: ConnectionId) -> Option<&mut MovementClient> {
        self.clients.get_mut(&conn).map(|c| &mut c.client)
    }

    pub fn connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.clients.keys().copied()
    }

    fn dt(&self) -> f64 {
        1.0 / f64::from(self.config.tick_rate.max(1))
    }

    /// One fixed step with every client driven by its bot.
    pub fn step(&mut self) {
        let dt = self.dt() as f32;
        let mut intents = BTreeMap::new();
        for (conn, sim_client) in self.clients.iter_mut() {
            intents.insert(*conn, sim_client.bot.next_intent(&mut self.rng, dt));
        }
        self.step_with(|conn| intents.remove(&conn).unwrap_or_default());
    }

    /// One fixed step: deliver what is due, tick clients, tick the server, ship output.
    pub fn step_with(&mut self, mut intent_for: impl FnMut(ConnectionId) -> MoveIntent) {
        let dt = self.dt();
        self.clock.advance(dt);
        let now = self.clock.now();
        self.steps += 1;

        for (to, bytes) in self.downlink.take_due(now) {
            match ClientPacket::deserialize(&bytes) {
                Ok(packet) => {
                    if let Some(sim_client) = self.clients.get_mut(&to) {
                        sim_client.client.handle(packet);
                    }
                }
                Err(err) => warn!("downlink packet for {to} unreadable: {err}"),
            }
        }
        for (from, bytes) in self.uplink.take_due(now) {
            match ServerPacket::deserialize(&bytes) {
                Ok(packet) => self.server.handle(from, packet),
                Err(err) => warn!("uplink packet from {from} unreadable: {err}"),
            }
        }

        for (conn, sim_client) in self.clients.iter_mut() {
            let intent = intent_for(*conn);
            sim_client.client.fixed_tick(&intent, dt as f32);
            sim_client.client.render(dt as f32);
            for out in sim_client.client.drain_outgoing() {
                match out.packet.serialize() {
                    Ok(bytes) => {
                        let len = bytes.len();
                        self.uplink.send(now, *conn, out.channel, bytes, len);
                    }
                    Err(err) => warn!("client {conn} packet not sent: {err}"),
                }
            }
        }

        self.server.tick();
        let outgoing: Vec<_> = self.server.drain_outgoing().collect();
        for out in outgoing {
            self.route(now, out);
        }
        for event in self.server.drain_events() {
            debug!("server event: {event:?}");
        }

        self.sample_errors();
    }

    /// Hands a packet straight to the server, bypassing the uplink.
    pub fn inject(&mut self, from: ConnectionId, packet: ServerPacket) {
        self.server.handle(from, packet);
        let outgoing: Vec<_> = self.server.drain_outgoing().collect();
        let now = self.clock.now();
        for out in outgoing {
            self.route(now, out);
        }
    }

    fn route(&mut self, now: f64, out: Outgoing<ClientPacket>) {
        let targets: Vec<ConnectionId> = match out.to {
            Recipient::Connection(conn) => vec![conn],
            Recipient::Observers => self
                .clients
                .keys()
                .copied()
                .filter(|conn| *conn != out.packet.actor)
                .collect(),
            Recipient::Server => {
                warn!("server addressed a packet to itself");
                return;
            }
        };

        let bytes = match out.packet.serialize() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("server packet not sent: {err}");
                return;
            }
        };
        for to in targets {
            if let Some(fault) = self.fault.as_mut() {
                if fault(to, &out.packet) {
                    trace!("fault hook dropped packet for {to}");
                    self.faults_injected += 1;
                    continue;
                }
            }
            self.downlink
                .send(now, to, out.channel, bytes.clone(), bytes.len());
        }
    }

    fn sample_errors(&mut self) {
        for (conn, sim_client) in &self.clients {
            let Some(driver) = self.server.driver(*conn) else {
                continue;
            };
            self.owner_error
                .record(planar_distance(sim_client.client.position(), driver.position()));

            for actor in sim_client.client.remote_actors() {
                let view = sim_client.client.remote_view(actor);
                let authority = self.server.driver(actor);
                if let (Some(view), Some(authority)) = (view, authority) {
                    self.remote_error
                        .record(planar_distance(view.pos, authority.position()));
                }
            }
        }
    }

    /// Steps until `config.seconds` of simulated time have passed.
    pub fn run(&mut self) -> SimReport {
        let steps = (self.config.seconds * f64::from(self.config.tick_rate)).round() as u64;
        for _ in 0..steps {
            self.step();
        }
        self.report()
    }

    pub fn report(&self) -> SimReport {
        SimReport {
            steps: self.steps,
            simulated_seconds: self.steps as f64 * self.dt(),
            clients: self.clients.len(),
            owner_error: self.owner_error,
            remote_error: self.remote_error,
            uplink: self.uplink.stats(),
            downlink: self.downlink.stats(),
            faults_injected: self.faults_injected,
            counters: self.telemetry.counters(),
        }
    }

    pub fn shutdown(&mut self) {
        for sim_client in self.clients.values_mut() {
            sim_client.client.shutdown();
        }
        self.server.shutdown();
        for event in self.server.drain_events() {
            debug!("server event: {event:?}");
        }
        self.uplink.clear();
        self.downlink.clear();
    }
}
