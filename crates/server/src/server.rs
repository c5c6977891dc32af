use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use glam::Vec3;
use log::{debug, info, warn};

use stride::net::{
    ClientPacket, ClientRpc, ConnectionId, Outgoing, Recipient, ServerPacket, ServerRpc,
};
use stride::{GridInterest, MovementConfig};

use crate::canary::CanaryEmitter;
use crate::config::ServerConfig;
use crate::driver::{ServerDriver, ServerServices};
use crate::events::{LeaveReason, ServerEvent};

/// Every connected actor's driver plus the spatial index they share. The host feeds it
/// packets and ticks, then ships whatever `drain_outgoing` yields.
pub struct MovementServer {
    config: ServerConfig,
    movement: Arc<MovementConfig>,
    services: ServerServices,
    interest: GridInterest,
    drivers: BTreeMap<ConnectionId, ServerDriver>,
    canary: Option<CanaryEmitter>,
    outgoing: VecDeque<Outgoing<ClientPacket>>,
    pending_events: VecDeque<ServerEvent>,
    shutting_down: bool,
}

impl MovementServer {
    pub fn new(config: ServerConfig, services: ServerServices) -> Self {
        let movement = Arc::new(config.movement.clone().sanitized());
        let canary = config.canary_interval.map(|interval| {
            CanaryEmitter::new(
                config.canary_len,
                movement.fec.shard_size,
                movement.fec.parity_shards.min(services.fec.max_parity()),
                interval,
            )
        });
        info!(
            "movement server ready: {} Hz, {} max connections, fec {} parity {}",
            config.tick_rate,
            config.max_connections,
            services.fec.name(),
            movement.fec.parity_shards
        );
        Self {
            interest: GridInterest::new(movement.broadcast.cell_size),
            drivers: BTreeMap::new(),
            canary,
            outgoing: VecDeque::new(),
            pending_events: VecDeque::new(),
            shutting_down: false,
            movement,
            services,
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn movement_config(&self) -> &MovementConfig {
        &self.movement
    }

    pub fn interest(&self) -> &GridInterest {
        &self.interest
    }

    pub fn driver(&self, conn: ConnectionId) -> Option<&ServerDriver> {
        self.drivers.get(&conn)
    }

    pub fn connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.drivers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn drain_outgoing(&mut self) -> impl Iterator<Item = Outgoing<ClientPacket>> + '_ {
        self.outgoing.drain(..)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    /// Spawns an actor for `conn`. Returns false when the connection was refused.
    pub fn connect(&mut self, conn: ConnectionId, spawn: Vec3) -> bool {
        let refusal = if self.shutting_down {
            Some("server shutting down")
        } else if self.drivers.contains_key(&conn) {
            Some("already connected")
        } else if self.drivers.len() >= self.config.max_connections {
            Some("server full")
        } else {
            None
        };
        if let Some(reason) = refusal {
            warn!("refused connection {conn}: {reason}");
            self.pending_events.push_back(ServerEvent::ConnectionDenied {
                conn,
                reason: reason.to_owned(),
            });
            return false;
        }

        self.interest.update_actor(conn, spawn);
        let driver = ServerDriver::new(
            conn,
            spawn,
            Arc::clone(&self.movement),
            self.services.clone(),
        );
        self.drivers.insert(conn, driver);
        info!("actor {conn} joined at {spawn}");
        self.pending_events
            .push_back(ServerEvent::ActorJoined { conn, pos: spawn });
        true
    }

    pub fn disconnect(&mut self, conn: ConnectionId) {
        if self.drivers.remove(&conn).is_none() {
            return;
        }
        self.interest.remove_actor(conn);
        for driver in self.drivers.values_mut() {
            driver.forget_connection(conn);
        }
        info!("actor {conn} left");
        self.pending_events.push_back(ServerEvent::ActorLeft {
            conn,
            reason: LeaveReason::Disconnected,
        });
    }

    /// Routes one client packet. `from` is the transport's connection, `packet.actor`
    /// the actor it concerns.
    pub fn handle(&mut self, from: ConnectionId, packet: ServerPacket) {
        if self.shutting_down {
            return;
        }
        let now = self.services.clock.now();

        match packet.rpc {
            ServerRpc::PingRequest { client_send } => {
                self.outgoing.push_back(Outgoing::reliable(
                    Recipient::Connection(from),
                    ClientPacket::new(
                        packet.actor,
                        ClientRpc::PingReply {
                            client_send,
                            server_recv: now,
                            server_send: now,
                        },
                    ),
                ));
            }
            ServerRpc::SendInput(input) => {
                if packet.actor != from {
                    warn!("connection {from} sent input for actor {}", packet.actor);
                    return;
                }
                let Some(driver) = self.drivers.get_mut(&from) else {
                    debug!("input from unknown connection {from}");
                    return;
                };
                if let Some(snap) = driver.accept_input(&input) {
                    self.interest.update_actor(from, snap.pos);
                    driver.publish(&snap, &self.interest);
                }
            }
            ServerRpc::AckFullSnapshot {
                ack_seq,
                client_state_hash,
            } => {
                if let Some(driver) = self.drivers.get_mut(&packet.actor) {
                    driver.on_ack(from, ack_seq, client_state_hash);
                }
            }
            ServerRpc::RequestFullSnapshot { prefer_no_fec } => {
                if let Some(driver) = self.drivers.get_mut(&packet.actor) {
                    driver.on_request_full(from, prefer_no_fec, &self.interest);
                }
            }
        }

        self.collect_driver_output();
    }

    /// Retries, late joiners and canaries.
    pub fn tick(&mut self) {
        if self.shutting_down {
            return;
        }
        let now = self.services.clock.now();

        for driver in self.drivers.values_mut() {
            driver.tick();
            driver.publish_to_new_observers(&self.interest);
        }

        if let Some(canary) = self.canary.as_mut() {
            if canary.poll(now) {
                for driver in self.drivers.values_mut() {
                    driver.send_canary(canary);
                }
            }
        }

        self.collect_driver_output();
    }

    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!("movement server shutting down ({} actors)", self.drivers.len());
        for (conn, driver) in self.drivers.iter_mut() {
            driver.shutdown();
            self.pending_events.push_back(ServerEvent::ActorLeft {
                conn: *conn,
                reason: LeaveReason::Shutdown,
            });
        }
        self.outgoing.clear();
    }

    fn collect_driver_output(&mut self) {
        for driver in self.drivers.values_mut() {
            self.outgoing.extend(driver.drain_outgoing());
            self.pending_events.extend(driver.drain_events());
        }
    }
}
