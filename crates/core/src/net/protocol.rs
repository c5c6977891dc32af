use glam::Vec3;
use rkyv::{Archive, Deserialize, Serialize, rancor};

pub const PROTOCOL_VERSION: u32 = 1;

/// Stable per-connection key. Each connection owns exactly one actor, so the same id
/// names the actor in every packet.
pub type ConnectionId = i32;

/// Owner input as sent at the fixed send rate.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct InputCommand {
    pub dir: [f32; 3],
    pub pred_pos: [f32; 3],
    pub running: bool,
    pub seq: u32,
    pub is_ctm: bool,
    pub path_corners: Option<Vec<[f32; 3]>>,
    pub client_timestamp: f64,
}

impl InputCommand {
    pub fn dir(&self) -> Vec3 {
        Vec3::from_array(self.dir)
    }

    pub fn pred_pos(&self) -> Vec3 {
        Vec3::from_array(self.pred_pos)
    }

    pub fn path_corners(&self) -> Option<Vec<Vec3>> {
        self.path_corners
            .as_ref()
            .map(|corners| corners.iter().copied().map(Vec3::from_array).collect())
    }
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum ServerRpc {
    SendInput(InputCommand),
    PingRequest { client_send: f64 },
    AckFullSnapshot { ack_seq: u32, client_state_hash: u64 },
    RequestFullSnapshot { prefer_no_fec: bool },
}

/// Server to client. `env` fields carry packed envelope frames.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum ClientRpc {
    TargetSnapshot {
        env: Vec<u8>,
        state_hash: u64,
    },
    TargetShard {
        env: Vec<u8>,
    },
    ObserversSnapshot {
        env: Vec<u8>,
    },
    OwnerCorrection {
        server_seq: u32,
        server_pos: [f32; 3],
    },
    PingReply {
        client_send: f64,
        server_recv: f64,
        server_send: f64,
    },
}

impl ClientRpc {
    pub fn wire_len(&self) -> usize {
        match self {
            Self::TargetSnapshot { env, .. } => env.len() + 8,
            Self::TargetShard { env } | Self::ObserversSnapshot { env } => env.len(),
            Self::OwnerCorrection { .. } => 16,
            Self::PingReply { .. } => 24,
        }
    }
}

/// `actor` is the actor the RPC is about.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ServerPacket {
    pub actor: ConnectionId,
    pub rpc: ServerRpc,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ClientPacket {
    pub actor: ConnectionId,
    pub rpc: ClientRpc,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
}

impl ServerPacket {
    pub fn new(actor: ConnectionId, rpc: ServerRpc) -> Self {
        Self { actor, rpc }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        rkyv::from_bytes::<Self, rancor::Error>(data).map_err(PacketError::Deserialize)
    }
}

impl ClientPacket {
    pub fn new(actor: ConnectionId, rpc: ClientRpc) -> Self {
        Self { actor, rpc }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        rkyv::from_bytes::<Self, rancor::Error>(data).map_err(PacketError::Deserialize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Reliable,
    Unreliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recipient {
    Server,
    Connection(ConnectionId),
    /// Every connection observing the actor.
    Observers,
}

/// A packet queued for the host's transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing<P> {
    pub to: Recipient,
    pub channel: Channel,
    pub packet: P,
}

impl<P> Outgoing<P> {
    pub fn reliable(to: Recipient, packet: P) -> Self {
        Self {
            to,
            channel: Channel::Reliable,
            packet,
        }
    }

    pub fn unreliable(to: Recipient, packet: P) -> Self {
        Self {
            to,
            channel: Channel::Unreliable,
            packet,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_packet_serialization() {
        let packet = ServerPacket::new(
            3,
            ServerRpc::SendInput(InputCommand {
                dir: [1.0, 0.0, 0.0],
                pred_pos: [0.5, 0.0, 2.0],
                running: true,
                seq: 42,
                is_ctm: true,
                path_corners: Some(vec![[1.0, 0.0, 1.0], [4.0, 0.0, 1.0]]),
                client_timestamp: 12.5,
            }),
        );

        let bytes = packet.serialize().unwrap();
        let decoded = ServerPacket::deserialize(&bytes).unwrap();
        assert_eq!(decoded, packet);

        let ServerRpc::SendInput(input) = decoded.rpc else {
            panic!("expected input");
        };
        assert_eq!(input.path_corners().unwrap()[1], Vec3::new(4.0, 0.0, 1.0));
    }

    #[test]
    fn test_client_packet_serialization() {
        let packet = ClientPacket::new(
            7,
            ClientRpc::TargetSnapshot {
                env: vec![1, 2, 3],
                state_hash: 0xDEAD_BEEF,
            },
        );
        let decoded = ClientPacket::deserialize(&packet.serialize().unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(ClientPacket::deserialize(&[0xFF; 3]).is_err());
    }
}
