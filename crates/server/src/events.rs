use glam::Vec3;
use stride::net::ConnectionId;

#[derive(Debug, Clone)]
pub enum ServerEvent {
    ActorJoined {
        conn: ConnectionId,
        pos: Vec3,
    },
    ActorLeft {
        conn: ConnectionId,
        reason: LeaveReason,
    },
    ConnectionDenied {
        conn: ConnectionId,
        reason: String,
    },
    /// A keyframe about `actor` was never acknowledged by `conn`.
    RetryAbandoned {
        actor: ConnectionId,
        conn: ConnectionId,
        seq: u32,
    },
    FecSuppressed {
        actor: ConnectionId,
        conn: ConnectionId,
        until: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Disconnected,
    Shutdown,
}

impl LeaveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaveReason::Disconnected => "disconnected",
            LeaveReason::Shutdown => "server shutdown",
        }
    }
}
