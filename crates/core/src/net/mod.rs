mod bytes;
mod envelope;
mod fec;
mod packed;
mod protocol;
mod shard;

pub use envelope::{
    ENVELOPE_HEADER_SIZE, Envelope, EnvelopeError, EnvelopeFlags, hash64, preview_bytes,
};
pub use fec::{FecCodec, FecError, MAX_RS_PARITY, ReedSolomon, XorParity};
pub use packed::{AnchorState, PACKED_DELTA, PACKED_FULL, PackedKind, PackedSnapshot, SnapshotError};
pub use protocol::{
    Channel, ClientPacket, ClientRpc, ConnectionId, InputCommand, Outgoing, PROTOCOL_VERSION,
    PacketError, Recipient, ServerPacket, ServerRpc,
};
pub use shard::{
    LOCAL_CLIENT_CONNECTION, SHARD_BUFFER_TIMEOUT_SECONDS, SHARD_HEADER_SIZE, ShardBufferKey,
    ShardError, ShardInfo, ShardLayout, ShardRegistry, reassemble,
};
