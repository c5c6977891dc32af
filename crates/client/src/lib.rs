//! Client side of the movement sync: prediction and correction for the owned actor,
//! interpolation for everyone else, and the receive path that feeds both.

pub mod client;
pub mod config;
pub mod owner;
pub mod receiver;
pub mod remote;
pub mod warn_limit;

pub use client::{ClientServices, MovementClient, RemoteActor};
pub use config::ClientConfig;
pub use owner::{MAX_PENDING_INPUTS, MoveIntent, OwnerRuntime};
pub use receiver::{COMPLETED_MESSAGE_MEMORY, DecodedSnapshot, SnapshotReceiver};
pub use remote::{RemoteRenderer, RemoteView, RenderSample};
pub use warn_limit::WarnLimiter;
