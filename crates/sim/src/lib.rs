//! Deterministic in-process harness: one [`MovementServer`](stride_server::MovementServer)
//! and a set of bot-driven clients exchanging serialized packets over lossy links.

pub mod bots;
pub mod link;
pub mod sim;

pub use bots::BotDriver;
pub use link::{LinkConfig, LinkStats, LossyLink};
pub use sim::{ErrorSummary, FaultHook, SimConfig, SimReport, Simulation};
