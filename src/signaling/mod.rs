//! Signaling: peer registry, mesh protocol and the HTTP bootstrap route

pub mod http;
pub mod hub;
pub mod registry;

pub use hub::{BroadcastReport, HubEvent, LogOnly, ReconnectHandler, SignalingHub};
pub use registry::PeerRegistry;
