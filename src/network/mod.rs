//! Network subsystem: peer transports, HTTP bootstrap and LAN discovery

pub mod bootstrap;
pub mod discovery;
/// In-memory transport and rendezvous for tests
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod rtc;
pub mod transport;

pub use bootstrap::{BootstrapClient, HttpBootstrapClient};
pub use discovery::{Discovery, LanDiscovery, ServiceAddress, StaticDiscovery};
pub use rtc::WebRtcFactory;
pub use transport::{
    ChannelMessage, ConnectionFactory, ConnectionRole, PeerConnection, TransportEvent,
};
