//! Peer transport abstraction
//!
//! The signaling hub drives connections through these traits, so the same
//! state machine runs over real WebRTC and over the in-memory mock.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::protocol::{IceCandidate, SessionDescription};

/// One message on the data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// Controller JSON, sent as a text message
    Control(String),
    /// Audio wire records, sent as a binary message
    Audio(Bytes),
}

/// Events raised by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Data channel is open and usable
    Connected,
    /// Transport went away; no further events follow
    Disconnected(String),
    Message(ChannelMessage),
}

/// Which side of the offer/answer exchange a connection plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Offerer,
    Answerer,
}

/// A single peer-to-peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Resolves once every local candidate is folded into the local
    /// description. Callers bound the wait.
    async fn wait_ice_gathering_complete(&self);

    /// Local description including gathered candidates
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn send(&self, message: ChannelMessage) -> Result<(), TransportError>;

    /// Event stream; only the first caller gets it
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    async fn close(&self);
}

/// Creates connections for the signaling hub
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create_connection(
        &self,
        role: ConnectionRole,
    ) -> Result<Arc<dyn PeerConnection>, TransportError>;
}
