//! Error types for the audio mesh

use std::time::Duration;
use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("No coordinator found within {0:?}")]
    DiscoveryTimeout(Duration),

    #[error("Signaling failure: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Connection failure: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("Resampling failed: {0}")]
    Resample(#[from] rubato::ResampleError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for failures that belong to a single peer connection attempt
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Error::DiscoveryTimeout(_) | Error::Signaling(_) | Error::Connection(_)
        )
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Connection(ConnectionError::Transport(err))
    }
}

/// Offer/answer exchange errors
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Bootstrap request rejected: {0}")]
    Rejected(String),

    #[error("Coordinator unreachable at {address}: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("Malformed signaling payload: {0}")]
    Malformed(String),

    #[error("Local peer is not accepting inbound offers")]
    NotCoordinator,

    #[error("Refusing offer carrying the local peer uuid")]
    SelfConnection,

    #[error("No coordinator link to relay through")]
    NoRelay,
}

/// Connection state machine errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("ICE gathering did not complete within {0:?}")]
    IceGatheringTimeout(Duration),

    #[error("Transport did not connect within {0:?}")]
    ConnectTimeout(Duration),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Peer {0} is not connected")]
    NotConnected(String),
}

/// Errors raised by a `PeerConnection` implementation
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Data channel not open")]
    ChannelNotOpen,

    #[error("Transport closed")]
    Closed,
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Codec setup failed: {0}")]
    SetupFailed(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),

    #[error("Unsupported channel count: {0}")]
    UnsupportedChannels(u16),
}

/// Audio wire framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Frame payload of {0} bytes exceeds the maximum")]
    PayloadTooLarge(usize),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
