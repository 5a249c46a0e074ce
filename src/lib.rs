//! # Soundsync Mesh
//!
//! Peer-to-peer audio mesh: devices discover a coordinator, open WebRTC data
//! channels to each other and stream sequence-tagged audio frames over them.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                          COORDINATOR PEER                              │
//! │  ┌──────────────────────┐        ┌──────────────────────────────────┐  │
//! │  │ HTTP bootstrap       │        │ LAN discovery (UDP broadcast)    │  │
//! │  │ POST /connect_webrtc │        │ {serviceName: "soundsync", port} │  │
//! │  └──────────┬───────────┘        └──────────────────────────────────┘  │
//! │             ▼                                                          │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │ Signaling Hub  (signaling::hub)                                  │  │
//! │  │   Peer Registry: uuid -> Peer, coordinator ref                   │  │
//! │  │   relay peerConnectionInfo, broadcast peerInfo                   │  │
//! │  └───────┬──────────────────┬──────────────────┬────────────────────┘  │
//! └──────────┼──────────────────┼──────────────────┼───────────────────────┘
//!            │ data channel     │                  │
//!            ▼                  ▼                  ▼
//!      ┌──────────┐       ┌──────────┐       ┌──────────┐
//!      │  Peer A  │◄─────►│  Peer B  │◄─────►│  Peer C  │   (relayed offers)
//!      └────┬─────┘       └──────────┘       └──────────┘
//!           │
//!           ▼  audio over the data channel
//!  ┌──────────────────────────────────────────────────────────────────────┐
//!  │ Encode: Resample -> Chunk (20ms) -> Opus -> [seq|len|payload]        │
//!  │ Decode: [seq|len|payload] -> Opus (PLC on gaps) -> Resample -> sink  │
//!  └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod identity;
pub mod network;
pub mod peer;
pub mod protocol;
pub mod signaling;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Fixed sample rate the codec pipeline works at
    pub const WORKING_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 128_000;

    /// Duration of one audio chunk in milliseconds
    pub const DEFAULT_CHUNK_DURATION_MS: u32 = 20;

    /// Default HTTP port of the bootstrap signaling server
    pub const DEFAULT_HTTP_PORT: u16 = 6512;

    /// UDP port the coordinator answers discovery queries on
    pub const DEFAULT_DISCOVERY_PORT: u16 = 6513;

    /// Service name advertised on the local network
    pub const SERVICE_NAME: &str = "soundsync";

    /// Bootstrap signaling route
    pub const CONNECT_ROUTE: &str = "/connect_webrtc_peer";

    /// Uuid a coordinator peer carries until the bootstrap response names it
    pub const PLACEHOLDER_COORDINATOR_UUID: &str = "placeholderForCoordinatorUuid";

    /// Label of the data channel peers open
    pub const DATA_CHANNEL_LABEL: &str = "soundsync";

    /// Largest payload a single wire frame may carry
    pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

    /// Capacity of per-peer inbound audio queues (in wire messages)
    pub const AUDIO_QUEUE_CAPACITY: usize = 256;

    /// Capacity of pipeline input queues (in sample blocks)
    pub const PIPELINE_QUEUE_CAPACITY: usize = 8;

    /// Most frames concealed for a single sequence gap
    pub const MAX_CONCEALED_FRAMES: u32 = 5;

    /// Largest forward sequence jump accepted as loss; anything further
    /// ahead is treated as a corrupt sequence number
    pub const MAX_SEQUENCE_JUMP: u32 = 50;

    /// Consecutive out-of-window frames after which the receiver follows
    /// the sender's new numbering
    pub const RESYNC_AFTER_FRAMES: u32 = 8;

    pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_ICE_GATHERING_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
}
