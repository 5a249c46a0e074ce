//! Application configuration
//!
//! Loaded from `config.toml` in the platform config directory; every field has
//! a default so a missing or partial file is fine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub peer: PeerConfig,
    pub signaling: SignalingConfig,
    pub audio: AudioConfig,
}

/// Local peer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Display name announced to the mesh
    pub name: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        let name = std::env::var("HOSTNAME")
            .ok()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "soundsync-peer".to_string());
        Self { name }
    }
}

/// Signaling and connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Address the bootstrap HTTP server binds to
    pub bind_address: String,
    pub http_port: u16,
    pub discovery_port: u16,
    /// Coordinator to join; discovered on the LAN when unset
    pub coordinator_address: Option<String>,
    pub discovery_timeout_ms: u64,
    pub ice_gathering_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// STUN/TURN urls handed to the WebRTC stack
    pub ice_servers: Vec<String>,
    /// Open links to peers announced by the coordinator
    pub auto_connect_peers: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: DEFAULT_HTTP_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            coordinator_address: None,
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT.as_millis() as u64,
            ice_gathering_timeout_ms: DEFAULT_ICE_GATHERING_TIMEOUT.as_millis() as u64,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            auto_connect_peers: true,
        }
    }
}

impl SignalingConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Codec carried inside audio frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Opus,
    /// Uncompressed 16-bit little-endian PCM
    Pcm,
}

/// Opus application mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpusApplication {
    Voip,
    Audio,
    LowDelay,
}

/// Opus encoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpusConfig {
    pub application: OpusApplication,
    pub bitrate: u32,
    pub vbr: bool,
    /// Constrained VBR, only meaningful when `vbr` is set
    pub cvbr: bool,
    pub fec: bool,
    pub packet_loss_perc: u8,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self::music()
    }
}

impl OpusConfig {
    pub fn music() -> Self {
        Self {
            application: OpusApplication::Audio,
            bitrate: DEFAULT_BITRATE,
            vbr: true,
            cvbr: true,
            fec: false,
            packet_loss_perc: 0,
        }
    }

    pub fn voice() -> Self {
        Self {
            application: OpusApplication::Voip,
            bitrate: 32_000,
            vbr: true,
            cvbr: false,
            fec: true,
            packet_loss_perc: 10,
        }
    }
}

/// Audio pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub working_sample_rate: u32,
    pub channels: u16,
    pub chunk_duration_ms: u32,
    pub codec: CodecKind,
    pub opus: OpusConfig,
    pub max_concealed_frames: u32,
    pub max_sequence_jump: u32,
    pub resync_after_frames: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            working_sample_rate: WORKING_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            chunk_duration_ms: DEFAULT_CHUNK_DURATION_MS,
            codec: CodecKind::Opus,
            opus: OpusConfig::default(),
            max_concealed_frames: MAX_CONCEALED_FRAMES,
            max_sequence_jump: MAX_SEQUENCE_JUMP,
            resync_after_frames: RESYNC_AFTER_FRAMES,
        }
    }
}

impl AudioConfig {
    /// Samples per channel in one chunk
    pub fn frame_size(&self) -> usize {
        (self.working_sample_rate as u64 * self.chunk_duration_ms as u64 / 1000) as usize
    }

    /// Interleaved samples in one chunk
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size() * self.channels as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.channels > 2 {
            return Err(Error::Config(format!(
                "channels must be 1 or 2, got {}",
                self.channels
            )));
        }
        if self.working_sample_rate == 0 || self.frame_size() == 0 {
            return Err(Error::Config(format!(
                "chunk of {}ms at {}Hz holds no samples",
                self.chunk_duration_ms, self.working_sample_rate
            )));
        }
        if self.max_sequence_jump == 0 || self.resync_after_frames == 0 {
            return Err(Error::Config(
                "max_sequence_jump and resync_after_frames must be non-zero".into(),
            ));
        }
        if self.codec == CodecKind::Opus {
            if ![8000, 12000, 16000, 24000, 48000].contains(&self.working_sample_rate) {
                return Err(Error::Config(format!(
                    "opus cannot run at {}Hz",
                    self.working_sample_rate
                )));
            }
            if ![10, 20, 40, 60].contains(&self.chunk_duration_ms) {
                return Err(Error::Config(format!(
                    "opus cannot encode {}ms frames",
                    self.chunk_duration_ms
                )));
            }
        }
        Ok(())
    }
}

impl AppConfig {
    /// Path of the config file, if the platform has a config directory
    pub fn config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "soundsync")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&raw)?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write to the default location
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()
            .ok_or_else(|| Error::Config("no config directory on this platform".into()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.peer.name.trim().is_empty() {
            return Err(Error::Config("peer name must not be empty".into()));
        }
        self.audio.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_frame_size() {
        let audio = AudioConfig::default();
        assert_eq!(audio.frame_size(), 960);
        assert_eq!(audio.samples_per_frame(), 1920);
        assert!(audio.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [peer]
            name = "garage"

            [signaling]
            http_port = 7000
            "#,
        )
        .unwrap();
        assert_eq!(config.peer.name, "garage");
        assert_eq!(config.signaling.http_port, 7000);
        assert_eq!(config.audio.codec, CodecKind::Opus);
        assert_eq!(config.signaling.discovery_timeout(), DEFAULT_DISCOVERY_TIMEOUT);
    }

    #[test]
    fn test_rejects_opus_incompatible_chunk() {
        let raw = r#"
            [audio]
            chunk_duration_ms = 15
        "#;
        assert!(matches!(AppConfig::from_toml(raw), Err(Error::Config(_))));

        let raw = r#"
            [audio]
            chunk_duration_ms = 15
            codec = "pcm"
        "#;
        assert!(AppConfig::from_toml(raw).is_ok());
    }

    #[test]
    fn test_rejects_surround() {
        let mut audio = AudioConfig::default();
        audio.channels = 6;
        assert!(audio.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_sequence_window() {
        let raw = r#"
            [audio]
            max_sequence_jump = 0
        "#;
        assert!(matches!(AppConfig::from_toml(raw), Err(Error::Config(_))));
    }
}
