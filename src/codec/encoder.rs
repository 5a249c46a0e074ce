//! Opus encoder wrapper
//!
//! The libopus state is created in `setup`, so a bad configuration surfaces as
//! a setup failure of the pipeline that owns the encoder.

use async_trait::async_trait;
use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::codec::FrameEncoder;
use crate::config::{OpusApplication, OpusConfig};
use crate::error::CodecError;

/// Largest packet libopus produces for one frame is about 1275 bytes
const ENCODE_BUFFER_LEN: usize = 4000;

/// Opus encoder for one stream
pub struct OpusEncoder {
    encoder: Option<Encoder>,
    sample_rate: u32,
    channels: u16,
    frame_size: usize,
    config: OpusConfig,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    frames_encoded: u64,
    bytes_produced: u64,
}

impl OpusEncoder {
    /// `frame_size` is in samples per channel
    pub fn new(sample_rate: u32, channels: u16, frame_size: usize, config: OpusConfig) -> Self {
        Self {
            encoder: None,
            sample_rate,
            channels,
            frame_size,
            config,
            encode_buffer: vec![0u8; ENCODE_BUFFER_LEN],
            frames_encoded: 0,
            bytes_produced: 0,
        }
    }

    fn build(&self) -> Result<Encoder, CodecError> {
        let channels = match self.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => return Err(CodecError::UnsupportedChannels(n)),
        };

        let application = match self.config.application {
            OpusApplication::Voip => Application::Voip,
            OpusApplication::Audio => Application::Audio,
            OpusApplication::LowDelay => Application::LowDelay,
        };

        let mut encoder = Encoder::new(self.sample_rate, channels, application)
            .map_err(|e| CodecError::SetupFailed(e.to_string()))?;
        Self::configure_encoder(&mut encoder, &self.config)?;
        Ok(encoder)
    }

    fn configure_encoder(encoder: &mut Encoder, config: &OpusConfig) -> Result<(), CodecError> {
        encoder
            .set_bitrate(opus::Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| CodecError::SetupFailed(format!("Failed to set bitrate: {}", e)))?;

        encoder
            .set_vbr(config.vbr)
            .map_err(|e| CodecError::SetupFailed(format!("Failed to set VBR: {}", e)))?;

        if config.vbr && config.cvbr {
            encoder
                .set_vbr_constraint(true)
                .map_err(|e| CodecError::SetupFailed(format!("Failed to set CVBR: {}", e)))?;
        }

        encoder
            .set_inband_fec(config.fec)
            .map_err(|e| CodecError::SetupFailed(format!("Failed to set FEC: {}", e)))?;

        if config.fec {
            encoder
                .set_packet_loss_perc(config.packet_loss_perc as i32)
                .map_err(|e| CodecError::SetupFailed(format!("Failed to set packet loss: {}", e)))?;
        }

        Ok(())
    }

    pub fn samples_per_frame(&self) -> usize {
        self.frame_size * self.channels as usize
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

#[async_trait]
impl FrameEncoder for OpusEncoder {
    async fn setup(&mut self) -> Result<(), CodecError> {
        if self.encoder.is_none() {
            self.encoder = Some(self.build()?);
        }
        Ok(())
    }

    async fn encode(&mut self, samples: &[f32]) -> Result<Bytes, CodecError> {
        let expected_len = self.samples_per_frame();
        if samples.len() != expected_len {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }

        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| CodecError::EncodingFailed("encoder used before setup".into()))?;
        let size = encoder
            .encode_float(samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}
