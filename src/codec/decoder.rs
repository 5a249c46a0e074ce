//! Opus decoder wrapper
//!
//! Provides Opus decoding with packet loss concealment.

use async_trait::async_trait;
use opus::{Channels, Decoder};

use crate::codec::FrameDecoder;
use crate::error::CodecError;

/// 120ms at 48kHz stereo, the largest Opus packet duration
const DECODE_BUFFER_LEN: usize = 48000 * 2 * 120 / 1000;

/// Opus decoder for one stream
pub struct OpusDecoder {
    decoder: Option<Decoder>,
    sample_rate: u32,
    channels: u16,
    frame_size: usize,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<f32>,
    frames_decoded: u64,
    /// Frames synthesized by PLC
    frames_concealed: u64,
}

impl OpusDecoder {
    /// `frame_size` is in samples per channel and sizes concealment output
    pub fn new(sample_rate: u32, channels: u16, frame_size: usize) -> Self {
        Self {
            decoder: None,
            sample_rate,
            channels,
            frame_size,
            decode_buffer: vec![0.0f32; DECODE_BUFFER_LEN],
            frames_decoded: 0,
            frames_concealed: 0,
        }
    }

    fn decoder_mut(&mut self) -> Result<&mut Decoder, CodecError> {
        self.decoder
            .as_mut()
            .ok_or_else(|| CodecError::DecodingFailed("decoder used before setup".into()))
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            frames_concealed: self.frames_concealed,
        }
    }
}

#[async_trait]
impl FrameDecoder for OpusDecoder {
    async fn setup(&mut self) -> Result<(), CodecError> {
        if self.decoder.is_some() {
            return Ok(());
        }
        let channels = match self.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => return Err(CodecError::UnsupportedChannels(n)),
        };
        let decoder = Decoder::new(self.sample_rate, channels)
            .map_err(|e| CodecError::SetupFailed(e.to_string()))?;
        self.decoder = Some(decoder);
        Ok(())
    }

    async fn decode(&mut self, payload: &[u8]) -> Result<Vec<f32>, CodecError> {
        if payload.is_empty() {
            return Err(CodecError::DecodingFailed("empty payload".into()));
        }
        let channels = self.channels as usize;
        let mut buffer = std::mem::take(&mut self.decode_buffer);
        let result = self
            .decoder_mut()
            .and_then(|d| {
                d.decode_float(payload, &mut buffer, false)
                    .map_err(|e| CodecError::DecodingFailed(e.to_string()))
            });
        let samples = result.map(|n| buffer[..n * channels].to_vec());
        self.decode_buffer = buffer;

        let samples = samples?;
        self.frames_decoded += 1;
        Ok(samples)
    }

    async fn conceal(&mut self) -> Result<Vec<f32>, CodecError> {
        let channels = self.channels as usize;
        // PLC synthesizes as many samples as the output slice holds
        let mut buffer = vec![0.0f32; self.frame_size * channels];
        let produced = self
            .decoder_mut()?
            .decode_float(&[], &mut buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
        buffer.truncate(produced * channels);

        self.frames_concealed += 1;
        Ok(buffer)
    }
}

/// Decoder statistics
#[derive(Debug, Clone)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_concealed: u64,
}
