//! Uncompressed 16-bit PCM payloads
//!
//! Used when links have bandwidth to spare and as the raw-payload form of
//! `AudioFrame`. Samples are clamped to [-1, 1] and stored little endian.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{FrameDecoder, FrameEncoder};
use crate::error::CodecError;

pub struct PcmEncoder {
    samples_per_frame: usize,
}

impl PcmEncoder {
    pub fn new(channels: u16, frame_size: usize) -> Self {
        Self {
            samples_per_frame: frame_size * channels as usize,
        }
    }
}

#[async_trait]
impl FrameEncoder for PcmEncoder {
    async fn encode(&mut self, samples: &[f32]) -> Result<Bytes, CodecError> {
        if samples.len() != self.samples_per_frame {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }
        let mut buf = BytesMut::with_capacity(samples.len() * 2);
        for &sample in samples {
            buf.put_i16_le((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
        }
        Ok(buf.freeze())
    }
}

pub struct PcmDecoder {
    samples_per_frame: usize,
}

impl PcmDecoder {
    pub fn new(channels: u16, frame_size: usize) -> Self {
        Self {
            samples_per_frame: frame_size * channels as usize,
        }
    }
}

#[async_trait]
impl FrameDecoder for PcmDecoder {
    async fn decode(&mut self, payload: &[u8]) -> Result<Vec<f32>, CodecError> {
        if payload.len() != self.samples_per_frame * 2 {
            return Err(CodecError::DecodingFailed(format!(
                "expected {} bytes of PCM, got {}",
                self.samples_per_frame * 2,
                payload.len()
            )));
        }
        Ok(payload
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
            .collect())
    }

    async fn conceal(&mut self) -> Result<Vec<f32>, CodecError> {
        Ok(vec![0.0; self.samples_per_frame])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pcm_roundtrip_precision() {
        let mut encoder = PcmEncoder::new(1, 4);
        let mut decoder = PcmDecoder::new(1, 4);
        let input = [0.0, 0.5, -0.5, 1.5];

        let payload = encoder.encode(&input).await.unwrap();
        assert_eq!(payload.len(), 8);
        let output = decoder.decode(&payload).await.unwrap();
        assert!((output[1] - 0.5).abs() < 1e-4);
        assert!((output[2] + 0.5).abs() < 1e-4);
        // Clamped
        assert!((output[3] - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_truncated_payload_fails() {
        let mut decoder = PcmDecoder::new(2, 4);
        assert!(decoder.decode(&[0u8; 15]).await.is_err());
        assert_eq!(decoder.conceal().await.unwrap(), vec![0.0; 8]);
    }
}
