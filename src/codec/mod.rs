//! Audio codecs
//!
//! Every codec sits behind `FrameEncoder`/`FrameDecoder`: setup is async and
//! awaited once, and each call takes `&mut self`, so one instance can only
//! ever have a single operation in flight.

pub mod decoder;
pub mod encoder;
pub mod pcm;
pub mod stage;

use async_trait::async_trait;
use bytes::Bytes;

pub use decoder::OpusDecoder;
pub use encoder::OpusEncoder;
pub use pcm::{PcmDecoder, PcmEncoder};
pub use stage::{
    CloseHandle, DecodeStage, DecodedFrame, EncodeStage, FrameEvent, FrameOrigin,
};

use crate::config::{AudioConfig, CodecKind};
use crate::error::CodecError;

/// Stateful frame encoder
#[async_trait]
pub trait FrameEncoder: Send {
    /// One-time initialization, awaited before the first frame
    async fn setup(&mut self) -> Result<(), CodecError> {
        Ok(())
    }

    /// Encode one frame of interleaved samples
    async fn encode(&mut self, samples: &[f32]) -> Result<Bytes, CodecError>;
}

/// Stateful frame decoder
#[async_trait]
pub trait FrameDecoder: Send {
    async fn setup(&mut self) -> Result<(), CodecError> {
        Ok(())
    }

    /// Decode one payload into interleaved samples
    async fn decode(&mut self, payload: &[u8]) -> Result<Vec<f32>, CodecError>;

    /// Produce one frame standing in for a lost one
    async fn conceal(&mut self) -> Result<Vec<f32>, CodecError>;
}

/// Build the encoder selected by the audio config
pub fn new_encoder(config: &AudioConfig) -> Box<dyn FrameEncoder> {
    match config.codec {
        CodecKind::Opus => Box::new(OpusEncoder::new(
            config.working_sample_rate,
            config.channels,
            config.frame_size(),
            config.opus.clone(),
        )),
        CodecKind::Pcm => Box::new(PcmEncoder::new(config.channels, config.frame_size())),
    }
}

/// Build the decoder selected by the audio config
pub fn new_decoder(config: &AudioConfig) -> Box<dyn FrameDecoder> {
    match config.codec {
        CodecKind::Opus => Box::new(OpusDecoder::new(
            config.working_sample_rate,
            config.channels,
            config.frame_size(),
        )),
        CodecKind::Pcm => Box::new(PcmDecoder::new(config.channels, config.frame_size())),
    }
}
