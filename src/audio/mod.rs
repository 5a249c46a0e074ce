//! Audio streaming subsystem

pub mod chunk;
pub mod pipeline;
pub mod resample;
pub mod wire;

pub use chunk::{Chunker, PcmFrame, Reassembler};
pub use pipeline::{DecodePipeline, EncodePipeline, RecordSink};
pub use resample::StreamResampler;
pub use wire::{AudioFrame, WireDecoder};
