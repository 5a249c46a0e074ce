//! Audio pipeline assembly
//!
//! ```text
//! encode:  samples ─► Resample ─► Chunk ─► EncodeStage ─► wire record
//! decode:  wire bytes ─► WireDecoder ─► DecodeStage ─► Resample ─► frames
//! ```
//!
//! A pipeline can be driven inline (`push`/`finish`) or moved into one tokio
//! task with `spawn`, in which case the stages still run sequentially and the
//! bounded input channel provides back-pressure.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::chunk::{Chunker, PcmFrame};
use crate::audio::resample::StreamResampler;
use crate::audio::wire::WireDecoder;
use crate::codec::stage::DecodeStats;
use crate::codec::{
    self, CloseHandle, DecodeStage, DecodedFrame, EncodeStage, FrameDecoder, FrameEncoder,
    FrameEvent,
};
use crate::config::AudioConfig;
use crate::error::Result;
use crate::peer::Peer;

/// Destination for encoded wire records
#[async_trait]
pub trait RecordSink: Send {
    /// Deliver one record; `Ok(false)` means the sink is gone and the
    /// pipeline should stop
    async fn deliver(&mut self, record: Bytes) -> Result<bool>;
}

#[async_trait]
impl RecordSink for mpsc::Sender<Bytes> {
    async fn deliver(&mut self, record: Bytes) -> Result<bool> {
        Ok(self.send(record).await.is_ok())
    }
}

#[async_trait]
impl RecordSink for Arc<Peer> {
    async fn deliver(&mut self, record: Bytes) -> Result<bool> {
        self.send_audio(record).await?;
        Ok(true)
    }
}

/// Samples in, wire records out
pub struct EncodePipeline {
    resampler: Option<StreamResampler>,
    chunker: Chunker,
    stage: EncodeStage,
    closed: CloseHandle,
}

impl EncodePipeline {
    /// `source_rate` is the rate of the pushed samples; a resampler is
    /// inserted when it differs from the working rate
    pub fn new(
        config: &AudioConfig,
        source_rate: u32,
        encoder: Box<dyn FrameEncoder>,
    ) -> Result<Self> {
        let closed = CloseHandle::new();
        let resampler = if source_rate != config.working_sample_rate {
            Some(StreamResampler::new(
                source_rate,
                config.working_sample_rate,
                config.channels,
            )?)
        } else {
            None
        };
        Ok(Self {
            resampler,
            chunker: Chunker::new(config.frame_size(), config.channels)?,
            stage: EncodeStage::new(encoder, closed.clone()),
            closed,
        })
    }

    /// Pipeline with the codec selected by `config`
    pub fn from_config(config: &AudioConfig, source_rate: u32) -> Result<Self> {
        Self::new(config, source_rate, codec::new_encoder(config))
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.closed.clone()
    }

    /// Feed interleaved samples, returning the records of every frame they
    /// completed
    ///
    /// An encode failure closes the pipeline; the stream never skips a
    /// sequence number.
    pub async fn push(&mut self, samples: &[f32]) -> Result<Vec<Bytes>> {
        if self.closed.is_closed() {
            return Ok(Vec::new());
        }
        let frames = match self.resampler.as_mut() {
            Some(resampler) => {
                let resampled = resampler.process(samples)?;
                self.chunker.push(&resampled)
            }
            None => self.chunker.push(samples),
        };
        self.encode_frames(frames).await
    }

    /// End of input: drain the resampler and pad the final chunk
    pub async fn finish(&mut self) -> Result<Vec<Bytes>> {
        if self.closed.is_closed() {
            return Ok(Vec::new());
        }
        let mut frames = match self.resampler.as_mut() {
            Some(resampler) => {
                let tail = resampler.flush()?;
                self.chunker.push(&tail)
            }
            None => Vec::new(),
        };
        frames.extend(self.chunker.finish());

        let records = self.encode_frames(frames).await?;
        tracing::debug!(
            "Encode pipeline finished after {} frames",
            self.stage.frames_encoded()
        );
        Ok(records)
    }

    async fn encode_frames(&mut self, frames: Vec<PcmFrame>) -> Result<Vec<Bytes>> {
        let mut records = Vec::with_capacity(frames.len());
        for frame in frames {
            match self.stage.process(frame).await {
                Ok(Some(encoded)) => records.push(encoded.encode()),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Encoding failed, closing stream: {}", e);
                    self.closed.close();
                    return Err(e.into());
                }
            }
        }
        Ok(records)
    }

    /// Run on its own task until the input closes, the sink goes away or the
    /// pipeline is closed. Resolves to the number of records delivered.
    pub fn spawn<S>(mut self, mut input: mpsc::Receiver<Vec<f32>>, mut sink: S) -> JoinHandle<Result<u64>>
    where
        S: RecordSink + 'static,
    {
        tokio::spawn(async move {
            let closed = self.closed.clone();
            let mut delivered = 0u64;
            loop {
                let block = tokio::select! {
                    biased;
                    _ = closed.closed() => break,
                    block = input.recv() => match block {
                        Some(block) => block,
                        None => break,
                    },
                };
                for record in self.push(&block).await? {
                    if !sink.deliver(record).await? {
                        tracing::debug!("Record sink closed");
                        return Ok(delivered);
                    }
                    delivered += 1;
                }
            }
            for record in self.finish().await? {
                if !sink.deliver(record).await? {
                    break;
                }
                delivered += 1;
            }
            Ok(delivered)
        })
    }

    /// Stream into a connected peer's data channel
    pub fn stream_to_peer(self, peer: Arc<Peer>, input: mpsc::Receiver<Vec<f32>>) -> JoinHandle<Result<u64>> {
        tracing::info!("Streaming audio to {}", peer.identity());
        self.spawn(input, peer)
    }
}

/// Wire bytes in, decoded frames out
pub struct DecodePipeline {
    wire: WireDecoder,
    stage: DecodeStage,
    resampler: Option<StreamResampler>,
    events: Option<mpsc::UnboundedSender<FrameEvent>>,
    closed: CloseHandle,
}

impl DecodePipeline {
    /// `sink_rate` is the rate frames are delivered at
    pub fn new(
        config: &AudioConfig,
        sink_rate: u32,
        decoder: Box<dyn FrameDecoder>,
    ) -> Result<Self> {
        let closed = CloseHandle::new();
        let resampler = if sink_rate != config.working_sample_rate {
            Some(StreamResampler::new(
                config.working_sample_rate,
                sink_rate,
                config.channels,
            )?)
        } else {
            None
        };
        let stage = DecodeStage::new(
            decoder,
            closed.clone(),
            config.samples_per_frame(),
            config.max_concealed_frames,
        )
        .with_sequence_window(config.max_sequence_jump, config.resync_after_frames);
        Ok(Self {
            wire: WireDecoder::new(),
            stage,
            resampler,
            events: None,
            closed,
        })
    }

    pub fn from_config(config: &AudioConfig, sink_rate: u32) -> Result<Self> {
        Self::new(config, sink_rate, codec::new_decoder(config))
    }

    /// Report loss, lateness and decode failures on `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<FrameEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.closed.clone()
    }

    /// Feed received bytes, returning every frame they completed
    ///
    /// Only codec setup failure is an error; per-frame problems become events.
    pub async fn push(&mut self, data: &[u8]) -> Result<Vec<DecodedFrame>> {
        if self.closed.is_closed() {
            return Ok(Vec::new());
        }
        let records = match self.wire.push(data) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("Audio stream lost framing: {}", e);
                self.report(FrameEvent::StreamCorrupted {
                    reason: e.to_string(),
                });
                return Ok(Vec::new());
            }
        };

        let mut decoded = Vec::with_capacity(records.len());
        for record in records {
            let output = self.stage.process(record).await?;
            for event in output.events {
                self.report(event);
            }
            for mut frame in output.frames {
                if let Some(resampler) = self.resampler.as_mut() {
                    frame.samples = resampler.process(&frame.samples)?;
                }
                decoded.push(frame);
            }
        }
        Ok(decoded)
    }

    /// Remaining resampler output at end of stream
    pub fn finish(&mut self) -> Result<Vec<f32>> {
        match self.resampler.as_mut() {
            Some(resampler) => resampler.flush(),
            None => Ok(Vec::new()),
        }
    }

    fn report(&self, event: FrameEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    pub fn stats(&self) -> DecodeStats {
        self.stage.stats()
    }

    pub fn spawn(
        mut self,
        mut input: mpsc::Receiver<Bytes>,
        output: mpsc::Sender<DecodedFrame>,
    ) -> JoinHandle<Result<u64>> {
        tokio::spawn(async move {
            let closed = self.closed.clone();
            let mut delivered = 0u64;
            loop {
                let data = tokio::select! {
                    biased;
                    _ = closed.closed() => break,
                    data = input.recv() => match data {
                        Some(data) => data,
                        None => break,
                    },
                };
                for frame in self.push(&data).await? {
                    if output.send(frame).await.is_err() {
                        return Ok(delivered);
                    }
                    delivered += 1;
                }
            }
            let stats = self.stats();
            tracing::debug!(
                "Decode pipeline finished: {} decoded, {} concealed, {} failed",
                stats.decoded,
                stats.concealed,
                stats.failed
            );
            Ok(delivered)
        })
    }

    /// Decode the audio a peer receives on its data channel
    ///
    /// Returns `None` when the peer's audio queue was already taken.
    pub fn attach_to_peer(
        self,
        peer: &Peer,
        output: mpsc::Sender<DecodedFrame>,
    ) -> Option<JoinHandle<Result<u64>>> {
        let input = peer.take_audio_receiver()?;
        tracing::info!("Receiving audio from {}", peer.identity());
        Some(self.spawn(input, output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::resample::resampled_len;
    use crate::audio::wire::AudioFrame;
    use crate::codec::FrameOrigin;
    use crate::config::CodecKind;
    use crate::error::CodecError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn pcm_config() -> AudioConfig {
        AudioConfig {
            codec: CodecKind::Pcm,
            ..AudioConfig::default()
        }
    }

    fn sine(frames: usize, channels: usize) -> Vec<f32> {
        (0..frames)
            .flat_map(|i| {
                let v = (i as f32 / 48000.0 * 440.0 * 2.0 * std::f32::consts::PI).sin() * 0.5;
                std::iter::repeat(v).take(channels)
            })
            .collect()
    }

    fn sequences_of(records: &[Bytes]) -> Vec<u32> {
        let mut decoder = WireDecoder::new();
        records
            .iter()
            .flat_map(|r| decoder.push(r).unwrap())
            .map(|f| f.sequence)
            .collect()
    }

    #[tokio::test]
    async fn test_opus_roundtrip_keeps_order() {
        let config = AudioConfig::default();
        let mut encoder = EncodePipeline::from_config(&config, 48000).unwrap();
        let mut decoder = DecodePipeline::from_config(&config, 48000).unwrap();

        let mut records = Vec::new();
        // 10 frames pushed in uneven blocks
        let input = sine(9600, 2);
        for block in input.chunks(1234) {
            records.extend(encoder.push(block).await.unwrap());
        }
        records.extend(encoder.finish().await.unwrap());
        assert_eq!(records.len(), 10);

        let stream: Vec<u8> = records.iter().flat_map(|r| r.iter().copied()).collect();
        let mut frames = Vec::new();
        for piece in stream.chunks(100) {
            frames.extend(decoder.push(piece).await.unwrap());
        }
        let sequences: Vec<u32> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, (0..10u32).collect::<Vec<_>>());
        assert!(frames.iter().all(|f| f.origin == FrameOrigin::Decoded));
        assert!(frames.iter().all(|f| f.samples.len() == 1920));
    }

    struct DelayedEncoder {
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        calls: u64,
    }

    #[async_trait]
    impl FrameEncoder for DelayedEncoder {
        async fn setup(&mut self) -> std::result::Result<(), CodecError> {
            tokio::time::sleep(Duration::from_millis(3)).await;
            Ok(())
        }

        async fn encode(&mut self, samples: &[f32]) -> std::result::Result<Bytes, CodecError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.calls += 1;
            tokio::time::sleep(Duration::from_millis(self.calls * 7 % 5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Bytes::from(vec![0u8; samples.len() % 7 + 1]))
        }
    }

    #[tokio::test]
    async fn test_slow_encoder_stays_ordered() {
        let config = pcm_config();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let encoder = DelayedEncoder {
            in_flight: in_flight.clone(),
            max_in_flight: max_in_flight.clone(),
            calls: 0,
        };
        let pipeline = EncodePipeline::new(&config, 48000, Box::new(encoder)).unwrap();

        let (input_tx, input_rx) = mpsc::channel(crate::constants::PIPELINE_QUEUE_CAPACITY);
        let (output_tx, mut output_rx) = mpsc::channel(64);
        let task = pipeline.spawn(input_rx, output_tx);

        let producer = tokio::spawn(async move {
            for _ in 0..12 {
                input_tx.send(vec![0.0f32; 1000]).await.unwrap();
            }
        });

        let mut records = Vec::new();
        while let Some(record) = output_rx.recv().await {
            records.push(record);
        }
        producer.await.unwrap();
        let delivered = task.await.unwrap().unwrap();

        let sequences = sequences_of(&records);
        assert_eq!(delivered as usize, sequences.len());
        // 12000 samples in 1920-sample frames, the last one padded
        assert_eq!(sequences, (0..7u32).collect::<Vec<_>>());
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resampled_frame_count() {
        let config = pcm_config();
        let mut pipeline = EncodePipeline::from_config(&config, 44100).unwrap();

        let source_frames = 10_000usize;
        let input = sine(source_frames, 2);
        let mut records = Vec::new();
        for block in input.chunks(882) {
            records.extend(pipeline.push(block).await.unwrap());
        }
        records.extend(pipeline.finish().await.unwrap());

        let working_frames = resampled_len(source_frames as u64, 44100, 48000);
        let expected = working_frames.div_ceil(config.frame_size() as u64);
        assert_eq!(expected, 12);
        assert_eq!(records.len() as u64, expected);
    }

    #[tokio::test]
    async fn test_corrupt_frame_does_not_stop_decoding() {
        let config = pcm_config();
        let mut encoder = EncodePipeline::from_config(&config, 48000).unwrap();
        let mut records = encoder.push(&sine(960 * 10, 2)).await.unwrap();
        assert_eq!(records.len(), 10);

        records[5] = AudioFrame::new(5, vec![1u8, 2, 3]).encode();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut decoder = DecodePipeline::from_config(&config, 48000).unwrap().with_events(events_tx);
        let mut frames = Vec::new();
        for record in &records {
            frames.extend(decoder.push(record).await.unwrap());
        }

        assert_eq!(frames.len(), 10);
        assert_eq!(frames[5].origin, FrameOrigin::Silence);
        for frame in &frames[6..] {
            assert_eq!(frame.origin, FrameOrigin::Decoded);
        }
        assert!(matches!(
            events_rx.try_recv().unwrap(),
            FrameEvent::DecodeFailed { sequence: 5, .. }
        ));
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lost_frames_are_concealed() {
        let config = pcm_config();
        let mut encoder = EncodePipeline::from_config(&config, 48000).unwrap();
        let records = encoder.push(&sine(960 * 4, 2)).await.unwrap();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut decoder = DecodePipeline::from_config(&config, 48000).unwrap().with_events(events_tx);
        let mut frames = Vec::new();
        for index in [0, 3] {
            frames.extend(decoder.push(&records[index]).await.unwrap());
        }

        let origins: Vec<FrameOrigin> = frames.iter().map(|f| f.origin).collect();
        assert_eq!(
            origins,
            vec![
                FrameOrigin::Decoded,
                FrameOrigin::Concealed,
                FrameOrigin::Concealed,
                FrameOrigin::Decoded
            ]
        );
        assert_eq!(
            events_rx.try_recv().unwrap(),
            FrameEvent::Lost { first: 1, count: 2 }
        );
        assert_eq!(decoder.stats().reassembly.lost, 2);
    }

    #[tokio::test]
    async fn test_close_suppresses_output() {
        let config = pcm_config();
        let mut pipeline = EncodePipeline::from_config(&config, 48000).unwrap();
        assert_eq!(pipeline.push(&[0.0; 1920]).await.unwrap().len(), 1);

        pipeline.close_handle().close();
        assert!(pipeline.push(&[0.0; 3840]).await.unwrap().is_empty());
        assert!(pipeline.finish().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_record_reports_corruption() {
        let config = pcm_config();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut decoder = DecodePipeline::from_config(&config, 48000).unwrap().with_events(events_tx);

        let frames = decoder.push(&[0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF]).await.unwrap();
        assert!(frames.is_empty());
        assert!(matches!(
            events_rx.try_recv().unwrap(),
            FrameEvent::StreamCorrupted { .. }
        ));
    }

    #[tokio::test]
    async fn test_opus_corrupt_frame_is_silenced_then_recovers() {
        let config = AudioConfig::default();
        let mut encoder = EncodePipeline::from_config(&config, 48000).unwrap();
        let mut records = encoder.push(&sine(960 * 10, 2)).await.unwrap();
        assert_eq!(records.len(), 10);

        // Code 3 packet announcing zero frames
        records[5] = AudioFrame::new(5, vec![0x03u8, 0x00]).encode();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut decoder = DecodePipeline::from_config(&config, 48000)
            .unwrap()
            .with_events(events_tx);
        let mut frames = Vec::new();
        for record in &records {
            frames.extend(decoder.push(record).await.unwrap());
        }

        assert_eq!(frames.len(), 10);
        assert_eq!(frames[5].origin, FrameOrigin::Silence);
        assert!(frames[5].samples.iter().all(|s| *s == 0.0));
        assert_eq!(frames[5].samples.len(), config.samples_per_frame());
        for frame in &frames[6..] {
            assert_eq!(frame.origin, FrameOrigin::Decoded);
            assert_eq!(frame.samples.len(), config.samples_per_frame());
        }
        assert!(matches!(
            events_rx.try_recv().unwrap(),
            FrameEvent::DecodeFailed { sequence: 5, .. }
        ));
        assert_eq!(decoder.stats().decoded, 9);
        assert_eq!(decoder.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_corrupt_sequence_does_not_stop_decoding() {
        for config in [pcm_config(), AudioConfig::default()] {
            let mut encoder = EncodePipeline::from_config(&config, 48000).unwrap();
            let mut records = encoder.push(&sine(960 * 51, 2)).await.unwrap();
            assert_eq!(records.len(), 51);

            let payload = WireDecoder::new().push(&records[5]).unwrap().remove(0).payload;
            records[5] = AudioFrame::new(5 | 0x0100_0000, payload).encode();

            let (events_tx, mut events_rx) = mpsc::unbounded_channel();
            let mut decoder = DecodePipeline::from_config(&config, 48000)
                .unwrap()
                .with_events(events_tx);
            let mut frames = Vec::new();
            for record in &records {
                frames.extend(decoder.push(record).await.unwrap());
            }

            let sequences: Vec<u32> = frames.iter().map(|f| f.sequence).collect();
            assert_eq!(sequences, (0..51u32).collect::<Vec<_>>());
            assert_eq!(frames[5].origin, FrameOrigin::Concealed);
            assert!(frames[6..].iter().all(|f| f.origin == FrameOrigin::Decoded));

            let mut late = 0;
            while let Ok(event) = events_rx.try_recv() {
                if matches!(event, FrameEvent::Late { .. }) {
                    late += 1;
                }
            }
            assert_eq!(late, 0);
            let stats = decoder.stats();
            assert_eq!(stats.decoded, 50);
            assert_eq!(stats.reassembly.rejected, 1);
        }
    }

    #[tokio::test]
    async fn test_closed_decode_pipeline_ends_task() {
        let config = pcm_config();
        let mut encoder = EncodePipeline::from_config(&config, 48000).unwrap();
        let records = encoder.push(&sine(960 * 6, 2)).await.unwrap();

        let pipeline = DecodePipeline::from_config(&config, 48000).unwrap();
        let closed = pipeline.close_handle();
        let (input_tx, input_rx) = mpsc::channel(16);
        let (output_tx, mut output_rx) = mpsc::channel(16);
        let task = pipeline.spawn(input_rx, output_tx);

        for record in &records[..3] {
            input_tx.send(record.clone()).await.unwrap();
            output_rx.recv().await.unwrap();
        }
        closed.close();

        // The sender stays open; the task still has to finish
        let delivered = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivered, 3);
        assert!(input_tx.send(records[3].clone()).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_encode_pipeline_ends_task() {
        let config = pcm_config();
        let pipeline = EncodePipeline::from_config(&config, 48000).unwrap();
        let closed = pipeline.close_handle();
        let (input_tx, input_rx) = mpsc::channel(4);
        let (output_tx, mut output_rx) = mpsc::channel(16);
        let task = pipeline.spawn(input_rx, output_tx);

        input_tx.send(vec![0.0f32; 1920]).await.unwrap();
        output_rx.recv().await.unwrap();
        closed.close();

        let delivered = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivered, 1);
        drop(input_tx);
    }

    #[tokio::test]
    async fn test_decode_resamples_to_sink_rate() {
        let config = pcm_config();
        let mut encoder = EncodePipeline::from_config(&config, 48000).unwrap();
        let records = encoder.push(&sine(960 * 10, 2)).await.unwrap();

        let mut decoder = DecodePipeline::from_config(&config, 44100).unwrap();
        let mut samples = 0usize;
        for record in &records {
            for frame in decoder.push(record).await.unwrap() {
                samples += frame.samples.len();
            }
        }
        samples += decoder.finish().unwrap().len();
        assert_eq!(samples as u64, resampled_len(9600, 48000, 44100) * 2);
    }
}
