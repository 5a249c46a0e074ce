//! Ordered codec stages
//!
//! A stage owns exactly one codec instance. `process` takes `&mut self`, and
//! the pipeline drives a stage from a single task, so frames are encoded or
//! decoded strictly in arrival order with at most one operation in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::audio::chunk::{Arrival, PcmFrame, Reassembler, ReassemblyStats};
use crate::audio::wire::AudioFrame;
use crate::codec::{FrameDecoder, FrameEncoder};
use crate::error::CodecError;

#[derive(Debug, Default)]
struct CloseState {
    closed: AtomicBool,
    notify: Notify,
}

/// Shared "stream has ended" flag
#[derive(Debug, Clone, Default)]
pub struct CloseHandle(Arc<CloseState>);

impl CloseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        loop {
            let notified = self.0.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

fn as_setup_failure(err: CodecError) -> CodecError {
    match err {
        CodecError::SetupFailed(_) => err,
        other => CodecError::SetupFailed(other.to_string()),
    }
}

/// Encode side of a pipeline
pub struct EncodeStage {
    encoder: Box<dyn FrameEncoder>,
    ready: bool,
    closed: CloseHandle,
    frames_encoded: u64,
}

impl EncodeStage {
    pub fn new(encoder: Box<dyn FrameEncoder>, closed: CloseHandle) -> Self {
        Self {
            encoder,
            ready: false,
            closed,
            frames_encoded: 0,
        }
    }

    /// Await codec setup; later calls return immediately
    pub async fn ensure_ready(&mut self) -> Result<(), CodecError> {
        if !self.ready {
            self.encoder.setup().await.map_err(as_setup_failure)?;
            self.ready = true;
        }
        Ok(())
    }

    /// Encode one frame, keeping its sequence number
    ///
    /// Returns `None` when the stream was closed before or during the call.
    pub async fn process(&mut self, frame: PcmFrame) -> Result<Option<AudioFrame>, CodecError> {
        if self.closed.is_closed() {
            return Ok(None);
        }
        self.ensure_ready().await?;

        let payload = self.encoder.encode(&frame.samples).await?;
        if self.closed.is_closed() {
            tracing::trace!("Dropping frame {} encoded after close", frame.sequence);
            return Ok(None);
        }

        self.frames_encoded += 1;
        Ok(Some(AudioFrame::new(frame.sequence, payload)))
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }
}

/// Where the samples of a decoded frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    Decoded,
    /// Synthesized for a frame that never arrived
    Concealed,
    /// Substituted for a frame that failed to decode
    Silence,
}

/// Decoded frame ready for playback
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub sequence: u32,
    pub samples: Vec<f32>,
    pub origin: FrameOrigin,
}

/// Recoverable per-frame events on the decode side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Lost { first: u32, count: u32 },
    Late { sequence: u32 },
    DecodeFailed { sequence: u32, reason: String },
    /// Sequence number too far from the stream to be trusted; frame dropped
    SequenceRejected { sequence: u32 },
    /// Receiver re-locked onto a renumbered stream
    Resynced { previous: u32, sequence: u32 },
    /// Wire framing was lost and buffered bytes were dropped
    StreamCorrupted { reason: String },
}

/// Result of feeding one frame to the decode stage
#[derive(Debug, Default)]
pub struct DecodeOutput {
    pub frames: Vec<DecodedFrame>,
    pub events: Vec<FrameEvent>,
}

/// Decode side of a pipeline
pub struct DecodeStage {
    decoder: Box<dyn FrameDecoder>,
    ready: bool,
    closed: CloseHandle,
    reassembler: Reassembler,
    max_concealed: u32,
    samples_per_frame: usize,
    stats: DecodeStats,
}

impl DecodeStage {
    pub fn new(
        decoder: Box<dyn FrameDecoder>,
        closed: CloseHandle,
        samples_per_frame: usize,
        max_concealed: u32,
    ) -> Self {
        Self {
            decoder,
            ready: false,
            closed,
            reassembler: Reassembler::default(),
            max_concealed,
            samples_per_frame,
            stats: DecodeStats::default(),
        }
    }

    /// Replace the default sequence window
    pub fn with_sequence_window(mut self, max_jump: u32, resync_after: u32) -> Self {
        self.reassembler = Reassembler::new(max_jump, resync_after);
        self
    }

    pub async fn ensure_ready(&mut self) -> Result<(), CodecError> {
        if !self.ready {
            self.decoder.setup().await.map_err(as_setup_failure)?;
            self.ready = true;
        }
        Ok(())
    }

    /// Decode one received frame
    ///
    /// Only a setup failure is an error. Gaps are concealed, stale frames are
    /// dropped, undecodable payloads become one frame of silence; each case is
    /// reported as a `FrameEvent`.
    pub async fn process(&mut self, frame: AudioFrame) -> Result<DecodeOutput, CodecError> {
        let mut out = DecodeOutput::default();
        if self.closed.is_closed() {
            return Ok(out);
        }
        self.ensure_ready().await?;

        let sequence = frame.sequence;
        match self.reassembler.accept(sequence) {
            Arrival::Stale => {
                tracing::debug!("Dropping stale frame {}", sequence);
                out.events.push(FrameEvent::Late { sequence });
                return Ok(out);
            }
            Arrival::OutOfWindow => {
                tracing::debug!("Dropping frame with untrusted sequence {}", sequence);
                out.events.push(FrameEvent::SequenceRejected { sequence });
                return Ok(out);
            }
            Arrival::Resync { previous } => {
                tracing::info!("Sequence resynced from {} to {}", previous, sequence);
                out.events.push(FrameEvent::Resynced { previous, sequence });
            }
            Arrival::Gap { missing } => {
                let first = sequence.wrapping_sub(missing);
                tracing::debug!("Frames {}..{} lost", first, sequence);
                out.events.push(FrameEvent::Lost {
                    first,
                    count: missing,
                });
                let concealed = missing.min(self.max_concealed);
                for i in 0..concealed {
                    let seq = sequence.wrapping_sub(concealed - i);
                    let decoded = match self.decoder.conceal().await {
                        Ok(samples) => DecodedFrame {
                            sequence: seq,
                            samples,
                            origin: FrameOrigin::Concealed,
                        },
                        Err(e) => {
                            tracing::debug!("Concealment failed for frame {}: {}", seq, e);
                            self.silence(seq)
                        }
                    };
                    self.stats.concealed += 1;
                    out.frames.push(decoded);
                }
            }
            Arrival::InOrder => {}
        }

        match self.decoder.decode(&frame.payload).await {
            Ok(samples) => {
                self.stats.decoded += 1;
                out.frames.push(DecodedFrame {
                    sequence,
                    samples,
                    origin: FrameOrigin::Decoded,
                });
            }
            Err(e) => {
                tracing::warn!("Frame {} failed to decode: {}", sequence, e);
                self.stats.failed += 1;
                out.events.push(FrameEvent::DecodeFailed {
                    sequence,
                    reason: e.to_string(),
                });
                out.frames.push(self.silence(sequence));
            }
        }

        if self.closed.is_closed() {
            out.frames.clear();
        }
        Ok(out)
    }

    fn silence(&self, sequence: u32) -> DecodedFrame {
        DecodedFrame {
            sequence,
            samples: vec![0.0; self.samples_per_frame],
            origin: FrameOrigin::Silence,
        }
    }

    pub fn stats(&self) -> DecodeStats {
        DecodeStats {
            reassembly: self.reassembler.stats(),
            ..self.stats
        }
    }
}

/// Decode stage counters
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeStats {
    pub decoded: u64,
    pub concealed: u64,
    pub failed: u64,
    pub reassembly: ReassemblyStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PcmDecoder, PcmEncoder};
    use async_trait::async_trait;
    use bytes::Bytes;

    struct BrokenSetup;

    #[async_trait]
    impl FrameEncoder for BrokenSetup {
        async fn setup(&mut self) -> Result<(), CodecError> {
            Err(CodecError::UnsupportedChannels(9))
        }

        async fn encode(&mut self, _samples: &[f32]) -> Result<Bytes, CodecError> {
            unreachable!("setup never succeeds")
        }
    }

    fn pcm_decode_stage(max_concealed: u32) -> DecodeStage {
        DecodeStage::new(
            Box::new(PcmDecoder::new(1, 2)),
            CloseHandle::new(),
            2,
            max_concealed,
        )
    }

    #[tokio::test]
    async fn test_closed_wakes_waiter() {
        let handle = CloseHandle::new();
        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.closed().await }
        });
        tokio::task::yield_now().await;
        handle.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        // Already closed resolves at once
        handle.closed().await;
    }

    #[tokio::test]
    async fn test_encode_keeps_sequence() {
        let mut stage = EncodeStage::new(Box::new(PcmEncoder::new(1, 2)), CloseHandle::new());
        let frame = stage
            .process(PcmFrame { sequence: 41, samples: vec![0.0, 0.5] })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.sequence, 41);
        assert_eq!(frame.payload.len(), 4);
    }

    #[tokio::test]
    async fn test_setup_failure_is_reported_as_setup() {
        let mut stage = EncodeStage::new(Box::new(BrokenSetup), CloseHandle::new());
        let err = stage
            .process(PcmFrame { sequence: 0, samples: vec![] })
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::SetupFailed(_)));
    }

    #[tokio::test]
    async fn test_encode_after_close_is_noop() {
        let closed = CloseHandle::new();
        let mut stage = EncodeStage::new(Box::new(PcmEncoder::new(1, 2)), closed.clone());
        closed.close();
        let out = stage
            .process(PcmFrame { sequence: 0, samples: vec![0.0, 0.0] })
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(stage.frames_encoded(), 0);
    }

    #[tokio::test]
    async fn test_gap_is_concealed_up_to_limit() {
        let mut stage = pcm_decode_stage(2);
        let payload = Bytes::from_static(&[0, 0, 0, 0]);

        stage.process(AudioFrame::new(0, payload.clone())).await.unwrap();
        let out = stage.process(AudioFrame::new(5, payload)).await.unwrap();

        assert_eq!(out.events, vec![FrameEvent::Lost { first: 1, count: 4 }]);
        let sequences: Vec<(u32, FrameOrigin)> =
            out.frames.iter().map(|f| (f.sequence, f.origin)).collect();
        assert_eq!(
            sequences,
            vec![
                (3, FrameOrigin::Concealed),
                (4, FrameOrigin::Concealed),
                (5, FrameOrigin::Decoded),
            ]
        );
    }

    #[tokio::test]
    async fn test_corrupt_frame_becomes_silence() {
        let mut stage = pcm_decode_stage(0);
        let out = stage
            .process(AudioFrame::new(0, Bytes::from_static(&[1, 2, 3])))
            .await
            .unwrap();
        assert_eq!(out.frames[0].origin, FrameOrigin::Silence);
        assert_eq!(out.frames[0].samples, vec![0.0, 0.0]);
        assert!(matches!(
            out.events[0],
            FrameEvent::DecodeFailed { sequence: 0, .. }
        ));
        assert_eq!(stage.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_untrusted_sequence_is_dropped_then_concealed() {
        let mut stage = pcm_decode_stage(5);
        let payload = Bytes::from_static(&[0, 0, 0, 0]);
        for seq in 0..5 {
            stage.process(AudioFrame::new(seq, payload.clone())).await.unwrap();
        }

        let out = stage
            .process(AudioFrame::new(5 | 0x0100_0000, payload.clone()))
            .await
            .unwrap();
        assert!(out.frames.is_empty());
        assert_eq!(
            out.events,
            vec![FrameEvent::SequenceRejected { sequence: 5 | 0x0100_0000 }]
        );

        let out = stage.process(AudioFrame::new(6, payload.clone())).await.unwrap();
        let origins: Vec<(u32, FrameOrigin)> =
            out.frames.iter().map(|f| (f.sequence, f.origin)).collect();
        assert_eq!(
            origins,
            vec![(5, FrameOrigin::Concealed), (6, FrameOrigin::Decoded)]
        );

        let mut late = 0;
        for seq in 7..50 {
            let out = stage.process(AudioFrame::new(seq, payload.clone())).await.unwrap();
            late += out.events.len();
            assert_eq!(out.frames.len(), 1);
        }
        assert_eq!(late, 0);
        assert_eq!(stage.stats().decoded, 49);
    }

    #[tokio::test]
    async fn test_restarted_sender_is_followed() {
        let mut stage = pcm_decode_stage(0).with_sequence_window(50, 3);
        let payload = Bytes::from_static(&[0, 0, 0, 0]);
        for seq in 0..20 {
            stage.process(AudioFrame::new(seq, payload.clone())).await.unwrap();
        }

        for seq in 0..2 {
            let out = stage.process(AudioFrame::new(seq, payload.clone())).await.unwrap();
            assert!(out.frames.is_empty());
        }
        let out = stage.process(AudioFrame::new(2, payload.clone())).await.unwrap();
        assert_eq!(
            out.events,
            vec![FrameEvent::Resynced { previous: 20, sequence: 2 }]
        );
        assert_eq!(out.frames[0].origin, FrameOrigin::Decoded);

        let out = stage.process(AudioFrame::new(3, payload)).await.unwrap();
        assert!(out.events.is_empty());
        assert_eq!(out.frames[0].sequence, 3);
    }

    #[tokio::test]
    async fn test_stale_frame_dropped() {
        let mut stage = pcm_decode_stage(0);
        let payload = Bytes::from_static(&[0, 0, 0, 0]);
        stage.process(AudioFrame::new(0, payload.clone())).await.unwrap();
        stage.process(AudioFrame::new(1, payload.clone())).await.unwrap();
        let out = stage.process(AudioFrame::new(0, payload)).await.unwrap();
        assert!(out.frames.is_empty());
        assert_eq!(out.events, vec![FrameEvent::Late { sequence: 0 }]);
    }
}
