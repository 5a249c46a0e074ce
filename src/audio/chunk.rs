//! Fixed-duration chunking and its receive-side inverse
//!
//! `Chunker` slices a continuous interleaved sample stream into frames of
//! exactly `frame_size` samples per channel and tags each with the next
//! sequence number. A short tail is padded with silence on `finish`.
//!
//! `Reassembler` follows sequence numbers on the receive side and classifies
//! every arrival, so losses and reordering become events instead of errors.

use crate::constants::{MAX_SEQUENCE_JUMP, RESYNC_AFTER_FRAMES};
use crate::error::{Error, Result};

/// Fixed-size block of interleaved samples
#[derive(Debug, Clone, PartialEq)]
pub struct PcmFrame {
    pub sequence: u32,
    pub samples: Vec<f32>,
}

/// Sample stream to frame slicer
pub struct Chunker {
    samples_per_frame: usize,
    buffer: Vec<f32>,
    next_sequence: u32,
}

impl Chunker {
    /// `frame_size` is in samples per channel
    pub fn new(frame_size: usize, channels: u16) -> Result<Self> {
        let samples_per_frame = frame_size * channels as usize;
        if samples_per_frame == 0 {
            return Err(Error::Config(format!(
                "frame of {} samples over {} channels holds nothing",
                frame_size, channels
            )));
        }
        Ok(Self {
            samples_per_frame,
            buffer: Vec::with_capacity(samples_per_frame * 2),
            next_sequence: 0,
        })
    }

    /// Accumulate samples and return every complete frame
    pub fn push(&mut self, samples: &[f32]) -> Vec<PcmFrame> {
        self.buffer.extend_from_slice(samples);

        let mut frames = Vec::with_capacity(self.buffer.len() / self.samples_per_frame);
        while self.buffer.len() >= self.samples_per_frame {
            let samples: Vec<f32> = self.buffer.drain(..self.samples_per_frame).collect();
            frames.push(self.tag(samples));
        }
        frames
    }

    /// Flush the short tail as a silence-padded frame
    pub fn finish(&mut self) -> Option<PcmFrame> {
        if self.buffer.is_empty() {
            return None;
        }
        let mut samples = std::mem::take(&mut self.buffer);
        samples.resize(self.samples_per_frame, 0.0);
        Some(self.tag(samples))
    }

    fn tag(&mut self, samples: Vec<f32>) -> PcmFrame {
        let frame = PcmFrame {
            sequence: self.next_sequence,
            samples,
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);
        frame
    }

    pub fn samples_per_frame(&self) -> usize {
        self.samples_per_frame
    }

    /// Samples buffered towards the next frame
    pub fn pending_samples(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }
}

/// How a received sequence number relates to the stream so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Exactly the next expected frame
    InOrder,
    /// `missing` frames were skipped before this one
    Gap { missing: u32 },
    /// Already played or duplicated
    Stale,
    /// Further ahead than any plausible loss; the sequence number is not
    /// trusted and the frame is dropped
    OutOfWindow,
    /// A run of out-of-window frames numbered consecutively; the tracker now
    /// follows them. `previous` is what was expected before.
    Resync { previous: u32 },
}

/// Receive-side sequence tracker
///
/// Forward jumps of up to `max_jump` frames count as loss. Frames outside
/// that window never move the tracker on their own, so a single corrupt
/// sequence number cannot strand the stream. Only `resync_after` consecutive
/// out-of-window frames (a restarted sender, say) move it.
#[derive(Debug)]
pub struct Reassembler {
    next_expected: u32,
    max_jump: u32,
    resync_after: u32,
    /// Last out-of-window sequence and the length of its consecutive run
    candidate: Option<(u32, u32)>,
    stats: ReassemblyStats,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(MAX_SEQUENCE_JUMP, RESYNC_AFTER_FRAMES)
    }
}

impl Reassembler {
    pub fn new(max_jump: u32, resync_after: u32) -> Self {
        Self {
            next_expected: 0,
            max_jump: max_jump.max(1),
            resync_after: resync_after.max(1),
            candidate: None,
            stats: ReassemblyStats::default(),
        }
    }

    /// Classify `sequence` and advance past it when it is trusted
    pub fn accept(&mut self, sequence: u32) -> Arrival {
        let diff = sequence.wrapping_sub(self.next_expected);
        if diff <= self.max_jump {
            self.advance(sequence);
            if diff == 0 {
                return Arrival::InOrder;
            }
            self.stats.lost += diff as u64;
            return Arrival::Gap { missing: diff };
        }

        let run = match self.candidate {
            Some((last, run)) if sequence == last.wrapping_add(1) => run + 1,
            _ => 1,
        };
        if run >= self.resync_after {
            let previous = self.next_expected;
            self.advance(sequence);
            self.stats.resyncs += 1;
            return Arrival::Resync { previous };
        }
        self.candidate = Some((sequence, run));

        if diff >= u32::MAX / 2 {
            self.stats.late += 1;
            Arrival::Stale
        } else {
            self.stats.rejected += 1;
            Arrival::OutOfWindow
        }
    }

    fn advance(&mut self, sequence: u32) {
        self.candidate = None;
        self.stats.received += 1;
        self.next_expected = sequence.wrapping_add(1);
    }

    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }
}

/// Reassembly counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub received: u64,
    pub lost: u64,
    pub late: u64,
    /// Frames dropped for an untrusted sequence number
    pub rejected: u64,
    pub resyncs: u64,
}

impl ReassemblyStats {
    pub fn loss_rate(&self) -> f32 {
        if self.received + self.lost == 0 {
            0.0
        } else {
            self.lost as f32 / (self.received + self.lost) as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exact_frames() {
        let mut chunker = Chunker::new(4, 2).unwrap();
        let frames = chunker.push(&[1.0; 16]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].sequence, 0);
        assert_eq!(frames[1].sequence, 1);
        assert_eq!(chunker.pending_samples(), 0);
        assert!(chunker.finish().is_none());
    }

    #[test]
    fn test_short_tail_is_padded() {
        let mut chunker = Chunker::new(4, 1).unwrap();
        assert_eq!(chunker.push(&[1.0, 2.0, 3.0, 4.0, 5.0]).len(), 1);
        let tail = chunker.finish().unwrap();
        assert_eq!(tail.sequence, 1);
        assert_eq!(tail.samples, vec![5.0, 0.0, 0.0, 0.0]);
        assert!(chunker.finish().is_none());
    }

    #[test]
    fn test_frames_span_pushes() {
        let mut chunker = Chunker::new(3, 1).unwrap();
        assert!(chunker.push(&[1.0, 2.0]).is_empty());
        let frames = chunker.push(&[3.0, 4.0]);
        assert_eq!(frames, vec![PcmFrame { sequence: 0, samples: vec![1.0, 2.0, 3.0] }]);
        assert_eq!(chunker.pending_samples(), 1);
    }

    #[test]
    fn test_reassembler_classifies() {
        let mut r = Reassembler::default();
        assert_eq!(r.accept(0), Arrival::InOrder);
        assert_eq!(r.accept(1), Arrival::InOrder);
        assert_eq!(r.accept(4), Arrival::Gap { missing: 2 });
        assert_eq!(r.accept(3), Arrival::Stale);
        assert_eq!(r.accept(4), Arrival::Stale);
        assert_eq!(r.accept(5), Arrival::InOrder);

        let stats = r.stats();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.lost, 2);
        assert_eq!(stats.late, 2);
        assert!((stats.loss_rate() - 2.0 / 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_reassembler_first_frames_lost() {
        let mut r = Reassembler::default();
        assert_eq!(r.accept(3), Arrival::Gap { missing: 3 });
        assert_eq!(r.next_expected(), 4);
    }

    #[test]
    fn test_empty_frame_is_config_error() {
        assert!(matches!(Chunker::new(0, 2), Err(Error::Config(_))));
        assert!(matches!(Chunker::new(960, 0), Err(Error::Config(_))));
    }

    #[test]
    fn test_corrupt_sequence_does_not_strand_stream() {
        let mut r = Reassembler::new(50, 8);
        for seq in 0..5 {
            assert_eq!(r.accept(seq), Arrival::InOrder);
        }
        assert_eq!(r.accept(5 | 0x0100_0000), Arrival::OutOfWindow);
        assert_eq!(r.next_expected(), 5);
        assert_eq!(r.accept(6), Arrival::Gap { missing: 1 });
        for seq in 7..50 {
            assert_eq!(r.accept(seq), Arrival::InOrder);
        }

        let stats = r.stats();
        assert_eq!(stats.received, 49);
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.late, 0);
    }

    #[test]
    fn test_jump_within_window_is_loss() {
        let mut r = Reassembler::new(10, 8);
        assert_eq!(r.accept(0), Arrival::InOrder);
        assert_eq!(r.accept(11), Arrival::Gap { missing: 10 });
        assert_eq!(r.accept(23), Arrival::OutOfWindow);
        assert_eq!(r.next_expected(), 12);
    }

    #[test]
    fn test_sender_restart_resyncs() {
        let mut r = Reassembler::new(50, 4);
        for seq in 0..100 {
            r.accept(seq);
        }
        assert_eq!(r.accept(0), Arrival::Stale);
        assert_eq!(r.accept(1), Arrival::Stale);
        assert_eq!(r.accept(2), Arrival::Stale);
        assert_eq!(r.accept(3), Arrival::Resync { previous: 100 });
        assert_eq!(r.accept(4), Arrival::InOrder);
        assert_eq!(r.stats().resyncs, 1);
    }

    #[test]
    fn test_scattered_outliers_never_resync() {
        let mut r = Reassembler::new(50, 3);
        assert_eq!(r.accept(0), Arrival::InOrder);
        for outlier in [1000, 5000, 9000, 70_000, 3000] {
            assert_eq!(r.accept(outlier), Arrival::OutOfWindow);
        }
        assert_eq!(r.accept(1), Arrival::InOrder);
        assert_eq!(r.stats().resyncs, 0);
    }

    proptest! {
        #[test]
        fn prop_sequences_contiguous(blocks in prop::collection::vec(0usize..500, 1..40)) {
            let mut chunker = Chunker::new(96, 2).unwrap();
            let mut sequences = Vec::new();
            let mut total = 0usize;
            for len in &blocks {
                total += len * 2;
                sequences.extend(chunker.push(&vec![0.0; len * 2]).iter().map(|f| f.sequence));
            }
            if let Some(tail) = chunker.finish() {
                prop_assert_eq!(tail.samples.len(), 192);
                sequences.push(tail.sequence);
            }
            let expected: Vec<u32> = (0..total.div_ceil(192) as u32).collect();
            prop_assert_eq!(sequences, expected);
        }
    }
}
