//! Streaming sample rate conversion
//!
//! Wraps rubato's FFT resampler, which low-pass filters while converting, so
//! content above the target Nyquist rate is removed instead of folding back
//! into the band. Blocks arrive interleaved and rubato works per channel, so
//! samples are split on the way in and interleaved on the way out.
//!
//! The filter delay is trimmed from the head of the stream and the tail is
//! padded on `flush`: a stream of `n` source frames produces exactly
//! `ceil(n * to / from)` frames however the input was split.

use rubato::{FftFixedIn, Resampler};

use crate::error::{Error, Result};

/// Milliseconds of input per resampler chunk
const CHUNK_MS: u32 = 20;

/// FFT sub-chunks per chunk
const SUB_CHUNKS: usize = 2;

/// Interleaved-sample streaming resampler
pub struct StreamResampler {
    from_rate: u32,
    to_rate: u32,
    channels: usize,
    /// `None` when the rates match
    inner: Option<FftFixedIn<f32>>,
    /// Per-channel input waiting for a full chunk
    pending: Vec<Vec<f32>>,
    /// Samples of a trailing incomplete frame
    carry: Vec<f32>,
    /// Output frames still to drop for the filter delay
    delay_left: usize,
    frames_in: u64,
    frames_out: u64,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32, channels: u16) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(Error::Config(format!(
                "cannot resample {}Hz to {}Hz",
                from_rate, to_rate
            )));
        }
        if channels == 0 {
            return Err(Error::Config("resampler needs at least one channel".into()));
        }

        let inner = if from_rate == to_rate {
            None
        } else {
            let chunk = (from_rate * CHUNK_MS / 1000).max(1) as usize;
            let resampler = FftFixedIn::<f32>::new(
                from_rate as usize,
                to_rate as usize,
                chunk,
                SUB_CHUNKS,
                channels as usize,
            )
            .map_err(|e| {
                Error::Config(format!(
                    "resampler {}Hz -> {}Hz: {}",
                    from_rate, to_rate, e
                ))
            })?;
            Some(resampler)
        };
        let delay_left = inner.as_ref().map_or(0, |r| r.output_delay());

        Ok(Self {
            from_rate,
            to_rate,
            channels: channels as usize,
            inner,
            pending: vec![Vec::new(); channels as usize],
            carry: Vec::new(),
            delay_left,
            frames_in: 0,
            frames_out: 0,
        })
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Feed interleaved samples, returning every output frame the completed
    /// chunks produced
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        if self.inner.is_none() {
            return Ok(input.to_vec());
        }
        self.split(input);

        let mut out = Vec::new();
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(out);
        };
        loop {
            let needed = resampler.input_frames_next();
            if self.pending[0].len() < needed {
                break;
            }
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|channel| channel.drain(..needed).collect())
                .collect();
            let wave = resampler.process(&chunk, None)?;
            take_output(
                &wave,
                &mut self.delay_left,
                &mut self.frames_out,
                u64::MAX,
                &mut out,
            );
        }
        Ok(out)
    }

    /// Drain the tail at end of stream and reset for reuse
    ///
    /// A trailing incomplete frame is dropped.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };
        let target = resampled_len(self.frames_in, self.from_rate, self.to_rate);
        self.carry.clear();

        let mut out = Vec::new();
        while self.frames_out < target {
            let wave = if self.pending[0].is_empty() {
                resampler.process_partial(None::<&[Vec<f32>]>, None)?
            } else {
                let tail = std::mem::replace(&mut self.pending, vec![Vec::new(); self.channels]);
                resampler.process_partial(Some(tail.as_slice()), None)?
            };
            take_output(
                &wave,
                &mut self.delay_left,
                &mut self.frames_out,
                target,
                &mut out,
            );
        }

        resampler.reset();
        self.delay_left = resampler.output_delay();
        self.frames_in = 0;
        self.frames_out = 0;
        for channel in &mut self.pending {
            channel.clear();
        }
        Ok(out)
    }

    fn split(&mut self, input: &[f32]) {
        let ch = self.channels;
        self.carry.extend_from_slice(input);
        let whole = self.carry.len() / ch;
        for frame in self.carry[..whole * ch].chunks_exact(ch) {
            for (channel, sample) in self.pending.iter_mut().zip(frame) {
                channel.push(*sample);
            }
        }
        self.carry.drain(..whole * ch);
        self.frames_in += whole as u64;
    }
}

/// Interleave `wave` into `out`, skipping the remaining filter delay and
/// stopping once `limit` frames were produced in total
fn take_output(
    wave: &[Vec<f32>],
    delay_left: &mut usize,
    frames_out: &mut u64,
    limit: u64,
    out: &mut Vec<f32>,
) {
    let produced = wave.first().map_or(0, Vec::len);
    let skip = (*delay_left).min(produced);
    *delay_left -= skip;
    let take = ((produced - skip) as u64).min(limit.saturating_sub(*frames_out)) as usize;

    out.reserve(take * wave.len());
    for i in skip..skip + take {
        for channel in wave {
            out.push(channel[i]);
        }
    }
    *frames_out += take as u64;
}

/// Output frame count for `input_frames` source frames once flushed
pub fn resampled_len(input_frames: u64, from_rate: u32, to_rate: u32) -> u64 {
    (input_frames * to_rate as u64).div_ceil(from_rate as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sine(freq: f32, rate: u32, frames: usize, amplitude: f32) -> Vec<f32> {
        (0..frames)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin() * amplitude)
            .collect()
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    fn run(resampler: &mut StreamResampler, input: &[f32], block: usize) -> Vec<f32> {
        let mut out = Vec::new();
        for piece in input.chunks(block) {
            out.extend(resampler.process(piece).unwrap());
        }
        out.extend(resampler.flush().unwrap());
        out
    }

    #[test]
    fn test_passthrough_is_identity() {
        let mut resampler = StreamResampler::new(48000, 48000, 2).unwrap();
        assert!(resampler.is_passthrough());
        let input = vec![0.1, 0.2, 0.3, 0.4];
        assert_eq!(resampler.process(&input).unwrap(), input);
        assert!(resampler.flush().unwrap().is_empty());
    }

    #[test]
    fn test_upsample_length() {
        let mut resampler = StreamResampler::new(44100, 48000, 1).unwrap();
        let out = run(&mut resampler, &vec![0.5f32; 44100], 441);
        assert_eq!(out.len(), 48000);
    }

    #[test]
    fn test_downsample_suppresses_aliasing() {
        // 30kHz is above the 24kHz Nyquist rate of the output
        let mut resampler = StreamResampler::new(96000, 48000, 1).unwrap();
        let input = sine(30_000.0, 96000, 96000, 1.0);
        assert!((rms(&input) - 0.707).abs() < 0.01);

        let out = run(&mut resampler, &input, 1920);
        assert_eq!(out.len(), 48000);
        assert!(rms(&out[4800..43200]) < 0.02, "aliased rms {}", rms(&out[4800..43200]));
    }

    #[test]
    fn test_in_band_tone_survives() {
        let mut resampler = StreamResampler::new(96000, 48000, 1).unwrap();
        let out = run(&mut resampler, &sine(1000.0, 96000, 96000, 0.5), 1920);
        let level = rms(&out[4800..43200]);
        assert!((level - 0.3536).abs() < 0.03, "tone rms {}", level);
    }

    #[test]
    fn test_stereo_channels_stay_separate() {
        let mut resampler = StreamResampler::new(44100, 48000, 2).unwrap();
        let left = sine(1000.0, 44100, 44100, 0.5);
        let input: Vec<f32> = left.iter().flat_map(|&l| [l, 0.0]).collect();

        let out = run(&mut resampler, &input, 882);
        assert_eq!(out.len(), 96000);
        let right: Vec<f32> = out.iter().skip(1).step_by(2).copied().collect();
        let left: Vec<f32> = out.iter().step_by(2).copied().collect();
        assert!(right.iter().all(|s| s.abs() < 1e-3));
        assert!(rms(&left[4800..43200]) > 0.3);
    }

    #[test]
    fn test_reusable_after_flush() {
        let mut resampler = StreamResampler::new(16000, 48000, 1).unwrap();
        let first = run(&mut resampler, &vec![0.1f32; 1600], 160);
        let second = run(&mut resampler, &vec![0.1f32; 1600], 333);
        assert_eq!(first.len(), 4800);
        assert_eq!(second.len(), 4800);
    }

    #[test]
    fn test_invalid_arguments_are_config_errors() {
        assert!(matches!(StreamResampler::new(0, 48000, 2), Err(Error::Config(_))));
        assert!(matches!(StreamResampler::new(44100, 48000, 0), Err(Error::Config(_))));
    }

    proptest! {
        #[test]
        fn prop_length_independent_of_block_split(
            frames in 1usize..4000,
            split in 1usize..700,
            from in prop::sample::select(vec![8000u32, 22050, 44100, 48000, 96000]),
        ) {
            let mut resampler = StreamResampler::new(from, 48000, 2).unwrap();
            let input = vec![0.25f32; frames * 2];
            let total = run(&mut resampler, &input, split * 2).len();
            prop_assert_eq!(total as u64, resampled_len(frames as u64, from, 48000) * 2);
        }
    }
}
