//! Audio wire framing
//!
//! Each frame travels as one record:
//!
//! ```text
//! ┌──────────────┬──────────────┬─────────────────────┐
//! │ sequence u32 │ length u32   │ payload (length B)  │
//! │ big endian   │ big endian   │ Opus or PCM bytes   │
//! └──────────────┴──────────────┴─────────────────────┘
//! ```
//!
//! Records are written in send order. The decoder accepts arbitrary slices of
//! the byte stream, so a record split across transport messages is fine.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::MAX_FRAME_PAYLOAD;
use crate::error::WireError;

/// Size of the record header
pub const HEADER_LEN: usize = 8;

/// Sequence-tagged audio payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub sequence: u32,
    pub payload: Bytes,
}

impl AudioFrame {
    pub fn new(sequence: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            payload: payload.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Serialize into one wire record
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32(self.sequence);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }
}

/// Incremental record splitter
pub struct WireDecoder {
    buffer: BytesMut,
    max_payload: usize,
}

impl Default for WireDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl WireDecoder {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_FRAME_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_payload,
        }
    }

    /// Append bytes and return every complete record
    ///
    /// An oversized length field means the stream lost framing; everything
    /// buffered is discarded and the error returned alongside nothing.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<AudioFrame>, WireError> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while self.buffer.len() >= HEADER_LEN {
            let sequence = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]);
            let length = u32::from_be_bytes([
                self.buffer[4],
                self.buffer[5],
                self.buffer[6],
                self.buffer[7],
            ]) as usize;

            if length > self.max_payload {
                self.buffer.clear();
                return Err(WireError::PayloadTooLarge(length));
            }
            if self.buffer.len() < HEADER_LEN + length {
                break;
            }

            self.buffer.advance(HEADER_LEN);
            let payload = self.buffer.split_to(length).freeze();
            frames.push(AudioFrame { sequence, payload });
        }

        Ok(frames)
    }

    /// Bytes held back waiting for the rest of a record
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_record_layout() {
        let frame = AudioFrame::new(7, vec![0xAA, 0xBB]);
        let bytes = frame.encode();
        assert_eq!(&bytes[..], &[0, 0, 0, 7, 0, 0, 0, 2, 0xAA, 0xBB]);
    }

    #[test]
    fn test_split_records() {
        let mut stream = BytesMut::new();
        AudioFrame::new(0, vec![1, 2, 3]).encode_into(&mut stream);
        AudioFrame::new(1, Vec::<u8>::new()).encode_into(&mut stream);
        AudioFrame::new(2, vec![9; 40]).encode_into(&mut stream);

        let mut decoder = WireDecoder::new();
        let mut frames = Vec::new();
        // Feed in awkward slices that cut through headers and payloads
        for piece in stream.chunks(5) {
            frames.extend(decoder.push(piece).unwrap());
        }
        assert_eq!(decoder.buffered(), 0);
        let sequences: Vec<u32> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(frames[0].payload.as_ref(), &[1, 2, 3]);
        assert!(frames[1].payload.is_empty());
        assert_eq!(frames[2].payload.len(), 40);
    }

    #[test]
    fn test_oversized_length_resets() {
        let mut decoder = WireDecoder::with_max_payload(16);
        let err = decoder.push(&[0, 0, 0, 1, 0, 0, 1, 0, 1, 2]).unwrap_err();
        assert_eq!(err, WireError::PayloadTooLarge(256));
        assert_eq!(decoder.buffered(), 0);

        let frames = decoder.push(&AudioFrame::new(2, vec![5]).encode()).unwrap();
        assert_eq!(frames.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_any_split_yields_same_frames(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..12),
            cut in 1usize..32,
        ) {
            let mut stream = BytesMut::new();
            for (seq, payload) in payloads.iter().enumerate() {
                AudioFrame::new(seq as u32, payload.clone()).encode_into(&mut stream);
            }

            let mut decoder = WireDecoder::new();
            let mut frames = Vec::new();
            for piece in stream.chunks(cut) {
                frames.extend(decoder.push(piece).unwrap());
            }

            prop_assert_eq!(decoder.buffered(), 0);
            prop_assert_eq!(frames.len(), payloads.len());
            for (seq, (frame, payload)) in frames.iter().zip(&payloads).enumerate() {
                prop_assert_eq!(frame.sequence, seq as u32);
                prop_assert_eq!(frame.payload.as_ref(), payload.as_slice());
            }
        }
    }
}
