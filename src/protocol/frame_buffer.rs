//! Frame buffer for accumulating partial reads.
//!
//! Bytes arrive from the channel in arbitrary chunks. The buffer is a small
//! state machine:
//! - `WaitingForHeader`: need at least 12 bytes
//! - `WaitingForPayload`: header parsed, need N more payload bytes
//!
//! Because all partial state lives here and not in a pending future, a read
//! that is abandoned halfway (e.g. on timeout) loses nothing.
//!
//! # Example
//!
//! ```
//! use objwire::protocol::{build_frame, FrameBuffer, FrameHeader};
//!
//! let bytes = build_frame(&FrameHeader::new(1, 5), b"hello");
//! let mut buffer = FrameBuffer::new();
//!
//! assert!(buffer.push(&bytes[..7]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[7..]).unwrap();
//! assert_eq!(frames[0].seq(), 1);
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{FrameHeader, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::Result;

#[derive(Debug, Clone)]
enum State {
    WaitingForHeader,
    WaitingForPayload { header: FrameHeader, remaining: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_payload_size: i32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings (64KB capacity, 1GB max payload).
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_payload(max_payload_size: i32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a header carries a negative or oversized length.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        match &self.state {
            State::WaitingForHeader => {
                let Some(header) = FrameHeader::decode(&self.buffer) else {
                    return Ok(None);
                };
                header.validate(self.max_payload_size)?;

                let _ = self.buffer.split_to(HEADER_SIZE);

                if header.payload_length == 0 {
                    return Ok(Some(Frame::new(header, Bytes::new())));
                }

                self.state = State::WaitingForPayload {
                    header,
                    remaining: header.payload_length as usize,
                };
                self.try_extract_one()
            }

            State::WaitingForPayload { header, remaining } => {
                let remaining = *remaining;
                if self.buffer.len() < remaining {
                    return Ok(None);
                }

                let payload = self.buffer.split_to(remaining).freeze();
                let header = *header;
                self.state = State::WaitingForHeader;

                Ok(Some(Frame::new(header, payload)))
            }
        }
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether a frame has started arriving but is not complete yet.
    pub fn is_mid_frame(&self) -> bool {
        !self.buffer.is_empty() || matches!(self.state, State::WaitingForPayload { .. })
    }

    /// Drop buffered bytes and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::build_frame;

    fn make_frame_bytes(seq: i32, payload: &[u8]) -> Vec<u8> {
        build_frame(&FrameHeader::new(seq, payload.len() as i32), payload)
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&make_frame_bytes(42, b"hello")).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].seq(), 42);
        assert_eq!(&frames[0].payload[..], b"hello");
        assert!(buffer.is_empty());
        assert!(!buffer.is_mid_frame());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut combined = make_frame_bytes(1, b"first");
        combined.extend_from_slice(&make_frame_bytes(2, b"second"));
        combined.extend_from_slice(&make_frame_bytes(3, b"third"));

        let frames = buffer.push(&combined).unwrap();
        let seqs: Vec<i32> = frames.iter().map(Frame::seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_fragmented_header_and_payload() {
        let mut buffer = FrameBuffer::new();
        let bytes = make_frame_bytes(7, b"a payload split in pieces");

        assert!(buffer.push(&bytes[..5]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");
        assert!(buffer.is_mid_frame());

        assert!(buffer.push(&bytes[5..HEADER_SIZE + 3]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForPayload");

        let frames = buffer.push(&bytes[HEADER_SIZE + 3..]).unwrap();
        assert_eq!(&frames[0].payload[..], b"a payload split in pieces");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let mut all = Vec::new();
        for byte in make_frame_bytes(5, b"hi") {
            all.extend(buffer.push(&[byte]).unwrap());
        }
        assert_eq!(all.len(), 1);
        assert_eq!(&all[0].payload[..], b"hi");
    }

    #[test]
    fn test_max_payload_validation() {
        let mut buffer = FrameBuffer::with_max_payload(100);
        let result = buffer.push(&FrameHeader::new(1, 1000).encode());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        let bytes = make_frame_bytes(1, b"test");
        buffer.push(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(buffer.state_name(), "WaitingForPayload");

        buffer.clear();
        assert_eq!(buffer.state_name(), "WaitingForHeader");
        assert!(!buffer.is_mid_frame());
    }
}
