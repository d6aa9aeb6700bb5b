//! Protocol module - wire format, framing, and protocol codes.
//!
//! - 12-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - zlib payload compression
//! - command, reply and GETINFO codes

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_frame, compress, decompress, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{commands, info, replies, FrameHeader, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
