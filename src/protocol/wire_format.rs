//! Wire format encoding and decoding.
//!
//! Every frame starts with a 12-byte header:
//! ```text
//! ┌──────────┬────────────┬──────────────────┐
//! │ Seq      │ Length     │ Uncompressed len │
//! │ 4 bytes  │ 4 bytes    │ 4 bytes          │
//! │ int32 BE │ int32 BE   │ int32 BE         │
//! └──────────┴────────────┴──────────────────┘
//! ```
//!
//! An uncompressed length of 0 means the payload is stored as is; otherwise
//! the payload is a zlib stream inflating to exactly that many bytes.
//!
//! The first payload byte is a command code (requests) or a reply code
//! (replies). See the [`commands`], [`replies`] and [`info`] modules.

use crate::error::{Error, Result};

/// Header size in bytes (fixed, exactly 12).
pub const HEADER_SIZE: usize = 12;

/// Default maximum payload size (1 GB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: i32 = 1_073_741_824;

/// Request command codes (first payload byte, client to server).
pub mod commands {
    pub const PING: u8 = 0;
    pub const INVOKE: u8 = 1;
    pub const QUIT: u8 = 2;
    pub const DECREF: u8 = 3;
    pub const INCREF: u8 = 4;
    pub const GETINFO: u8 = 5;
    pub const CHECK_CAST: u8 = 6;
    pub const QUERY_PROXY_TYPE: u8 = 7;

    /// Human-readable name for logs.
    pub fn name(code: u8) -> &'static str {
        match code {
            PING => "PING",
            INVOKE => "INVOKE",
            QUIT => "QUIT",
            DECREF => "DECREF",
            INCREF => "INCREF",
            GETINFO => "GETINFO",
            CHECK_CAST => "CHECK_CAST",
            QUERY_PROXY_TYPE => "QUERY_PROXY_TYPE",
            _ => "UNKNOWN",
        }
    }
}

/// Reply codes (first payload byte, server to client).
pub mod replies {
    pub const SUCCESS: u8 = 0;
    pub const PROTOCOL_ERROR: u8 = 1;
    pub const PACKED_EXCEPTION: u8 = 2;
    pub const GENERIC_EXCEPTION: u8 = 3;
}

/// GETINFO selector codes.
pub mod info {
    pub const META: i32 = 0;
    pub const SERVICE: i32 = 1;
    pub const FUNCTIONS: i32 = 2;
    pub const REFLECTION: i32 = 3;
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Sequence number correlating a request with its reply.
    pub seq: i32,
    /// Number of payload bytes on the wire.
    pub payload_length: i32,
    /// Inflated payload size, or 0 if the payload is not compressed.
    pub uncompressed_length: i32,
}

impl FrameHeader {
    /// Header for an uncompressed payload.
    pub fn new(seq: i32, payload_length: i32) -> Self {
        Self {
            seq,
            payload_length,
            uncompressed_length: 0,
        }
    }

    /// Header for a compressed payload.
    pub fn compressed(seq: i32, payload_length: i32, uncompressed_length: i32) -> Self {
        Self {
            seq,
            payload_length,
            uncompressed_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use objwire::protocol::FrameHeader;
    ///
    /// let bytes = FrameHeader::new(7, 100).encode();
    /// assert_eq!(bytes.len(), 12);
    /// assert_eq!(&bytes[..4], &[0, 0, 0, 7]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.seq.to_be_bytes());
        buf[4..8].copy_from_slice(&self.payload_length.to_be_bytes());
        buf[8..12].copy_from_slice(&self.uncompressed_length.to_be_bytes());
        buf
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            seq: i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            payload_length: i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            uncompressed_length: i32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    /// Reject negative or oversized lengths.
    pub fn validate(&self, max_payload_size: i32) -> Result<()> {
        if self.payload_length < 0 || self.uncompressed_length < 0 {
            return Err(Error::protocol(format!(
                "negative frame length (payload {}, uncompressed {})",
                self.payload_length, self.uncompressed_length
            )));
        }

        if self.payload_length > max_payload_size || self.uncompressed_length > max_payload_size
        {
            return Err(Error::protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length.max(self.uncompressed_length),
                max_payload_size
            )));
        }

        Ok(())
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.uncompressed_length > 0
    }
}
