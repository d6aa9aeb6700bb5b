//! Frame struct and payload compression.
//!
//! A [`Frame`] is one header plus its raw payload as it travelled on the wire.
//! Compressed payloads are inflated with [`Frame::into_payload`].

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::wire_format::{FrameHeader, HEADER_SIZE};
use crate::error::{Error, Result};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: FrameHeader,
    /// Payload bytes as received (possibly compressed).
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: FrameHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    #[inline]
    pub fn seq(&self) -> i32 {
        self.header.seq
    }

    /// The logical payload, inflated if the frame was compressed.
    pub fn into_payload(self) -> Result<Bytes> {
        if !self.header.is_compressed() {
            return Ok(self.payload);
        }
        let expected = self.header.uncompressed_length as usize;
        let inflated = decompress(&self.payload, expected)?;
        Ok(Bytes::from(inflated))
    }
}

/// Encode header and payload into one contiguous buffer.
pub fn build_frame(header: &FrameHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

/// Compress a payload with zlib.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| Error::Compression(format!("compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::Compression(format!("compression finish failed: {}", e)))
}

/// Inflate a zlib payload that must expand to exactly `expected` bytes.
pub fn decompress(data: &[u8], expected: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected);
    ZlibDecoder::new(data)
        .take(expected as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| Error::Compression(format!("decompression failed: {}", e)))?;

    if out.len() != expected {
        return Err(Error::protocol(format!(
            "compressed payload inflated to {} bytes, header announced {}",
            out.len(),
            expected
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncompressed_payload_passthrough() {
        let frame = Frame::new(FrameHeader::new(3, 5), Bytes::from_static(b"hello"));
        assert_eq!(frame.seq(), 3);
        assert_eq!(frame.into_payload().unwrap(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_compressed_payload_is_inflated() {
        let data = vec![b'z'; 10_000];
        let packed = compress(&data).unwrap();
        assert!(packed.len() < data.len());

        let header = FrameHeader::compressed(1, packed.len() as i32, data.len() as i32);
        let frame = Frame::new(header, Bytes::from(packed));
        assert_eq!(&frame.into_payload().unwrap()[..], &data[..]);
    }

    #[test]
    fn test_length_mismatch_is_protocol_error() {
        let packed = compress(b"abcdef").unwrap();
        let err = decompress(&packed, 3).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_garbage_is_compression_error() {
        let err = decompress(b"definitely not zlib", 10).unwrap_err();
        assert!(matches!(err, Error::Compression(_)));
    }

    #[test]
    fn test_build_frame() {
        let header = FrameHeader::new(9, 2);
        let bytes = build_frame(&header, b"ok");
        assert_eq!(bytes.len(), HEADER_SIZE + 2);
        assert_eq!(FrameHeader::decode(&bytes).unwrap(), header);
        assert_eq!(&bytes[HEADER_SIZE..], b"ok");
    }
}
