//! Frame and compression codec.
//!
//! Every payload is stored behind a one-byte marker so the decoder knows
//! which inverse to apply: zlib when compression won, raw passthrough when
//! it lost or failed. The declared length in the header counts the marker
//! plus the stored body, never the inflated size.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::{
    CodecError, DATAGRAM_PREFIX_LEN, HEADER_LEN, MARKER_RAW, MARKER_ZLIB, MAX_PAYLOAD_LEN,
};

/// Parsed reliable-channel frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: i32,
    pub stored_len: usize,
}

impl FrameHeader {
    /// Parses a header from exactly [`HEADER_LEN`] bytes, rejecting
    /// negative or oversized declared lengths.
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self, CodecError> {
        let kind = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let raw_len = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if raw_len < 0 {
            return Err(CodecError::NegativeLength(raw_len));
        }
        let stored_len = raw_len as usize;
        if stored_len > MAX_PAYLOAD_LEN {
            return Err(CodecError::OversizedPayload(raw_len as i64));
        }
        Ok(Self { kind, stored_len })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.kind.to_le_bytes());
        out.extend_from_slice(&(self.stored_len as i32).to_le_bytes());
    }
}

/// Converts a plain payload into its stored form: `[marker, body...]`.
///
/// Compression is only kept when it actually shrinks the stored form;
/// otherwise the raw fallback is used. An empty payload stays empty with
/// no marker at all.
pub fn encode_payload(payload: &[u8]) -> Vec<u8> {
    if payload.is_empty() {
        return Vec::new();
    }
    if let Some(compressed) = try_compress(payload) {
        if compressed.len() + 1 < payload.len() + 1 {
            let mut stored = Vec::with_capacity(compressed.len() + 1);
            stored.push(MARKER_ZLIB);
            stored.extend_from_slice(&compressed);
            return stored;
        }
    }
    let mut stored = Vec::with_capacity(payload.len() + 1);
    stored.push(MARKER_RAW);
    stored.extend_from_slice(payload);
    stored
}

fn try_compress(payload: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(payload.len() / 2 + 16),
        Compression::fast(),
    );
    encoder.write_all(payload).ok()?;
    encoder.finish().ok()
}

/// Recovers the plain payload from its stored form.
pub fn decode_payload(stored: &[u8]) -> Result<Vec<u8>, CodecError> {
    let (marker, body) = match stored.split_first() {
        None => return Ok(Vec::new()),
        Some(split) => split,
    };
    match *marker {
        MARKER_RAW => Ok(body.to_vec()),
        MARKER_ZLIB => {
            let mut out = Vec::with_capacity(body.len() * 2);
            let mut decoder = ZlibDecoder::new(body).take(MAX_PAYLOAD_LEN as u64 + 1);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| CodecError::Decompress(e.to_string()))?;
            if out.len() > MAX_PAYLOAD_LEN {
                return Err(CodecError::OversizedPayload(out.len() as i64));
            }
            Ok(out)
        }
        other => Err(CodecError::UnknownMarker(other)),
    }
}

/// Builds a complete reliable-channel frame ready for the transport.
pub fn encode_frame(kind: i32, payload: &[u8]) -> Vec<u8> {
    let stored = encode_payload(payload);
    let mut frame = Vec::with_capacity(HEADER_LEN + stored.len());
    FrameHeader {
        kind,
        stored_len: stored.len(),
    }
    .write_to(&mut frame);
    frame.extend_from_slice(&stored);
    frame
}

/// Splits a complete frame back into kind and plain payload. Used by tests
/// and by the datagram path, which receives whole frames in one read.
pub fn decode_frame(frame: &[u8]) -> Result<(i32, Vec<u8>), CodecError> {
    if frame.len() < HEADER_LEN {
        return Err(CodecError::Truncated {
            needed: HEADER_LEN,
            have: frame.len(),
        });
    }
    let mut header_bytes = [0u8; HEADER_LEN];
    header_bytes.copy_from_slice(&frame[..HEADER_LEN]);
    let header = FrameHeader::parse(&header_bytes)?;
    let stored = &frame[HEADER_LEN..];
    if stored.len() < header.stored_len {
        return Err(CodecError::Truncated {
            needed: header.stored_len,
            have: stored.len(),
        });
    }
    let payload = decode_payload(&stored[..header.stored_len])?;
    Ok((header.kind, payload))
}

/// Builds a datagram: i32 sender index, then the normal frame.
pub fn encode_datagram(sender_index: i32, kind: i32, payload: &[u8]) -> Vec<u8> {
    let frame = encode_frame(kind, payload);
    let mut datagram = Vec::with_capacity(DATAGRAM_PREFIX_LEN + frame.len());
    datagram.extend_from_slice(&sender_index.to_le_bytes());
    datagram.extend_from_slice(&frame);
    datagram
}

/// Splits a datagram back into sender index, kind and plain payload.
pub fn decode_datagram(buf: &[u8]) -> Result<(i32, i32, Vec<u8>), CodecError> {
    if buf.len() < DATAGRAM_PREFIX_LEN {
        return Err(CodecError::Truncated {
            needed: DATAGRAM_PREFIX_LEN,
            have: buf.len(),
        });
    }
    let sender_index = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let (kind, payload) = decode_frame(&buf[DATAGRAM_PREFIX_LEN..])?;
    Ok((sender_index, kind, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_roundtrip_various_sizes() {
        // Compressible runs and incompressible pseudo-noise through both paths.
        let compressible: Vec<u8> = std::iter::repeat(b"subspace".iter().copied())
            .flatten()
            .take(4096)
            .collect();
        let incompressible: Vec<u8> = (0u32..4096)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();

        for payload in [
            Vec::new(),
            vec![0u8],
            vec![7u8; 3],
            compressible,
            incompressible,
        ] {
            let stored = encode_payload(&payload);
            let back = decode_payload(&stored).unwrap();
            assert_eq!(back, payload);
        }
    }

    #[test]
    fn compressible_payload_actually_shrinks() {
        let payload = vec![b'x'; 10_000];
        let stored = encode_payload(&payload);
        assert_eq!(stored[0], MARKER_ZLIB);
        assert!(stored.len() < payload.len());
    }

    #[test]
    fn tiny_payload_falls_back_to_raw() {
        let payload = vec![1u8, 2, 3];
        let stored = encode_payload(&payload);
        assert_eq!(stored[0], MARKER_RAW);
        assert_eq!(&stored[1..], &payload[..]);
    }

    #[test]
    fn empty_payload_has_no_marker() {
        assert!(encode_payload(&[]).is_empty());
        assert!(decode_payload(&[]).unwrap().is_empty());
    }

    #[test]
    fn unknown_marker_is_rejected() {
        assert!(matches!(
            decode_payload(&[0x42, 1, 2]),
            Err(CodecError::UnknownMarker(0x42))
        ));
    }

    #[test]
    fn header_rejects_oversized_length() {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[..4].copy_from_slice(&5i32.to_le_bytes());
        bytes[4..].copy_from_slice(&((MAX_PAYLOAD_LEN as i32) + 1).to_le_bytes());
        assert!(matches!(
            FrameHeader::parse(&bytes),
            Err(CodecError::OversizedPayload(_))
        ));
    }

    #[test]
    fn header_rejects_negative_length() {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[4..].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(
            FrameHeader::parse(&bytes),
            Err(CodecError::NegativeLength(-1))
        ));
    }

    #[test]
    fn frame_roundtrip() {
        let payload = b"tick probe payload".to_vec();
        let frame = encode_frame(11, &payload);
        let (kind, back) = decode_frame(&frame).unwrap();
        assert_eq!(kind, 11);
        assert_eq!(back, payload);
    }

    #[test]
    fn datagram_roundtrip_carries_sender_index() {
        let datagram = encode_datagram(42, 11, &[9, 9, 9]);
        let (sender, kind, payload) = decode_datagram(&datagram).unwrap();
        assert_eq!(sender, 42);
        assert_eq!(kind, 11);
        assert_eq!(payload, vec![9, 9, 9]);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let frame = encode_frame(3, b"hello there, server");
        assert!(decode_frame(&frame[..frame.len() - 2]).is_err());
        assert!(decode_frame(&frame[..4]).is_err());
    }
}
