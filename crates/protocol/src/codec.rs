//! Frame payload codec for the WebSocket transport.
//!
//! A frame's `image` field is the base64 of the zlib-compressed raster bytes.
//! The payload deliberately carries no `data:image/...` prefix — the client
//! prepends it after inflating, so the same codec serves jpeg and png frames.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

/// Fixed compression level. Level 6 is zlib's speed/ratio sweet spot; raster
/// bytes are already entropy-coded so higher levels buy almost nothing.
const COMPRESSION_LEVEL: u32 = 6;

/// A compressed, transport-ready frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// Base64 of the zlib-compressed image bytes.
    pub payload: String,
    /// Compressed size in bytes, before base64 expansion.
    pub byte_len: usize,
}

/// Compress raster bytes and base64-encode the result.
///
/// Never fails for well-formed input: the sink is an in-memory buffer, so the
/// only failure mode zlib reports (sink I/O) cannot occur.
pub fn encode(raw: &[u8]) -> Encoded {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::new(COMPRESSION_LEVEL));
    encoder
        .write_all(raw)
        .expect("writing to an in-memory buffer cannot fail");
    let compressed = encoder
        .finish()
        .expect("finishing an in-memory zlib stream cannot fail");

    Encoded {
        byte_len: compressed.len(),
        payload: STANDARD.encode(&compressed),
    }
}

/// Base64-decode and inflate a frame payload back to the raster bytes.
pub fn decode(payload: &str) -> Result<Vec<u8>, CodecError> {
    let compressed = STANDARD.decode(payload)?;
    let mut decoder = ZlibDecoder::new(compressed.as_slice());
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    Ok(raw)
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("inflate failed: {0}")]
    Inflate(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_plain_bytes() {
        let raw = b"\xff\xd8\xff\xe0 not a real jpeg but bytes all the same";
        let encoded = encode(raw);
        assert_eq!(decode(&encoded.payload).unwrap(), raw);
    }

    #[test]
    fn roundtrip_empty() {
        let encoded = encode(b"");
        assert!(encoded.byte_len > 0, "zlib emits a header even for empty input");
        assert_eq!(decode(&encoded.payload).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn roundtrip_all_byte_values() {
        let raw: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let encoded = encode(&raw);
        assert_eq!(decode(&encoded.payload).unwrap(), raw);
    }

    #[test]
    fn byte_len_matches_compressed_size() {
        let raw = vec![0u8; 10_000];
        let encoded = encode(&raw);
        let compressed = STANDARD.decode(&encoded.payload).unwrap();
        assert_eq!(encoded.byte_len, compressed.len());
        // 10KB of zeros compresses far below the input size
        assert!(encoded.byte_len < raw.len() / 10);
    }

    #[test]
    fn payload_is_plain_base64() {
        let encoded = encode(b"frame");
        assert!(!encoded.payload.starts_with("data:"));
        assert!(STANDARD.decode(&encoded.payload).is_ok());
    }

    #[test]
    fn decode_rejects_bad_base64() {
        match decode("not!!valid@@base64") {
            Err(CodecError::Base64(_)) => {}
            other => panic!("expected Base64 error, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_non_zlib_bytes() {
        let payload = STANDARD.encode(b"plain bytes, no zlib header");
        match decode(&payload) {
            Err(CodecError::Inflate(_)) => {}
            other => panic!("expected Inflate error, got {other:?}"),
        }
    }
}
