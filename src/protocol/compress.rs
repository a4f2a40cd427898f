use super::frame::{Frame, FrameHeader, HEADER_SIZE, MAX_BODY_SIZE, MessageType};
use crate::core::{DbError, Result};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};

/// Size of the uncompressed-length prefix inside a compressed body.
const SIZE_PREFIX: usize = 8;

/// Wraps a complete encoded frame into a compressed frame.
///
/// Layout: header(type 4) + uncompressed frame size (u64, little-endian)
/// + zlib stream of the original frame.
pub fn compress_frame(frame: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(frame)?;
    let deflated = encoder.finish()?;

    let header = FrameHeader::new(MessageType::Compressed, SIZE_PREFIX + deflated.len())?;
    let mut out = Vec::with_capacity(HEADER_SIZE + SIZE_PREFIX + deflated.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&(frame.len() as u64).to_le_bytes());
    out.extend_from_slice(&deflated);
    Ok(out)
}

/// Inflates the body of a compressed frame back into the inner frame.
pub fn decompress_body(body: &[u8]) -> Result<Frame> {
    if body.len() < SIZE_PREFIX {
        return Err(DbError::Protocol(
            "compressed body shorter than its size prefix".to_string(),
        ));
    }
    let mut prefix = [0u8; SIZE_PREFIX];
    prefix.copy_from_slice(&body[..SIZE_PREFIX]);
    let expected = u64::from_le_bytes(prefix);
    if expected > MAX_BODY_SIZE + HEADER_SIZE as u64 {
        return Err(DbError::Protocol(format!(
            "compressed frame inflates to {} bytes",
            expected
        )));
    }

    let mut inflated = Vec::with_capacity(expected as usize);
    ZlibDecoder::new(&body[SIZE_PREFIX..])
        .read_to_end(&mut inflated)
        .map_err(|e| DbError::Protocol(format!("cannot inflate frame: {}", e)))?;
    if inflated.len() as u64 != expected {
        return Err(DbError::Protocol(format!(
            "inflated {} bytes, header announced {}",
            inflated.len(),
            expected
        )));
    }

    let frame = Frame::from_bytes(&inflated)?;
    if frame.msg_type() == MessageType::Compressed {
        return Err(DbError::Protocol("nested compressed frame".to_string()));
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::encode_frame;

    #[test]
    fn test_compressed_frame_restores_inner_frame() {
        let body = vec![7u8; 4096];
        let plain = encode_frame(MessageType::Message, &body).unwrap();
        let packed = compress_frame(&plain).unwrap();
        assert!(packed.len() < plain.len());

        let outer = Frame::from_bytes(&packed).unwrap();
        assert_eq!(outer.msg_type(), MessageType::Compressed);

        let inner = decompress_body(&outer.body).unwrap();
        assert_eq!(inner.msg_type(), MessageType::Message);
        assert_eq!(inner.body, body);
    }

    #[test]
    fn test_size_mismatch_is_protocol_error() {
        let plain = encode_frame(MessageType::Message, b"abc").unwrap();
        let packed = compress_frame(&plain).unwrap();
        let mut outer = Frame::from_bytes(&packed).unwrap();
        outer.body[0] = outer.body[0].wrapping_add(1);

        assert!(matches!(
            decompress_body(&outer.body),
            Err(DbError::Protocol(_))
        ));
    }
}
