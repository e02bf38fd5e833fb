// LZ4 compression of the email byte stream
//
// Stream layout: [1 byte tag][body], tag 0 = raw, 1 = lz4 with size prepended.
// Compression is only used when it actually makes the stream smaller.

use super::{EmailError, Result};

pub const TAG_RAW: u8 = 0;
pub const TAG_LZ4: u8 = 1;

/// Produce a tagged stream, compressing only if that shrinks it
pub fn encode(data: &[u8]) -> Vec<u8> {
    let compressed = lz4_flex::compress_prepend_size(data);
    let (tag, body) = if compressed.len() < data.len() {
        (TAG_LZ4, compressed.as_slice())
    } else {
        (TAG_RAW, data)
    };
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(tag);
    out.extend_from_slice(body);
    out
}

/// Inverse of `encode`
pub fn decode(stream: &[u8]) -> Result<Vec<u8>> {
    let (&tag, body) = stream
        .split_first()
        .ok_or_else(|| EmailError::Decompression("empty stream".to_string()))?;
    match tag {
        TAG_RAW => Ok(body.to_vec()),
        TAG_LZ4 => lz4_flex::decompress_size_prepended(body)
            .map_err(|e| EmailError::Decompression(e.to_string())),
        other => Err(EmailError::Decompression(format!(
            "unknown compression tag {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repetitive_data_is_compressed() {
        let original = "AAAAAABBBBBBCCCCCCDDDDDD".repeat(100);
        let stream = encode(original.as_bytes());
        assert_eq!(stream[0], TAG_LZ4);
        assert!(stream.len() < original.len() / 2);
        assert_eq!(decode(&stream).unwrap(), original.as_bytes());
    }

    #[test]
    fn test_short_data_stays_raw() {
        let stream = encode(b"A");
        assert_eq!(stream, vec![TAG_RAW, b'A']);
        assert_eq!(decode(&stream).unwrap(), b"A");
    }

    #[test]
    fn test_empty_data() {
        let stream = encode(b"");
        assert_eq!(stream, vec![TAG_RAW]);
        assert!(decode(&stream).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_streams() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[7, 1, 2]).is_err());
        assert!(decode(&[TAG_LZ4, 10, 0, 0, 0, 0xff]).is_err());
    }
}
