// Big-endian byte reader/writer helpers shared by all packet codecs

use super::{PacketError, Result};
use crate::crypto::Hash256;

/// Cursor over an input buffer. Every read checks the remaining length.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(PacketError::Truncated {
                need: self.pos + len,
                got: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash256> {
        Ok(Hash256(self.read_array()?))
    }

    /// Read a u16 length prefix followed by that many bytes
    pub fn read_u16_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }

    /// Fail if input is left over
    pub fn finish(self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(PacketError::TrailingBytes(n)),
        }
    }
}

pub fn put_u16_prefixed(out: &mut Vec<u8>, data: &[u8], field: &'static str) -> Result<()> {
    let len = u16::try_from(data.len()).map_err(|_| PacketError::TooLarge {
        field,
        len: data.len(),
        max: u16::MAX as usize,
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

pub fn put_u32_prefixed(out: &mut Vec<u8>, data: &[u8], field: &'static str) -> Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| PacketError::TooLarge {
        field,
        len: data.len(),
        max: u32::MAX as usize,
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_sequence() {
        let mut data = vec![7u8];
        data.extend_from_slice(&0x0102u16.to_be_bytes());
        data.extend_from_slice(&0x03040506u32.to_be_bytes());
        data.extend_from_slice(&9u64.to_be_bytes());
        let mut reader = Reader::new(&data);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_u16().unwrap(), 0x0102);
        assert_eq!(reader.read_u32().unwrap(), 0x03040506);
        assert_eq!(reader.read_u64().unwrap(), 9);
        reader.finish().unwrap();
    }

    #[test]
    fn test_truncated_read() {
        let mut reader = Reader::new(&[1, 2, 3]);
        assert!(matches!(
            reader.read_u32(),
            Err(PacketError::Truncated { need: 4, got: 3 })
        ));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut reader = Reader::new(&[1, 2, 3]);
        reader.read_u8().unwrap();
        assert!(matches!(reader.finish(), Err(PacketError::TrailingBytes(2))));
    }

    #[test]
    fn test_prefixed_roundtrip_and_limit() {
        let mut out = Vec::new();
        put_u16_prefixed(&mut out, b"hello", "payload").unwrap();
        let mut reader = Reader::new(&out);
        assert_eq!(reader.read_u16_prefixed().unwrap(), b"hello");

        let big = vec![0u8; 70_000];
        assert!(matches!(
            put_u16_prefixed(&mut Vec::new(), &big, "payload"),
            Err(PacketError::TooLarge { .. })
        ));
    }
}
