use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};

pub const HEADER_SIZE: usize = 64;

const MAGIC: &[u8; 8] = b"CINDERWL";
const VERSION: u32 = 1;

/// Fixed-size prefix of every WAL segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub magic: [u8; 8],
    pub version: u32,
    pub log_number: u64,
    /// Last sequence published when the segment was created. Recovery
    /// resumes from here when every older segment has been purged.
    pub start_sequence: u64,
}

impl Header {
    pub fn new(log_number: u64, start_sequence: u64) -> Self {
        Header {
            magic: *MAGIC,
            version: VERSION,
            log_number,
            start_sequence,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC {
            return Err(Error::Corruption("bad WAL magic".into()));
        }
        if self.version != VERSION {
            return Err(Error::NotSupported(format!(
                "WAL format version {}",
                self.version
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        BigEndian::write_u32(&mut buf[8..12], self.version);
        BigEndian::write_u64(&mut buf[12..20], self.log_number);
        BigEndian::write_u64(&mut buf[20..28], self.start_sequence);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Corruption("truncated WAL header".into()));
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);
        let header = Self {
            magic,
            version: BigEndian::read_u32(&buf[8..12]),
            log_number: BigEndian::read_u64(&buf[12..20]),
            start_sequence: BigEndian::read_u64(&buf[20..28]),
        };
        header.validate()?;
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encoding_decoding() {
        let header = Header::new(42, 1000);

        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);

        let decoded = Header::decode(&encoded).expect("Failed to decode Header");
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_header_magic_validation() {
        let mut buf = Header::new(1, 0).encode();
        buf[0..8].copy_from_slice(b"INVALID!");

        let result = Header::decode(&buf);
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn test_header_version_validation() {
        let mut buf = Header::new(1, 0).encode();
        BigEndian::write_u32(&mut buf[8..12], 999);

        let result = Header::decode(&buf);
        assert!(matches!(result, Err(Error::NotSupported(_))));
    }

    #[test]
    fn test_header_decoding_invalid_length() {
        let invalid_data = [0u8; HEADER_SIZE - 2];
        assert!(Header::decode(&invalid_data).is_err());
    }
}
