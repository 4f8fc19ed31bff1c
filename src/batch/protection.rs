//! Per-record integrity checksums.
//!
//! Each counted record gets a 64-bit checksum folded from its key, value,
//! operation tag and column family. The checksums live beside the encoded
//! buffer, so a bit flip in the buffer after construction is caught by
//! re-deriving them from the bytes.

use crc::{Crc, CRC_64_ECMA_182};

use super::record::{read_record, Record, Tag};
use crate::error::{Error, Result};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

// Distinct odd multipliers so swapping fields changes the checksum.
const KEY_SEED: u64 = 0x9e37_79b9_7f4a_7c15;
const VALUE_SEED: u64 = 0xc2b2_ae3d_27d4_eb4f;
const OP_SEED: u64 = 0x1656_67b1_9e37_79f9;
const CF_SEED: u64 = 0x85eb_ca77_c2b2_ae63;

pub fn entry_checksum(op: Tag, cf: u32, key: &[u8], value: &[u8]) -> u64 {
    CRC64.checksum(key).wrapping_mul(KEY_SEED)
        ^ CRC64.checksum(value).wrapping_mul(VALUE_SEED)
        ^ u64::from(op as u8).wrapping_mul(OP_SEED)
        ^ u64::from(cf).wrapping_mul(CF_SEED)
}

/// Checksums for every counted record of a batch, in encoding order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtectionInfo {
    entries: Vec<u64>,
}

impl ProtectionInfo {
    pub fn push(&mut self, op: Tag, cf: u32, key: &[u8], value: &[u8]) {
        self.entries.push(entry_checksum(op, cf, key, value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }

    pub fn extend(&mut self, other: &ProtectionInfo, count: usize) {
        self.entries.extend(other.entries.iter().take(count));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Re-derives the checksum of every counted record in `records` and compares
/// it with `info`.
pub(crate) fn verify(mut records: &[u8], info: &ProtectionInfo) -> Result<()> {
    let mut next = 0;
    while !records.is_empty() {
        let (op, cf, key, value) = match read_record(&mut records)? {
            Record::Put { cf, key, value } => (Tag::Value, cf, key, value),
            Record::Delete { cf, key } => (Tag::Deletion, cf, key, &[][..]),
            Record::SingleDelete { cf, key } => (Tag::SingleDeletion, cf, key, &[][..]),
            Record::DeleteRange { cf, begin, end } => (Tag::RangeDeletion, cf, begin, end),
            Record::Merge { cf, key, value } => (Tag::Merge, cf, key, value),
            Record::BlobIndex { cf, key, value } => (Tag::BlobIndex, cf, key, value),
            _ => continue,
        };
        match info.entries.get(next) {
            Some(&expected) if expected == entry_checksum(op, cf, key, value) => next += 1,
            _ => {
                return Err(Error::Corruption(format!(
                    "WriteBatch protection info mismatch at entry {}",
                    next
                )))
            }
        }
    }
    if next != info.entries.len() {
        return Err(Error::Corruption(
            "WriteBatch protection info count mismatch".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_depends_on_every_field() {
        let base = entry_checksum(Tag::Value, 0, b"key", b"value");
        assert_ne!(base, entry_checksum(Tag::Merge, 0, b"key", b"value"));
        assert_ne!(base, entry_checksum(Tag::Value, 1, b"key", b"value"));
        assert_ne!(base, entry_checksum(Tag::Value, 0, b"kez", b"value"));
        assert_ne!(base, entry_checksum(Tag::Value, 0, b"value", b"key"));
    }
}
