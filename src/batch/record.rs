use crate::coding::{get_length_prefixed_slice, get_varint32};
use crate::error::{Error, Result};

/// One-byte record tag. The values are part of the WAL format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Deletion = 0x0,
    Value = 0x1,
    Merge = 0x2,
    LogData = 0x3,
    ColumnFamilyDeletion = 0x4,
    ColumnFamilyValue = 0x5,
    ColumnFamilyMerge = 0x6,
    SingleDeletion = 0x7,
    ColumnFamilySingleDeletion = 0x8,
    BeginPrepareXid = 0x9,
    EndPrepareXid = 0xA,
    CommitXid = 0xB,
    RollbackXid = 0xC,
    Noop = 0xD,
    ColumnFamilyRangeDeletion = 0xE,
    RangeDeletion = 0xF,
    ColumnFamilyBlobIndex = 0x10,
    BlobIndex = 0x11,
    BeginPersistedPrepareXid = 0x12,
    BeginUnprepareXid = 0x13,
}

impl TryFrom<u8> for Tag {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self> {
        let tag = match byte {
            0x0 => Tag::Deletion,
            0x1 => Tag::Value,
            0x2 => Tag::Merge,
            0x3 => Tag::LogData,
            0x4 => Tag::ColumnFamilyDeletion,
            0x5 => Tag::ColumnFamilyValue,
            0x6 => Tag::ColumnFamilyMerge,
            0x7 => Tag::SingleDeletion,
            0x8 => Tag::ColumnFamilySingleDeletion,
            0x9 => Tag::BeginPrepareXid,
            0xA => Tag::EndPrepareXid,
            0xB => Tag::CommitXid,
            0xC => Tag::RollbackXid,
            0xD => Tag::Noop,
            0xE => Tag::ColumnFamilyRangeDeletion,
            0xF => Tag::RangeDeletion,
            0x10 => Tag::ColumnFamilyBlobIndex,
            0x11 => Tag::BlobIndex,
            0x12 => Tag::BeginPersistedPrepareXid,
            0x13 => Tag::BeginUnprepareXid,
            _ => return Err(Error::Corruption("unknown WriteBatch tag".into())),
        };
        Ok(tag)
    }
}

/// Flavor of a begin-prepare marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareKind {
    /// Written by write-committed transactions.
    Committed,
    /// The prepared data is also persisted in the memtable.
    Persisted,
    /// Written by transactions that flush unprepared data.
    Unprepared,
}

/// A decoded record borrowing from the batch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record<'a> {
    Put { cf: u32, key: &'a [u8], value: &'a [u8] },
    Delete { cf: u32, key: &'a [u8] },
    SingleDelete { cf: u32, key: &'a [u8] },
    DeleteRange { cf: u32, begin: &'a [u8], end: &'a [u8] },
    Merge { cf: u32, key: &'a [u8], value: &'a [u8] },
    BlobIndex { cf: u32, key: &'a [u8], value: &'a [u8] },
    LogData(&'a [u8]),
    BeginPrepare(PrepareKind),
    EndPrepare(&'a [u8]),
    Commit(&'a [u8]),
    Rollback(&'a [u8]),
    Noop,
}

fn column_family(input: &mut &[u8], what: &str) -> Result<u32> {
    get_varint32(input).ok_or_else(|| Error::Corruption(format!("bad WriteBatch {}", what)))
}

fn slice<'a>(input: &mut &'a [u8], what: &str) -> Result<&'a [u8]> {
    get_length_prefixed_slice(input).ok_or_else(|| Error::Corruption(format!("bad WriteBatch {}", what)))
}

fn xid<'a>(input: &mut &'a [u8], what: &str) -> Result<&'a [u8]> {
    get_length_prefixed_slice(input).ok_or_else(|| Error::Corruption(format!("bad {} XID", what)))
}

/// Decodes the record at the front of `input` and advances past it.
pub fn read_record<'a>(input: &mut &'a [u8]) -> Result<Record<'a>> {
    let (&byte, rest) = input
        .split_first()
        .ok_or_else(|| Error::Corruption("unexpected end of WriteBatch".into()))?;
    *input = rest;

    let record = match Tag::try_from(byte)? {
        tag @ (Tag::Value | Tag::ColumnFamilyValue) => {
            let cf = match tag {
                Tag::ColumnFamilyValue => column_family(input, "Put")?,
                _ => 0,
            };
            let key = slice(input, "Put")?;
            let value = slice(input, "Put")?;
            Record::Put { cf, key, value }
        }
        tag @ (Tag::Deletion
        | Tag::SingleDeletion
        | Tag::ColumnFamilyDeletion
        | Tag::ColumnFamilySingleDeletion) => {
            let cf = match tag {
                Tag::ColumnFamilyDeletion | Tag::ColumnFamilySingleDeletion => {
                    column_family(input, "Delete")?
                }
                _ => 0,
            };
            let key = slice(input, "Delete")?;
            match tag {
                Tag::Deletion | Tag::ColumnFamilyDeletion => Record::Delete { cf, key },
                _ => Record::SingleDelete { cf, key },
            }
        }
        tag @ (Tag::RangeDeletion | Tag::ColumnFamilyRangeDeletion) => {
            let cf = match tag {
                Tag::ColumnFamilyRangeDeletion => column_family(input, "DeleteRange")?,
                _ => 0,
            };
            let begin = slice(input, "DeleteRange")?;
            let end = slice(input, "DeleteRange")?;
            Record::DeleteRange { cf, begin, end }
        }
        tag @ (Tag::Merge | Tag::ColumnFamilyMerge) => {
            let cf = match tag {
                Tag::ColumnFamilyMerge => column_family(input, "Merge")?,
                _ => 0,
            };
            let key = slice(input, "Merge")?;
            let value = slice(input, "Merge")?;
            Record::Merge { cf, key, value }
        }
        tag @ (Tag::BlobIndex | Tag::ColumnFamilyBlobIndex) => {
            let cf = match tag {
                Tag::ColumnFamilyBlobIndex => column_family(input, "BlobIndex")?,
                _ => 0,
            };
            let key = slice(input, "BlobIndex")?;
            let value = slice(input, "BlobIndex")?;
            Record::BlobIndex { cf, key, value }
        }
        Tag::LogData => Record::LogData(slice(input, "Blob")?),
        Tag::Noop => Record::Noop,
        Tag::BeginPrepareXid => Record::BeginPrepare(PrepareKind::Committed),
        Tag::BeginPersistedPrepareXid => Record::BeginPrepare(PrepareKind::Persisted),
        Tag::BeginUnprepareXid => Record::BeginPrepare(PrepareKind::Unprepared),
        Tag::EndPrepareXid => Record::EndPrepare(xid(input, "EndPrepare")?),
        Tag::CommitXid => Record::Commit(xid(input, "Commit")?),
        Tag::RollbackXid => Record::Rollback(xid(input, "Rollback")?),
    };
    Ok(record)
}
