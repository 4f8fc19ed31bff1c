use std::cmp::Ordering;

use crate::batch::Tag;

/// Operation stored with a memtable entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ValueKind {
    Deletion = 0x0,
    Value = 0x1,
    Merge = 0x2,
    SingleDeletion = 0x7,
    RangeDeletion = 0xF,
    BlobIndex = 0x11,
}

impl ValueKind {
    /// The record tag that carries this kind in a batch.
    pub fn tag(self) -> Tag {
        match self {
            ValueKind::Deletion => Tag::Deletion,
            ValueKind::Value => Tag::Value,
            ValueKind::Merge => Tag::Merge,
            ValueKind::SingleDeletion => Tag::SingleDeletion,
            ValueKind::RangeDeletion => Tag::RangeDeletion,
            ValueKind::BlobIndex => Tag::BlobIndex,
        }
    }

    pub fn is_deletion(self) -> bool {
        matches!(
            self,
            ValueKind::Deletion | ValueKind::SingleDeletion | ValueKind::RangeDeletion
        )
    }
}

/// Memtable key: user key ascending, then newest sequence first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InternalKey {
    pub user_key: Vec<u8>,
    pub sequence: u64,
    pub kind: ValueKind,
}

impl InternalKey {
    pub fn new(user_key: &[u8], sequence: u64, kind: ValueKind) -> Self {
        Self {
            user_key: user_key.to_vec(),
            sequence,
            kind,
        }
    }

    /// Smallest key for `user_key` visible at `sequence`.
    pub fn seek_key(user_key: &[u8], sequence: u64) -> Self {
        Self::new(user_key, sequence, ValueKind::BlobIndex)
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| other.kind.cmp(&self.kind))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        let mut keys = vec![
            InternalKey::new(b"b", 1, ValueKind::Value),
            InternalKey::new(b"a", 1, ValueKind::Value),
            InternalKey::new(b"a", 5, ValueKind::Deletion),
            InternalKey::new(b"a", 3, ValueKind::Merge),
        ];
        keys.sort();
        let order: Vec<_> = keys
            .iter()
            .map(|k| (k.user_key.clone(), k.sequence))
            .collect();
        assert_eq!(
            order,
            vec![
                (b"a".to_vec(), 5),
                (b"a".to_vec(), 3),
                (b"a".to_vec(), 1),
                (b"b".to_vec(), 1)
            ]
        );
    }

    #[test]
    fn test_seek_key_sorts_first_for_its_sequence() {
        let seek = InternalKey::seek_key(b"a", 3);
        assert!(seek <= InternalKey::new(b"a", 3, ValueKind::Value));
        assert!(seek < InternalKey::new(b"a", 2, ValueKind::BlobIndex));
        assert!(seek > InternalKey::new(b"a", 4, ValueKind::Deletion));
    }
}
