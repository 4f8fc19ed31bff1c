use crate::error::Result;

/// Folds merge operands into a value.
pub trait MergeOperator: Send + Sync {
    fn name(&self) -> &str;

    /// Combines `existing` (if any) with `operands`, oldest operand first.
    fn full_merge(&self, key: &[u8], existing: Option<&[u8]>, operands: &[&[u8]]) -> Result<Vec<u8>>;
}

/// Joins operands onto the existing value with a delimiter.
#[derive(Debug, Clone)]
pub struct StringAppendOperator {
    delimiter: u8,
}

impl StringAppendOperator {
    pub fn new(delimiter: u8) -> Self {
        Self { delimiter }
    }
}

impl MergeOperator for StringAppendOperator {
    fn name(&self) -> &str {
        "StringAppendOperator"
    }

    fn full_merge(&self, _key: &[u8], existing: Option<&[u8]>, operands: &[&[u8]]) -> Result<Vec<u8>> {
        let mut parts = existing.into_iter().chain(operands.iter().copied());
        let mut merged = parts.next().map(<[u8]>::to_vec).unwrap_or_default();
        for part in parts {
            merged.push(self.delimiter);
            merged.extend_from_slice(part);
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_append() -> Result<()> {
        let op = StringAppendOperator::new(b',');
        assert_eq!(op.full_merge(b"k", Some(b"a"), &[b"b", b"c"])?, b"a,b,c".to_vec());
        assert_eq!(op.full_merge(b"k", None, &[b"x"])?, b"x".to_vec());
        assert_eq!(op.full_merge(b"k", None, &[])?, Vec::<u8>::new());
        Ok(())
    }
}
