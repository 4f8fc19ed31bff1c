use super::record::{read_record, PrepareKind, Record};
use super::HEADER_SIZE;
use crate::error::{Error, Result};

/// Callbacks invoked by `WriteBatch::iterate`, one per record tag.
///
/// Data methods that are not overridden reject the record, so a handler only
/// accepts the operations it knows how to process. `put_cf` and friends on
/// the default column family fall back to the column-family-less variants.
pub trait Handler {
    fn put_cf(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<()> {
        if cf == 0 {
            self.put(key, value);
            return Ok(());
        }
        Err(Error::InvalidArgument(
            "non-default column family and PutCF not implemented".into(),
        ))
    }

    fn put(&mut self, _key: &[u8], _value: &[u8]) {}

    fn delete_cf(&mut self, cf: u32, key: &[u8]) -> Result<()> {
        if cf == 0 {
            self.delete(key);
            return Ok(());
        }
        Err(Error::InvalidArgument(
            "non-default column family and DeleteCF not implemented".into(),
        ))
    }

    fn delete(&mut self, _key: &[u8]) {}

    fn single_delete_cf(&mut self, cf: u32, key: &[u8]) -> Result<()> {
        if cf == 0 {
            self.single_delete(key);
            return Ok(());
        }
        Err(Error::InvalidArgument(
            "non-default column family and SingleDeleteCF not implemented".into(),
        ))
    }

    fn single_delete(&mut self, _key: &[u8]) {}

    fn delete_range_cf(&mut self, _cf: u32, _begin: &[u8], _end: &[u8]) -> Result<()> {
        Err(Error::InvalidArgument("DeleteRangeCF not implemented".into()))
    }

    fn merge_cf(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<()> {
        if cf == 0 {
            self.merge(key, value);
            return Ok(());
        }
        Err(Error::InvalidArgument(
            "non-default column family and MergeCF not implemented".into(),
        ))
    }

    fn merge(&mut self, _key: &[u8], _value: &[u8]) {}

    fn put_blob_index_cf(&mut self, _cf: u32, _key: &[u8], _value: &[u8]) -> Result<()> {
        Err(Error::InvalidArgument("PutBlobIndexCF not implemented".into()))
    }

    /// Opaque data that is logged but never applied.
    fn log_data(&mut self, _blob: &[u8]) {}

    fn mark_begin_prepare(&mut self, _unprepared: bool) -> Result<()> {
        Err(Error::InvalidArgument(
            "MarkBeginPrepare() handler not defined.".into(),
        ))
    }

    fn mark_end_prepare(&mut self, _xid: &[u8]) -> Result<()> {
        Err(Error::InvalidArgument("MarkEndPrepare() handler not defined.".into()))
    }

    /// `empty_batch` is true when nothing has been seen since the previous
    /// batch boundary.
    fn mark_noop(&mut self, _empty_batch: bool) -> Result<()> {
        Err(Error::InvalidArgument("MarkNoop() handler not defined.".into()))
    }

    fn mark_commit(&mut self, _xid: &[u8]) -> Result<()> {
        Err(Error::InvalidArgument("MarkCommit() handler not defined.".into()))
    }

    fn mark_rollback(&mut self, _xid: &[u8]) -> Result<()> {
        Err(Error::InvalidArgument("MarkRollback() handler not defined.".into()))
    }

    /// Checked before every record; returning false stops the iteration.
    fn should_continue(&mut self) -> bool {
        true
    }

    /// Write-committed transactions log their data at commit time.
    fn write_after_commit(&self) -> bool {
        true
    }

    fn write_before_prepare(&self) -> bool {
        false
    }
}

/// Replays the records in `contents[begin..end]` into `handler`.
///
/// The record count is only verified when the range covers the whole batch
/// and the handler did not stop early.
pub(crate) fn iterate(
    contents: &[u8],
    handler: &mut dyn Handler,
    begin: usize,
    end: usize,
) -> Result<()> {
    if begin > contents.len() || end > contents.len() || end < begin {
        return Err(Error::Corruption(
            "Invalid start/end bounds for Iterate".into(),
        ));
    }
    let mut input = &contents[begin..end];
    let whole_batch = begin == HEADER_SIZE && end == contents.len();

    // A sub-batch may start with a noop; it only counts as a boundary when
    // something was seen since the previous one.
    let mut empty_batch = true;
    let mut found: u32 = 0;
    let mut retry: Option<Record<'_>> = None;
    let mut handler_continue = true;

    while !input.is_empty() || retry.is_some() {
        handler_continue = handler.should_continue();
        if !handler_continue {
            break;
        }

        let (record, last_was_try_again) = match retry.take() {
            Some(record) => (record, true),
            None => (read_record(&mut input)?, false),
        };

        let status = dispatch(handler, record, &mut empty_batch, &mut found);
        match status {
            Err(Error::TryAgain(_)) if last_was_try_again => {
                return Err(Error::Corruption(
                    "two consecutive TryAgain in WriteBatch handler; this is either a software bug or data corruption."
                        .into(),
                ));
            }
            Err(Error::TryAgain(_)) => retry = Some(record),
            Err(e) => return Err(e),
            Ok(()) => {}
        }
    }

    if handler_continue && whole_batch && found != super::decode_count(contents) {
        return Err(Error::Corruption("WriteBatch has wrong count".into()));
    }
    Ok(())
}

fn dispatch(
    handler: &mut dyn Handler,
    record: Record<'_>,
    empty_batch: &mut bool,
    found: &mut u32,
) -> Result<()> {
    let counted = |result: Result<()>, empty: &mut bool, found: &mut u32| {
        if result.is_ok() {
            *empty = false;
            *found += 1;
        }
        result
    };

    match record {
        Record::Put { cf, key, value } => counted(handler.put_cf(cf, key, value), empty_batch, found),
        Record::Delete { cf, key } => counted(handler.delete_cf(cf, key), empty_batch, found),
        Record::SingleDelete { cf, key } => {
            counted(handler.single_delete_cf(cf, key), empty_batch, found)
        }
        Record::DeleteRange { cf, begin, end } => {
            counted(handler.delete_range_cf(cf, begin, end), empty_batch, found)
        }
        Record::Merge { cf, key, value } => counted(handler.merge_cf(cf, key, value), empty_batch, found),
        Record::BlobIndex { cf, key, value } => {
            let result = handler.put_blob_index_cf(cf, key, value);
            if result.is_ok() {
                *found += 1;
            }
            result
        }
        Record::LogData(blob) => {
            handler.log_data(blob);
            // A batch holding nothing but log data is still a batch.
            *empty_batch = false;
            Ok(())
        }
        Record::BeginPrepare(kind) => {
            let unprepared = kind == PrepareKind::Unprepared;
            handler.mark_begin_prepare(unprepared)?;
            *empty_batch = false;
            check_write_policy(handler, kind)
        }
        Record::EndPrepare(xid) => {
            let result = handler.mark_end_prepare(xid);
            *empty_batch = true;
            result
        }
        Record::Commit(xid) => {
            let result = handler.mark_commit(xid);
            *empty_batch = true;
            result
        }
        Record::Rollback(xid) => {
            let result = handler.mark_rollback(xid);
            *empty_batch = true;
            result
        }
        Record::Noop => {
            let result = handler.mark_noop(*empty_batch);
            *empty_batch = true;
            result
        }
    }
}

fn check_write_policy(handler: &dyn Handler, kind: PrepareKind) -> Result<()> {
    let after_commit = handler.write_after_commit();
    let before_prepare = handler.write_before_prepare();
    match kind {
        PrepareKind::Committed if !after_commit => Err(Error::NotSupported(
            "WriteCommitted txn tag when write_after_commit is disabled".into(),
        )),
        PrepareKind::Committed if before_prepare => Err(Error::NotSupported(
            "WriteCommitted txn tag when write_before_prepare is enabled".into(),
        )),
        PrepareKind::Persisted if after_commit => Err(Error::NotSupported(
            "WritePrepared txn tag when write_after_commit is enabled".into(),
        )),
        PrepareKind::Unprepared if after_commit => Err(Error::NotSupported(
            "WriteUnprepared txn tag when write_after_commit is enabled".into(),
        )),
        PrepareKind::Unprepared if !before_prepare => Err(Error::NotSupported(
            "WriteUnprepared txn tag when write_before_prepare is disabled".into(),
        )),
        _ => Ok(()),
    }
}
