//! Rebuilds memtables from the WAL when a database is opened.
//!
//! Segments are replayed oldest first into fresh memtables. Nothing is
//! flushed while replaying; memtables that came back full are switched by
//! the first write after open.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use super::state::{AliveLog, CurrentLog, DbState, LogFile};
use crate::batch::{self, WriteBatch};
use crate::column_family::{ColumnFamilySet, DEFAULT_COLUMN_FAMILY_NAME};
use crate::config::DbConfig;
use crate::error::{Error, Result};
use crate::inserter::{sub_batch_count, InsertOptions, MemtableInserter, RecoveredTransactions};
use crate::memtable::Memtable;
use crate::wal::header::HEADER_SIZE;
use crate::wal::{list_log_numbers, log_file_path, sync_dir, wal_dir, LogReader, LogWriter, WalOptions, WalRecoveryMode};
use crate::write_buffer_manager::WriteBufferManager;

/// Everything `Db::open` needs to assemble a running database.
pub(crate) struct Recovered {
    pub state: DbState,
    pub current: CurrentLog,
    pub last_sequence: u64,
    pub next_memtable_id: u64,
}

struct MemtableFactory<'a> {
    config: &'a DbConfig,
    write_buffer_manager: &'a Arc<WriteBufferManager>,
    next_id: u64,
}

impl MemtableFactory<'_> {
    fn create(&mut self, log_number: u64) -> Arc<Memtable> {
        let id = self.next_id;
        self.next_id += 1;
        Arc::new(Memtable::new(
            id,
            log_number,
            self.config.write_buffer_size,
            Some(self.write_buffer_manager.clone()),
        ))
    }
}

/// Replays every WAL segment under `config.dir` and opens a new tail segment.
pub(crate) fn recover(config: &DbConfig, write_buffer_manager: &Arc<WriteBufferManager>) -> Result<Recovered> {
    let dir = &config.dir;
    fs::create_dir_all(wal_dir(dir))?;

    let numbers = list_log_numbers(dir)?;
    let new_log = numbers.last().map_or(1, |last| last + 1);
    let first_log = numbers.first().copied().unwrap_or(new_log);

    let mut factory = MemtableFactory {
        config,
        write_buffer_manager,
        next_id: 1,
    };
    let mut cfs = ColumnFamilySet::new(factory.create(first_log));
    for name in &config.column_families {
        if name != DEFAULT_COLUMN_FAMILY_NAME {
            cfs.create(name, factory.create(first_log))?;
        }
    }

    let mut recovered = RecoveredTransactions::new();
    let mut last_sequence = 0;
    let mut alive_logs = VecDeque::with_capacity(numbers.len() + 1);
    let mut stop_replay = false;

    for (i, &number) in numbers.iter().enumerate() {
        let path = log_file_path(dir, number);
        if stop_replay {
            tracing::warn!(log_number = number, "Dropping WAL segment after point of corruption");
            fs::remove_file(&path)?;
            continue;
        }

        let is_last = i + 1 == numbers.len();
        let mut reader = match LogReader::open(&path, config.wal_recovery_mode) {
            Ok(reader) => reader,
            // A crash while creating the newest segment can leave its header torn.
            Err(Error::Corruption(msg))
                if is_last && config.wal_recovery_mode != WalRecoveryMode::AbsoluteConsistency =>
            {
                tracing::warn!(log_number = number, "Removing WAL segment with damaged header: {}", msg);
                fs::remove_file(&path)?;
                continue;
            }
            Err(e) => return Err(e),
        };
        last_sequence = last_sequence.max(reader.start_sequence());

        let memtables = cfs.memtables();
        let opts = InsertOptions {
            ignore_missing_column_families: true,
            recovering_log_number: number,
            concurrent_memtable_writes: false,
            seq_per_batch: config.seq_per_batch,
            inplace_update_support: config.inplace_update_support,
            supports_range_deletion: config.flush_sink.supports_range_deletion(),
        };

        let mut records = 0usize;
        while let Some(record) = reader.next() {
            let record = record?;
            if record.len() < batch::HEADER_SIZE {
                let err = Error::Corruption(format!("log record too small in log {}", number));
                if config.wal_recovery_mode == WalRecoveryMode::SkipAnyCorruptedRecords {
                    tracing::warn!(log_number = number, "Skipping undersized record");
                    continue;
                }
                return Err(err);
            }

            let batch = WriteBatch::from_data(record);
            let sequence = batch.sequence();
            let checked = batch.check_arguments(
                opts.supports_range_deletion,
                config.merge_operator.is_some(),
            );
            let result = checked.and_then(|()| {
                let mut inserter = MemtableInserter::new(sequence, &memtables, opts)
                    .with_merge_operator(config.merge_operator.as_deref())
                    .with_recovered_transactions(&mut recovered);
                inserter.insert(&batch)?;
                inserter.finish_batch(sequence);
                Ok(inserter.sequence())
            });
            let next_sequence = match result {
                Ok(next) => next,
                Err(e) if e.is_corruption() && config.wal_recovery_mode == WalRecoveryMode::SkipAnyCorruptedRecords => {
                    tracing::warn!(log_number = number, sequence, error = %e, "Skipping malformed batch");
                    continue;
                }
                // The write failed when it was made; its sequences stay used.
                Err(e @ (Error::InvalidArgument(_) | Error::NotSupported(_))) => {
                    tracing::warn!(log_number = number, sequence, error = %e, "Skipping rejected batch");
                    sequence + consumed_sequences(&batch, config.seq_per_batch)
                }
                Err(e) => return Err(e),
            };
            last_sequence = last_sequence.max(next_sequence.saturating_sub(1));
            records += 1;
        }

        if reader.stopped_early() {
            truncate_segment(&path, reader.valid_len())?;
            if config.wal_recovery_mode == WalRecoveryMode::PointInTimeRecovery {
                stop_replay = true;
            }
        }

        let size = fs::metadata(&path)?.len().saturating_sub(HEADER_SIZE as u64);
        tracing::info!(
            log_number = number,
            records,
            skipped = reader.skipped(),
            last_sequence,
            "Replayed WAL segment"
        );
        alive_logs.push_back(AliveLog {
            number,
            size,
            getting_flushed: false,
        });
    }

    let opts = WalOptions {
        buffer_size: config.wal_buffer_size,
        manual_flush: config.manual_wal_flush,
    };
    let writer = Arc::new(Mutex::new(LogWriter::create(dir, new_log, last_sequence, &opts)?));
    sync_dir(&wal_dir(dir))?;

    // Families with nothing to replay start over at the new segment.
    for cfd in cfs.iter_mut() {
        if cfd.mem().is_empty() {
            cfd.set_log_number(new_log);
        }
    }
    alive_logs.push_back(AliveLog {
        number: new_log,
        size: 0,
        getting_flushed: false,
    });

    tracing::info!(
        segments = numbers.len(),
        last_sequence,
        log_number = new_log,
        recovered_transactions = recovered.len(),
        "WAL recovery complete"
    );

    let mut logs = VecDeque::new();
    logs.push_back(LogFile {
        number: new_log,
        writer: writer.clone(),
        getting_synced: false,
    });

    Ok(Recovered {
        state: DbState {
            cfs,
            logs,
            alive_logs,
            logfile_number: new_log,
            next_file_number: new_log + 1,
            log_dir_synced: true,
            bg_error: None,
            recovered,
            unable_to_release_oldest_log: false,
            logs_to_free: Vec::new(),
            stop_token: None,
            delay_token: None,
        },
        current: CurrentLog {
            number: new_log,
            writer,
            empty: true,
            bytes: 0,
        },
        last_sequence,
        next_memtable_id: factory.next_id,
    })
}

/// Cuts a segment back to its last intact record.
fn consumed_sequences(batch: &WriteBatch, seq_per_batch: bool) -> u64 {
    if seq_per_batch {
        sub_batch_count(batch).unwrap_or(1)
    } else {
        u64::from(batch.count())
    }
}

fn truncate_segment(path: &Path, valid_len: u64) -> Result<()> {
    let file = File::options().write(true).open(path)?;
    if file.metadata()?.len() > valid_len {
        tracing::warn!(path = ?path, valid_len, "Truncating WAL segment");
        file.set_len(valid_len)?;
        file.sync_all()?;
    }
    Ok(())
}
