pub mod batch;
pub mod coding;
pub mod column_family;
pub mod config;
pub mod db;
pub mod error;
pub mod flock;
pub mod flush_scheduler;
pub mod inserter;
pub mod memtable;
pub mod merge;
pub mod prep_tracker;
pub mod scheduler;
pub mod wal;
pub mod write_buffer_manager;
pub mod write_controller;
pub mod write_thread;

pub use batch::{PrepareKind, WriteBatch};
pub use config::{DbConfig, WriteMode, WriteOptions};
pub use db::{Db, DiscardSink, FlushSink, FlushedTable, MemorySink, WriteOutcome};
pub use error::{Error, Result};
pub use inserter::RecoveredTransaction;
pub use merge::{MergeOperator, StringAppendOperator};
pub use wal::WalRecoveryMode;
pub use write_buffer_manager::WriteBufferManager;
pub use write_controller::WriteController;
pub use write_thread::{PreReleaseCallback, WriteCallback, WriteRequest};
