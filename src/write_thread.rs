//! Group commit scheduling.
//!
//! Concurrent writers queue up on a [`WriteThread`]. The writer at the front
//! of the queue becomes the group leader: it pulls in the compatible writers
//! queued right behind it, writes one WAL record for all of them and then
//! applies their batches, either by itself or by letting every member insert
//! its own batch in parallel. When the group is done the next writer in the
//! queue is promoted to leader.
//!
//! Each [`Writer`] moves through a small set of states:
//!
//! ```text
//! Init -> GroupLeader ------------------------------> Completed
//!      -> ParallelMemtableWriter -------------------> Completed
//!      -> MemtableWriterLeader (pipelined only) ----> Completed
//!      -> Completed (applied by the leader)
//! ```
//!
//! With pipelining enabled, WAL groups hand their writers over to a second
//! queue that applies them to the memtable, so the next WAL group can start
//! while the previous one is still being inserted.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::batch::WriteBatch;
use crate::config::WriteOptions;
use crate::db::Db;
use crate::error::{Error, Result};

/// Hook run by the group leader right before a write is committed.
pub trait WriteCallback: Send + Sync {
    /// Returning an error vetoes the write; nothing of it reaches the WAL or
    /// the memtable.
    fn callback(&self, db: &Db) -> Result<()>;

    /// Whether the write may share a group with other writers.
    fn allow_write_batching(&self) -> bool;
}

/// Hook run per writer once its sequence is known, after the WAL write and
/// before the memtable insert.
pub trait PreReleaseCallback: Send + Sync {
    /// `index` counts the callbacks of the group, `total` of them in all.
    fn callback(
        &self,
        sequence: u64,
        disable_memtable: bool,
        log_number: u64,
        index: usize,
        total: usize,
    ) -> Result<()>;
}

/// A batch plus the low-level knobs of a write.
///
/// Plain writes only need [`Db::write`]; this is for callers that want
/// callbacks, WAL-only writes or explicit sub-batch counts.
pub struct WriteRequest {
    pub(crate) batch: WriteBatch,
    pub(crate) callback: Option<Box<dyn WriteCallback>>,
    pub(crate) pre_release: Option<Box<dyn PreReleaseCallback>>,
    pub(crate) log_ref: u64,
    pub(crate) disable_memtable: bool,
    pub(crate) batch_cnt: u64,
}

impl WriteRequest {
    pub fn new(batch: WriteBatch) -> Self {
        Self {
            batch,
            callback: None,
            pre_release: None,
            log_ref: 0,
            disable_memtable: false,
            batch_cnt: 0,
        }
    }

    pub fn callback(mut self, callback: impl WriteCallback + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn pre_release_callback(mut self, callback: impl PreReleaseCallback + 'static) -> Self {
        self.pre_release = Some(Box::new(callback));
        self
    }

    /// WAL segment holding the prepared section this write commits.
    pub fn log_ref(mut self, log: u64) -> Self {
        self.log_ref = log;
        self
    }

    /// Write the WAL only.
    pub fn disable_memtable(mut self, disable: bool) -> Self {
        self.disable_memtable = disable;
        self
    }

    /// Sequences the batch consumes when one is used per sub-batch.
    pub fn batch_cnt(mut self, count: u64) -> Self {
        self.batch_cnt = count;
        self
    }
}

impl fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRequest")
            .field("count", &self.batch.count())
            .field("has_callback", &self.callback.is_some())
            .field("has_pre_release", &self.pre_release.is_some())
            .field("log_ref", &self.log_ref)
            .field("disable_memtable", &self.disable_memtable)
            .field("batch_cnt", &self.batch_cnt)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Init,
    GroupLeader,
    MemtableWriterLeader,
    ParallelMemtableWriter,
    Completed,
}

/// One pending write, shared between its own thread and the group leader.
pub struct Writer {
    pub(crate) batch: WriteBatch,
    pub(crate) sync: bool,
    pub(crate) no_slowdown: bool,
    pub(crate) disable_wal: bool,
    pub(crate) disable_memtable: bool,
    pub(crate) ignore_missing_column_families: bool,
    pub(crate) batch_cnt: u64,
    pub(crate) log_ref: u64,
    callback: Option<Box<dyn WriteCallback>>,
    pub(crate) pre_release: Option<Box<dyn PreReleaseCallback>>,
    /// Holds a queue position without carrying a batch.
    unbatched: bool,
    state: Mutex<WriterState>,
    state_cv: Condvar,
    sequence: AtomicU64,
    log_used: AtomicU64,
    status: Mutex<Option<Error>>,
    callback_status: Mutex<Option<Error>>,
    /// The group's owner keeps it alive until every member completed.
    group: Mutex<Weak<WriteGroup>>,
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("count", &self.batch.count())
            .field("sync", &self.sync)
            .field("no_slowdown", &self.no_slowdown)
            .field("disable_wal", &self.disable_wal)
            .field("disable_memtable", &self.disable_memtable)
            .field("state", &*self.state.lock())
            .field("sequence", &self.sequence())
            .finish_non_exhaustive()
    }
}

impl Writer {
    pub fn new(opts: &WriteOptions, request: WriteRequest) -> Self {
        Self {
            batch: request.batch,
            sync: opts.sync,
            no_slowdown: opts.no_slowdown,
            disable_wal: opts.disable_wal,
            disable_memtable: request.disable_memtable,
            ignore_missing_column_families: opts.ignore_missing_column_families,
            batch_cnt: request.batch_cnt,
            log_ref: request.log_ref,
            callback: request.callback,
            pre_release: request.pre_release,
            unbatched: false,
            state: Mutex::new(WriterState::Init),
            state_cv: Condvar::new(),
            sequence: AtomicU64::new(0),
            log_used: AtomicU64::new(0),
            status: Mutex::new(None),
            callback_status: Mutex::new(None),
            group: Mutex::new(Weak::new()),
        }
    }

    /// A placeholder used to gain exclusive use of a queue.
    pub fn unbatched() -> Self {
        let mut writer = Self::new(&WriteOptions::default(), WriteRequest::new(WriteBatch::new()));
        writer.unbatched = true;
        writer.disable_memtable = true;
        writer
    }

    pub fn state(&self) -> WriterState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: WriterState) {
        let mut current = self.state.lock();
        *current = state;
        self.state_cv.notify_all();
    }

    /// Blocks until the writer reaches a state accepted by `goal`.
    pub(crate) fn await_state(&self, goal: impl Fn(WriterState) -> bool) -> WriterState {
        let mut state = self.state.lock();
        while !goal(*state) {
            self.state_cv.wait(&mut state);
        }
        *state
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub(crate) fn set_sequence(&self, sequence: u64) {
        self.sequence.store(sequence, Ordering::Release);
    }

    pub fn log_used(&self) -> u64 {
        self.log_used.load(Ordering::Acquire)
    }

    pub(crate) fn set_log_used(&self, log: u64) {
        self.log_used.store(log, Ordering::Release);
    }

    pub(crate) fn status(&self) -> Option<Error> {
        self.status.lock().clone()
    }

    pub(crate) fn set_status(&self, status: Result<()>) {
        *self.status.lock() = status.err();
    }

    /// Records `err` unless the writer already failed.
    pub(crate) fn fail(&self, err: Error) {
        let mut status = self.status.lock();
        if status.is_none() {
            *status = Some(err);
        }
    }

    /// Runs the pre-commit callback once; false when it vetoed the write.
    pub(crate) fn check_callback(&self, db: &Db) -> bool {
        if let Some(callback) = &self.callback {
            if let Err(e) = callback.callback(db) {
                *self.callback_status.lock() = Some(e);
            }
        }
        !self.callback_failed()
    }

    pub(crate) fn callback_failed(&self) -> bool {
        self.callback_status.lock().is_some()
    }

    pub(crate) fn allows_batching(&self) -> bool {
        self.callback
            .as_ref()
            .map_or(true, |callback| callback.allow_write_batching())
    }

    pub(crate) fn should_write_to_memtable(&self) -> bool {
        self.status.lock().is_none() && !self.callback_failed() && !self.disable_memtable
    }

    /// What the caller of the write gets back.
    pub(crate) fn final_status(&self) -> Result<()> {
        if let Some(e) = self.callback_status.lock().clone() {
            return Err(e);
        }
        match self.status() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) fn group(&self) -> Option<Arc<WriteGroup>> {
        self.group.lock().upgrade()
    }

    fn set_group(&self, group: &Arc<WriteGroup>) {
        *self.group.lock() = Arc::downgrade(group);
    }
}

/// Writers committed together, leader first.
#[derive(Debug)]
pub struct WriteGroup {
    writers: Vec<Arc<Writer>>,
    last_sequence: AtomicU64,
    status: Mutex<Option<Error>>,
    running: AtomicUsize,
}

impl WriteGroup {
    fn new(writers: Vec<Arc<Writer>>) -> Self {
        Self {
            writers,
            last_sequence: AtomicU64::new(0),
            status: Mutex::new(None),
            running: AtomicUsize::new(0),
        }
    }

    pub fn leader(&self) -> &Arc<Writer> {
        &self.writers[0]
    }

    pub fn writers(&self) -> &[Arc<Writer>] {
        &self.writers
    }

    pub fn len(&self) -> usize {
        self.writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    pub fn set_last_sequence(&self, sequence: u64) {
        self.last_sequence.store(sequence, Ordering::Release);
    }

    pub fn status(&self) -> Result<()> {
        match self.status.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) fn set_status(&self, status: Result<()>) {
        if let Err(e) = status {
            let mut current = self.status.lock();
            if current.is_none() {
                *current = Some(e);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Queues {
    /// Writers waiting for, or taking part in, a WAL group. The front one is
    /// the current leader.
    writers: VecDeque<Arc<Writer>>,
    /// Writers waiting for their memtable insert when pipelining.
    memtable_writers: VecDeque<Arc<Writer>>,
    stalled: bool,
}

/// A queue of writers that commits them in groups.
#[derive(Debug)]
pub struct WriteThread {
    queues: Mutex<Queues>,
    stall_cv: Condvar,
    memtable_idle_cv: Condvar,
    max_group_size: usize,
    allow_concurrent_memtable_write: bool,
    enable_pipelined_write: bool,
}

impl WriteThread {
    pub fn new(
        max_group_size: usize,
        allow_concurrent_memtable_write: bool,
        enable_pipelined_write: bool,
    ) -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            stall_cv: Condvar::new(),
            memtable_idle_cv: Condvar::new(),
            max_group_size: max_group_size.max(1),
            allow_concurrent_memtable_write,
            enable_pipelined_write,
        }
    }

    /// Queues `w` and blocks until it leads a group, must insert its own
    /// batch, or was completed by someone else.
    pub fn join_batch_group(&self, w: &Arc<Writer>) -> WriterState {
        let is_leader = {
            let mut queues = self.queues.lock();
            while queues.stalled {
                if w.no_slowdown {
                    drop(queues);
                    w.set_status(Err(Error::Incomplete("Write stall".into())));
                    w.set_state(WriterState::Completed);
                    return WriterState::Completed;
                }
                self.stall_cv.wait(&mut queues);
            }
            queues.writers.push_back(w.clone());
            queues.writers.len() == 1
        };

        if is_leader {
            w.set_state(WriterState::GroupLeader);
            return WriterState::GroupLeader;
        }
        w.await_state(|state| {
            matches!(
                state,
                WriterState::GroupLeader
                    | WriterState::MemtableWriterLeader
                    | WriterState::ParallelMemtableWriter
                    | WriterState::Completed
            )
        })
    }

    /// Forms a group out of `leader` and the compatible writers queued right
    /// behind it. The group stops at the first writer that does not fit.
    pub fn enter_as_batch_group_leader(&self, leader: &Arc<Writer>) -> Arc<WriteGroup> {
        let queues = self.queues.lock();
        debug_assert!(queues
            .writers
            .front()
            .map_or(false, |front| Arc::ptr_eq(front, leader)));

        let leader_size = leader.batch.data_size();
        // Keep small writes from being slowed down by a large group.
        let max_size = if leader_size <= self.max_group_size / 8 {
            leader_size + self.max_group_size / 8
        } else {
            self.max_group_size
        };

        let mut writers = vec![leader.clone()];
        let mut size = leader_size;
        if !leader.unbatched && leader.allows_batching() {
            for w in queues.writers.iter().skip(1) {
                if w.sync && !leader.sync {
                    // A sync write must not ride on a non-sync leader.
                    break;
                }
                if w.no_slowdown != leader.no_slowdown || w.disable_wal != leader.disable_wal {
                    break;
                }
                if w.unbatched || !w.allows_batching() {
                    break;
                }
                let batch_size = w.batch.data_size();
                if size + batch_size > max_size {
                    break;
                }
                size += batch_size;
                writers.push(w.clone());
            }
        }
        drop(queues);

        let group = Arc::new(WriteGroup::new(writers));
        for w in group.writers() {
            w.set_group(&group);
        }
        tracing::debug!(size = group.len(), bytes = size, "Formed write group");
        group
    }

    /// Finishes a WAL group and promotes the next leader.
    ///
    /// Without pipelining every follower is completed here. With pipelining,
    /// members that still have to reach the memtable move to the memtable
    /// queue and the leader blocks until it has a memtable role or is done.
    pub fn exit_as_batch_group_leader(&self, group: &Arc<WriteGroup>, status: Result<()>) {
        let leader = group.leader().clone();
        group.set_status(status.clone());

        if self.enable_pipelined_write {
            let mut memtable_writers = Vec::with_capacity(group.len());
            for w in group.writers() {
                if let Err(e) = &status {
                    w.set_status(Err(e.clone()));
                }
                if w.should_write_to_memtable() {
                    memtable_writers.push(w.clone());
                } else if !Arc::ptr_eq(w, &leader) {
                    w.set_state(WriterState::Completed);
                }
            }
            let leader_done = !leader.should_write_to_memtable();

            {
                let mut queues = self.queues.lock();
                // Link to the memtable queue before waking the next WAL
                // leader, so memtable order follows WAL order.
                if !memtable_writers.is_empty() {
                    let was_idle = queues.memtable_writers.is_empty();
                    if was_idle {
                        memtable_writers[0].set_state(WriterState::MemtableWriterLeader);
                    }
                    queues.memtable_writers.extend(memtable_writers);
                }
                Self::pop_group(&mut queues, group);
                if let Some(next) = queues.writers.front() {
                    next.set_state(WriterState::GroupLeader);
                }
            }

            if leader_done {
                leader.set_state(WriterState::Completed);
            }
            leader.await_state(|state| {
                matches!(
                    state,
                    WriterState::MemtableWriterLeader
                        | WriterState::ParallelMemtableWriter
                        | WriterState::Completed
                )
            });
            return;
        }

        {
            let mut queues = self.queues.lock();
            Self::pop_group(&mut queues, group);
            if let Some(next) = queues.writers.front() {
                next.set_state(WriterState::GroupLeader);
            }
        }

        for w in group.writers().iter().skip(1) {
            if let Err(e) = &status {
                w.set_status(Err(e.clone()));
            }
            w.set_state(WriterState::Completed);
        }
    }

    fn pop_group(queues: &mut Queues, group: &WriteGroup) {
        for w in group.writers() {
            let front = queues.writers.pop_front();
            debug_assert!(front.map_or(false, |front| Arc::ptr_eq(&front, w)));
        }
    }

    /// Lets every member of `group` insert its own batch.
    pub fn launch_parallel_memtable_writers(&self, group: &Arc<WriteGroup>) {
        group.running.store(group.len(), Ordering::Release);
        for w in group.writers() {
            w.set_group(group);
            w.set_state(WriterState::ParallelMemtableWriter);
        }
    }

    /// Reports that `w` finished its parallel insert. Returns true for the
    /// last one to finish, which must then exit the group; everyone else
    /// blocks until the group is completed.
    pub fn complete_parallel_memtable_writer(&self, w: &Arc<Writer>) -> bool {
        let Some(group) = w.group() else {
            return true;
        };
        if group.running.fetch_sub(1, Ordering::AcqRel) > 1 {
            w.await_state(|state| state == WriterState::Completed);
            return false;
        }
        true
    }

    /// Exit duties of a parallel follower that finished last.
    pub fn exit_as_batch_group_follower(&self, w: &Arc<Writer>) {
        let Some(group) = w.group() else {
            return;
        };
        let status = group.status();
        self.exit_as_batch_group_leader(&group, status);
        // The leader exits last; it owns the group.
        group.leader().set_state(WriterState::Completed);
    }

    /// Merges the writers queued for the memtable behind `leader` into one
    /// memtable group. Merge batches are applied on their own.
    pub fn enter_as_memtable_writer(&self, leader: &Arc<Writer>) -> Arc<WriteGroup> {
        let queues = self.queues.lock();
        debug_assert!(queues
            .memtable_writers
            .front()
            .map_or(false, |front| Arc::ptr_eq(front, leader)));

        let mut writers = vec![leader.clone()];
        let mut size = leader.batch.data_size();
        if !self.allow_concurrent_memtable_write || !leader.batch.has_merge() {
            for w in queues.memtable_writers.iter().skip(1) {
                if w.unbatched || w.batch.has_merge() {
                    break;
                }
                if !self.allow_concurrent_memtable_write {
                    let batch_size = w.batch.data_size();
                    if size + batch_size > self.max_group_size {
                        break;
                    }
                    size += batch_size;
                }
                writers.push(w.clone());
            }
        }
        drop(queues);

        let group = Arc::new(WriteGroup::new(writers));
        let last = group.writers().last().map_or(0, |w| {
            (w.sequence() + u64::from(w.batch.count())).saturating_sub(1)
        });
        group.set_last_sequence(last);
        for w in group.writers() {
            w.set_group(&group);
        }
        group
    }

    /// Completes a memtable group and hands memtable leadership on.
    pub fn exit_as_memtable_writer(&self, group: &Arc<WriteGroup>) {
        {
            let mut queues = self.queues.lock();
            for w in group.writers() {
                let front = queues.memtable_writers.pop_front();
                debug_assert!(front.map_or(false, |front| Arc::ptr_eq(&front, w)));
            }
            match queues.memtable_writers.front() {
                Some(next) => next.set_state(WriterState::MemtableWriterLeader),
                None => {
                    self.memtable_idle_cv.notify_all();
                }
            }
        }

        let status = group.status();
        for w in group.writers().iter().skip(1) {
            if let Err(e) = &status {
                w.set_status(Err(e.clone()));
            }
            w.set_state(WriterState::Completed);
        }
        let leader = group.leader();
        if let Err(e) = status {
            leader.set_status(Err(e));
        }
        leader.set_state(WriterState::Completed);
    }

    /// Blocks until no memtable group is pending.
    pub fn wait_for_memtable_writers(&self) {
        if !self.enable_pipelined_write {
            return;
        }
        let mut queues = self.queues.lock();
        while !queues.memtable_writers.is_empty() {
            self.memtable_idle_cv.wait(&mut queues);
        }
    }

    /// Takes exclusive use of the queue: returns once `w` is the leader and
    /// all earlier writes are done.
    pub fn enter_unbatched(&self, w: &Arc<Writer>) {
        debug_assert!(w.unbatched);
        // Nobody batches an unbatched writer, so it always ends up leading.
        self.join_batch_group(w);
        self.wait_for_memtable_writers();
    }

    pub fn exit_unbatched(&self, w: &Arc<Writer>) {
        let group = Arc::new(WriteGroup::new(vec![w.clone()]));
        let mut queues = self.queues.lock();
        Self::pop_group(&mut queues, &group);
        if let Some(next) = queues.writers.front() {
            next.set_state(WriterState::GroupLeader);
        }
    }

    /// Blocks new writers from queueing and evicts the queued writers that
    /// asked not to be slowed down. Must be called by the current leader.
    pub fn begin_write_stall(&self) {
        let mut queues = self.queues.lock();
        queues.stalled = true;

        let mut kept = VecDeque::with_capacity(queues.writers.len());
        let mut evicted = Vec::new();
        for (i, w) in queues.writers.drain(..).enumerate() {
            if i > 0 && w.no_slowdown {
                evicted.push(w);
            } else {
                kept.push_back(w);
            }
        }
        queues.writers = kept;
        drop(queues);

        for w in evicted {
            w.set_status(Err(Error::Incomplete("Write stall".into())));
            w.set_state(WriterState::Completed);
        }
    }

    pub fn end_write_stall(&self) {
        let mut queues = self.queues.lock();
        queues.stalled = false;
        self.stall_cv.notify_all();
    }

    pub fn is_stalled(&self) -> bool {
        self.queues.lock().stalled
    }

    pub fn allow_concurrent_memtable_write(&self) -> bool {
        self.allow_concurrent_memtable_write
    }

    #[cfg(test)]
    pub(crate) fn queue_len(&self) -> usize {
        self.queues.lock().writers.len()
    }
}
