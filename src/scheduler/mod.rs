use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::error::Result;

/// Handed to a task on every run.
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: Receiver<()>,
}

impl Context {
    /// True once the scheduler has been asked to stop.
    pub fn is_shutting_down(&self) -> bool {
        matches!(self.shutdown.try_recv(), Err(TryRecvError::Disconnected))
    }
}

/// Periodic maintenance such as memtable flushes and WAL cleanup.
pub trait BackgroundTask: Send + Sync {
    fn name(&self) -> &'static str;

    /// Time between two runs.
    fn interval(&self) -> Duration;

    /// A failed run is logged and retried at the next tick.
    fn execute(&self, ctx: Context) -> Result<()>;
}

/// Runs each registered task on its own thread until shutdown.
pub struct Scheduler {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = bounded(0);
        Self {
            tasks: Mutex::new(Vec::new()),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        }
    }

    /// Starts `task` on a dedicated thread.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> Result<&Self> {
        let handle = self.spawn_timer_loop(task)?;
        self.tasks.lock().push(handle);
        Ok(self)
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> Result<JoinHandle<()>> {
        let ticker = tick(task.interval());
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = std::thread::Builder::new()
            .name(format!("cinderdb-{}", task.name()))
            .spawn(move || {
                let mut run_id = 0u64;
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            run_id += 1;
                            let ctx = Context {
                                task_name: task.name(),
                                run_id,
                                shutdown: shutdown_rx.clone(),
                            };

                            if let Err(e) = task.execute(ctx) {
                                tracing::error!(
                                    task = task.name(),
                                    run_id,
                                    error = %e,
                                    "Background task failed"
                                );
                            }
                        }
                        // Dropping the sender disconnects every receiver.
                        recv(shutdown_rx) -> _ => {
                            tracing::debug!(task = task.name(), runs = run_id, "Background task stopped");
                            break;
                        }
                    }
                }
            })?;
        Ok(handle)
    }

    /// Stops every task and joins its thread. A run in progress finishes
    /// first.
    pub fn shutdown(&self) {
        self.shutdown_tx.lock().take();

        for task in self.tasks.lock().drain(..) {
            if task.join().is_err() {
                tracing::error!("Background task panicked");
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
