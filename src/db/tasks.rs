use std::sync::Arc;
use std::time::Duration;

use super::state::DbInner;
use crate::error::Result;
use crate::scheduler::{BackgroundTask, Context};

/// Drains sealed memtables into the flush sink.
pub struct FlushTask {
    inner: Arc<DbInner>,
}

impl FlushTask {
    pub(crate) fn new(inner: Arc<DbInner>) -> Self {
        Self { inner }
    }
}

impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "memtable-flush"
    }

    fn interval(&self) -> Duration {
        self.inner.config.flush_interval
    }

    fn execute(&self, ctx: Context) -> Result<()> {
        if ctx.is_shutting_down() {
            return Ok(());
        }
        let flushed = self.inner.flush_immutable_memtables()?;
        if flushed > 0 {
            tracing::debug!(run_id = ctx.run_id, flushed, "Background flush pass");
        }
        Ok(())
    }
}
