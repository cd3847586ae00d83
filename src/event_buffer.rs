//! Event Buffer (C7): two typed ring buffers with batched transactional
//! flush. A buffer that reaches capacity flushes synchronously within the
//! producer's call — back-pressure is a flush, never a silent drop.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::store::rows::{DivisionEventRow, TableEventRow};
use crate::store::Store;

#[derive(Debug, Default, Clone, Copy)]
pub struct BufferStats {
    pub total_division_inserts: u64,
    pub total_table_inserts: u64,
    pub total_commits: u64,
}

impl BufferStats {
    pub fn avg_batch_size(&self) -> f64 {
        let total = self.total_division_inserts + self.total_table_inserts;
        if self.total_commits == 0 {
            0.0
        } else {
            (total as f64 / self.total_commits as f64 * 10.0).round() / 10.0
        }
    }
}

struct Inner {
    division: Vec<DivisionEventRow>,
    table: Vec<TableEventRow>,
    stats: BufferStats,
}

/// Shared across analysis workers; access is serialized per buffer via the
/// guard's short critical section (one lock acquisition, O(1) enqueue). The
/// store handle is shared with the rest of the service (C8 is one
/// connection per process, not one per component).
pub struct EventBuffer {
    batch_size: usize,
    inner: Mutex<Inner>,
    store: Arc<Mutex<Store>>,
}

impl EventBuffer {
    pub fn new(store: Arc<Mutex<Store>>, batch_size: usize) -> Self {
        Self {
            batch_size,
            inner: Mutex::new(Inner { division: Vec::new(), table: Vec::new(), stats: BufferStats::default() }),
            store,
        }
    }

    /// Buffers a division state change, auto-flushing if capacity is hit.
    pub fn add_division_state(&self, row: DivisionEventRow) -> Result<()> {
        let should_flush = {
            let mut inner = self.inner.lock();
            inner.division.push(row);
            inner.division.len() >= self.batch_size
        };
        if should_flush {
            self.flush_division()?;
        }
        Ok(())
    }

    /// Buffers a table state change, auto-flushing if capacity is hit.
    pub fn add_table_state(&self, row: TableEventRow) -> Result<()> {
        let should_flush = {
            let mut inner = self.inner.lock();
            inner.table.push(row);
            inner.table.len() >= self.batch_size
        };
        if should_flush {
            self.flush_table()?;
        }
        Ok(())
    }

    /// Commits buffered division rows in a single transaction. On failure
    /// the rows are retained in the buffer for the next attempt.
    pub fn flush_division(&self) -> Result<()> {
        let pending = {
            let inner = self.inner.lock();
            inner.division.clone()
        };
        if pending.is_empty() {
            return Ok(());
        }
        let count = pending.len();
        self.store.lock().insert_division_batch(&pending)?;

        let mut inner = self.inner.lock();
        inner.division.drain(..count);
        inner.stats.total_division_inserts += count as u64;
        inner.stats.total_commits += 1;
        Ok(())
    }

    pub fn flush_table(&self) -> Result<()> {
        let pending = {
            let inner = self.inner.lock();
            inner.table.clone()
        };
        if pending.is_empty() {
            return Ok(());
        }
        let count = pending.len();
        self.store.lock().insert_table_batch(&pending)?;

        let mut inner = self.inner.lock();
        inner.table.drain(..count);
        inner.stats.total_table_inserts += count as u64;
        inner.stats.total_commits += 1;
        Ok(())
    }

    /// Flushes both buffers. Called on shutdown.
    pub fn flush_all(&self) -> Result<()> {
        self.flush_division()?;
        self.flush_table()?;
        Ok(())
    }

    pub fn stats(&self) -> BufferStats {
        self.inner.lock().stats
    }

    pub fn pending_division(&self) -> usize {
        self.inner.lock().division.len()
    }

    pub fn pending_table(&self) -> usize {
        self.inner.lock().table.len()
    }
}
