use std::{
    collections::VecDeque,
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, Weak},
    time::Instant,
};

use tokio::sync::Notify;
use tracing::trace;

use crate::{entry::Entry, factory::Poolable};

/// The bounded idle queue a [`Cell`] returns itself to on release.
///
/// A plain `tokio::sync::mpsc` channel doesn't work here because `get_value`'s
/// `tokio::select!` needs several waiters polling the same queue concurrently; a
/// `Notify` paired with a mutex-guarded deque is the idiomatic substitute.
pub(crate) struct ReturnQueue<V> {
    idle: Mutex<VecDeque<Cell<V>>>,
    notify: Notify,
}

impl<V> ReturnQueue<V> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(ReturnQueue {
            idle: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    pub(crate) fn push(&self, cell: Cell<V>) {
        self.idle.lock().unwrap().push_back(cell);
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<Cell<V>> {
        self.idle.lock().unwrap().pop_front()
    }

    /// Waits until a cell is idle, then removes and returns it.
    pub(crate) async fn pop(&self) -> Cell<V> {
        loop {
            // Register interest before re-checking so a push racing with this call
            // is never missed between the check and the await.
            let notified = self.notify.notified();
            if let Some(cell) = self.try_pop() {
                return cell;
            }
            notified.await;
        }
    }

    /// Drains every idle cell currently queued, oldest first.
    pub(crate) fn drain(&self) -> Vec<Cell<V>> {
        self.idle.lock().unwrap().drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}

/// One resource instance plus the bookkeeping the pool needs to hand it out,
/// reclaim it, and eventually close it.
///
/// A cell is owned by exactly one [`Entry`] and is, at any instant, idle (sitting
/// in `return_queue`), in use (held by a [`Handle`]), or closed. There is no
/// explicit state field for this — it falls out of ordinary Rust ownership:
/// whichever structure currently holds the `Cell` by value *is* the state.
pub(crate) struct Cell<V> {
    value: Option<V>,
    pub(crate) last_used: Instant,
    return_queue: Arc<ReturnQueue<V>>,
    entry: Weak<Entry<V>>,
}

impl<V: Poolable> Cell<V> {
    pub(crate) fn new(value: V, return_queue: Arc<ReturnQueue<V>>, entry: Weak<Entry<V>>) -> Self {
        Cell {
            value: Some(value),
            last_used: Instant::now(),
            return_queue,
            entry,
        }
    }

    pub(crate) fn value(&self) -> &V {
        self.value.as_ref().expect("cell value taken before close")
    }

    pub(crate) fn value_mut(&mut self) -> &mut V {
        self.value.as_mut().expect("cell value taken before close")
    }

    /// Rebuilds this cell in place against a new factory and return queue, used
    /// while migrating idle cells during hot reconfiguration. Closes the old
    /// value unconditionally; on factory failure the cell is left with no value
    /// and must not be reused — the caller discards it.
    pub(crate) async fn update_value(
        &mut self,
        factory: &(dyn crate::factory::Factory<V>),
        new_return_queue: Arc<ReturnQueue<V>>,
    ) -> Result<(), crate::error::BoxError> {
        self.close_value();
        let fresh = factory.create().await?;
        self.value = Some(fresh);
        self.return_queue = new_return_queue;
        self.last_used = Instant::now();
        Ok(())
    }

    fn close_value(&mut self) {
        if let Some(mut value) = self.value.take() {
            if let Err(err) = value.close() {
                trace!(error = %err, "closing pooled value failed");
            }
        }
    }

    /// Closes the value and consumes the cell. Used on eviction and overflow
    /// paths, where the cell will not be returned to any queue.
    pub(crate) fn close(mut self) {
        self.close_value();
    }

    pub(crate) fn return_queue(&self) -> &Arc<ReturnQueue<V>> {
        &self.return_queue
    }

    pub(crate) fn entry(&self) -> Option<Arc<Entry<V>>> {
        self.entry.upgrade()
    }
}

impl<V> Drop for Cell<V> {
    fn drop(&mut self) {
        if let Some(mut value) = self.value.take() {
            if let Err(err) = Poolable::close(&mut value) {
                trace!(error = %err, "closing abandoned pooled value failed");
            }
        }
    }
}

impl<V> fmt::Debug for Cell<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("last_used", &self.last_used)
            .field("closed", &self.value.is_none())
            .finish()
    }
}

/// RAII handle to a checked-out [`Cell`], named after the teacher pool's
/// `Pooled<T, K>`. Dereferences to the held value; returns the cell to its
/// entry's available queue on drop.
///
/// Unlike the tuple `(value, release, pre_existed, error)` shape this crate's
/// algorithm was ported from, a failed acquire simply yields `Err` with no
/// `Handle` at all — there is nothing to release, so the "no-op release on
/// error" requirement holds by construction rather than by convention.
pub struct Handle<V> {
    cell: Option<Cell<V>>,
    reused: bool,
}

impl<V: Poolable> Handle<V> {
    pub(crate) fn new(cell: Cell<V>, reused: bool) -> Self {
        Handle {
            cell: Some(cell),
            reused,
        }
    }

    /// True if this handle wraps a cell that was idle in the pool, false if a
    /// fresh value was just constructed for it.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Returns the cell to its entry now, rather than waiting for drop.
    pub fn release(mut self) {
        if let Some(cell) = self.cell.take() {
            return_to_entry(cell);
        }
    }
}

impl<V> Deref for Handle<V> {
    type Target = V;

    fn deref(&self) -> &V {
        self.cell.as_ref().expect("handle used after release").value()
    }
}

impl<V> DerefMut for Handle<V> {
    fn deref_mut(&mut self) -> &mut V {
        self.cell.as_mut().expect("handle used after release").value_mut()
    }
}

impl<V> Drop for Handle<V> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            return_to_entry(cell);
        }
    }
}

/// Pushes a released cell back onto its current return queue if the entry
/// hasn't reconfigured since this cell was acquired; otherwise treats it as an
/// orphan of a now-superseded regime. See `Entry::return_orphan` for the
/// capacity bookkeeping this implies.
fn return_to_entry<V: Poolable>(mut cell: Cell<V>) {
    let Some(entry) = cell.entry() else {
        // Entry has been torn down entirely; nothing left to return to.
        cell.close();
        return;
    };
    cell.last_used = Instant::now();
    entry.return_cell(cell);
}
