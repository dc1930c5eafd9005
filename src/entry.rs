use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    cell::{Cell, Handle, ReturnQueue},
    error::{BoxError, Error},
    factory::{Factory, Poolable},
};

/// The part of an [`Entry`] that is swapped wholesale by hot reconfiguration.
struct Regime<V> {
    available: Arc<ReturnQueue<V>>,
    capacity: Arc<Semaphore>,
    factory: Arc<dyn Factory<V>>,
    max_cap: usize,
    /// Number of still-outstanding orphan releases from a superseded regime
    /// that are themselves the over-subscription (i.e. the cells a downsized
    /// cap has no room for at all). These close with no ticket credited; only
    /// once this drains to zero do further orphan releases from the same
    /// regime swap credit a ticket back. See `Entry::reconfigure` for how this
    /// is computed and `Entry::return_cell` for how it is drawn down.
    legacy_overflow: usize,
}

/// The per-key sub-pool: available queue, capacity tickets, current factory and
/// cap, all behind one swap point so reconfiguration can replace them atomically
/// without disturbing cells already checked out.
pub(crate) struct Entry<V> {
    state: Mutex<Regime<V>>,
    /// True in-use count, independent of which regime created the cell. Touched
    /// on every successful acquire and every release, regardless of path.
    in_use: AtomicUsize,
}

impl<V: Poolable> Entry<V> {
    pub(crate) fn new(factory: Arc<dyn Factory<V>>, max_cap: usize) -> Arc<Self> {
        Arc::new(Entry {
            state: Mutex::new(Regime {
                available: ReturnQueue::new(),
                capacity: Arc::new(Semaphore::new(max_cap)),
                factory,
                max_cap,
                legacy_overflow: 0,
            }),
            in_use: AtomicUsize::new(0),
        })
    }

    pub(crate) fn in_use_count(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// The hot path: waits on whichever of (cancellation, an idle cell, a fresh
    /// capacity ticket) becomes ready first. Non-deterministic when more than
    /// one is simultaneously ready — callers must not depend on a preference
    /// between reuse and creation.
    pub(crate) async fn get_value(
        self: &Arc<Self>,
        ctx: &CancellationToken,
    ) -> Result<Handle<V>, Error> {
        let (available, capacity, factory) = {
            let regime = self.state.lock().unwrap();
            (regime.available.clone(), regime.capacity.clone(), regime.factory.clone())
        };

        tokio::select! {
            _ = ctx.cancelled() => Err(Error::Cancelled),
            cell = available.pop() => {
                self.in_use.fetch_add(1, Ordering::AcqRel);
                trace!("reused idle pooled value");
                Ok(Handle::new(cell, true))
            }
            permit = capacity.clone().acquire_owned() => {
                let permit = permit.expect("entry capacity semaphore is never closed");
                permit.forget();
                match factory.create().await {
                    Ok(value) => {
                        self.in_use.fetch_add(1, Ordering::AcqRel);
                        trace!("created pooled value");
                        let cell = Cell::new(value, available, Arc::downgrade(self));
                        Ok(Handle::new(cell, false))
                    }
                    Err(cause) => {
                        capacity.add_permits(1);
                        Err(Error::FactoryFailed(cause))
                    }
                }
            }
        }
    }

    /// Called by a [`Handle`]'s drop/release to return a cell. If the cell's
    /// captured return queue still matches the entry's current one, it rejoins
    /// the idle queue; otherwise it's an orphan of a superseded regime (see
    /// `reconfigure`) and is closed. The first `legacy_overflow` such orphans
    /// are themselves the over-subscription relative to the new cap and credit
    /// nothing; only once that count has drained does an orphan release credit
    /// a ticket back.
    pub(crate) fn return_cell(&self, cell: Cell<V>) {
        let mut regime = self.state.lock().unwrap();
        if Arc::ptr_eq(cell.return_queue(), &regime.available) {
            drop(regime);
            self.in_use.fetch_sub(1, Ordering::AcqRel);
            cell.return_queue().clone().push(cell);
            return;
        }

        let credit = if regime.legacy_overflow > 0 {
            regime.legacy_overflow -= 1;
            None
        } else {
            Some(regime.capacity.clone())
        };
        drop(regime);
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        trace!("closing orphaned pooled value from a superseded regime");
        cell.close();
        if let Some(capacity) = credit {
            capacity.add_permits(1);
        }
    }

    /// Drains the available queue non-blockingly, closing any cell idle for at
    /// least `idle_ttl`. Returns true iff the entry is now fully idle at full
    /// cap — the signal the cache uses to remove it on sweep.
    pub(crate) fn cleanup_values(&self, idle_ttl: std::time::Duration) -> bool {
        let (available, capacity, max_cap) = {
            let regime = self.state.lock().unwrap();
            (regime.available.clone(), regime.capacity.clone(), regime.max_cap)
        };

        let now = std::time::Instant::now();
        let drained = available.drain();
        let mut survivors = Vec::with_capacity(drained.len());
        for cell in drained {
            if now.duration_since(cell.last_used) >= idle_ttl {
                trace!("evicting idle pooled value");
                cell.close();
                capacity.add_permits(1);
            } else {
                survivors.push(cell);
            }
        }
        let idle_len = survivors.len();
        for cell in survivors {
            available.push(cell);
        }

        idle_len == 0 && self.in_use_count() == 0 && capacity.available_permits() == max_cap
    }

    /// Closes every idle cell this entry owns; used on cache shutdown and on
    /// sweep-driven removal.
    pub(crate) fn close_idle(&self) {
        let available = self.state.lock().unwrap().available.clone();
        for cell in available.drain() {
            cell.close();
        }
    }

    /// Hot-swaps the factory and/or cap without invalidating cells currently
    /// checked out. See SPEC_FULL.md §4.3 for the worked numeric derivation of
    /// the budget split below.
    pub(crate) async fn reconfigure(
        &self,
        factory: Arc<dyn Factory<V>>,
        new_cap: usize,
    ) -> Result<(), Error> {
        let new_available = ReturnQueue::new();
        let in_use = self.in_use_count();
        let old_idle = {
            let regime = self.state.lock().unwrap();
            regime.available.drain()
        };

        let budget_for_in_use = in_use.min(new_cap);
        let remaining = new_cap - budget_for_in_use;
        let legacy_overflow = in_use.saturating_sub(new_cap);

        let mut causes: Vec<BoxError> = Vec::new();
        let mut successful_migrations = 0usize;
        for mut cell in old_idle {
            if successful_migrations >= remaining {
                trace!("closing overflow idle pooled value during reconfiguration");
                cell.close();
                continue;
            }
            match cell.update_value(factory.as_ref(), new_available.clone()).await {
                Ok(()) => {
                    successful_migrations += 1;
                    new_available.push(cell);
                }
                Err(cause) => {
                    causes.push(cause);
                }
            }
        }
        let initial_permits = remaining - successful_migrations;

        {
            let mut regime = self.state.lock().unwrap();
            regime.available = new_available;
            regime.capacity = Arc::new(Semaphore::new(initial_permits));
            regime.factory = factory;
            regime.max_cap = new_cap;
            regime.legacy_overflow = legacy_overflow;
        }

        if causes.is_empty() {
            Ok(())
        } else {
            Err(Error::UpdatePartial(causes))
        }
    }
}
