use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::client::ClientCore;
use crate::core::processor::process;
use crate::options::DelayRange;
use crate::util::{lock_unpoisoned, random_delay_ms};

const SUPERVISOR_TICK: Duration = Duration::from_secs(1);
const MAX_WORKERS: usize = 100;
const DELAY_WIDEN_STEP_MS: u64 = 100;
const DELAY_CAP_MS: u64 = 5_000;

/// Elastic worker accounting.
///
/// `active_workers` counts running worker tasks; `locked_workers` counts
/// workers currently awaiting a dependent child request. Locked workers are
/// excluded from the shrink arithmetic so the pool never collapses below
/// the number of outstanding dependent waits.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    active_workers: AtomicUsize,
    locked_workers: AtomicUsize,
    delay_range_ms: Mutex<(u64, u64)>,
}

impl WorkerPool {
    pub(crate) fn new(delay: DelayRange) -> Self {
        Self {
            active_workers: AtomicUsize::new(0),
            locked_workers: AtomicUsize::new(0),
            delay_range_ms: Mutex::new(delay.as_millis()),
        }
    }

    pub(crate) fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub(crate) fn locked_workers(&self) -> usize {
        self.locked_workers.load(Ordering::SeqCst)
    }

    /// Marks the current worker as awaiting a child request for the guard's
    /// lifetime.
    pub(crate) fn lock_scope(&self) -> WorkerLockGuard<'_> {
        self.locked_workers.fetch_add(1, Ordering::SeqCst);
        WorkerLockGuard(self)
    }

    fn delay_range(&self) -> (u64, u64) {
        *lock_unpoisoned(&self.delay_range_ms)
    }

    /// Soft throttle: widens the inter-tick delay instead of retiring the
    /// last drainable worker.
    fn widen_delay(&self) {
        let mut range = lock_unpoisoned(&self.delay_range_ms);
        range.0 = (range.0 + DELAY_WIDEN_STEP_MS).min(DELAY_CAP_MS);
        range.1 = (range.1 + DELAY_WIDEN_STEP_MS).min(DELAY_CAP_MS);
    }
}

pub(crate) struct WorkerLockGuard<'a>(&'a WorkerPool);

impl Drop for WorkerLockGuard<'_> {
    fn drop(&mut self) {
        self.0.locked_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Starts the supervisor: one bounded spawn decision per tick, so the pool
/// grows only as fast as rate data arrives. On cancellation the queues are
/// drained and every orphaned resolution fires.
pub(crate) fn spawn_supervisor(core: Arc<ClientCore>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + SUPERVISOR_TICK,
            SUPERVISOR_TICK,
        );
        loop {
            tokio::select! {
                _ = core.cancel.cancelled() => {
                    for item in core.queues.close_and_drain() {
                        item.message.resolve();
                    }
                    return;
                }
                _ = ticker.tick() => {}
            }

            if core.queues.pending_count() == 0 {
                continue;
            }
            let under_rate = core.rate.current_rate() < u64::from(core.rate.target());
            let all_locked =
                core.pool.active_workers() == core.pool.locked_workers();
            // all_locked covers dependent children queued while every
            // worker awaits one; without it the pool would starve itself.
            if (under_rate || all_locked) && core.pool.active_workers() < MAX_WORKERS {
                spawn_worker(Arc::clone(&core));
            }
        }
    });
}

fn spawn_worker(core: Arc<ClientCore>) {
    let worker_id = core.pool.active_workers.fetch_add(1, Ordering::SeqCst) + 1;
    debug!(worker_id, "worker started");
    tokio::spawn(async move {
        worker_loop(&core).await;
        core.pool.active_workers.fetch_sub(1, Ordering::SeqCst);
        debug!(worker_id, "worker stopped");
    });
}

async fn worker_loop(core: &Arc<ClientCore>) {
    loop {
        let Some(item) = core.queues.dequeue_highest(&core.cancel).await else {
            return;
        };

        process(core, item).await;
        core.rate.tick_now();

        let (min_ms, max_ms) = core.pool.delay_range();
        let delay = random_delay_ms(min_ms, max_ms);
        if delay > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                _ = core.cancel.cancelled() => return,
            }
        }

        let over_rate = core.rate.current_rate() > u64::from(core.rate.target());
        if over_rate || core.queues.pending_count() == 0 {
            let active = core.pool.active_workers();
            let locked = core.pool.locked_workers();
            if active.saturating_sub(locked) > 1 {
                return;
            }
            core.pool.widen_delay();
        }
    }
}
