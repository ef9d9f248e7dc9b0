use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use crate::util::lock_unpoisoned;

/// Sliding-window rate governor.
///
/// The window holds `5 × target` completion timestamps in microseconds; the
/// observed rate is computed from the extremes rather than a deque, which
/// absorbs remote latency jitter cheaply. Ticks record completed
/// dispatches, not scheduler wake-ups.
#[derive(Debug)]
pub struct RateGovernor {
    target: AtomicU32,
    throttle_percentage: AtomicU32,
    throttle_rate: AtomicU32,
    window: Mutex<RateWindow>,
    epoch: Instant,
}

#[derive(Debug)]
struct RateWindow {
    slots: Vec<Option<i64>>,
    cursor: usize,
}

impl RateWindow {
    fn with_target(target: u32) -> Self {
        Self {
            slots: vec![None; (target as usize) * 5],
            cursor: 0,
        }
    }
}

impl RateGovernor {
    pub(crate) fn new(target: u32) -> Self {
        Self {
            target: AtomicU32::new(target),
            throttle_percentage: AtomicU32::new(0),
            throttle_rate: AtomicU32::new(0),
            window: Mutex::new(RateWindow::with_target(target)),
            epoch: Instant::now(),
        }
    }

    /// Configured requests-per-second target; 0 means stopped.
    pub fn target(&self) -> u32 {
        self.target.load(Ordering::SeqCst)
    }

    /// Records one completed dispatch.
    pub(crate) fn tick_now(&self) {
        let micros = self.epoch.elapsed().as_micros() as i64;
        self.tick_at(micros);
    }

    pub(crate) fn tick_at(&self, micros: i64) {
        if self.target() == 0 {
            return;
        }
        let mut window = lock_unpoisoned(&self.window);
        if window.slots.is_empty() {
            return;
        }
        let cursor = (window.cursor + 1) % window.slots.len();
        window.cursor = cursor;
        window.slots[cursor] = Some(micros);
    }

    /// Observed completions per second over the window, 0 while the span is
    /// under a millisecond.
    pub fn current_rate(&self) -> u64 {
        let window = lock_unpoisoned(&self.window);
        let mut lowest = i64::MAX;
        let mut highest = i64::MIN;
        let mut populated = 0u64;
        for slot in window.slots.iter().flatten() {
            lowest = lowest.min(*slot);
            highest = highest.max(*slot);
            populated += 1;
        }
        if populated == 0 {
            return 0;
        }
        let elapsed_ms = (highest - lowest) / 1000;
        if elapsed_ms > 1 {
            (1000 * populated) / elapsed_ms as u64
        } else {
            0
        }
    }

    /// Replaces the target and reallocates the window. A zero (or clamped
    /// negative) rate stops the governor: ticks become no-ops and the
    /// observed rate reads 0.
    pub fn change_rate(&self, rate: u32) {
        let mut window = lock_unpoisoned(&self.window);
        self.target.store(rate, Ordering::SeqCst);
        *window = RateWindow::with_target(rate);
        self.recompute_throttle_rate(rate);
    }

    pub fn stop(&self) {
        self.change_rate(0);
    }

    /// Stores the 429-density scalar. The derived `throttle_rate` is an
    /// observability hook; the dispatch path never re-reads it.
    pub fn set_throttle_percentage(&self, percentage: u8) {
        let clamped = u32::from(percentage.min(100));
        self.throttle_percentage.store(clamped, Ordering::SeqCst);
        self.recompute_throttle_rate(self.target());
    }

    pub fn throttle_percentage(&self) -> u8 {
        self.throttle_percentage.load(Ordering::SeqCst) as u8
    }

    pub fn throttle_rate(&self) -> u32 {
        self.throttle_rate.load(Ordering::SeqCst)
    }

    fn recompute_throttle_rate(&self, target: u32) {
        let percentage = self.throttle_percentage.load(Ordering::SeqCst);
        self.throttle_rate
            .store(target * percentage / 100, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::RateGovernor;

    #[test]
    fn empty_window_reads_zero() {
        let governor = RateGovernor::new(10);
        assert_eq!(governor.current_rate(), 0);
    }

    #[test]
    fn rate_is_computed_from_window_extremes() {
        let governor = RateGovernor::new(10);
        // 10 ticks spread over 900ms => 11.1/s, truncated to 11.
        for i in 0..10i64 {
            governor.tick_at(i * 100_000);
        }
        assert_eq!(governor.current_rate(), 11);
    }

    #[test]
    fn sub_millisecond_span_reads_zero() {
        let governor = RateGovernor::new(10);
        governor.tick_at(100);
        governor.tick_at(900);
        assert_eq!(governor.current_rate(), 0);
    }

    #[test]
    fn window_wraps_at_five_times_target() {
        let governor = RateGovernor::new(1);
        for i in 0..20i64 {
            governor.tick_at(i * 1_000_000);
        }
        // Only the last five ticks (4s span) remain in the window.
        assert_eq!(governor.current_rate(), (1000 * 5) / 4000);
    }

    #[test]
    fn change_rate_resets_the_window() {
        let governor = RateGovernor::new(10);
        governor.tick_at(0);
        governor.tick_at(5_000_000);
        governor.change_rate(3);
        assert_eq!(governor.target(), 3);
        assert_eq!(governor.current_rate(), 0);
    }

    #[test]
    fn zero_rate_stops_ticking() {
        let governor = RateGovernor::new(5);
        governor.stop();
        governor.tick_at(0);
        governor.tick_at(10_000_000);
        assert_eq!(governor.target(), 0);
        assert_eq!(governor.current_rate(), 0);
    }

    #[test]
    fn throttle_rate_derives_from_target_and_percentage() {
        let governor = RateGovernor::new(50);
        governor.set_throttle_percentage(40);
        assert_eq!(governor.throttle_percentage(), 40);
        assert_eq!(governor.throttle_rate(), 20);

        governor.set_throttle_percentage(150);
        assert_eq!(governor.throttle_percentage(), 100);
        assert_eq!(governor.throttle_rate(), 50);
    }
}
