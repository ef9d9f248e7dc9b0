use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::options::ErrorHandlingOptions;
use crate::util::lock_unpoisoned;

/// Minimum sample count before the percentage threshold can fire.
const PERCENTAGE_THRESHOLD_MIN_SAMPLES: u64 = 40;

#[derive(Debug, Default)]
struct ErrorCounters {
    total_errors: u64,
    total_successful: u64,
    consecutive_errors: u64,
    per_kind: BTreeMap<String, u64>,
}

/// Why an escalation fired; rendered into the fatal log line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum EscalationReason {
    Consecutive { threshold: u32, observed: u64 },
    Percentage { threshold: u32, errors: u64, total: u64 },
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Consecutive { threshold, observed } => write!(
                formatter,
                "exceeded {threshold} consecutive errors threshold ({observed} observed)"
            ),
            Self::Percentage {
                threshold,
                errors,
                total,
            } => write!(
                formatter,
                "{errors} errors out of {total} requests exceeded {threshold}% error threshold"
            ),
        }
    }
}

/// Escalation ladder snapshot, evaluated against the offending submission's
/// options at the moment the threshold was crossed.
#[derive(Clone, Debug)]
pub(crate) struct EscalationPlan {
    pub(crate) verify_ban: bool,
    pub(crate) rotate_ip: bool,
    pub(crate) report: bool,
    pub(crate) reason: EscalationReason,
}

/// Shared error bookkeeping: totals, the consecutive-failure counter and
/// per-kind counts, plus the single-probe guard for ban verification.
#[derive(Debug, Default)]
pub(crate) struct ErrorAccountant {
    counters: Mutex<ErrorCounters>,
    ban_check_in_flight: AtomicBool,
}

impl ErrorAccountant {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A classified success resets the consecutive counter. Nothing else
    /// resets it; a refuted ban check deliberately leaves it standing.
    pub(crate) fn record_success(&self) {
        let mut counters = lock_unpoisoned(&self.counters);
        counters.total_successful += 1;
        counters.consecutive_errors = 0;
    }

    pub(crate) fn record_error(&self, kind: &str) {
        let mut counters = lock_unpoisoned(&self.counters);
        counters.total_errors += 1;
        counters.consecutive_errors += 1;
        *counters.per_kind.entry(kind.to_owned()).or_default() += 1;
    }

    pub(crate) fn consecutive_errors(&self) -> u64 {
        lock_unpoisoned(&self.counters).consecutive_errors
    }

    /// (errors, successes) observed so far.
    pub(crate) fn totals(&self) -> (u64, u64) {
        let counters = lock_unpoisoned(&self.counters);
        (counters.total_errors, counters.total_successful)
    }

    pub(crate) fn kind_counts(&self) -> BTreeMap<String, u64> {
        lock_unpoisoned(&self.counters).per_kind.clone()
    }

    /// Checks both thresholds and, on breach, returns the reaction ladder
    /// configured by the offending submission.
    pub(crate) fn evaluate(&self, options: &ErrorHandlingOptions) -> Option<EscalationPlan> {
        let (consecutive, errors, total) = {
            let counters = lock_unpoisoned(&self.counters);
            (
                counters.consecutive_errors,
                counters.total_errors,
                counters.total_errors + counters.total_successful,
            )
        };

        let reason = if options.consecutive_threshold > 0
            && consecutive > u64::from(options.consecutive_threshold)
        {
            EscalationReason::Consecutive {
                threshold: options.consecutive_threshold,
                observed: consecutive,
            }
        } else if options.percentage_threshold > 0
            && total >= PERCENTAGE_THRESHOLD_MIN_SAMPLES
            && errors * 100 / total > u64::from(options.percentage_threshold)
        {
            EscalationReason::Percentage {
                threshold: options.percentage_threshold,
                errors,
                total,
            }
        } else {
            return None;
        };

        Some(EscalationPlan {
            verify_ban: options.verify_ip_ban_if_exceeded,
            rotate_ip: options.ip_rotate_if_exceeded,
            report: options.report_errors_if_exceeded,
            reason,
        })
    }

    /// Claims the ban-check slot; at most one probe is ever in flight.
    pub(crate) fn try_begin_ban_check(&self) -> bool {
        !self.ban_check_in_flight.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn finish_ban_check(&self) {
        self.ban_check_in_flight.store(false, Ordering::SeqCst);
    }
}
