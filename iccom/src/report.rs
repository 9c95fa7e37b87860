//! Throttled reporting for repetitive link errors.
//!
//! A flaky link can raise the same error thousands of times per second;
//! logging each one would drown the log and slow the return path. Each
//! error class is reported at most once per [`MIN_REPORT_INTERVAL`];
//! occurrences in between are counted and summarized with the next
//! report.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Minimum silence between two reports of the same error class.
pub(crate) const MIN_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// The error classes tracked on the link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LinkErrorClass {
    /// Frame rejected: CRC, filler or length violation.
    BadFrame,
    /// Verified frame whose packet data failed to parse.
    ParseFailed,
    /// The transport layer failed an exchange.
    Transport,
}

impl LinkErrorClass {
    const COUNT: usize = 3;

    fn label(self) -> &'static str {
        match self {
            Self::BadFrame => "bad frame received",
            Self::ParseFailed => "package parsing failed",
            Self::Transport => "xfer failed on transport layer, restarting frame",
        }
    }
}

#[derive(Clone, Copy, Default)]
struct Record {
    total: u64,
    unreported: u64,
    last_report: Option<Instant>,
}

/// Per-class throttling state.
pub(crate) struct ErrorReporter {
    records: Mutex<[Record; LinkErrorClass::COUNT]>,
}

impl ErrorReporter {
    pub(crate) fn new() -> ErrorReporter {
        ErrorReporter { records: Mutex::new([Record::default(); LinkErrorClass::COUNT]) }
    }

    fn lock(&self) -> MutexGuard<'_, [Record; LinkErrorClass::COUNT]> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count one occurrence of `class` and emit a `warn!` unless one was
    /// already emitted within [`MIN_REPORT_INTERVAL`].
    pub(crate) fn report(&self, class: LinkErrorClass, detail: &dyn fmt::Display) {
        let now = Instant::now();
        let mut records = self.lock();
        let rec = &mut records[class as usize];
        rec.total += 1;

        if let Some(last) = rec.last_report {
            if now.duration_since(last) < MIN_REPORT_INTERVAL {
                rec.unreported += 1;
                return;
            }
        }

        if rec.unreported > 0 {
            log::warn!(
                "{}: {} ({} occurrences suppressed, {} total)",
                class.label(),
                detail,
                rec.unreported,
                rec.total,
            );
        } else {
            log::warn!("{}: {} ({} total)", class.label(), detail, rec.total);
        }
        rec.unreported = 0;
        rec.last_report = Some(now);
    }

    /// Total occurrences of `class` since start, reported or not.
    #[cfg(test)]
    pub(crate) fn total(&self, class: LinkErrorClass) -> u64 {
        self.lock()[class as usize].total
    }
}
