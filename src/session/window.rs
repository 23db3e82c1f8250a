use chrono::{DateTime, Duration, Utc};

use crate::scoring::{score_window, WindowScore, WindowTally};
use crate::signal::Signal;

/// The single window of a session that still accepts signals.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenWindow {
    pub index: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub tally: WindowTally,
}

/// A window after its final score was computed.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedWindow {
    pub index: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub samples: u32,
    pub score: WindowScore,
}

/// Result of moving the session clock past the open window's end.
#[derive(Debug, Clone, PartialEq)]
pub struct Rollover {
    pub closed: ClosedWindow,
    /// Windows between the closed one and the new open one that saw no
    /// signals. They close with a zero score and are never flagged.
    pub skipped: u64,
}

/// Buckets a session's signals into fixed windows aligned to its start time.
/// Windows only move forward: a late or pre-start signal folds into the
/// window that is currently open.
#[derive(Debug, Clone)]
pub struct IntervalAggregator {
    session_start: DateTime<Utc>,
    interval: Duration,
    open: OpenWindow,
}

impl IntervalAggregator {
    pub fn new(session_start: DateTime<Utc>, interval_secs: u64) -> Self {
        let interval = Duration::seconds(interval_secs.max(1) as i64);
        Self {
            session_start,
            interval,
            open: Self::window_at(session_start, interval, 0),
        }
    }

    fn window_at(session_start: DateTime<Utc>, interval: Duration, index: u64) -> OpenWindow {
        let offset = interval
            .num_milliseconds()
            .saturating_mul(i64::try_from(index).unwrap_or(i64::MAX));
        // Saturate at the end of representable time rather than overflow.
        let start = Duration::try_milliseconds(offset)
            .and_then(|offset| session_start.checked_add_signed(offset))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        OpenWindow {
            index,
            start,
            end: start.checked_add_signed(interval).unwrap_or(DateTime::<Utc>::MAX_UTC),
            tally: WindowTally::default(),
        }
    }

    pub fn open_window(&self) -> &OpenWindow {
        &self.open
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// `floor((timestamp - start) / interval)`, with anything before the
    /// session start mapped to window 0.
    pub fn index_for(&self, timestamp: DateTime<Utc>) -> u64 {
        let elapsed_ms = (timestamp - self.session_start).num_milliseconds();
        if elapsed_ms <= 0 {
            return 0;
        }
        (elapsed_ms / self.interval.num_milliseconds()) as u64
    }

    /// Closes the open window if `now` lies beyond it and opens the window
    /// `now` belongs to. Returns `None` when `now` is still inside (or
    /// before) the open window.
    pub fn advance_to(&mut self, now: DateTime<Utc>) -> Option<Rollover> {
        let target = self.index_for(now);
        if target <= self.open.index {
            return None;
        }

        let next = Self::window_at(self.session_start, self.interval, target);
        let finished = std::mem::replace(&mut self.open, next);
        let skipped = target - finished.index - 1;
        Some(Rollover {
            closed: Self::finalize(&finished, finished.end),
            skipped,
        })
    }

    pub fn record(&mut self, signal: &Signal) {
        self.open.tally.record(signal);
    }

    /// Running score of the open window; not final until it closes.
    pub fn running_score(&self) -> WindowScore {
        score_window(&self.open.tally, self.open.index)
    }

    /// Closes the open window early, at `at`, when the session ends.
    pub fn close_final(&self, at: DateTime<Utc>) -> ClosedWindow {
        let end = at.clamp(self.open.start, self.open.end);
        Self::finalize(&self.open, end)
    }

    fn finalize(window: &OpenWindow, end: DateTime<Utc>) -> ClosedWindow {
        ClosedWindow {
            index: window.index,
            start: window.start,
            end,
            samples: window.tally.samples,
            score: score_window(&window.tally, window.index),
        }
    }
}
