#![forbid(unsafe_code)]

//! Time sources for the event loop.
//!
//! Production loops read wall-clock time. Test loops use a [`LabClock`],
//! which only moves when told to, so timer-driven deferred values settle
//! deterministically and no test ever sleeps.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use web_time::{Duration, Instant};

/// A manually-advanceable clock for deterministic tests.
///
/// All clones share the same offset, so every loop holding a clone of the
/// same `LabClock` sees the same time.
#[derive(Debug, Clone)]
pub struct LabClock {
    epoch: Instant,
    offset_us: Arc<AtomicU64>,
}

impl LabClock {
    /// Create a new lab clock starting at `Instant::now()`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_us: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Advance the clock by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.offset_us
            .fetch_add(duration_to_us(delta), Ordering::Release);
    }

    /// Move the clock forward to `target`. Never moves backwards.
    pub fn advance_to(&self, target: Instant) {
        let target_us = duration_to_us(target.saturating_duration_since(self.epoch));
        self.offset_us.fetch_max(target_us, Ordering::AcqRel);
    }

    /// Current lab time.
    #[must_use]
    pub fn now(&self) -> Instant {
        let offset = Duration::from_micros(self.offset_us.load(Ordering::Acquire));
        self.epoch + offset
    }

    /// Total virtual time elapsed since the clock was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.offset_us.load(Ordering::Acquire))
    }
}

impl Default for LabClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Where an [`EventLoop`](crate::EventLoop) reads the current time from.
#[derive(Debug, Clone, Default)]
pub enum Clock {
    /// Real wall-clock time.
    #[default]
    Real,
    /// Deterministic lab clock for testing.
    Lab(LabClock),
}

impl Clock {
    /// Current time according to this source.
    #[must_use]
    pub fn now(&self) -> Instant {
        match self {
            Self::Real => Instant::now(),
            Self::Lab(clock) => clock.now(),
        }
    }

    /// Whether this source is a lab clock.
    #[inline]
    #[must_use]
    pub fn is_lab(&self) -> bool {
        matches!(self, Self::Lab(_))
    }
}

fn duration_to_us(d: Duration) -> u64 {
    d.as_micros().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lab_clock_starts_at_zero_offset() {
        let clock = LabClock::new();
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn lab_clock_advances_by_delta() {
        let clock = LabClock::new();
        let start = clock.now();
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now() - start, Duration::from_millis(250));
    }

    #[test]
    fn clones_share_time() {
        let a = LabClock::new();
        let b = a.clone();
        a.advance(Duration::from_secs(3));
        assert_eq!(b.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn advance_to_never_goes_backwards() {
        let clock = LabClock::new();
        let start = clock.now();
        clock.advance(Duration::from_millis(500));
        clock.advance_to(start + Duration::from_millis(100));
        assert_eq!(clock.elapsed(), Duration::from_millis(500));

        clock.advance_to(start + Duration::from_millis(900));
        assert_eq!(clock.elapsed(), Duration::from_millis(900));
    }

    #[test]
    fn clock_source_reports_lab() {
        assert!(!Clock::Real.is_lab());
        assert!(Clock::Lab(LabClock::new()).is_lab());
    }

    #[test]
    fn lab_source_reads_lab_time() {
        let lab = LabClock::new();
        let clock = Clock::Lab(lab.clone());
        lab.advance(Duration::from_millis(42));
        assert_eq!(clock.now(), lab.now());
    }
}
