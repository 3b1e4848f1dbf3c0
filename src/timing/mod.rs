//! Tick pacing for the acquisition loop
//!
//! Ticks are scheduled on a fixed grid from the session start. A tick whose
//! work runs past the next deadline is an overrun. The schedule then moves to
//! the grid point nearest the current instant: the deadlines it skipped are
//! never replayed as a burst, and the grid phase is kept so small delays do
//! not accumulate over a session.

use std::time::{Duration, Instant};

/// Cadence derived from a target frame rate
pub fn tick_interval(framerate_hz: u32) -> Duration {
    Duration::from_millis(1000 / u64::from(framerate_hz.max(1)))
}

fn nanos(n: u128) -> Duration {
    Duration::from_nanos(u64::try_from(n).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone)]
pub struct TickSchedule {
    interval: Duration,
    next: Instant,
    ticks: u64,
    overruns: u64,
}

impl TickSchedule {
    /// First tick is due immediately.
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(Instant::now(), interval)
    }

    pub fn starting_at(start: Instant, interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_nanos(1)),
            next: start,
            ticks: 0,
            overruns: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// When the next tick should start
    pub fn deadline(&self) -> Instant {
        self.next
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next
    }

    /// Record that the current tick finished at `now` and schedule the next.
    ///
    /// Returns how many deadlines were missed while the tick ran. A late
    /// tick counts as one overrun however many deadlines it skipped. After
    /// an overrun the next tick runs on the closest grid point, so no two
    /// ticks start less than half an interval apart.
    pub fn complete(&mut self, now: Instant) -> u64 {
        self.ticks += 1;
        let candidate = self.next + self.interval;
        if now <= candidate {
            self.next = candidate;
            return 0;
        }

        let interval = self.interval.as_nanos();
        let late = now.duration_since(candidate).as_nanos();
        let behind = late / interval;
        let missed = behind as u64 + 1;
        self.overruns += 1;

        // Latest grid point not after `now`, and how far past it we are.
        let latest = candidate + nanos(behind * interval);
        let lag = late % interval;
        self.next = if lag * 2 <= interval {
            latest
        } else {
            latest + self.interval
        };
        missed
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_interval_from_framerate() {
        assert_eq!(tick_interval(30), Duration::from_millis(33));
        assert_eq!(tick_interval(5), Duration::from_millis(200));
        assert_eq!(tick_interval(60), Duration::from_millis(16));
    }

    #[test]
    fn test_on_time_ticks_follow_grid() {
        let t0 = Instant::now();
        let mut s = TickSchedule::starting_at(t0, 10 * MS);
        assert!(s.is_due(t0));
        assert_eq!(s.complete(t0 + 2 * MS), 0);
        assert_eq!(s.deadline(), t0 + 10 * MS);
        assert_eq!(s.complete(t0 + 15 * MS), 0);
        assert_eq!(s.deadline(), t0 + 20 * MS);
        assert_eq!(s.overruns(), 0);
    }

    #[test]
    fn test_overrun_skips_to_nearest_grid_point() {
        let t0 = Instant::now();
        let mut s = TickSchedule::starting_at(t0, 10 * MS);
        // Tick 0 blocked for 35ms: deadlines at 10, 20 and 30 passed.
        assert_eq!(s.complete(t0 + 35 * MS), 3);
        assert_eq!(s.overruns(), 1);
        // 30 is closer than 40, so the next tick is due at once.
        assert_eq!(s.deadline(), t0 + 30 * MS);
        assert_eq!(s.complete(t0 + 36 * MS), 0);
        assert_eq!(s.deadline(), t0 + 40 * MS);
        assert_eq!(s.ticks(), 2);
    }

    #[test]
    fn test_overrun_late_in_slot_waits_for_next_point() {
        let t0 = Instant::now();
        let mut s = TickSchedule::starting_at(t0, 10 * MS);
        assert_eq!(s.complete(t0 + 38 * MS), 3);
        assert_eq!(s.deadline(), t0 + 40 * MS);
        assert_eq!(s.overruns(), 1);
    }

    #[test]
    fn test_jitter_does_not_accumulate() {
        let t0 = Instant::now();
        let mut s = TickSchedule::starting_at(t0, 10 * MS);
        // Every other tick runs 2ms long; the grid stays at multiples of 10.
        let mut now = t0;
        for k in 0..10 {
            now = now.max(s.deadline());
            now += if k % 2 == 0 { 12 * MS } else { MS };
            s.complete(now);
        }
        assert_eq!(s.deadline(), t0 + 100 * MS);
        assert_eq!(s.overruns(), 5);
    }

    #[test]
    fn test_slightly_late_counts_once() {
        let t0 = Instant::now();
        let mut s = TickSchedule::starting_at(t0, 10 * MS);
        assert_eq!(s.complete(t0 + 11 * MS), 1);
        assert_eq!(s.deadline(), t0 + 10 * MS);
    }
}
