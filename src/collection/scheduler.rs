//! Fixed-interval refresh ticker.

use std::{
    thread,
    time::{Duration, Instant},
};

/// Drives the one-refresh-per-interval contract for the caller's loop.
///
/// Deadlines advance in whole intervals from the previous deadline rather
/// than from "now", so time spent sampling and rendering does not stretch
/// the cadence. If a cycle overruns, missed deadlines are skipped instead of
/// bunching up.
pub struct RefreshScheduler {
    interval: Duration,
    deadline: Instant,
}

impl RefreshScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: Instant::now() + interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Blocks until the next deadline, then arms the one after it.
    pub fn wait(&mut self) {
        let now = Instant::now();
        if let Some(remaining) = self.deadline.checked_duration_since(now) {
            thread::sleep(remaining);
        }
        self.deadline = next_deadline(self.deadline, Instant::now(), self.interval);
    }
}

fn next_deadline(previous: Instant, now: Instant, interval: Duration) -> Instant {
    let mut next = previous + interval;
    while next <= now {
        next += interval;
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(1);

    #[test]
    fn deadline_advances_by_one_interval() {
        let base = Instant::now();
        let next = next_deadline(base, base + Duration::from_millis(200), INTERVAL);
        assert_eq!(next, base + INTERVAL);
    }

    #[test]
    fn overrun_skips_missed_deadlines() {
        let base = Instant::now();
        // 2.5 intervals late: the next deadline is the third tick, not a
        // burst of catch-up ticks.
        let next = next_deadline(base, base + Duration::from_millis(2_500), INTERVAL);
        assert_eq!(next, base + 3 * INTERVAL);
    }
}
