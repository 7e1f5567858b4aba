//! Monotonic time and fixed-period pacing for the control loop.

use std::time::{Duration, Instant};

/// Monotonic time source, expressed as the time elapsed since the clock's origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;

    /// Block until `now() >= deadline`; returns immediately if already past.
    fn sleep_until(&self, deadline: Duration);
}

/// Wall-independent clock backed by `Instant`. Sleeps spin for the final stretch,
/// which keeps millisecond periods accurate where the OS timer is coarse.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep_until(&self, deadline: Duration) {
        let now = self.now();
        if deadline > now {
            spin_sleep::sleep(deadline - now);
        }
    }
}

/// Result of closing out one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Work finished early; slept for the remainder.
    OnTime { slack: Duration },
    /// Work took longer than the period; the next tick starts immediately.
    Overrun { by: Duration },
}

/// Holds a loop to a fixed period measured from the start of the current tick.
///
/// There is no ideal schedule to catch up with: an overrun costs that one tick and the
/// next tick is paced from wherever it actually started.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    period: Duration,
}

impl Pacer {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn finish(&self, clock: &dyn Clock, tick_start: Duration) -> TickOutcome {
        let deadline = tick_start + self.period;
        let now = clock.now();
        if now < deadline {
            clock.sleep_until(deadline);
            TickOutcome::OnTime {
                slack: deadline - now,
            }
        } else {
            TickOutcome::Overrun {
                by: now - deadline,
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod manual {
    use super::Clock;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Test clock that only moves when told to, or when slept on.
    #[derive(Debug, Default)]
    pub struct ManualClock {
        now: Mutex<Duration>,
    }

    impl ManualClock {
        pub fn advance(&self, by: Duration) {
            *self.now.lock() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Duration {
            *self.now.lock()
        }

        fn sleep_until(&self, deadline: Duration) {
            let mut now = self.now.lock();
            if deadline > *now {
                *now = deadline;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::manual::ManualClock;
    use super::*;

    const P: Duration = Duration::from_millis(10);

    fn run(clock: &ManualClock, pacer: &Pacer, work: &[Duration]) -> Vec<Duration> {
        let mut starts = Vec::new();
        for w in work {
            let start = clock.now();
            starts.push(start);
            clock.advance(*w);
            pacer.finish(clock, start);
        }
        starts
    }

    #[test]
    fn test_short_work_is_spaced_by_period() {
        let clock = ManualClock::default();
        let pacer = Pacer::new(P);
        let starts = run(&clock, &pacer, &[Duration::from_millis(3); 6]);
        for pair in starts.windows(2) {
            assert_eq!(pair[1] - pair[0], P);
        }
    }

    #[test]
    fn test_overrun_starts_next_tick_immediately_without_backlog() {
        let clock = ManualClock::default();
        let pacer = Pacer::new(P);
        let ms = Duration::from_millis;
        let starts = run(&clock, &pacer, &[ms(2), ms(25), ms(2), ms(2), ms(2)]);
        assert_eq!(starts[1] - starts[0], P);
        // The overrunning tick is followed at once, not after a sleep
        assert_eq!(starts[2] - starts[1], ms(25));
        // Then normal spacing resumes; no attempt to recover the lost time
        assert_eq!(starts[3] - starts[2], P);
        assert_eq!(starts[4] - starts[3], P);
    }

    #[test]
    fn test_outcome_reports_slack_and_overrun() {
        let clock = ManualClock::default();
        let pacer = Pacer::new(P);
        clock.advance(Duration::from_millis(4));
        assert_eq!(
            pacer.finish(&clock, Duration::ZERO),
            TickOutcome::OnTime {
                slack: Duration::from_millis(6)
            }
        );
        let start = clock.now();
        clock.advance(Duration::from_millis(13));
        assert_eq!(
            pacer.finish(&clock, start),
            TickOutcome::Overrun {
                by: Duration::from_millis(3)
            }
        );
    }

    #[test]
    fn test_monotonic_clock_sleeps_to_deadline() {
        let clock = MonotonicClock::new();
        let deadline = clock.now() + Duration::from_millis(3);
        clock.sleep_until(deadline);
        assert!(clock.now() >= deadline);
        // Past deadlines return at once
        let before = clock.now();
        clock.sleep_until(Duration::ZERO);
        assert!(clock.now() - before < Duration::from_millis(50));
    }
}
