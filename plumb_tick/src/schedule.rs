//! Tick schedule
//!
//! The non-async interior of [`crate::Ticker`]. Given the current time and a
//! jitter sample it decides when the next tick fires, without touching a clock
//! or a random number generator, which keeps it easy to make claims about.

use std::time::Duration;

use crate::Error;

#[derive(Debug, Clone, Copy)]
/// Decides tick deadlines.
///
/// Ticks fire at `anchor + k * interval + jitter` for increasing `k`. An
/// aligned schedule anchors at the Unix epoch so ticks land on wall-clock
/// multiples of the interval; an unaligned schedule anchors at its creation
/// time.
pub struct Schedule {
    interval: Duration,
    anchor: Duration,
    /// The most recent base, without jitter, handed out.
    last_base: Option<Duration>,
}

impl Schedule {
    /// Create a new schedule.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroInterval`] if `interval` is zero.
    pub fn new(interval: Duration, aligned: bool, now: Duration) -> Result<Self, Error> {
        if interval.is_zero() {
            return Err(Error::ZeroInterval);
        }
        let anchor = if aligned { Duration::ZERO } else { now };
        Ok(Self {
            interval,
            anchor,
            last_base: None,
        })
    }

    /// The interval between ticks.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Compute the deadline of the next tick.
    ///
    /// The base of the returned deadline is the first interval boundary
    /// strictly after `now`, so boundaries that passed while the caller was
    /// busy are skipped. `jitter` is added to that base unchanged.
    pub fn next_deadline(&mut self, now: Duration, jitter: Duration) -> Duration {
        let interval = self.interval.as_nanos();
        let since_anchor = now.saturating_sub(self.anchor).as_nanos();
        let periods = since_anchor / interval + 1;
        let offset = periods.saturating_mul(interval);
        let mut base = self.anchor + nanos(offset);

        if let Some(last) = self.last_base {
            if base <= last {
                base = last + self.interval;
            }
        }
        self.last_base = Some(base);
        base + jitter
    }
}

fn nanos(value: u128) -> Duration {
    let secs = value / 1_000_000_000;
    let sub = value % 1_000_000_000;
    // Both casts are range-checked: `sub` is below one billion and `secs`
    // saturates.
    Duration::new(
        u64::try_from(secs).unwrap_or(u64::MAX),
        u32::try_from(sub).unwrap_or(0),
    )
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn first_aligned_deadline_is_next_boundary() {
        let mut schedule =
            Schedule::new(Duration::from_secs(10), true, Duration::from_secs(7)).unwrap();
        assert_eq!(
            schedule.next_deadline(Duration::from_secs(7), Duration::ZERO),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn on_boundary_waits_a_full_interval() {
        let mut schedule =
            Schedule::new(Duration::from_secs(10), true, Duration::from_secs(10)).unwrap();
        assert_eq!(
            schedule.next_deadline(Duration::from_secs(10), Duration::ZERO),
            Duration::from_secs(20)
        );
    }

    #[test]
    fn clock_stepping_backwards_never_repeats_a_base() {
        let mut schedule =
            Schedule::new(Duration::from_secs(10), true, Duration::from_secs(15)).unwrap();
        let first = schedule.next_deadline(Duration::from_secs(15), Duration::ZERO);
        let second = schedule.next_deadline(Duration::from_secs(3), Duration::ZERO);
        assert_eq!(first, Duration::from_secs(20));
        assert_eq!(second, Duration::from_secs(30));
    }

    proptest! {
        #[test]
        fn deadlines_are_in_the_future_and_bounded(
            interval_ms in 1u64..100_000,
            jitter_ms in 0u64..100_000,
            aligned in any::<bool>(),
            start_ms in 0u64..10_000_000,
            steps in proptest::collection::vec(0u64..500_000, 1..50),
        ) {
            let interval = Duration::from_millis(interval_ms);
            let mut now = Duration::from_millis(start_ms);
            let mut schedule = Schedule::new(interval, aligned, now).unwrap();

            let mut previous: Option<Duration> = None;
            for step in steps {
                let jitter = Duration::from_millis(step % (jitter_ms + 1));
                let deadline = schedule.next_deadline(now, jitter);
                let base = deadline - jitter;

                prop_assert!(base > now, "base {base:?} not after now {now:?}");
                prop_assert!(base <= now + interval, "base {base:?} more than an interval out");
                if aligned {
                    prop_assert_eq!(base.as_nanos() % interval.as_nanos(), 0);
                }
                if let Some(previous) = previous {
                    prop_assert!(base > previous, "base {base:?} repeated");
                }
                previous = Some(base);

                // The caller sleeps to the deadline, then works for a while.
                now = deadline + Duration::from_millis(step);
            }
        }
    }
}
