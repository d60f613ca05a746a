//! The plumb tick mechanism
//!
//! Every periodic activity in plumb, source gathers and sink flushes alike,
//! waits on a [`Ticker`]. A ticker fires once per interval, optionally on
//! interval boundaries of the wall clock, and delays each firing by a uniform
//! random jitter so that many agents do not all collect in the same instant.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use tokio::time;

pub mod schedule;

pub use schedule::Schedule;

/// Errors produced by [`Ticker`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The tick interval was zero.
    #[error("tick interval must be greater than zero")]
    ZeroInterval,
}

#[async_trait]
/// The `Clock` every ticker reads and waits on.
pub trait Clock {
    /// Wall-clock time elapsed since the Unix epoch.
    fn now(&self) -> Duration;
    /// Wait for `duration` to pass.
    async fn wait(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
/// A clock that operates with respect to real time.
pub struct RealClock;

#[async_trait]
impl Clock for RealClock {
    fn now(&self) -> Duration {
        // A system clock set before 1970 reads as the epoch itself.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }

    async fn wait(&self, duration: Duration) {
        time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Configuration of a [`Ticker`].
pub struct Config {
    /// Time between consecutive ticks.
    pub interval: Duration,
    /// Upper bound, exclusive, of the random delay added to every tick.
    pub jitter: Duration,
    /// Fire on multiples of `interval` since the Unix epoch rather than on
    /// multiples since the ticker was created.
    pub aligned: bool,
}

/// Fires once per configured interval.
#[derive(Debug)]
pub struct Ticker<C = RealClock> {
    schedule: Schedule,
    jitter: Duration,
    clock: C,
    rng: SmallRng,
    /// Deadline of a tick whose wait was abandoned before it fired.
    pending: Option<Duration>,
}

impl Ticker<RealClock> {
    /// Create a new ticker against the real clock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroInterval`] if the configured interval is zero.
    pub fn new(config: Config) -> Result<Self, Error> {
        let seed = rand::rng().random();
        Self::with_clock(config, RealClock, seed)
    }
}

impl<C> Ticker<C>
where
    C: Clock + Send + Sync,
{
    /// Create a new ticker against the given clock with a fixed jitter seed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroInterval`] if the configured interval is zero.
    pub fn with_clock(config: Config, clock: C, seed: u64) -> Result<Self, Error> {
        let schedule = Schedule::new(config.interval, config.aligned, clock.now())?;
        Ok(Self {
            schedule,
            jitter: config.jitter,
            clock,
            rng: SmallRng::seed_from_u64(seed),
            pending: None,
        })
    }

    fn sample_jitter(&mut self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }
        let bound = u64::try_from(self.jitter.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(self.rng.random_range(0..bound))
    }

    /// Wait for the next tick, returning its deadline as wall-clock time since
    /// the Unix epoch.
    ///
    /// Ticks missed because the caller was busy are skipped rather than fired
    /// in a burst. Dropping the returned future mid-wait does not skip that
    /// tick: the next call waits for the same deadline.
    pub async fn tick(&mut self) -> Duration {
        let now = self.clock.now();
        let deadline = match self.pending {
            Some(deadline) if deadline > now => deadline,
            _ => {
                let jitter = self.sample_jitter();
                self.schedule.next_deadline(now, jitter)
            }
        };
        self.pending = Some(deadline);
        self.clock.wait(deadline.saturating_sub(now)).await;
        self.pending = None;
        deadline
    }

    /// The configured interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.schedule.interval()
    }
}
