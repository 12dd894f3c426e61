//! Per-engine limits: time control, grace periods and memory.
//!
//! The main entry point is the [`ConstraintsBuilder`] struct, which uses a builder pattern
//! to configure limits:
//!
//! - **Time control**: base time plus increment per move, per side
//! - **Think grace**: how long past its clock an engine may take before it forfeits
//! - **Startup timeout**: bound on the initial handshake
//! - **Shutdown grace**: how long an engine gets to exit after `quit` before it is killed
//! - **Memory**: optional RAM limit per engine process, enforced with Linux cgroups v2
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use enginetest::constraints::ConstraintsBuilder;
//!
//! let constraints = ConstraintsBuilder::new()
//!     .with_time_control("10+0.1".parse().unwrap())
//!     .with_think_grace(Duration::from_millis(200))
//!     .with_ram_per_engine(512)
//!     .build()
//!     .unwrap();
//! ```
//!
//! You may also construct constraints from environment variables using
//! [`ConstraintsBuilder::from_env()`] for runtime configurability.

use std::{env, fmt::Display, str::FromStr, time::Duration};

use anyhow::{bail, Context};
use thiserror::Error;
use tracing::warn;

/// Base time plus increment, in the `base+inc` seconds notation (`10+0.1`, `60`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeControl {
    /// Initial clock time per side.
    pub base: Duration,
    /// Added to the mover's clock after each move.
    pub increment: Duration,
}

impl TimeControl {
    /// Time control from milliseconds.
    pub fn from_millis(base: u64, increment: u64) -> TimeControl {
        TimeControl {
            base: Duration::from_millis(base),
            increment: Duration::from_millis(increment),
        }
    }
}

impl Default for TimeControl {
    fn default() -> Self {
        Self::from_millis(10_000, 100)
    }
}

/// Error returned when a time control string cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid time control '{0}': expected <seconds>[+<seconds>], e.g. 10+0.1")]
pub struct ParseTimeControlError(String);

impl FromStr for TimeControl {
    type Err = ParseTimeControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseTimeControlError(s.to_string());
        let seconds = |part: &str| -> Result<Duration, ParseTimeControlError> {
            let value: f64 = part.trim().parse().map_err(|_| err())?;
            if !value.is_finite() || value < 0.0 {
                return Err(err());
            }
            Duration::try_from_secs_f64(value).map_err(|_| err())
        };

        let (base, increment) = match s.split_once('+') {
            Some((base, inc)) => (seconds(base)?, seconds(inc)?),
            None => (seconds(s)?, Duration::ZERO),
        };
        if base.is_zero() {
            return Err(err());
        }
        Ok(TimeControl { base, increment })
    }
}

impl Display for TimeControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}+{}",
            self.base.as_secs_f64(),
            self.increment.as_secs_f64()
        )
    }
}

/// A builder for the limits applied to every engine process.
///
/// By default: `10+0.1` time control, 100 ms think grace, 10 s startup timeout,
/// 500 ms shutdown grace and no memory limit.
#[derive(Debug, Default)]
pub struct ConstraintsBuilder {
    time_control: Option<TimeControl>,
    think_grace: Option<Duration>,
    startup_timeout: Option<Duration>,
    shutdown_grace: Option<Duration>,
    engine_ram: Option<usize>,
}

impl ConstraintsBuilder {
    /// Creates a new `ConstraintsBuilder` with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new `ConstraintsBuilder` configured from environment variables.
    ///
    /// Read environment variables are:
    /// - `TIME_CONTROL` (string): e.g. `"10+0.1"`
    /// - `THINK_GRACE_MS` (u64): extra time before a slow engine forfeits
    /// - `STARTUP_TIMEOUT_MS` (u64): handshake timeout
    /// - `SHUTDOWN_GRACE_MS` (u64): time given to exit before being killed
    /// - `ENGINE_RAM_MB` (usize): memory limit per engine process
    ///
    /// Unset or unparsable variables leave the default in place.
    #[must_use]
    pub fn from_env() -> Self {
        fn parse<T: FromStr>(var: &str) -> Option<T> {
            env::var(var).ok()?.parse().ok()
        }

        fn parse_millis(var: &str) -> Option<Duration> {
            parse::<u64>(var).map(Duration::from_millis)
        }

        ConstraintsBuilder {
            time_control: parse("TIME_CONTROL"),
            think_grace: parse_millis("THINK_GRACE_MS"),
            startup_timeout: parse_millis("STARTUP_TIMEOUT_MS"),
            shutdown_grace: parse_millis("SHUTDOWN_GRACE_MS"),
            engine_ram: parse("ENGINE_RAM_MB"),
        }
    }

    /// Sets the time control of every game.
    #[must_use]
    pub fn with_time_control(self, time_control: TimeControl) -> Self {
        Self {
            time_control: Some(time_control),
            ..self
        }
    }

    /// Sets the extra time an engine may use past its clock before it forfeits.
    #[must_use]
    pub fn with_think_grace(self, duration: Duration) -> Self {
        Self {
            think_grace: Some(duration),
            ..self
        }
    }

    /// Sets the maximum duration of the initial handshake.
    #[must_use]
    pub fn with_startup_timeout(self, duration: Duration) -> Self {
        Self {
            startup_timeout: Some(duration),
            ..self
        }
    }

    /// Sets how long an engine may take to exit after `quit` before being killed.
    #[must_use]
    pub fn with_shutdown_grace(self, duration: Duration) -> Self {
        Self {
            shutdown_grace: Some(duration),
            ..self
        }
    }

    /// Sets the maximum RAM available per engine process (in MB).
    #[must_use]
    pub fn with_ram_per_engine(self, max: usize) -> Self {
        Self {
            engine_ram: Some(max),
            ..self
        }
    }

    /// Consumes the builder and returns the constructed `Constraints`.
    ///
    /// # Errors
    ///
    /// Returns an error when the limits are impossible, e.g. an engine RAM limit larger than
    /// the memory currently available.
    pub fn build(self) -> anyhow::Result<Constraints> {
        let engine_ram = match self.engine_ram {
            Some(0) => bail!("engine RAM limit must be positive"),
            Some(mb) => {
                let mut sys = sysinfo::System::new();
                sys.refresh_memory();
                let available = sys.available_memory() as usize;
                let requested = mb
                    .checked_mul(1_000_000)
                    .with_context(|| format!("engine RAM size ({mb}MB) is out of range"))?;
                if requested > available {
                    bail!(
                        "engine RAM size ({mb}MB) is greater than available RAM ({}MB)",
                        available / 1_000_000
                    );
                }
                Some(requested)
            }
            None => None,
        };

        Ok(Constraints {
            time_control: self.time_control.unwrap_or_default(),
            think_grace: self.think_grace.unwrap_or(Duration::from_millis(100)),
            startup_timeout: self.startup_timeout.unwrap_or(Duration::from_secs(10)),
            shutdown_grace: self.shutdown_grace.unwrap_or(Duration::from_millis(500)),
            engine_ram,
        })
    }
}

/// Obtained using `ConstraintsBuilder`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Constraints {
    pub(crate) time_control: TimeControl,
    pub(crate) think_grace: Duration,
    pub(crate) startup_timeout: Duration,
    pub(crate) shutdown_grace: Duration,
    /// bytes
    pub(crate) engine_ram: Option<usize>,
}

impl Default for Constraints {
    fn default() -> Self {
        Constraints {
            time_control: TimeControl::default(),
            think_grace: Duration::from_millis(100),
            startup_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_millis(500),
            engine_ram: None,
        }
    }
}

impl Constraints {
    /// create a ConstraintsBuilder
    pub fn builder() -> ConstraintsBuilder {
        ConstraintsBuilder::new()
    }

    /// Time control of every game.
    pub fn time_control(&self) -> TimeControl {
        self.time_control
    }

    /// Warn when concurrent games would run more engines than there are physical cores.
    pub(crate) fn check_concurrency(&self, concurrency: usize) {
        let physical = num_cpus::get_physical();
        // two engines per game, but only one of them thinks at a time
        if concurrency > physical {
            warn!(
                "concurrency {concurrency} exceeds the {physical} physical CPUs: engines will compete for cores and timing will suffer"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_time_controls() {
        let tc: TimeControl = "10+0.1".parse().unwrap();
        assert_eq!(tc, TimeControl::from_millis(10_000, 100));

        let tc: TimeControl = "60".parse().unwrap();
        assert_eq!(tc, TimeControl::from_millis(60_000, 0));

        let tc: TimeControl = "0.5+0".parse().unwrap();
        assert_eq!(tc.base, Duration::from_millis(500));
    }

    #[test]
    fn rejects_bad_time_controls() {
        for bad in ["", "abc", "0+1", "-1+0", "10+x", "nan", "10+-1", "1e30", "10+1e300"] {
            assert!(bad.parse::<TimeControl>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn time_control_display_round_trips() {
        let tc = TimeControl::from_millis(10_000, 100);
        assert_eq!(tc.to_string(), "10+0.1");
        assert_eq!(tc.to_string().parse::<TimeControl>().unwrap(), tc);
    }

    #[test]
    fn builder_defaults() {
        let constraints = ConstraintsBuilder::new().build().unwrap();
        assert_eq!(constraints, Constraints::default());
        assert_eq!(constraints.engine_ram, None);
    }

    #[test]
    fn builder_overrides() {
        let constraints = Constraints::builder()
            .with_time_control(TimeControl::from_millis(1000, 10))
            .with_think_grace(Duration::from_millis(5))
            .with_startup_timeout(Duration::from_millis(50))
            .with_shutdown_grace(Duration::from_millis(7))
            .build()
            .unwrap();
        assert_eq!(constraints.time_control(), TimeControl::from_millis(1000, 10));
        assert_eq!(constraints.think_grace, Duration::from_millis(5));
        assert_eq!(constraints.startup_timeout, Duration::from_millis(50));
        assert_eq!(constraints.shutdown_grace, Duration::from_millis(7));
    }

    #[test]
    fn impossible_ram_is_rejected() {
        assert!(ConstraintsBuilder::new()
            .with_ram_per_engine(usize::MAX / 2_000_000)
            .build()
            .is_err());
        assert!(ConstraintsBuilder::new().with_ram_per_engine(0).build().is_err());
    }

    #[test]
    fn overflowing_ram_is_an_error() {
        let err = ConstraintsBuilder::new()
            .with_ram_per_engine(usize::MAX)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err:#}");
    }

    #[test]
    fn huge_time_controls_parse() {
        let tc: TimeControl = "1e15+0".parse().unwrap();
        assert_eq!(tc.base, Duration::from_secs(1_000_000_000_000_000));
    }
}
