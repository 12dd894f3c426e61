//! Config for the match runner behaviors
//!
//! This module provides configuration options for controlling the behavior of the runner,
//! as opposed to the tournament itself (see [`TournamentConfig`](crate::tournament::TournamentConfig)).
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! The following environment variables can be used to override configuration values. All
//! values are optional, and case-insensitive. Set the value to `"true"` to enable a flag.
//!
//! - `MATCH_VERBOSE`: Print game results and progress to stdout (default: `true`)
//! - `MATCH_LOG`: Enable logging to a file (default: `false`)
//! - `MATCH_ALLOW_UNCONTAINED`: Run engines without a cgroup when containment is unavailable (default: `false`)
//! - `MATCH_DEBUG_ENGINE_STDERR`: Let engines write to our stderr (default: `false`)

/// Configuration for runner behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Configuration {
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) allow_uncontained: bool,
    pub(crate) debug_engine_stderr: bool,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Game results and progress are printed to stdout.
    /// - Logging to file is disabled.
    /// - Engines are not started when a requested memory limit cannot be enforced.
    /// - Engine stderr output is discarded.
    pub fn new() -> Self {
        Self {
            verbose: true,
            log: false,
            allow_uncontained: false,
            debug_engine_stderr: false,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// The following environment variables are recognized:
    /// - `MATCH_VERBOSE`: if set to `"true"`, enables progress output (default: `true`)
    /// - `MATCH_LOG`: if set to `"true"`, enables logging to file (default: `false`)
    /// - `MATCH_ALLOW_UNCONTAINED`: if set to `"true"`, allows uncontained engines (default: `false`)
    /// - `MATCH_DEBUG_ENGINE_STDERR`: if set to `"true"`, forwards engine stderr (default: `false`)
    ///
    /// Any other value (including unset) will result in using the default value for each field.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        Self {
            verbose: get_env_flag("MATCH_VERBOSE", true),
            log: get_env_flag("MATCH_LOG", false),
            allow_uncontained: get_env_flag("MATCH_ALLOW_UNCONTAINED", false),
            debug_engine_stderr: get_env_flag("MATCH_DEBUG_ENGINE_STDERR", false),
        }
    }

    /// Enable or disable progress output.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Allow engines to run without memory containment when cgroups are unavailable.
    pub fn with_allow_uncontained(mut self, value: bool) -> Self {
        self.allow_uncontained = value;
        self
    }

    /// Enable or disable engine stderr output (debug purposes only).
    pub fn with_debug_engine_stderr(mut self, value: bool) -> Self {
        self.debug_engine_stderr = value;
        self
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
