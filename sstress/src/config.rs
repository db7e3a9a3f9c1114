//! Harness configuration: command-line surface and validation.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::runtime::timing::{Duration, Millis};
use crate::trace::{DEFAULT_LOG_MASK, LogLevel};
use crate::transport::scripted::ScriptPlan;

/// Upper bound on `-c`.
pub const MAX_CONCURRENCY: u32 = 100;

pub const DEFAULT_TIMEOUT_MS: u64 = 8000;
pub const DEFAULT_WATCHDOG_GRACE_MS: u64 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--force-portal and --force-no-internet are mutually exclusive")]
    ConflictingFaultSimulation,

    #[error("concurrency {0} is out of range 1..={MAX_CONCURRENCY}")]
    ConcurrencyOutOfRange(u32),

    #[error("budget must be at least 1")]
    ZeroBudget,

    #[error("per-attempt timeout must be at least 1ms")]
    ZeroTimeout,

    #[error("instance ordinal {instance} is out of range for concurrency {concurrency}")]
    InstanceOutOfRange { instance: u32, concurrency: u32 },
}

/// Named stream type the attempts use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Mintest,
    MintestOts,
    Respmap,
}

impl StreamType {
    /// `--ots` wins over `--respmap`.
    #[must_use]
    pub const fn select(ots: bool, respmap: bool) -> Self {
        if ots {
            Self::MintestOts
        } else if respmap {
            Self::Respmap
        } else {
            Self::Mintest
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mintest => "mintest",
            Self::MintestOts => "mintest-ots",
            Self::Respmap => "respmap",
        }
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Synthetic network degradation injected through the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultSimulation {
    #[default]
    None,
    /// Connectivity check answers with a redirect.
    CaptivePortal,
    /// Connectivity check endpoint has nothing listening.
    NoInternet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FanoutMode {
    /// Re-execute this binary once per extra instance.
    #[default]
    Process,
    /// One named thread per instance inside this process.
    Thread,
}

/// Stress harness driving policy-configured streams through budgeted
/// connect/transfer/disconnect cycles.
#[derive(Parser, Debug, Clone)]
#[command(name = "sstress")]
#[command(version, about, long_about = None)]
pub struct HarnessArgs {
    /// Number of concurrent instances (1..=100)
    #[arg(short = 'c', long = "concurrency", default_value_t = 1, env = "SSTRESS_CONCURRENCY")]
    pub concurrency: u32,

    /// Log bitmask: err=1 warn=2 notice=4 info=8 debug=16 user=1024
    #[arg(short = 'd', default_value_t = DEFAULT_LOG_MASK, env = "SSTRESS_LOG_MASK")]
    pub log_mask: u32,

    /// Make the connectivity check look like a captive portal
    #[arg(long)]
    pub force_portal: bool,

    /// Make the connectivity check look like there is no internet
    #[arg(long)]
    pub force_no_internet: bool,

    /// Use the `respmap` stream type
    #[arg(long)]
    pub respmap: bool,

    /// Use the `mintest-ots` stream type
    #[arg(long)]
    pub ots: bool,

    /// Per-attempt timeout in milliseconds
    #[arg(
        long = "timeout_ms",
        alias = "timeout-ms",
        default_value_t = DEFAULT_TIMEOUT_MS,
        env = "SSTRESS_TIMEOUT_MS"
    )]
    pub timeout_ms: u64,

    /// Number of attempts each instance may make
    #[arg(long, default_value_t = 1, env = "SSTRESS_BUDGET")]
    pub budget: u32,

    /// Successes needed for a good verdict (defaults to the budget)
    #[arg(long, env = "SSTRESS_PASS_LIMIT")]
    pub pass_limit: Option<u32>,

    /// Indicator the run is expected to end with
    #[arg(long, default_value_t = 0, env = "SSTRESS_EXPECTED_EXIT")]
    pub expected_exit: u8,

    /// Policy document to use instead of the built-in one
    #[arg(long, env = "SSTRESS_POLICY")]
    pub policy: Option<PathBuf>,

    /// Directory receiving the per-instance `ctx<k>.log` files
    #[arg(long, default_value = "/tmp", env = "SSTRESS_LOG_DIR")]
    pub log_dir: PathBuf,

    /// Drive a scripted in-memory transport instead of the network,
    /// e.g. `succeed` or `timeout,succeed`
    #[arg(long, env = "SSTRESS_SIMULATE")]
    pub simulate: Option<ScriptPlan>,

    /// Slack added to the budget × timeout watchdog deadline, in milliseconds
    #[arg(long, default_value_t = DEFAULT_WATCHDOG_GRACE_MS)]
    pub watchdog_grace_ms: u64,

    /// How extra instances are started
    #[arg(long, value_enum, default_value_t = FanoutMode::Process)]
    pub fanout: FanoutMode,

    /// Run only this instance ordinal (used by spawned children)
    #[arg(long, hide = true)]
    pub instance: Option<u32>,
}

/// Validated harness configuration shared read-only by every instance.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub concurrency: u32,
    pub timeout: Duration<Millis>,
    pub budget: u32,
    pub pass_limit: u32,
    pub fault: FaultSimulation,
    pub stream_type: StreamType,
    pub expected_exit: u8,
    pub log_level: LogLevel,
    pub log_dir: PathBuf,
    pub policy_path: Option<PathBuf>,
    pub simulate: Option<ScriptPlan>,
    pub watchdog_grace: Duration<Millis>,
    pub fanout: FanoutMode,
    pub instance: Option<u32>,
    /// Set when both fault switches were given; rejected by `validate`.
    conflicting_faults: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            budget: 1,
            pass_limit: 1,
            fault: FaultSimulation::None,
            stream_type: StreamType::Mintest,
            expected_exit: 0,
            log_level: LogLevel::from_mask(DEFAULT_LOG_MASK),
            log_dir: std::env::temp_dir(),
            policy_path: None,
            simulate: None,
            watchdog_grace: Duration::from_millis(DEFAULT_WATCHDOG_GRACE_MS),
            fanout: FanoutMode::Process,
            instance: None,
            conflicting_faults: false,
        }
    }
}

impl HarnessConfig {
    /// Single validation point for every configuration source.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.conflicting_faults {
            return Err(ConfigError::ConflictingFaultSimulation);
        }
        if !(1..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(ConfigError::ConcurrencyOutOfRange(self.concurrency));
        }
        if self.budget == 0 {
            return Err(ConfigError::ZeroBudget);
        }
        if self.timeout == Duration::ZERO {
            return Err(ConfigError::ZeroTimeout);
        }
        if let Some(instance) = self.instance
            && instance >= self.concurrency
        {
            return Err(ConfigError::InstanceOutOfRange {
                instance,
                concurrency: self.concurrency,
            });
        }
        Ok(())
    }

    /// Watchdog deadline: budget × per-attempt timeout, plus grace.
    #[must_use]
    pub fn watchdog_deadline(&self) -> Duration<Millis> {
        self.timeout
            .saturating_mul(u64::from(self.budget))
            .saturating_add(self.watchdog_grace)
    }
}

impl TryFrom<HarnessArgs> for HarnessConfig {
    type Error = ConfigError;

    fn try_from(args: HarnessArgs) -> Result<Self, Self::Error> {
        let fault = match (args.force_portal, args.force_no_internet) {
            (true, false) => FaultSimulation::CaptivePortal,
            (false, true) => FaultSimulation::NoInternet,
            _ => FaultSimulation::None,
        };
        let config = Self {
            concurrency: args.concurrency,
            timeout: Duration::from_millis(args.timeout_ms),
            budget: args.budget,
            pass_limit: args.pass_limit.unwrap_or(args.budget),
            fault,
            stream_type: StreamType::select(args.ots, args.respmap),
            expected_exit: args.expected_exit,
            log_level: LogLevel::from_mask(args.log_mask),
            log_dir: args.log_dir,
            policy_path: args.policy,
            simulate: args.simulate,
            watchdog_grace: Duration::from_millis(args.watchdog_grace_ms),
            fanout: args.fanout,
            instance: args.instance,
            conflicting_faults: args.force_portal && args.force_no_internet,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn parse(argv: &[&str]) -> Result<HarnessConfig, ConfigError> {
        let args = HarnessArgs::try_parse_from(std::iter::once("sstress").chain(argv.iter().copied()))
            .unwrap();
        HarnessConfig::try_from(args)
    }

    #[test]
    fn defaults_follow_budget() {
        let config = parse(&["--budget", "5"]).unwrap();
        assert_eq!(config.budget, 5);
        assert_eq!(config.pass_limit, 5);
        assert_eq!(config.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
        assert_eq!(config.stream_type, StreamType::Mintest);
        assert_eq!(config.fault, FaultSimulation::None);
    }

    #[test]
    fn both_fault_switches_are_rejected() {
        assert_eq!(
            parse(&["--force-portal", "--force-no-internet"]).unwrap_err(),
            ConfigError::ConflictingFaultSimulation
        );
        assert_eq!(
            parse(&["--force-portal"]).unwrap().fault,
            FaultSimulation::CaptivePortal
        );
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert_eq!(
            parse(&["-c", "101"]).unwrap_err(),
            ConfigError::ConcurrencyOutOfRange(101)
        );
        assert_eq!(
            parse(&["-c", "0"]).unwrap_err(),
            ConfigError::ConcurrencyOutOfRange(0)
        );
        assert_eq!(parse(&["--budget", "0"]).unwrap_err(), ConfigError::ZeroBudget);
        assert_eq!(parse(&["--timeout_ms", "0"]).unwrap_err(), ConfigError::ZeroTimeout);
        assert!(matches!(
            parse(&["-c", "2", "--instance", "2"]).unwrap_err(),
            ConfigError::InstanceOutOfRange { .. }
        ));
    }

    #[test]
    fn ots_wins_over_respmap() {
        assert_eq!(
            parse(&["--ots", "--respmap"]).unwrap().stream_type,
            StreamType::MintestOts
        );
        assert_eq!(parse(&["--respmap"]).unwrap().stream_type, StreamType::Respmap);
    }

    #[test]
    fn timeout_accepts_both_spellings() {
        assert_eq!(
            parse(&["--timeout-ms", "50"]).unwrap().timeout,
            Duration::from_millis(50)
        );
        assert_eq!(
            parse(&["--timeout_ms", "60"]).unwrap().timeout,
            Duration::from_millis(60)
        );
    }

    #[test]
    fn watchdog_deadline_scales_with_budget() {
        let config = parse(&["--budget", "3", "--timeout_ms", "100", "--watchdog-grace-ms", "7"])
            .unwrap();
        assert_eq!(config.watchdog_deadline(), Duration::from_millis(307));
    }

    #[test]
    fn watchdog_deadline_defaults_to_budget_times_timeout() {
        let config = parse(&["--budget", "4", "--timeout_ms", "250"]).unwrap();
        assert_eq!(config.watchdog_grace, Duration::from_millis(0));
        assert_eq!(config.watchdog_deadline(), Duration::from_millis(1000));
    }

    #[test]
    #[serial]
    fn environment_fills_unset_options() {
        // SAFETY: serialized; no other test reads these variables.
        unsafe {
            std::env::set_var("SSTRESS_EXPECTED_EXIT", "3");
            std::env::set_var("SSTRESS_LOG_DIR", "/var/tmp/sstress");
        }
        let from_env = parse(&[]);
        let explicit = parse(&["--expected-exit", "1"]);
        unsafe {
            std::env::remove_var("SSTRESS_EXPECTED_EXIT");
            std::env::remove_var("SSTRESS_LOG_DIR");
        }
        let from_env = from_env.unwrap();
        assert_eq!(from_env.expected_exit, 3);
        assert_eq!(from_env.log_dir, PathBuf::from("/var/tmp/sstress"));
        assert_eq!(explicit.unwrap().expected_exit, 1);
    }
}
