//! sstress: stream stress harness.
//!
//! # Usage
//!
//! ```sh
//! sstress --budget 10 -c 4 --timeout_ms 2000
//! sstress --simulate timeout,succeed --budget 3 --pass-limit 2
//! ```
//!
//! # Exit status
//!
//! - `0`: the observed indicator matched `--expected-exit`
//! - `1`: it did not, or the run failed
//! - `2`: invalid configuration or policy
//! - `124`: the watchdog fired
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop creating attempts and report what was seen

use std::ffi::OsString;
use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use thiserror::Error;

use sstress::config::FanoutMode;
use sstress::policy::{Policy, PolicyError};
use sstress::runtime::fanout::{self, FanoutError};
use sstress::runtime::instance::{InstanceError, InstanceReport, run_instance};
use sstress::trace::init_tracing;
use sstress::{HarnessArgs, HarnessConfig};

const EXIT_FAILED: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_WATCHDOG: u8 = 124;

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("cannot prepare log directory: {0}")]
    LogDir(#[source] io::Error),

    #[error("cannot install signal handlers: {0}")]
    Signals(#[source] io::Error),

    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error(transparent)]
    Fanout(#[from] FanoutError),
}

impl AppError {
    const fn exit_code(&self) -> u8 {
        match self {
            Self::Policy(_) => EXIT_CONFIG,
            Self::Instance(InstanceError::WatchdogExpired { .. }) => EXIT_WATCHDOG,
            _ => EXIT_FAILED,
        }
    }
}

fn main() -> ExitCode {
    let args = HarnessArgs::parse();
    let config = match HarnessConfig::try_from(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sstress: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    init_tracing(config.log_level);

    match run(&config) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("sstress: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(config: &HarnessConfig) -> Result<u8, AppError> {
    let policy = match &config.policy_path {
        Some(path) => Policy::from_file(path)?,
        None => Policy::embedded()?,
    };
    std::fs::create_dir_all(&config.log_dir).map_err(AppError::LogDir)?;

    let interrupt = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&interrupt)).map_err(AppError::Signals)?;
    }

    if let Some(ordinal) = config.instance {
        let spec = fanout::instance_spec(ordinal, &config.log_dir);
        let report = run_instance(config, &spec, policy, interrupt)?;
        return Ok(report_verdict(config, &report, false));
    }

    match config.fanout {
        FanoutMode::Process => {
            // Children re-parse our own arguments, plus their ordinal.
            let args: Vec<OsString> = std::env::args_os().skip(1).collect();
            let children = fanout::spawn_children(config.concurrency, &args)?;
            let spec = fanout::instance_spec(0, &config.log_dir);
            let result = run_instance(config, &spec, policy, interrupt);
            children.wait();
            let report = result?;
            Ok(report_verdict(config, &report, config.concurrency > 1))
        }
        FanoutMode::Thread => {
            let specs = fanout::plan(config.concurrency, &config.log_dir);
            let results = fanout::run_threads(config, &specs, &policy, &interrupt)?;
            let mut code = EXIT_FAILED;
            for (ordinal, result) in results.into_iter().enumerate() {
                let instance_code = match result {
                    Ok(report) => report_verdict(config, &report, config.concurrency > 1),
                    Err(e) => {
                        eprintln!("sstress: ctx{ordinal}: {e}");
                        AppError::from(e).exit_code()
                    }
                };
                if ordinal == 0 {
                    code = instance_code;
                }
            }
            Ok(code)
        }
    }
}

/// Prints the two report lines and returns the instance's exit code.
fn report_verdict(config: &HarnessConfig, report: &InstanceReport, prefixed: bool) -> u8 {
    for line in report.verdict.report_lines(config.expected_exit) {
        if prefixed {
            println!("{}: {line}", report.name);
        } else {
            println!("{line}");
        }
    }
    report.verdict.exit_code(config.expected_exit)
}
