//! Tracing infrastructure for the harness.
//!
//! Enabled by the default `tracing` feature. All trace macros become no-ops
//! when the feature is disabled.
//!
//! Two kinds of sink exist: the process-wide stderr subscriber installed by
//! [`init_tracing`], and one file sink per instance ([`InstanceLog`]) that is
//! made the thread-local default while that instance's loop runs.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("cannot open log sink {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Verbosity selected by the `-d` bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Maps the log bitmask (err=1, warn=2, notice=4, info=8, debug=16,
    /// user=1024) to the most verbose level it enables.
    #[must_use]
    pub const fn from_mask(mask: u32) -> Self {
        if mask & 16 != 0 {
            Self::Debug
        } else if mask & (8 | 4 | 1024) != 0 {
            Self::Info
        } else if mask & 2 != 0 {
            Self::Warn
        } else {
            Self::Error
        }
    }

    #[must_use]
    pub const fn as_filter(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Default mask: err | warn | notice | user.
pub const DEFAULT_LOG_MASK: u32 = 1 | 2 | 4 | 1024;

/// Initialize the process-wide stderr subscriber.
///
/// `SSTRESS_LOG`, then `RUST_LOG`, take precedence over `level`. Safe to
/// call more than once.
#[cfg(feature = "tracing")]
pub fn init_tracing(level: LogLevel) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_env("SSTRESS_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(format!("sstress={}", level.as_filter())));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing(_level: LogLevel) {}

/// Per-instance file sink.
#[cfg(feature = "tracing")]
pub struct InstanceLog {
    dispatch: tracing::Dispatch,
    path: PathBuf,
}

#[cfg(feature = "tracing")]
impl InstanceLog {
    /// Creates (truncating) the log file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Open`] if the file cannot be created.
    pub fn open(path: &Path, level: LogLevel) -> Result<Self, LogError> {
        use std::sync::Mutex;
        use tracing_subscriber::{EnvFilter, fmt, prelude::*};

        let file = std::fs::File::create(path).map_err(|source| LogError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_names(true)
                    .with_timer(fmt::time::uptime()),
            )
            .with(EnvFilter::new(format!("sstress={}", level.as_filter())));
        Ok(Self {
            dispatch: tracing::Dispatch::new(subscriber),
            path: path.to_path_buf(),
        })
    }

    /// Makes this sink the current thread's default until the guard drops.
    #[must_use]
    pub fn install(&self) -> tracing::dispatcher::DefaultGuard {
        tracing::dispatcher::set_default(&self.dispatch)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(not(feature = "tracing"))]
pub struct InstanceLog {
    path: PathBuf,
}

#[cfg(not(feature = "tracing"))]
impl InstanceLog {
    pub fn open(path: &Path, _level: LogLevel) -> Result<Self, LogError> {
        std::fs::File::create(path).map_err(|source| LogError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub const fn install(&self) {}

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// When tracing is enabled, re-export macros from the tracing crate.
#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, warn};

// When tracing is disabled, provide no-op macro implementations.
#[cfg(not(feature = "tracing"))]
macro_rules! debug_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! info_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! error_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use debug_noop as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use error_noop as error;
#[cfg(not(feature = "tracing"))]
pub(crate) use info_noop as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use warn_noop as warn;
