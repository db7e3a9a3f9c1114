//! Starting N isolated instances.
//!
//! Instances share nothing: each has its own ordinal, context name, log file,
//! budget and event loop. In process mode every extra instance is a re-exec
//! of the current binary with `--instance <k>`; in thread mode each instance
//! gets a named thread with its own log dispatch.

use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;

use thiserror::Error;

use super::instance::{InstanceError, InstanceReport, InstanceSpec, run_instance};
use crate::config::HarnessConfig;
use crate::policy::Policy;
use crate::trace::{debug, info, warn};

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("cannot locate own executable: {0}")]
    CurrentExe(#[source] io::Error),

    #[error("cannot spawn instance {ordinal}: {source}")]
    Spawn {
        ordinal: u32,
        #[source]
        source: io::Error,
    },

    #[error("cannot wait for instance {ordinal}: {source}")]
    Wait {
        ordinal: u32,
        #[source]
        source: io::Error,
    },

    #[error("cannot start thread for instance {ordinal}: {source}")]
    Thread {
        ordinal: u32,
        #[source]
        source: io::Error,
    },

    #[error("instance {ordinal} thread panicked")]
    Panicked { ordinal: u32 },
}

/// Identity of instance `ordinal`: `ctx<k>` logging to `<log_dir>/ctx<k>.log`.
#[must_use]
pub fn instance_spec(ordinal: u32, log_dir: &Path) -> InstanceSpec {
    let name = format!("ctx{ordinal}");
    InstanceSpec {
        ordinal,
        log_path: log_dir.join(format!("{name}.log")),
        name,
    }
}

/// Specs for instances `0..n`.
#[must_use]
pub fn plan(n: u32, log_dir: &Path) -> Vec<InstanceSpec> {
    (0..n).map(|k| instance_spec(k, log_dir)).collect()
}

/// Child processes running instances `1..n`.
#[derive(Debug)]
pub struct Children {
    children: Vec<(u32, Child)>,
}

impl Children {
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Waits for every child and logs how it ended.
    pub fn wait(self) -> Vec<(u32, Result<ExitStatus, FanoutError>)> {
        self.children
            .into_iter()
            .map(|(ordinal, mut child)| {
                let status = child
                    .wait()
                    .map_err(|source| FanoutError::Wait { ordinal, source });
                match &status {
                    Ok(s) if s.success() => {
                        info!(ctx = ordinal, "instance exited cleanly");
                    }
                    Ok(s) => {
                        warn!(ctx = ordinal, status = %s, "instance exited with failure");
                    }
                    Err(e) => {
                        warn!(ctx = ordinal, error = %e, "instance lost");
                    }
                }
                (ordinal, status)
            })
            .collect()
    }
}

/// Re-executes this binary once per extra instance, passing `args` (the
/// caller's own arguments, program name excluded) plus `--instance <k>`.
///
/// Children already started are killed if a later spawn fails.
///
/// # Errors
///
/// Fails if the executable cannot be located or a child cannot be spawned.
pub fn spawn_children(n: u32, args: &[OsString]) -> Result<Children, FanoutError> {
    let exe = std::env::current_exe().map_err(FanoutError::CurrentExe)?;
    let mut children = Vec::with_capacity(n.saturating_sub(1) as usize);
    for ordinal in 1..n {
        let spawned = Command::new(&exe)
            .args(args)
            .arg("--instance")
            .arg(ordinal.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn();
        match spawned {
            Ok(child) => {
                debug!(ctx = ordinal, pid = child.id(), "instance spawned");
                children.push((ordinal, child));
            }
            Err(source) => {
                for (_, mut child) in children {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                return Err(FanoutError::Spawn { ordinal, source });
            }
        }
    }
    Ok(Children { children })
}

/// Runs every instance in `specs` on its own named thread and collects the
/// results in the order given.
///
/// # Errors
///
/// Fails if a thread cannot be started or an instance thread panics.
pub fn run_threads(
    config: &HarnessConfig,
    specs: &[InstanceSpec],
    policy: &Policy,
    interrupt: &Arc<AtomicBool>,
) -> Result<Vec<Result<InstanceReport, InstanceError>>, FanoutError> {
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(specs.len());
        for spec in specs {
            let policy = policy.clone();
            let interrupt = Arc::clone(interrupt);
            let handle = thread::Builder::new()
                .name(format!("sstress-{}", spec.name))
                .spawn_scoped(scope, move || run_instance(config, spec, policy, interrupt))
                .map_err(|source| FanoutError::Thread {
                    ordinal: spec.ordinal,
                    source,
                })?;
            handles.push((spec.ordinal, handle));
        }
        handles
            .into_iter()
            .map(|(ordinal, handle)| handle.join().map_err(|_| FanoutError::Panicked { ordinal }))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_names_each_instance() {
        let specs = plan(3, Path::new("/var/log/s"));
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[2].ordinal, 2);
        assert_eq!(specs[2].name, "ctx2");
        assert_eq!(specs[2].log_path, Path::new("/var/log/s/ctx2.log"));
    }

    #[test]
    fn single_instance_spawns_no_children() {
        let children = spawn_children(1, &[]).unwrap();
        assert!(children.is_empty());
        assert!(children.wait().is_empty());
    }
}
