//! One instance's cooperative event loop.
//!
//! Everything an instance owns (budget, tally, blobs, policy, timers,
//! transport) lives here and is only touched from the thread running
//! [`Instance::run`]. Readiness events, timer expiries and lifecycle
//! callbacks are each handled to completion before the next one.
//!
//! ```text
//! ContextCreated ─▶ … ─▶ Registered ─▶ ConnectivityCheck ──any verdict──▶ Operational
//!                                                                             │
//!                                                                       attempts until
//!                                                                       budget is spent
//!                                                                             ▼
//!                                                                         Completed
//! ```
//!
//! A failed connectivity check is recorded but does not hold the instance
//! back; attempts then fail against the same network and are counted.

use core::num::NonZeroUsize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mio::{Events, Poll};
use thiserror::Error;

use super::timing::{Clock, Duration, Millis, MonotonicClock, Timestamp, WheelError};
use super::{TimerEvent, Timers, WHEEL_CAPACITY};
use crate::config::HarnessConfig;
use crate::controller::{AttemptEnv, ControllerStatus, RetryBudget, RetryController};
use crate::gate::{GateContext, GateDecision, GateEffect, ReadinessGate};
use crate::outcome::{OutcomeTally, Verdict};
use crate::policy::Policy;
use crate::system::{BlobStore, ConnectivityProbe, ProbeVerdict, StateManager, SystemState};
use crate::trace::{InstanceLog, LogError, debug, error, info, warn};
use crate::transport::{HttpTransport, ScriptedTransport, StreamId, Transport};
use crate::watchdog::Watchdog;

/// Longest the loop sleeps without checking for an interrupt.
const MAX_POLL_WAIT: Duration<Millis> = Duration::new(50);

const EVENTS_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("watchdog expired after {after}")]
    WatchdogExpired { after: Duration<Millis> },

    #[error("event loop i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("timer error: {0}")]
    Timer(#[from] WheelError),

    #[error(transparent)]
    Log(#[from] LogError),
}

/// Identity of one instance within a fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub ordinal: u32,
    /// Context name, `ctx<ordinal>`.
    pub name: String,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceExit {
    /// Budget spent.
    Completed,
    /// Stopped by a signal.
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct InstanceReport {
    pub name: String,
    pub exit: InstanceExit,
    pub verdict: Verdict,
    pub attempts_created: u32,
    pub budget_remaining: u32,
    /// Result of the connectivity check, `None` when the policy has no
    /// probe stream or the check never finished.
    pub connectivity: Option<ProbeVerdict>,
    /// Gate side effects, in the order they were applied.
    pub effects: Vec<GateEffect>,
}

/// Counters and stores owned by one instance.
#[derive(Debug)]
pub struct InstanceContext {
    pub name: String,
    pub budget: RetryBudget,
    pub tally: OutcomeTally,
    pub blobs: BlobStore,
    pub policy: Policy,
}

impl InstanceContext {
    fn env<'a, T>(
        &'a mut self,
        transport: &'a mut T,
        timers: &'a mut Timers,
        now: Timestamp<Millis>,
    ) -> AttemptEnv<'a, T> {
        AttemptEnv {
            transport,
            timers,
            budget: &mut self.budget,
            tally: &mut self.tally,
            policy: &self.policy,
            blobs: &self.blobs,
            now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Starting,
    Probing,
    Running,
    Done(InstanceExit),
}

pub struct Instance<T, C> {
    ctx: InstanceContext,
    transport: T,
    clock: C,
    timers: Timers,
    stages: StateManager,
    gate: ReadinessGate,
    controller: RetryController,
    probe: ConnectivityProbe,
    watchdog: Watchdog,
    watchdog_after: Duration<Millis>,
    attempt_timeout: Duration<Millis>,
    interrupt: Arc<AtomicBool>,
    effects: Vec<GateEffect>,
    phase: Phase,
    started: Timestamp<Millis>,
}

impl<T: Transport, C: Clock> Instance<T, C> {
    pub fn new(
        config: &HarnessConfig,
        spec: &InstanceSpec,
        policy: Policy,
        transport: T,
        clock: C,
        interrupt: Arc<AtomicBool>,
    ) -> Self {
        let start = clock.now();
        let capacity = NonZeroUsize::new(WHEEL_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            ctx: InstanceContext {
                name: spec.name.clone(),
                budget: RetryBudget::new(config.budget),
                tally: OutcomeTally::new(config.budget, config.pass_limit),
                blobs: BlobStore::new(),
                policy,
            },
            transport,
            clock,
            timers: Timers::new(capacity, start),
            stages: StateManager::new(),
            gate: ReadinessGate::new(config.fault),
            controller: RetryController::new(config.stream_type, config.timeout),
            probe: ConnectivityProbe::new(),
            watchdog: Watchdog::new(),
            watchdog_after: config.watchdog_deadline(),
            attempt_timeout: config.timeout,
            interrupt,
            effects: Vec::new(),
            phase: Phase::Starting,
            started: start,
        }
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[must_use]
    pub fn context(&self) -> &InstanceContext {
        &self.ctx
    }

    /// Runs the loop until the budget is spent, an interrupt arrives or the
    /// watchdog fires.
    ///
    /// # Errors
    ///
    /// [`InstanceError::WatchdogExpired`] when the deadline passes; other
    /// variants for failures of the loop itself.
    pub fn run(&mut self) -> Result<InstanceReport, InstanceError> {
        let mut poll = Poll::new()?;
        self.transport.attach(poll.registry())?;
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        let now = self.clock.now();
        self.started = now;
        self.ctx.blobs.seed_device_identity();
        self.watchdog
            .schedule(&mut self.timers, now, self.watchdog_after)?;
        info!(
            ctx = %self.ctx.name,
            budget = self.ctx.budget.original(),
            timeout = %self.attempt_timeout,
            watchdog = %self.watchdog_after,
            "instance starting"
        );

        self.bring_up(now);
        self.drain(now);

        let exit = loop {
            if let Phase::Done(exit) = &self.phase {
                break exit.clone();
            }
            if self.interrupt.load(Ordering::Relaxed) {
                warn!(ctx = %self.ctx.name, "interrupted");
                let now = self.clock.now();
                self.controller
                    .abort(&mut self.ctx.env(&mut self.transport, &mut self.timers, now));
                if self.phase == Phase::Probing {
                    self.transport.teardown(StreamId::PROBE);
                }
                break InstanceExit::Interrupted;
            }

            let wait = self.poll_wait(self.clock.now());
            match poll.poll(&mut events, Some(wait.to_std())) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }

            let now = self.clock.now();
            for event in &events {
                self.transport.on_ready(event, now);
            }
            self.transport.on_tick(now);
            self.drain(now);
            self.fire_timers(now)?;
            self.drain(now);
        };

        self.watchdog.cancel(&mut self.timers);
        let report = self.report(exit);
        info!(
            ctx = %self.ctx.name,
            exit = ?report.exit,
            good = report.verdict.observed_successes,
            budget = report.verdict.original_budget,
            pass_limit = report.verdict.expected_pass_limit,
            indicator = report.verdict.indicator,
            "instance finished"
        );
        Ok(report)
    }

    fn report(&self, exit: InstanceExit) -> InstanceReport {
        InstanceReport {
            name: self.ctx.name.clone(),
            exit,
            verdict: self.ctx.tally.final_verdict(),
            attempts_created: self.controller.attempts_created(),
            budget_remaining: self.ctx.budget.remaining(),
            connectivity: self.probe.verdict().cloned(),
            effects: self.effects.clone(),
        }
    }

    fn poll_wait(&self, now: Timestamp<Millis>) -> Duration<Millis> {
        [self.timers.next_deadline(), self.transport.next_wakeup()]
            .into_iter()
            .flatten()
            .min()
            .map_or(MAX_POLL_WAIT, |next| next.saturating_since(now).min(MAX_POLL_WAIT))
    }

    /// Walks the lifecycle through the gate, collecting what it applied.
    fn advance_stage(&mut self, target: SystemState) -> Vec<GateEffect> {
        let gate = &mut self.gate;
        let mut ctx = GateContext {
            policy: &mut self.ctx.policy,
            blobs: &mut self.ctx.blobs,
        };
        let applied: Vec<GateEffect> = self
            .stages
            .advance_to(target, |transition| {
                debug!(?transition, "stage transition");
                gate.handle(transition, &mut ctx)
            })
            .into_iter()
            .filter_map(|decision| match decision {
                GateDecision::Applied(effect) => Some(effect),
                GateDecision::Proceed => None,
            })
            .collect();
        self.effects.extend(applied.iter().copied());
        applied
    }

    fn bring_up(&mut self, now: Timestamp<Millis>) {
        self.advance_stage(SystemState::ConnectivityCheck);
        if !ConnectivityProbe::is_configured(&self.ctx.policy) {
            self.go_operational(now);
            return;
        }
        self.phase = Phase::Probing;
        if let Some(verdict) = self.probe.start(
            &mut self.transport,
            &mut self.timers,
            &self.ctx.policy,
            &self.ctx.blobs,
            now,
            self.attempt_timeout,
        ) {
            self.on_probe_verdict(verdict, now);
        }
    }

    fn go_operational(&mut self, now: Timestamp<Millis>) {
        let effects = self.advance_stage(SystemState::Operational);
        self.phase = Phase::Running;
        if effects.contains(&GateEffect::StartAttempts) {
            let status = self
                .controller
                .launch(&mut self.ctx.env(&mut self.transport, &mut self.timers, now));
            self.on_status(status);
        }
    }

    fn on_probe_verdict(&mut self, verdict: ProbeVerdict, now: Timestamp<Millis>) {
        match verdict {
            ProbeVerdict::Passed => self.go_operational(now),
            ProbeVerdict::Failed(failure) => {
                warn!(ctx = %self.ctx.name, ?failure, "connectivity check failed, going operational anyway");
                self.go_operational(now);
            }
        }
    }

    fn on_status(&mut self, status: ControllerStatus) {
        if status == ControllerStatus::Finished && self.phase == Phase::Running {
            self.phase = Phase::Done(InstanceExit::Completed);
        }
    }

    /// Delivers queued transport events in order.
    fn drain(&mut self, now: Timestamp<Millis>) {
        while let Some(event) = self.transport.poll_event() {
            let for_probe = event.stream == StreamId::PROBE;
            match self.phase {
                Phase::Probing if for_probe => {
                    if let Some(verdict) =
                        self.probe
                            .handle(&mut self.transport, &mut self.timers, event.signal)
                    {
                        self.on_probe_verdict(verdict, now);
                    }
                }
                Phase::Running if !for_probe => {
                    let status = self.controller.handle(
                        &mut self.ctx.env(&mut self.transport, &mut self.timers, now),
                        event,
                    );
                    self.on_status(status);
                }
                _ => {
                    debug!(?event, phase = ?self.phase, "dropping event");
                }
            }
        }
    }

    fn fire_timers(&mut self, now: Timestamp<Millis>) -> Result<(), InstanceError> {
        let mut fired = Vec::new();
        self.timers.advance(now, |_, event| fired.push(event));
        for event in fired {
            match event {
                TimerEvent::Watchdog => {
                    if self.watchdog.on_fire() {
                        let after = now.saturating_since(self.started);
                        error!(ctx = %self.ctx.name, %after, "process timed out");
                        return Err(InstanceError::WatchdogExpired { after });
                    }
                }
                TimerEvent::AttemptTimeout(id) => {
                    if self.phase == Phase::Running {
                        warn!(attempt = %id, "attempt timed out");
                        let status = self.controller.on_timeout(
                            &mut self.ctx.env(&mut self.transport, &mut self.timers, now),
                            id,
                        );
                        self.on_status(status);
                    }
                }
                TimerEvent::ProbeTimeout => {
                    if self.phase == Phase::Probing
                        && let Some(verdict) =
                            self.probe.on_timeout(&mut self.transport, &mut self.timers)
                    {
                        self.on_probe_verdict(verdict, now);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Runs one instance with its own log sink, on the transport the
/// configuration selects.
///
/// # Errors
///
/// See [`Instance::run`]; also fails if the log sink cannot be opened.
pub fn run_instance(
    config: &HarnessConfig,
    spec: &InstanceSpec,
    policy: Policy,
    interrupt: Arc<AtomicBool>,
) -> Result<InstanceReport, InstanceError> {
    let log = InstanceLog::open(&spec.log_path, config.log_level)?;
    #[allow(clippy::let_unit_value)]
    let _guard = log.install();
    info!(ctx = %spec.name, log = %log.path().display(), "log sink open");

    match &config.simulate {
        Some(plan) => {
            let transport = ScriptedTransport::simulating(plan.clone(), config.fault);
            Instance::new(config, spec, policy, transport, MonotonicClock::new(), interrupt).run()
        }
        None => {
            let transport = HttpTransport::new();
            Instance::new(config, spec, policy, transport, MonotonicClock::new(), interrupt).run()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FaultSimulation;
    use crate::transport::{Call, Script, ScriptPlan};

    fn spec(dir: &std::path::Path) -> InstanceSpec {
        InstanceSpec {
            ordinal: 0,
            name: "ctx0".to_owned(),
            log_path: dir.join("ctx0.log"),
        }
    }

    fn config(plan: &str, budget: u32) -> HarnessConfig {
        let mut config = HarnessConfig::default();
        config.budget = budget;
        config.pass_limit = budget;
        config.timeout = Duration::from_millis(40);
        config.watchdog_grace = Duration::from_millis(200);
        config.simulate = Some(plan.parse::<ScriptPlan>().unwrap());
        config
    }

    #[test]
    fn instance_without_probe_stream_goes_straight_to_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let config = config("succeed", 2);
        let policy = Policy::parse(
            r#"{"s": [{"mintest": {"endpoint": "localhost",
                "metadata": [{"uptag": "X-Upload-Tag:"}, {"ctype": "Content-Type:"}]}}]}"#,
        )
        .unwrap();
        let transport = ScriptedTransport::new(ScriptPlan::always(Script::Succeed));
        let mut instance = Instance::new(
            &config,
            &spec(dir.path()),
            policy,
            transport,
            MonotonicClock::new(),
            Arc::new(AtomicBool::new(false)),
        );
        let report = instance.run().unwrap();
        assert_eq!(report.exit, InstanceExit::Completed);
        assert_eq!(report.verdict.observed_successes, 2);
        assert!(
            instance
                .transport()
                .calls()
                .iter()
                .all(|c| !matches!(c, Call::Create { id, .. } if *id == StreamId::PROBE))
        );
    }

    #[test]
    fn interrupt_before_start_reports_without_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let config = config("stall", 3);
        let transport =
            ScriptedTransport::simulating(ScriptPlan::always(Script::Stall), FaultSimulation::None);
        let mut instance = Instance::new(
            &config,
            &spec(dir.path()),
            Policy::embedded().unwrap(),
            transport,
            MonotonicClock::new(),
            Arc::new(AtomicBool::new(true)),
        );
        let report = instance.run().unwrap();
        assert_eq!(report.exit, InstanceExit::Interrupted);
        assert_eq!(report.attempts_created, 1);
        assert_eq!(report.verdict.observed_successes, 0);
        assert_eq!(report.budget_remaining, 2);
    }
}
