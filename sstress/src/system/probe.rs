//! Connectivity check run at the `ConnectivityCheck` stage.
//!
//! Opens the `captive_portal_detect` stream once. An assertive ack passes;
//! a negative ack (e.g. a redirect), transport timeout, exhausted retries,
//! a drop before the ack or the probe's own timeout all fail it.

use crate::policy::{CAPTIVE_PORTAL_DETECT, Policy};
use crate::runtime::timing::{Duration, Millis, Timestamp, TimerHandle};
use crate::runtime::{TimerEvent, Timers};
use crate::system::BlobStore;
use crate::trace::{info, warn};
use crate::transport::{CreationError, Signal, StreamId, StreamRequest, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    Rejected,
    TimedOut,
    RetriesExhausted,
    Dropped,
    Unavailable(CreationError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    Passed,
    Failed(ProbeFailure),
}

#[derive(Debug)]
enum ProbeState {
    Idle,
    Running { timer: Option<TimerHandle<TimerEvent>> },
    Done(ProbeVerdict),
}

#[derive(Debug)]
pub struct ConnectivityProbe {
    state: ProbeState,
}

impl Default for ConnectivityProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityProbe {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: ProbeState::Idle,
        }
    }

    /// Whether the policy defines a probe stream at all.
    #[must_use]
    pub fn is_configured(policy: &Policy) -> bool {
        policy.stream(CAPTIVE_PORTAL_DETECT).is_some()
    }

    #[must_use]
    pub fn verdict(&self) -> Option<&ProbeVerdict> {
        match &self.state {
            ProbeState::Done(v) => Some(v),
            ProbeState::Idle | ProbeState::Running { .. } => None,
        }
    }

    /// Opens the probe stream. Returns a verdict at once if it cannot start.
    ///
    /// The probe times out after the stream's own `timeout_ms`, falling back
    /// to `fallback_timeout`.
    pub fn start<T: Transport>(
        &mut self,
        transport: &mut T,
        timers: &mut Timers,
        policy: &Policy,
        blobs: &BlobStore,
        now: Timestamp<Millis>,
        fallback_timeout: Duration<Millis>,
    ) -> Option<ProbeVerdict> {
        if !matches!(self.state, ProbeState::Idle) {
            return self.verdict().cloned();
        }
        let opened = Self::open(transport, policy, blobs, now, fallback_timeout);
        match opened {
            Ok(timeout) => {
                let timer = match timers.schedule_after(now, timeout, TimerEvent::ProbeTimeout) {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        warn!(error = %e, "cannot arm probe timeout");
                        None
                    }
                };
                info!(%timeout, "connectivity check started");
                self.state = ProbeState::Running { timer };
                None
            }
            Err(e) => {
                warn!(error = %e, "connectivity check could not start");
                let verdict = ProbeVerdict::Failed(ProbeFailure::Unavailable(e));
                self.state = ProbeState::Done(verdict.clone());
                Some(verdict)
            }
        }
    }

    fn open<T: Transport>(
        transport: &mut T,
        policy: &Policy,
        blobs: &BlobStore,
        now: Timestamp<Millis>,
        fallback_timeout: Duration<Millis>,
    ) -> Result<Duration<Millis>, CreationError> {
        let request = StreamRequest::for_stream(policy, blobs, CAPTIVE_PORTAL_DETECT)?;
        let timeout = request
            .policy
            .timeout_ms
            .map_or(fallback_timeout, Duration::from_millis);
        transport.create(StreamId::PROBE, request)?;
        if let Err(e) = transport.connect(StreamId::PROBE, now) {
            transport.teardown(StreamId::PROBE);
            return Err(e);
        }
        Ok(timeout)
    }

    /// Feeds a signal for the probe stream.
    pub fn handle<T: Transport>(
        &mut self,
        transport: &mut T,
        timers: &mut Timers,
        signal: Signal,
    ) -> Option<ProbeVerdict> {
        let verdict = match signal {
            Signal::AckPositive => ProbeVerdict::Passed,
            Signal::AckNegative => ProbeVerdict::Failed(ProbeFailure::Rejected),
            Signal::TimedOut => ProbeVerdict::Failed(ProbeFailure::TimedOut),
            Signal::RetriesExhausted => ProbeVerdict::Failed(ProbeFailure::RetriesExhausted),
            Signal::Disconnected => ProbeVerdict::Failed(ProbeFailure::Dropped),
            Signal::Connecting | Signal::Connected | Signal::Data { .. } => return None,
        };
        self.conclude(transport, timers, verdict)
    }

    /// The probe's own timeout fired.
    pub fn on_timeout<T: Transport>(
        &mut self,
        transport: &mut T,
        timers: &mut Timers,
    ) -> Option<ProbeVerdict> {
        if let ProbeState::Running { timer } = &mut self.state {
            *timer = None;
        }
        self.conclude(
            transport,
            timers,
            ProbeVerdict::Failed(ProbeFailure::TimedOut),
        )
    }

    fn conclude<T: Transport>(
        &mut self,
        transport: &mut T,
        timers: &mut Timers,
        verdict: ProbeVerdict,
    ) -> Option<ProbeVerdict> {
        let ProbeState::Running { timer } = &self.state else {
            return None;
        };
        if let Some(timer) = timer {
            timers.cancel(timer);
        }
        transport.teardown(StreamId::PROBE);
        info!(?verdict, "connectivity check finished");
        self.state = ProbeState::Done(verdict.clone());
        Some(verdict)
    }
}
