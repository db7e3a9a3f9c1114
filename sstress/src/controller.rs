//! Retry controller.
//!
//! Drives one attempt at a time through its state machine, spending one unit
//! of budget per attempt. When an attempt has been torn down the next one is
//! created from a loop, never by recursion, until the budget is gone.

pub mod attempt;
pub mod budget;

use crate::config::StreamType;
use crate::outcome::OutcomeTally;
use crate::policy::Policy;
use crate::runtime::timing::{Duration, Millis, Timestamp, TimerHandle};
use crate::runtime::{TimerEvent, Timers};
use crate::system::BlobStore;
use crate::trace::{debug, info, warn};
use crate::transport::{CreationError, StreamEvent, StreamId, StreamRequest, Transport};

pub use attempt::{Attempt, AttemptEvent, AttemptResult, AttemptState, Step};
pub use budget::RetryBudget;

/// Tags attached to every attempt once it is connecting.
pub const ATTEMPT_METADATA: [(&str, &str); 2] = [("uptag", "myuptag123"), ("ctype", "myctype")];

/// Borrowed view of the instance state an attempt touches.
pub struct AttemptEnv<'a, T> {
    pub transport: &'a mut T,
    pub timers: &'a mut Timers,
    pub budget: &'a mut RetryBudget,
    pub tally: &'a mut OutcomeTally,
    pub policy: &'a Policy,
    pub blobs: &'a BlobStore,
    pub now: Timestamp<Millis>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    Running,
    Finished,
}

#[derive(Debug)]
struct Current {
    attempt: Attempt,
    timer: Option<TimerHandle<TimerEvent>>,
}

#[derive(Debug)]
pub struct RetryController {
    stream_type: StreamType,
    timeout: Duration<Millis>,
    next_ordinal: u64,
    current: Option<Current>,
    attempts_created: u32,
    finished: bool,
}

impl RetryController {
    #[must_use]
    pub const fn new(stream_type: StreamType, timeout: Duration<Millis>) -> Self {
        Self {
            stream_type,
            timeout,
            next_ordinal: 1,
            current: None,
            attempts_created: 0,
            finished: false,
        }
    }

    #[must_use]
    pub const fn attempts_created(&self) -> u32 {
        self.attempts_created
    }

    #[must_use]
    pub fn current(&self) -> Option<StreamId> {
        self.current.as_ref().map(|c| c.attempt.id())
    }

    #[must_use]
    pub const fn status(&self) -> ControllerStatus {
        if self.finished {
            ControllerStatus::Finished
        } else {
            ControllerStatus::Running
        }
    }

    /// Spends one unit of budget and asks the transport for a stream.
    ///
    /// The budget is spent before the transport is involved, so a failed
    /// creation still costs an attempt.
    ///
    /// # Errors
    ///
    /// [`CreationError::BudgetExhausted`] if nothing is left to spend; any
    /// other variant means the attempt was spent and failed immediately.
    pub fn create_attempt<T: Transport>(
        &mut self,
        env: &mut AttemptEnv<'_, T>,
    ) -> Result<StreamId, CreationError> {
        if !env.budget.try_consume() {
            return Err(CreationError::BudgetExhausted);
        }
        self.attempts_created += 1;
        let id = StreamId(self.next_ordinal);
        self.next_ordinal += 1;
        info!(
            attempt = %id,
            stream = %self.stream_type,
            remaining = env.budget.remaining(),
            "starting attempt"
        );

        let request = StreamRequest::for_stream(env.policy, env.blobs, self.stream_type.name())?;
        env.transport.create(id, request)?;
        if let Err(e) = env.transport.connect(id, env.now) {
            env.transport.teardown(id);
            return Err(e);
        }
        self.current = Some(Current {
            attempt: Attempt::new(id),
            timer: None,
        });
        Ok(id)
    }

    /// Creates attempts until one is in flight or the budget is gone.
    pub fn launch<T: Transport>(&mut self, env: &mut AttemptEnv<'_, T>) -> ControllerStatus {
        if self.finished || self.current.is_some() {
            return self.status();
        }
        loop {
            match self.create_attempt(env) {
                Ok(_) => return ControllerStatus::Running,
                Err(CreationError::BudgetExhausted) => {
                    info!(attempts = self.attempts_created, "budget exhausted");
                    self.finished = true;
                    return ControllerStatus::Finished;
                }
                Err(e) => {
                    warn!(error = %e, "attempt failed at creation");
                    env.tally.record(AttemptResult::Other);
                }
            }
        }
    }

    /// Routes a transport event to the current attempt.
    pub fn handle<T: Transport>(
        &mut self,
        env: &mut AttemptEnv<'_, T>,
        event: StreamEvent,
    ) -> ControllerStatus {
        self.dispatch(env, event.stream, AttemptEvent::Signal(event.signal))
    }

    /// The per-attempt timeout for `id` fired.
    pub fn on_timeout<T: Transport>(
        &mut self,
        env: &mut AttemptEnv<'_, T>,
        id: StreamId,
    ) -> ControllerStatus {
        if let Some(current) = self.current.as_mut()
            && current.attempt.id() == id
        {
            current.timer = None;
        }
        self.dispatch(env, id, AttemptEvent::TimeoutFired)
    }

    /// Tears down the attempt in flight and stops creating new ones.
    pub fn abort<T: Transport>(&mut self, env: &mut AttemptEnv<'_, T>) {
        self.finished = true;
        if let Some(current) = self.current.take() {
            info!(attempt = %current.attempt.id(), "aborting attempt");
            if let Some(timer) = current.timer {
                env.timers.cancel(&timer);
            }
            env.transport.teardown(current.attempt.id());
        }
    }

    fn dispatch<T: Transport>(
        &mut self,
        env: &mut AttemptEnv<'_, T>,
        id: StreamId,
        event: AttemptEvent,
    ) -> ControllerStatus {
        let Some(current) = self.current.as_mut() else {
            debug!(stream = %id, ?event, "no attempt in flight, ignoring");
            return self.status();
        };
        if current.attempt.id() != id {
            debug!(stream = %id, ?event, "event for stale attempt, ignoring");
            return self.status();
        }

        let mut step = current.attempt.handle(event);
        loop {
            debug!(attempt = %id, ?event, ?step, "attempt step");
            match step {
                Step::Ignored | Step::Continue => return self.status(),
                Step::EndOfMessage => {
                    env.tally.note_end_of_message();
                    return self.status();
                }
                Step::Arm => match self.arm(env) {
                    Ok(()) => return self.status(),
                    Err(rejected) => step = rejected,
                },
                Step::Terminal { result, teardown } => {
                    info!(attempt = %id, ?result, "attempt terminal");
                    env.tally.record(result);
                    if !teardown {
                        return self.status();
                    }
                    return self.finish_attempt(env);
                }
                Step::Teardown => return self.finish_attempt(env),
            }
        }
    }

    /// Starts the per-attempt timeout and attaches the metadata tags. A
    /// rejected tag yields the attempt's next step.
    fn arm<T: Transport>(&mut self, env: &mut AttemptEnv<'_, T>) -> Result<(), Step> {
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };
        let id = current.attempt.id();
        match env
            .timers
            .schedule_after(env.now, self.timeout, TimerEvent::AttemptTimeout(id))
        {
            Ok(handle) => current.timer = Some(handle),
            Err(e) => {
                warn!(attempt = %id, error = %e, "cannot arm attempt timeout");
            }
        }
        for (name, value) in ATTEMPT_METADATA {
            if let Err(e) = env.transport.set_metadata(id, name, value) {
                warn!(attempt = %id, error = %e, "metadata rejected");
                return Err(current.attempt.handle(AttemptEvent::MetadataRejected));
            }
        }
        Ok(())
    }

    fn finish_attempt<T: Transport>(&mut self, env: &mut AttemptEnv<'_, T>) -> ControllerStatus {
        if let Some(current) = self.current.take() {
            if let Some(timer) = current.timer {
                env.timers.cancel(&timer);
            }
            env.transport.teardown(current.attempt.id());
        }
        self.launch(env)
    }
}
