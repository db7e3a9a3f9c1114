//! One attempt's state machine.

use crate::transport::{Signal, StreamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptResult {
    AckedSuccess,
    NackedFailure,
    TimedOut,
    RetriesExhausted,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// Connect requested; waiting for the transport to report connecting.
    Creating,
    Connecting,
    Connected,
    /// End of message seen; waiting for the assertive ack.
    AckPending,
    /// Result known; waiting for the disconnect (or timeout) to tear down.
    Terminal(AttemptResult),
    /// Teardown requested. Nothing further is accepted.
    TornDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptEvent {
    Signal(Signal),
    TimeoutFired,
    MetadataRejected,
}

/// What the controller must do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Event had no meaning in this state.
    Ignored,
    Continue,
    /// Entered `Connecting`: start the timeout and attach metadata.
    Arm,
    EndOfMessage,
    /// Result reached. `teardown` says whether to tear down right away or
    /// wait for the following disconnect.
    Terminal {
        result: AttemptResult,
        teardown: bool,
    },
    /// Deferred teardown of an already-terminal attempt.
    Teardown,
}

#[derive(Debug)]
pub struct Attempt {
    id: StreamId,
    state: AttemptState,
}

impl Attempt {
    #[must_use]
    pub const fn new(id: StreamId) -> Self {
        Self {
            id,
            state: AttemptState::Creating,
        }
    }

    #[must_use]
    pub const fn id(&self) -> StreamId {
        self.id
    }

    #[must_use]
    pub const fn state(&self) -> AttemptState {
        self.state
    }

    /// Single entry point of the state machine. The first terminal event
    /// wins; later ones are ignored.
    pub fn handle(&mut self, event: AttemptEvent) -> Step {
        use AttemptEvent as E;
        use AttemptState as S;

        match (self.state, event) {
            (S::TornDown, _) => Step::Ignored,
            (S::Terminal(_), E::Signal(Signal::Disconnected) | E::TimeoutFired) => {
                self.state = S::TornDown;
                Step::Teardown
            }
            (S::Terminal(_), _) => Step::Ignored,

            (S::Creating, E::Signal(Signal::Connecting)) => {
                self.state = S::Connecting;
                Step::Arm
            }
            // Reported again on each transport-level reconnect.
            (_, E::Signal(Signal::Connecting)) => Step::Continue,
            (_, E::MetadataRejected) => self.terminate(AttemptResult::Other, true),

            (S::Creating | S::Connecting, E::Signal(Signal::Connected)) => {
                self.state = S::Connected;
                Step::Continue
            }
            (_, E::Signal(Signal::Connected)) => Step::Continue,
            (_, E::Signal(Signal::Data { eom: true, .. })) => {
                self.state = S::AckPending;
                Step::EndOfMessage
            }
            (_, E::Signal(Signal::Data { eom: false, .. })) => Step::Continue,

            (_, E::Signal(Signal::AckPositive)) => {
                self.terminate(AttemptResult::AckedSuccess, false)
            }
            (_, E::Signal(Signal::AckNegative)) => {
                self.terminate(AttemptResult::NackedFailure, false)
            }
            (_, E::Signal(Signal::TimedOut) | E::TimeoutFired) => {
                self.terminate(AttemptResult::TimedOut, true)
            }
            (_, E::Signal(Signal::RetriesExhausted)) => {
                self.terminate(AttemptResult::RetriesExhausted, true)
            }
            (_, E::Signal(Signal::Disconnected)) => self.terminate(AttemptResult::Other, true),
        }
    }

    fn terminate(&mut self, result: AttemptResult, teardown: bool) -> Step {
        self.state = if teardown {
            AttemptState::TornDown
        } else {
            AttemptState::Terminal(result)
        };
        Step::Terminal { result, teardown }
    }
}
