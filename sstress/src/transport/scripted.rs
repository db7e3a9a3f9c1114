//! Deterministic in-memory transport.
//!
//! Each stream follows a [`Script`] chosen when it is created: from a plan
//! registered for its stream type, else from the default plan. A plan is a
//! sequence consumed one entry per stream; its last entry repeats. All
//! events are queued at call time and delivered by `poll_event`.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;

use mio::Registry;
use mio::event::Event;
use thiserror::Error;

use super::{
    CreationError, Signal, StreamEvent, StreamId, StreamRequest, Transport, TransportError,
};
use crate::config::FaultSimulation;
use crate::policy::CAPTIVE_PORTAL_DETECT;
use crate::runtime::timing::{Millis, Timestamp};

/// Payload size reported by scripted data chunks.
const SCRIPTED_BODY_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Full transaction: data with end-of-message, positive ack, disconnect.
    Succeed,
    /// Full transaction ending in a negative ack.
    Nack,
    /// Transport reports its own timeout right after connecting starts.
    TimeOut,
    /// Connecting, then silence.
    Stall,
    /// Never even reports connecting.
    Hang,
    /// Connection retries exhausted.
    Exhaust,
    /// Creation fails synchronously.
    FailCreate,
    /// Metadata tags are refused.
    RejectMetadata,
    /// Positive ack but no disconnect follows.
    AckThenStall,
    /// Connection drops before any ack.
    Drop,
}

impl Script {
    const NAMES: [(&'static str, Self); 10] = [
        ("succeed", Self::Succeed),
        ("nack", Self::Nack),
        ("timeout", Self::TimeOut),
        ("stall", Self::Stall),
        ("hang", Self::Hang),
        ("exhaust", Self::Exhaust),
        ("fail-create", Self::FailCreate),
        ("reject-metadata", Self::RejectMetadata),
        ("ack-then-stall", Self::AckThenStall),
        ("drop", Self::Drop),
    ];

    /// Signals queued after `Connecting`.
    fn after_connecting(self) -> &'static [Signal] {
        const DATA_EOM: Signal = Signal::Data {
            len: SCRIPTED_BODY_LEN,
            eom: true,
        };
        match self {
            Self::Succeed => &[
                Signal::Connected,
                DATA_EOM,
                Signal::AckPositive,
                Signal::Disconnected,
            ],
            Self::Nack => &[
                Signal::Connected,
                DATA_EOM,
                Signal::AckNegative,
                Signal::Disconnected,
            ],
            Self::TimeOut => &[Signal::TimedOut],
            Self::Exhaust => &[Signal::RetriesExhausted],
            Self::AckThenStall => &[Signal::Connected, DATA_EOM, Signal::AckPositive],
            Self::Drop => &[Signal::Connected, Signal::Disconnected],
            Self::Stall | Self::Hang | Self::FailCreate | Self::RejectMetadata => &[],
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown script {0:?}")]
pub struct ScriptError(String);

impl FromStr for Script {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::NAMES
            .iter()
            .find(|(name, _)| *name == s.trim())
            .map(|(_, script)| *script)
            .ok_or_else(|| ScriptError(s.to_owned()))
    }
}

/// Per-stream sequence of scripts; the last one repeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptPlan(Vec<Script>);

impl ScriptPlan {
    #[must_use]
    pub fn always(script: Script) -> Self {
        Self(vec![script])
    }

    /// Script for the `n`-th stream (0-based).
    #[must_use]
    pub fn nth(&self, n: usize) -> Script {
        self.0
            .get(n)
            .or_else(|| self.0.last())
            .copied()
            .unwrap_or(Script::Succeed)
    }
}

impl From<Vec<Script>> for ScriptPlan {
    fn from(steps: Vec<Script>) -> Self {
        Self(steps)
    }
}

impl FromStr for ScriptPlan {
    type Err = ScriptError;

    /// Comma-separated script names, e.g. `timeout,succeed`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let steps = s
            .split(',')
            .filter(|p| !p.trim().is_empty())
            .map(Script::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        if steps.is_empty() {
            return Err(ScriptError(s.to_owned()));
        }
        Ok(Self(steps))
    }
}

/// Call made on the transport, recorded for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create {
        id: StreamId,
        stream_type: String,
        endpoint: String,
        port: u16,
    },
    Connect(StreamId),
    SetMetadata {
        id: StreamId,
        name: String,
        value: String,
    },
    Teardown(StreamId),
}

#[derive(Debug)]
pub struct ScriptedTransport {
    default: ScriptPlan,
    per_stream: HashMap<String, ScriptPlan>,
    uses: HashMap<String, usize>,
    active: HashMap<StreamId, Script>,
    queue: VecDeque<StreamEvent>,
    calls: Vec<Call>,
}

impl ScriptedTransport {
    /// Every stream follows `default`, except the connectivity probe which
    /// succeeds unless told otherwise.
    #[must_use]
    pub fn new(default: ScriptPlan) -> Self {
        let mut per_stream = HashMap::new();
        per_stream.insert(
            CAPTIVE_PORTAL_DETECT.to_owned(),
            ScriptPlan::always(Script::Succeed),
        );
        Self {
            default,
            per_stream,
            uses: HashMap::new(),
            active: HashMap::new(),
            queue: VecDeque::new(),
            calls: Vec::new(),
        }
    }

    /// Scripted stand-in for the network. With a fault injected, every
    /// stream answers the way that network would: a portal redirects
    /// (negative ack) and a dead port exhausts its retries.
    #[must_use]
    pub fn simulating(default: ScriptPlan, fault: FaultSimulation) -> Self {
        let broken = match fault {
            FaultSimulation::None => return Self::new(default),
            FaultSimulation::CaptivePortal => ScriptPlan::always(Script::Nack),
            FaultSimulation::NoInternet => ScriptPlan::always(Script::Exhaust),
        };
        Self::new(broken.clone()).with_stream_plan(CAPTIVE_PORTAL_DETECT, broken)
    }

    #[must_use]
    pub fn with_stream_plan(mut self, stream_type: &str, plan: ScriptPlan) -> Self {
        self.per_stream.insert(stream_type.to_owned(), plan);
        self
    }

    #[must_use]
    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    fn next_script(&mut self, stream_type: &str) -> Script {
        let n = self.uses.entry(stream_type.to_owned()).or_insert(0);
        let plan = self.per_stream.get(stream_type).unwrap_or(&self.default);
        let script = plan.nth(*n);
        *n += 1;
        script
    }
}

impl Transport for ScriptedTransport {
    fn attach(&mut self, _registry: &Registry) -> std::io::Result<()> {
        Ok(())
    }

    fn create(&mut self, id: StreamId, request: StreamRequest) -> Result<(), CreationError> {
        self.calls.push(Call::Create {
            id,
            stream_type: request.stream_type.clone(),
            endpoint: request.policy.endpoint.clone(),
            port: request.policy.port,
        });
        let script = self.next_script(&request.stream_type);
        if script == Script::FailCreate {
            return Err(CreationError::ResourceExhausted(format!(
                "scripted creation failure for {}",
                request.stream_type
            )));
        }
        self.active.insert(id, script);
        Ok(())
    }

    fn connect(&mut self, id: StreamId, _now: Timestamp<Millis>) -> Result<(), CreationError> {
        self.calls.push(Call::Connect(id));
        let Some(script) = self.active.get(&id).copied() else {
            return Err(CreationError::ResourceExhausted(format!(
                "connect on unknown stream {id}"
            )));
        };
        if script == Script::Hang {
            return Ok(());
        }
        self.queue.push_back(StreamEvent::new(id, Signal::Connecting));
        self.queue.extend(
            script
                .after_connecting()
                .iter()
                .map(|signal| StreamEvent::new(id, *signal)),
        );
        Ok(())
    }

    fn set_metadata(
        &mut self,
        id: StreamId,
        name: &str,
        value: &str,
    ) -> Result<(), TransportError> {
        self.calls.push(Call::SetMetadata {
            id,
            name: name.to_owned(),
            value: value.to_owned(),
        });
        match self.active.get(&id) {
            None => Err(TransportError::UnknownStream(id)),
            Some(Script::RejectMetadata) => Err(TransportError::MetadataRejected {
                stream: id,
                name: name.to_owned(),
            }),
            Some(_) => Ok(()),
        }
    }

    fn teardown(&mut self, id: StreamId) {
        self.calls.push(Call::Teardown(id));
        self.active.remove(&id);
        self.queue.retain(|e| e.stream != id);
    }

    fn on_ready(&mut self, _event: &Event, _now: Timestamp<Millis>) {}

    fn on_tick(&mut self, _now: Timestamp<Millis>) {}

    fn next_wakeup(&self) -> Option<Timestamp<Millis>> {
        None
    }

    fn poll_event(&mut self) -> Option<StreamEvent> {
        self.queue.pop_front()
    }
}
