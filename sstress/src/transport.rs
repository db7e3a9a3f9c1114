//! Transport binding the controller drives.
//!
//! A transport owns logical streams keyed by [`StreamId`]. Everything it has
//! to say comes back as queued [`StreamEvent`]s that the instance loop drains
//! after each call or readiness event, so callbacks never re-enter the
//! controller.

pub mod http;
pub mod response;
pub mod scripted;

use std::io;

use mio::event::Event;
use mio::{Registry, Token};
use thiserror::Error;

use crate::policy::{Policy, RetryPolicy, StreamPolicy};
use crate::runtime::timing::{Millis, Timestamp};
use crate::system::BlobStore;

pub use http::HttpTransport;
pub use scripted::{Call, Script, ScriptPlan, ScriptedTransport};

/// Identifier of one logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u64);

impl StreamId {
    /// Reserved for the connectivity probe; attempts start at 1.
    pub const PROBE: Self = Self(0);

    #[must_use]
    pub const fn token(self) -> Token {
        Token(self.0 as usize)
    }

    #[must_use]
    pub const fn from_token(token: Token) -> Self {
        Self(token.0 as u64)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ss#{}", self.0)
    }
}

/// Lifecycle signal reported for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Connecting,
    Connected,
    Data { len: usize, eom: bool },
    AckPositive,
    AckNegative,
    Disconnected,
    TimedOut,
    RetriesExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEvent {
    pub stream: StreamId,
    pub signal: Signal,
}

impl StreamEvent {
    #[must_use]
    pub const fn new(stream: StreamId, signal: Signal) -> Self {
        Self { stream, signal }
    }
}

/// Everything a transport needs to open one stream.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub stream_type: String,
    pub policy: StreamPolicy,
    pub retry: RetryPolicy,
    pub user_agent: String,
    pub credential: Option<String>,
}

impl StreamRequest {
    /// Resolves a named stream type against the policy and the blob store.
    ///
    /// # Errors
    ///
    /// Returns [`CreationError::UnknownStreamType`] if the policy lacks it.
    pub fn for_stream(
        policy: &Policy,
        blobs: &BlobStore,
        stream_type: &str,
    ) -> Result<Self, CreationError> {
        let stream = policy
            .stream(stream_type)
            .ok_or_else(|| CreationError::UnknownStreamType(stream_type.to_owned()))?;
        Ok(Self {
            stream_type: stream_type.to_owned(),
            retry: policy.retry_for(stream),
            credential: stream.use_auth.then(|| blobs.refresh_token()).flatten(),
            user_agent: blobs.user_agent(),
            policy: stream.clone(),
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CreationError {
    /// Precondition: no budget left, nothing was attempted.
    #[error("retry budget exhausted")]
    BudgetExhausted,

    #[error("transport cannot take another stream: {0}")]
    ResourceExhausted(String),

    #[error("policy has no stream type {0:?}")]
    UnknownStreamType(String),

    #[error("stream type {stream:?} needs unsupported {feature}")]
    Unsupported { stream: String, feature: String },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no stream {0}")]
    UnknownStream(StreamId),

    #[error("stream {stream} does not accept metadata {name:?}")]
    MetadataRejected { stream: StreamId, name: String },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub trait Transport {
    /// Called once with the instance's poll registry before any stream.
    ///
    /// # Errors
    ///
    /// Fails if the registry cannot be cloned or used.
    fn attach(&mut self, registry: &Registry) -> io::Result<()>;

    /// Opens a stream without connecting it.
    ///
    /// # Errors
    ///
    /// Fails synchronously when the stream cannot be created at all.
    fn create(&mut self, id: StreamId, request: StreamRequest) -> Result<(), CreationError>;

    /// Starts connecting; progress is reported via events.
    ///
    /// # Errors
    ///
    /// Immediate failure to start the connection.
    fn connect(&mut self, id: StreamId, now: Timestamp<Millis>) -> Result<(), CreationError>;

    /// Attaches a metadata tag to a stream.
    ///
    /// # Errors
    ///
    /// Rejected tags or unknown streams.
    fn set_metadata(&mut self, id: StreamId, name: &str, value: &str)
    -> Result<(), TransportError>;

    /// Destroys the stream and drops any events still queued for it.
    fn teardown(&mut self, id: StreamId);

    /// Handles one readiness event from the instance poll.
    fn on_ready(&mut self, event: &Event, now: Timestamp<Millis>);

    /// Runs transport-internal timers that are due at `now`.
    fn on_tick(&mut self, now: Timestamp<Millis>);

    /// Earliest time `on_tick` has work to do.
    fn next_wakeup(&self) -> Option<Timestamp<Millis>>;

    /// Next queued event, oldest first.
    fn poll_event(&mut self) -> Option<StreamEvent>;
}
